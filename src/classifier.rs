//! Query classification: intent kind plus typed parameters.
//!
//! Classification is pure. Given the same query (and the same session
//! snapshot) it always yields the same `ClassifiedIntent`. It never fails;
//! weak or contradictory signals degrade to `free_text`.
//!
//! Intent precedence, first match wins:
//!
//! 1. `comparative`: a comparative cue with at least one dimension, or two regions
//! 2. spatial + temporal co-occurrence: `spatial`, carrying the date range
//! 3. `biogeochemical`: any BGC parameter
//! 4. `spatial`: coordinates or a region
//! 5. `temporal`: a date range
//! 6. `lookup`: a float identifier, or a bare parameter
//! 7. `free_text`

use crate::error::QueryError;
use crate::session::{find_references, reference_kind, EntityRef, SessionContext};
use crate::types::*;
use crate::vocabulary::{find_parameters, find_regions, find_word, is_bgc, parameter_by_name, region_by_name};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::debug;

/// Below this the classifier gives up and answers `free_text`
pub const MIN_CONFIDENCE: f32 = 0.5;
/// Radius used when coordinates are given without one
pub const DEFAULT_RADIUS_KM: f64 = 250.0;
pub const MAX_RADIUS_KM: f64 = 5000.0;

const COMPARATIVE_CUES: &[&str] = &[
    "compare", "comparison", "comparing", "versus", "vs", "difference between",
    "differences between", "contrast", "against",
];
const LATEST_CUES: &[&str] = &["latest", "most recent", "recent", "current", "currently", "today", "now"];
const MONTHS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august",
    "september", "october", "november", "december",
];

/// Raw evidence pulled out of the query before deciding
#[derive(Debug, Clone, Default, PartialEq)]
struct Signals {
    lat: Option<f64>,
    lon: Option<f64>,
    radius_km: Option<f64>,
    range: Option<DateRange>,
    parameters: Vec<String>,
    regions: Vec<String>,
    float_id: Option<String>,
    comparative: bool,
    latest: bool,
    references: Vec<&'static str>,
    /// Half-parsed signals (latitude without longitude, radius without a centre)
    ambiguities: Vec<String>,
}

impl Signals {
    fn has_point(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }

    fn is_spatial(&self) -> bool {
        self.has_point() || !self.regions.is_empty()
    }

    fn dimensions(&self) -> usize {
        self.is_spatial() as usize + self.range.is_some() as usize + !self.parameters.is_empty() as usize
    }
}

#[derive(Debug, Clone)]
pub struct QueryClassifier {
    default_radius_km: f64,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self {
            default_radius_km: DEFAULT_RADIUS_KM,
        }
    }
}

impl QueryClassifier {
    pub fn new(default_radius_km: f64) -> Self {
        Self { default_radius_km }
    }

    pub fn classify(&self, query: &Query) -> ClassifiedIntent {
        self.classify_in_session(query, None)
    }

    /// Classify, filling dimensions the text refers back to ("that region")
    /// from the session's remembered entities.
    pub fn classify_in_session(&self, query: &Query, session: Option<&SessionContext>) -> ClassifiedIntent {
        let normalized = normalize_text(&query.raw_text);
        let mut signals = extract_signals(&normalized);

        let hint = match &query.filters {
            Some(filters) => merge_filters(&mut signals, filters),
            None => None,
        };

        if let Some(session) = session {
            fill_from_session(&mut signals, session);
        }

        let intent = self.decide(&signals, hint, normalized);
        debug!(
            kind = intent.kind.as_str(),
            confidence = intent.confidence,
            params = intent.parameters.len(),
            "Classified query"
        );
        intent
    }

    fn decide(&self, s: &Signals, hint: Option<IntentKind>, normalized: String) -> ClassifiedIntent {
        let (kind, mut confidence) = match hint.filter(|h| hint_consistent(*h, s)) {
            Some(kind) => (kind, 1.0),
            None => {
                if let Some(h) = hint {
                    debug!(hint = h.as_str(), "Ignoring intent hint inconsistent with filters");
                }
                select_kind(s)
            }
        };

        if confidence < 1.0 {
            confidence -= 0.1 * s.ambiguities.len() as f32;
        }
        if kind == IntentKind::FreeText || confidence < MIN_CONFIDENCE {
            if kind != IntentKind::FreeText {
                let ambiguous = QueryError::ClassificationAmbiguous(format!(
                    "{} at confidence {:.2}: {}",
                    kind.as_str(),
                    confidence,
                    s.ambiguities.join(", ")
                ));
                debug!("{}; degrading to free_text", ambiguous);
            }
            return ClassifiedIntent::free_text(normalized, confidence.clamp(0.0, 0.3));
        }

        let mut parameters = BTreeMap::new();
        if let (Some(lat), Some(lon)) = (s.lat, s.lon) {
            parameters.insert(keys::LAT.to_string(), ParamValue::Number(lat));
            parameters.insert(keys::LON.to_string(), ParamValue::Number(lon));
            parameters.insert(
                keys::RADIUS_KM.to_string(),
                ParamValue::Number(s.radius_km.unwrap_or(self.default_radius_km)),
            );
        }
        if let Some(range) = s.range {
            parameters.insert(keys::START.to_string(), ParamValue::Date(range.start));
            parameters.insert(keys::END.to_string(), ParamValue::Date(range.end));
        }
        if !s.parameters.is_empty() {
            parameters.insert(keys::PARAMETERS.to_string(), ParamValue::List(s.parameters.clone()));
        }
        if !s.regions.is_empty() {
            parameters.insert(keys::REGIONS.to_string(), ParamValue::List(s.regions.clone()));
        }
        if let Some(id) = &s.float_id {
            parameters.insert(keys::FLOAT_ID.to_string(), ParamValue::Text(id.clone()));
        }
        if s.latest {
            parameters.insert(keys::LATEST.to_string(), ParamValue::Flag(true));
        }
        if kind == IntentKind::Spatial && s.range.is_some() {
            parameters.insert(keys::COMPOSITE.to_string(), ParamValue::Flag(true));
        }

        ClassifiedIntent {
            kind,
            parameters,
            confidence: confidence.min(1.0),
            normalized_text: normalized,
        }
    }
}

fn select_kind(s: &Signals) -> (IntentKind, f32) {
    let multi = s.regions.len() >= 2;
    if (s.comparative && (s.dimensions() > 0 || s.float_id.is_some())) || multi {
        (IntentKind::Comparative, 0.9)
    } else if s.is_spatial() && s.range.is_some() {
        (IntentKind::Spatial, 0.85)
    } else if s.parameters.iter().any(|p| is_bgc(p)) {
        (IntentKind::Biogeochemical, 0.8)
    } else if s.is_spatial() {
        (IntentKind::Spatial, if s.has_point() { 0.9 } else { 0.75 })
    } else if s.range.is_some() {
        (IntentKind::Temporal, 0.8)
    } else if s.float_id.is_some() {
        (IntentKind::Lookup, 0.85)
    } else if !s.parameters.is_empty() {
        (IntentKind::Lookup, 0.55)
    } else {
        (IntentKind::FreeText, 0.3)
    }
}

fn hint_consistent(hint: IntentKind, s: &Signals) -> bool {
    match hint {
        IntentKind::Spatial => s.is_spatial(),
        IntentKind::Temporal => s.range.is_some(),
        IntentKind::Comparative => s.regions.len() + s.parameters.len() >= 2,
        IntentKind::Biogeochemical => s.parameters.iter().any(|p| is_bgc(p)),
        IntentKind::Lookup => s.float_id.is_some() || !s.parameters.is_empty(),
        IntentKind::FreeText => true,
    }
}

/// Lowercase, collapse whitespace, drop trailing punctuation
pub fn normalize_text(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    collapsed
        .trim_end_matches(|c: char| matches!(c, '?' | '.' | '!'))
        .trim()
        .to_string()
}

impl StructuredFilters {
    /// Reject internally inconsistent hints instead of silently trusting them.
    pub fn validate(&self) -> Result<(), QueryError> {
        if let Some(sp) = &self.spatial {
            if !sp.lat.is_finite() || !(-90.0..=90.0).contains(&sp.lat) {
                return Err(QueryError::InvalidFilter(format!("latitude {} out of range", sp.lat)));
            }
            if !sp.lon.is_finite() || !(-180.0..=180.0).contains(&sp.lon) {
                return Err(QueryError::InvalidFilter(format!("longitude {} out of range", sp.lon)));
            }
            if !sp.radius_km.is_finite() || sp.radius_km <= 0.0 || sp.radius_km > MAX_RADIUS_KM {
                return Err(QueryError::InvalidFilter(format!(
                    "radius {} km outside (0, {}]",
                    sp.radius_km, MAX_RADIUS_KM
                )));
            }
        }
        if let Some(range) = &self.temporal {
            if range.start > range.end {
                return Err(QueryError::InvalidFilter(format!(
                    "start {} is after end {}",
                    range.start, range.end
                )));
            }
        }
        for p in &self.parameters {
            if parameter_by_name(p).is_none() {
                return Err(QueryError::InvalidFilter(format!("unknown parameter '{}'", p)));
            }
        }
        for r in &self.regions {
            if region_by_name(r).is_none() {
                return Err(QueryError::InvalidFilter(format!("unknown region '{}'", r)));
            }
        }
        if let Some(id) = &self.float_id {
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(QueryError::InvalidFilter(format!("malformed float id '{}'", id)));
            }
        }
        Ok(())
    }
}

/// Structured filters override what the text says. Invalid pieces are skipped;
/// callers are expected to have run `validate` first.
fn merge_filters(s: &mut Signals, f: &StructuredFilters) -> Option<IntentKind> {
    if let Some(sp) = &f.spatial {
        let valid = (-90.0..=90.0).contains(&sp.lat)
            && (-180.0..=180.0).contains(&sp.lon)
            && sp.radius_km > 0.0
            && sp.radius_km <= MAX_RADIUS_KM;
        if valid {
            s.lat = Some(sp.lat);
            s.lon = Some(sp.lon);
            s.radius_km = Some(sp.radius_km);
        } else {
            s.ambiguities.push("invalid spatial filter".to_string());
        }
    }
    if let Some(range) = f.temporal {
        if range.start <= range.end {
            s.range = Some(range);
        }
    }
    let params: Vec<String> = f
        .parameters
        .iter()
        .filter_map(|p| parameter_by_name(p).map(|p| p.name.to_string()))
        .collect();
    if !params.is_empty() {
        s.parameters = params;
    }
    let regions: Vec<String> = f
        .regions
        .iter()
        .filter_map(|r| region_by_name(r).map(|r| r.name.to_string()))
        .collect();
    if !regions.is_empty() {
        s.regions = regions;
    }
    if f.float_id.is_some() {
        s.float_id = f.float_id.clone();
    }
    f.intent_hint
}

fn fill_from_session(s: &mut Signals, session: &SessionContext) {
    for phrase in s.references.clone() {
        match reference_kind(phrase) {
            Some(EntityRef::Region) if s.regions.is_empty() && !s.has_point() => {
                match session.resolve_reference(phrase) {
                    Some(ParamValue::Text(region)) => s.regions.push(region),
                    Some(ParamValue::Point { lat, lon, radius_km }) => {
                        s.lat = Some(lat);
                        s.lon = Some(lon);
                        s.radius_km = Some(radius_km);
                    }
                    _ => {}
                }
            }
            Some(EntityRef::Period) if s.range.is_none() => {
                s.range = session.period();
            }
            Some(EntityRef::Floats) if s.float_id.is_none() => {
                if let Some(ParamValue::List(ids)) = session.resolve_reference(phrase) {
                    s.float_id = ids.into_iter().next();
                }
            }
            _ => {}
        }
    }
}

fn extract_signals(text: &str) -> Signals {
    let tokens = tokenize(text);
    let mut consumed = vec![false; tokens.len()];
    let mut s = Signals::default();

    extract_radius(&tokens, &mut consumed, &mut s);
    extract_coordinates(&tokens, &mut consumed, &mut s);
    extract_float_id(&tokens, &mut consumed, &mut s);
    extract_dates(&tokens, &mut consumed, &mut s);

    s.parameters = find_parameters(text).into_iter().map(String::from).collect();
    s.regions = find_regions(text).into_iter().map(String::from).collect();
    s.comparative = COMPARATIVE_CUES.iter().any(|cue| find_word(text, cue).is_some());
    s.latest = LATEST_CUES.iter().any(|cue| find_word(text, cue).is_some());
    s.references = find_references(text);

    if s.lat.is_some() != s.lon.is_some() {
        s.ambiguities.push("incomplete coordinates".to_string());
        s.lat = None;
        s.lon = None;
    }
    if s.radius_km.is_some() && !s.has_point() && s.regions.is_empty() {
        s.ambiguities.push("radius without a centre".to_string());
    }
    s
}

fn tokenize(text: &str) -> Vec<String> {
    text.replace(['=', ':', ',', ';', '(', ')', '?', '!'], " ")
        .split_whitespace()
        .map(|t| t.trim_end_matches('.').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_number(token: &str) -> Option<f64> {
    let n: f64 = token.trim_end_matches('°').parse().ok()?;
    n.is_finite().then_some(n)
}

fn extract_radius(tokens: &[String], consumed: &mut [bool], s: &mut Signals) {
    for i in 0..tokens.len() {
        let t = tokens[i].as_str();
        if let Some(n) = t
            .strip_suffix("km")
            .or_else(|| t.strip_suffix("kms"))
            .and_then(parse_number)
        {
            consumed[i] = true;
            set_radius(s, n);
            return;
        }
        if let (Some(n), Some(unit)) = (parse_number(t), tokens.get(i + 1)) {
            if matches!(unit.as_str(), "km" | "kms" | "kilometers" | "kilometres") {
                consumed[i] = true;
                consumed[i + 1] = true;
                set_radius(s, n);
                return;
            }
        }
    }
}

/// Radii outside (0, MAX_RADIUS_KM] are dropped so the default applies
fn set_radius(s: &mut Signals, km: f64) {
    if km > 0.0 && km <= MAX_RADIUS_KM {
        s.radius_km = Some(km);
    } else {
        s.ambiguities.push(format!("radius {} km out of range", km));
    }
}

fn hemisphere(word: &str) -> Option<char> {
    match word {
        "n" | "north" => Some('n'),
        "s" | "south" => Some('s'),
        "e" | "east" => Some('e'),
        "w" | "west" => Some('w'),
        _ => None,
    }
}

fn apply_coordinate(s: &mut Signals, value: f64, hemi: char) {
    match hemi {
        'n' | 's' => {
            let lat = if hemi == 's' { -value.abs() } else { value };
            if (-90.0..=90.0).contains(&lat) {
                s.lat = Some(lat);
            }
        }
        _ => {
            let lon = if hemi == 'w' { -value.abs() } else { value };
            if (-180.0..=180.0).contains(&lon) {
                s.lon = Some(lon);
            }
        }
    }
}

fn extract_coordinates(tokens: &[String], consumed: &mut [bool], s: &mut Signals) {
    for i in 0..tokens.len() {
        if consumed[i] {
            continue;
        }
        let core = tokens[i].replace('°', "");
        let t = core.as_str();

        // "lat 15.5" / "longitude -68.2"
        if matches!(t, "lat" | "latitude" | "lon" | "long" | "longitude") {
            if let Some(n) = tokens.get(i + 1).and_then(|next| parse_number(next)) {
                let hemi = if t.starts_with("lat") { 'n' } else { 'e' };
                apply_coordinate(s, n, hemi);
                consumed[i] = true;
                consumed[i + 1] = true;
            }
            continue;
        }

        // "15.5n" / "68.2e"
        if let Some((idx, _)) = t.char_indices().last() {
            if let Some(hemi) = hemisphere(&t[idx..]) {
                if let Some(n) = parse_number(&t[..idx]) {
                    apply_coordinate(s, n, hemi);
                    consumed[i] = true;
                    continue;
                }
            }
        }

        // "15.5 n" / "15.5 north"
        if let (Some(n), Some(next)) = (parse_number(t), tokens.get(i + 1)) {
            if let Some(hemi) = hemisphere(next) {
                apply_coordinate(s, n, hemi);
                consumed[i] = true;
                consumed[i + 1] = true;
            }
        }
    }
}

fn extract_float_id(tokens: &[String], consumed: &mut [bool], s: &mut Signals) {
    for (i, t) in tokens.iter().enumerate() {
        if !consumed[i] && t.len() == 7 && t.chars().all(|c| c.is_ascii_digit()) {
            s.float_id = Some(t.clone());
            consumed[i] = true;
            return;
        }
    }
}

fn month_index(word: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| *m == word || (word.len() == 3 && m.starts_with(word)))
        .map(|i| i as u32 + 1)
}

fn month_span(year: i32, month: u32) -> Option<DateRange> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(DateRange::new(start, next.pred_opt()?))
}

fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = token.parse().ok()?;
    (1900..=2100).contains(&year).then_some(year)
}

fn extract_dates(tokens: &[String], consumed: &mut [bool], s: &mut Signals) {
    let mut spans: Vec<DateRange> = Vec::new();

    for i in 0..tokens.len() {
        if consumed[i] {
            continue;
        }
        let t = tokens[i].as_str();
        if let Ok(date) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
            spans.push(DateRange::new(date, date));
            consumed[i] = true;
            continue;
        }
        if let Some(month) = month_index(t) {
            if let Some(year) = tokens.get(i + 1).and_then(|y| parse_year(y)) {
                if let Some(span) = month_span(year, month) {
                    spans.push(span);
                    consumed[i] = true;
                    consumed[i + 1] = true;
                }
            }
        }
    }

    for i in 0..tokens.len() {
        if consumed[i] {
            continue;
        }
        if let Some(year) = parse_year(&tokens[i]) {
            if let (Some(start), Some(end)) = (
                NaiveDate::from_ymd_opt(year, 1, 1),
                NaiveDate::from_ymd_opt(year, 12, 31),
            ) {
                spans.push(DateRange::new(start, end));
                consumed[i] = true;
            }
        }
    }

    let start = spans.iter().map(|r| r.start).min();
    let end = spans.iter().map(|r| r.end).max();
    if let (Some(start), Some(end)) = (start, end) {
        s.range = Some(DateRange::new(start, end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use std::time::Duration;

    fn classify(text: &str) -> ClassifiedIntent {
        QueryClassifier::default().classify(&Query::new(text, "s1"))
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn spatial_with_coordinates_and_radius() {
        let intent = classify("temperature near 15.5N 68.2E within 100km");
        assert_eq!(intent.kind, IntentKind::Spatial);
        assert_eq!(intent.number(keys::LAT), Some(15.5));
        assert_eq!(intent.number(keys::LON), Some(68.2));
        assert_eq!(intent.number(keys::RADIUS_KM), Some(100.0));
        assert_eq!(intent.measured_parameters(), &["temperature".to_string()]);
    }

    #[test]
    fn coordinate_forms() {
        let intent = classify("salinity at lat -12.5 lon 70 radius 50 km");
        assert_eq!(intent.number(keys::LAT), Some(-12.5));
        assert_eq!(intent.number(keys::LON), Some(70.0));
        assert_eq!(intent.number(keys::RADIUS_KM), Some(50.0));

        let intent = classify("profiles near 10.2° S, 80.1° E");
        assert_eq!(intent.number(keys::LAT), Some(-10.2));
        assert_eq!(intent.number(keys::LON), Some(80.1));
        assert_eq!(intent.number(keys::RADIUS_KM), Some(DEFAULT_RADIUS_KM));
    }

    #[test]
    fn out_of_range_radius_falls_back_to_default() {
        let exact = classify("temperature near 15.5N 68.2E within 100km");
        for text in ["temperature near 15.5N 68.2E within 9000 km", "temperature near 15.5N 68.2E within 0km"] {
            let intent = classify(text);
            assert_eq!(intent.kind, IntentKind::Spatial, "{}", text);
            assert_eq!(intent.number(keys::RADIUS_KM), Some(DEFAULT_RADIUS_KM));
            assert!(intent.confidence < exact.confidence);
        }
    }

    #[test]
    fn recency_cue_makes_any_kind_time_sensitive() {
        let plain = classify("temperature near 15.5N 68.2E");
        let latest = classify("latest temperature near 15.5N 68.2E");
        assert_eq!((plain.kind, latest.kind), (IntentKind::Spatial, IntentKind::Spatial));
        assert!(!plain.is_time_sensitive());
        assert!(latest.is_time_sensitive());
        assert!(classify("profiles from 2024-01-01 to 2024-01-31").is_time_sensitive());
    }

    #[test]
    fn region_and_month_is_composite_spatial() {
        let intent = classify("salinity Arabian Sea March 2023");
        assert_eq!(intent.kind, IntentKind::Spatial);
        assert!(intent.flag(keys::COMPOSITE));
        assert_eq!(intent.regions(), &["Arabian Sea".to_string()]);
        assert_eq!(
            intent.date_range(),
            Some(DateRange::new(d("2023-03-01"), d("2023-03-31")))
        );
    }

    #[test]
    fn precedence_comparative_over_composite_over_single() {
        // comparative beats spatial+temporal
        let comparative = classify("compare salinity in the Arabian Sea and Bay of Bengal in 2023");
        assert_eq!(comparative.kind, IntentKind::Comparative);

        // two regions without a cue are still comparative
        let two_regions = classify("Arabian Sea Bay of Bengal temperature");
        assert_eq!(two_regions.kind, IntentKind::Comparative);

        // spatial+temporal beats the BGC single dimension
        let composite = classify("oxygen in the Bay of Bengal during June 2023");
        assert_eq!(composite.kind, IntentKind::Spatial);
        assert!(composite.flag(keys::COMPOSITE));

        // BGC beats plain spatial
        let bgc = classify("chlorophyll and nitrate in the Arabian Sea");
        assert_eq!(bgc.kind, IntentKind::Biogeochemical);
        assert_eq!(bgc.measured_parameters(), &["CHLA".to_string(), "NITRATE".to_string()]);

        // single dimensions
        assert_eq!(classify("temperature in the Arabian Sea").kind, IntentKind::Spatial);
        assert_eq!(classify("profiles from 2023-01-01 to 2023-02-15").kind, IntentKind::Temporal);
        assert_eq!(classify("show float 2902746").kind, IntentKind::Lookup);
    }

    #[test]
    fn iso_dates_form_range() {
        let intent = classify("temperature between 2023-01-10 and 2023-02-20");
        assert_eq!(intent.kind, IntentKind::Temporal);
        assert_eq!(
            intent.date_range(),
            Some(DateRange::new(d("2023-01-10"), d("2023-02-20")))
        );
    }

    #[test]
    fn unparsable_input_is_free_text() {
        let intent = classify("tell me something interesting about the ocean");
        assert_eq!(intent.kind, IntentKind::FreeText);
        assert!(intent.parameters.is_empty());
    }

    #[test]
    fn ambiguity_degrades_to_free_text() {
        // latitude without longitude plus a stray radius: a bare parameter lookup
        // drops below the confidence floor
        let intent = classify("temperature at 15.5N within 40 km");
        assert_eq!(intent.kind, IntentKind::FreeText);
        assert!(intent.parameters.is_empty());
        assert!(intent.confidence < MIN_CONFIDENCE);
    }

    #[test]
    fn classification_is_deterministic() {
        let query = Query::new("Compare oxygen in Arabian Sea vs Bay of Bengal March 2023", "s1");
        let classifier = QueryClassifier::default();
        assert_eq!(classifier.classify(&query), classifier.classify(&query));
    }

    #[test]
    fn trusted_hint_and_filter_override() {
        let filters = StructuredFilters {
            spatial: Some(SpatialFilter { lat: 12.0, lon: 85.0, radius_km: 300.0 }),
            intent_hint: Some(IntentKind::Spatial),
            ..Default::default()
        };
        let query = Query::new("floats", "s1").with_filters(filters);
        let intent = QueryClassifier::default().classify(&query);
        assert_eq!(intent.kind, IntentKind::Spatial);
        assert_eq!(intent.confidence, 1.0);
        assert_eq!(intent.number(keys::RADIUS_KM), Some(300.0));
    }

    #[test]
    fn inconsistent_hint_is_ignored() {
        let filters = StructuredFilters {
            intent_hint: Some(IntentKind::Spatial),
            ..Default::default()
        };
        let query = Query::new("average salinity in 2022", "s1").with_filters(filters);
        let intent = QueryClassifier::default().classify(&query);
        assert_eq!(intent.kind, IntentKind::Temporal);
    }

    #[test]
    fn validate_rejects_out_of_range_coordinates() {
        let filters = StructuredFilters {
            spatial: Some(SpatialFilter { lat: 95.0, lon: 68.0, radius_km: 100.0 }),
            ..Default::default()
        };
        assert!(matches!(filters.validate(), Err(QueryError::InvalidFilter(_))));

        let filters = StructuredFilters {
            parameters: vec!["unobtainium".into()],
            ..Default::default()
        };
        assert!(filters.validate().is_err());

        let ok = StructuredFilters {
            parameters: vec!["DOXY".into(), "salinity".into()],
            regions: vec!["bay of bengal".into()],
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn session_reference_fills_region() {
        let sessions = SessionStore::new(10, Duration::from_secs(600));
        let first = Query::new("salinity in the Bay of Bengal", "s1");
        let classifier = QueryClassifier::default();
        let intent = classifier.classify(&first);
        sessions.update("s1", first, intent, Some("summary".into()));

        let snapshot = sessions.snapshot("s1").unwrap();
        let follow_up = Query::new("what about temperature in that region", "s1");
        let intent = classifier.classify_in_session(&follow_up, Some(&snapshot));
        assert_eq!(intent.kind, IntentKind::Spatial);
        assert_eq!(intent.regions(), &["Bay of Bengal".to_string()]);
    }
}
