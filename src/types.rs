//! Core type definitions for query orchestration

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user question as submitted. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub raw_text: String,
    pub filters: Option<StructuredFilters>,
    pub session_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl Query {
    pub fn new(raw_text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            filters: None,
            session_id: session_id.into(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_filters(mut self, filters: StructuredFilters) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Pre-populated filters from the structured query shortcuts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFilters {
    #[serde(default)]
    pub spatial: Option<SpatialFilter>,
    #[serde(default)]
    pub temporal: Option<DateRange>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub float_id: Option<String>,
    #[serde(default)]
    pub intent_hint: Option<IntentKind>,
}

impl StructuredFilters {
    pub fn is_empty(&self) -> bool {
        self.spatial.is_none()
            && self.temporal.is_none()
            && self.parameters.is_empty()
            && self.regions.is_empty()
            && self.float_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilter {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Grow the range around its midpoint so it spans `multiplier` times the
    /// original length. Each side grows by at least one day.
    pub fn widened(&self, multiplier: f64) -> Self {
        let len = self.days().max(1);
        let target = ((len as f64) * multiplier.max(1.0)).ceil() as i64;
        let per_side = ((target - len) as f64 / 2.0).ceil().max(1.0) as i64;
        Self {
            start: self.start - Duration::days(per_side),
            end: self.end + Duration::days(per_side),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Lookup,
    Temporal,
    Spatial,
    Comparative,
    Biogeochemical,
    FreeText,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Lookup => "lookup",
            IntentKind::Temporal => "temporal",
            IntentKind::Spatial => "spatial",
            IntentKind::Comparative => "comparative",
            IntentKind::Biogeochemical => "biogeochemical",
            IntentKind::FreeText => "free_text",
        }
    }
}

/// Typed value of an extracted intent parameter or remembered session entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
    List(Vec<String>),
    Point { lat: f64, lon: f64, radius_km: f64 },
}

/// Well-known parameter keys
pub mod keys {
    pub const LAT: &str = "lat";
    pub const LON: &str = "lon";
    pub const RADIUS_KM: &str = "radius_km";
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const PARAMETERS: &str = "parameters";
    pub const REGIONS: &str = "regions";
    pub const FLOAT_ID: &str = "float_id";
    pub const LATEST: &str = "latest";
    pub const COMPOSITE: &str = "composite";

    // Session entity keys
    pub const REGION: &str = "region";
    pub const LOCATION: &str = "location";
    pub const PERIOD_START: &str = "period_start";
    pub const PERIOD_END: &str = "period_end";
    pub const FLOAT_IDS: &str = "float_ids";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedIntent {
    pub kind: IntentKind,
    pub parameters: BTreeMap<String, ParamValue>,
    pub confidence: f32,
    /// Lowercased, whitespace-collapsed query text
    pub normalized_text: String,
}

impl ClassifiedIntent {
    pub fn free_text(normalized_text: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind: IntentKind::FreeText,
            parameters: BTreeMap::new(),
            confidence,
            normalized_text: normalized_text.into(),
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key) {
            Some(ParamValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn date(&self, key: &str) -> Option<NaiveDate> {
        match self.parameters.get(key) {
            Some(ParamValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn list(&self, key: &str) -> &[String] {
        match self.parameters.get(key) {
            Some(ParamValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key) {
            Some(ParamValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.parameters.get(key), Some(ParamValue::Flag(true)))
    }

    pub fn spatial(&self) -> Option<SpatialFilter> {
        Some(SpatialFilter {
            lat: self.number(keys::LAT)?,
            lon: self.number(keys::LON)?,
            radius_km: self.number(keys::RADIUS_KM)?,
        })
    }

    pub fn date_range(&self) -> Option<DateRange> {
        Some(DateRange::new(self.date(keys::START)?, self.date(keys::END)?))
    }

    pub fn measured_parameters(&self) -> &[String] {
        self.list(keys::PARAMETERS)
    }

    pub fn regions(&self) -> &[String] {
        self.list(keys::REGIONS)
    }

    pub fn float_id(&self) -> Option<&str> {
        self.text(keys::FLOAT_ID)
    }

    /// Answers to these go stale quickly and get the short cache TTL.
    pub fn is_time_sensitive(&self) -> bool {
        match self.kind {
            IntentKind::Temporal => true,
            _ => self.flag(keys::LATEST),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Record,
    Aggregate,
    Document,
}

/// One retrieved unit of context. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFragment {
    pub source_id: String,
    pub kind: FragmentKind,
    /// Raw distance reported by the store (km for spatial, 1 - cosine otherwise)
    pub vector_distance: f32,
    /// Final ranking score, higher is better
    pub relevance: f32,
    /// Rendered text; numeric values appear exactly as the store reported them
    pub payload: String,
    /// Name of the store or secondary source that produced it
    pub origin: String,
}

impl ContextFragment {
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientReason {
    NoMatches,
    BelowThreshold,
    Unavailable,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Sufficiency {
    Sufficient,
    Insufficient(InsufficientReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    Recovered { fragments: usize },
    StillInsufficient,
    Failed { error: String },
    TimedOut,
}

/// Attribution for a secondary-source escalation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationRecord {
    pub source: String,
    pub trigger: InsufficientReason,
    pub outcome: EscalationOutcome,
}

/// Ranked, size-bounded context for one generation.
///
/// Fragments are ordered by non-increasing relevance. `truncated` is set iff
/// more qualifying fragments existed than the budget admitted.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub fragments: Vec<ContextFragment>,
    pub total_score: f32,
    pub truncated: bool,
    pub sufficiency: Sufficiency,
    /// Some parallel sub-retrievals failed; the bundle is incomplete
    pub partial: bool,
    /// The temporal range was widened once to find these fragments
    pub widened: bool,
    pub strategy: String,
    pub escalation: Option<EscalationRecord>,
}

impl ContextBundle {
    pub fn insufficient(strategy: impl Into<String>, reason: InsufficientReason) -> Self {
        Self {
            fragments: Vec::new(),
            total_score: 0.0,
            truncated: false,
            sufficiency: Sufficiency::Insufficient(reason),
            partial: false,
            widened: false,
            strategy: strategy.into(),
            escalation: None,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        self.sufficiency == Sufficiency::Sufficient
    }

    pub fn insufficient_reason(&self) -> Option<InsufficientReason> {
        match self.sufficiency {
            Sufficiency::Sufficient => None,
            Sufficiency::Insufficient(reason) => Some(reason),
        }
    }

}

/// Per-request retrieval limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBudget {
    pub max_fragments: usize,
    pub max_bytes: usize,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_fragments: 8,
            max_bytes: 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Stream,
    Batch,
}

/// Terminal status reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Answered,
    AnsweredWithCaveat,
    NoData,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    InProgress,
    Complete,
    Cancelled,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn widened_range_keeps_midpoint() {
        let range = DateRange::new(d(2023, 3, 1), d(2023, 3, 31));
        let wide = range.widened(3.0);
        assert_eq!(wide.start, d(2023, 1, 29));
        assert_eq!(wide.end, d(2023, 5, 1));
        assert!(wide.days() >= range.days() * 3);
    }

    #[test]
    fn widened_single_day_grows_both_sides() {
        let range = DateRange::new(d(2023, 3, 10), d(2023, 3, 10));
        let wide = range.widened(1.0);
        assert_eq!(wide.start, d(2023, 3, 9));
        assert_eq!(wide.end, d(2023, 3, 11));
    }

    #[test]
    fn spatial_accessor_requires_all_parts() {
        let mut intent = ClassifiedIntent::free_text("x", 0.3);
        intent.parameters.insert(keys::LAT.into(), ParamValue::Number(15.5));
        intent.parameters.insert(keys::LON.into(), ParamValue::Number(68.2));
        assert!(intent.spatial().is_none());
        intent.parameters.insert(keys::RADIUS_KM.into(), ParamValue::Number(100.0));
        assert_eq!(
            intent.spatial(),
            Some(SpatialFilter { lat: 15.5, lon: 68.2, radius_km: 100.0 })
        );
    }

    #[test]
    fn param_value_untagged_serialization() {
        let json = serde_json::to_string(&ParamValue::List(vec!["DOXY".into()])).unwrap();
        assert_eq!(json, r#"["DOXY"]"#);
        let date: ParamValue = serde_json::from_str(r#""2023-03-01""#).unwrap();
        assert_eq!(date, ParamValue::Date(d(2023, 3, 1)));
    }
}
