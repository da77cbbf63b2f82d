//! Ocean regions and measured parameters recognised in queries

/// Named basin with an approximate bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub lat: (f64, f64),
    pub lon: (f64, f64),
}

impl Region {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.lat.0 <= lat && lat <= self.lat.1 && self.lon.0 <= lon && lon <= self.lon.1
    }

    pub fn centroid(&self) -> (f64, f64) {
        ((self.lat.0 + self.lat.1) / 2.0, (self.lon.0 + self.lon.1) / 2.0)
    }

    /// Radius of a circle around the centroid that covers the whole box
    pub fn covering_radius_km(&self) -> f64 {
        let (clat, clon) = self.centroid();
        crate::scoring::haversine_km(clat, clon, self.lat.1, self.lon.1)
    }
}

// Order matters: first containing region wins in `identify_region`.
pub const REGIONS: &[Region] = &[
    Region {
        name: "Arabian Sea",
        aliases: &["arabian sea", "arabian"],
        lat: (10.0, 30.0),
        lon: (50.0, 78.0),
    },
    Region {
        name: "Bay of Bengal",
        aliases: &["bay of bengal", "bengal"],
        lat: (5.0, 25.0),
        lon: (78.0, 100.0),
    },
    Region {
        name: "Central Indian Ocean",
        aliases: &["central indian ocean", "indian ocean central"],
        lat: (-10.0, 10.0),
        lon: (60.0, 90.0),
    },
    Region {
        name: "Equatorial Indian Ocean",
        aliases: &["equatorial indian ocean", "equatorial indian", "equator"],
        lat: (-5.0, 5.0),
        lon: (50.0, 100.0),
    },
    Region {
        name: "Southern Indian Ocean",
        aliases: &["southern indian ocean", "southern indian"],
        lat: (-40.0, -10.0),
        lon: (40.0, 120.0),
    },
];

pub const DEFAULT_REGION: &str = "Indian Ocean";

pub fn identify_region(lat: f64, lon: f64) -> &'static str {
    REGIONS
        .iter()
        .find(|r| r.contains(lat, lon))
        .map(|r| r.name)
        .unwrap_or(DEFAULT_REGION)
}

pub fn region_by_name(name: &str) -> Option<&'static Region> {
    let needle = name.trim().to_lowercase();
    REGIONS
        .iter()
        .find(|r| r.name.to_lowercase() == needle || r.aliases.contains(&needle.as_str()))
}

/// Regions mentioned in normalized text, in order of first mention.
/// Longer aliases are matched first so "bay of bengal" is not also read as "bengal".
pub fn find_regions(text: &str) -> Vec<&'static str> {
    let mut aliases: Vec<(&'static str, &'static Region)> = REGIONS
        .iter()
        .flat_map(|r| r.aliases.iter().map(move |a| (*a, r)))
        .collect();
    aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut masked = text.to_string();
    let mut found: Vec<(usize, &'static str)> = Vec::new();
    for (alias, region) in aliases {
        while let Some(pos) = find_word(&masked, alias) {
            if !found.iter().any(|(_, name)| *name == region.name) {
                found.push((pos, region.name));
            }
            masked.replace_range(pos..pos + alias.len(), &" ".repeat(alias.len()));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameter {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub units: &'static str,
    pub bgc: bool,
}

pub const PARAMETERS: &[Parameter] = &[
    Parameter {
        name: "temperature",
        aliases: &["temperature", "temp", "thermal", "sst"],
        units: "°C",
        bgc: false,
    },
    Parameter {
        name: "salinity",
        aliases: &["salinity", "salt", "psu"],
        units: "PSU",
        bgc: false,
    },
    Parameter {
        name: "pressure",
        aliases: &["pressure", "depth", "pres"],
        units: "dbar",
        bgc: false,
    },
    Parameter {
        name: "DOXY",
        aliases: &["dissolved oxygen", "oxygen", "doxy"],
        units: "µmol/kg",
        bgc: true,
    },
    Parameter {
        name: "CHLA",
        aliases: &["chlorophyll-a", "chlorophyll", "chla"],
        units: "mg/m³",
        bgc: true,
    },
    Parameter {
        name: "BBP700",
        aliases: &["backscattering", "backscatter", "bbp700"],
        units: "m⁻¹",
        bgc: true,
    },
    Parameter {
        name: "PH_IN_SITU_TOTAL",
        aliases: &["ph_in_situ_total", "acidity", "ph"],
        units: "pH units",
        bgc: true,
    },
    Parameter {
        name: "NITRATE",
        aliases: &["nitrate", "no3"],
        units: "µmol/kg",
        bgc: true,
    },
];

pub fn parameter_by_name(name: &str) -> Option<&'static Parameter> {
    let needle = name.trim().to_lowercase();
    PARAMETERS
        .iter()
        .find(|p| p.name.to_lowercase() == needle || p.aliases.contains(&needle.as_str()))
}

/// Parameters mentioned in normalized text, in order of first mention.
pub fn find_parameters(text: &str) -> Vec<&'static str> {
    let mut found: Vec<(usize, &'static str)> = Vec::new();
    for param in PARAMETERS {
        let first = param
            .aliases
            .iter()
            .filter_map(|alias| find_word(text, alias))
            .min();
        if let Some(pos) = first {
            found.push((pos, param.name));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name).collect()
}

pub fn is_bgc(name: &str) -> bool {
    parameter_by_name(name).map(|p| p.bgc).unwrap_or(false)
}

/// Byte offset of `needle` in `haystack` where it is not part of a longer word.
pub(crate) fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        let pos = start + rel;
        let end = pos + needle.len();
        let before_ok = haystack[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(pos);
        }
        start = pos + needle.len().max(1);
        if start >= haystack.len() {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_region_uses_first_containing_box() {
        assert_eq!(identify_region(15.5, 68.2), "Arabian Sea");
        assert_eq!(identify_region(15.0, 88.0), "Bay of Bengal");
        assert_eq!(identify_region(0.0, 70.0), "Central Indian Ocean");
        assert_eq!(identify_region(45.0, 10.0), DEFAULT_REGION);
    }

    #[test]
    fn longest_alias_wins() {
        assert_eq!(find_regions("salinity in the bay of bengal"), vec!["Bay of Bengal"]);
        assert_eq!(
            find_regions("compare arabian sea and bay of bengal"),
            vec!["Arabian Sea", "Bay of Bengal"]
        );
    }

    #[test]
    fn parameters_match_whole_words_only() {
        assert_eq!(find_parameters("temperature and salinity"), vec!["temperature", "salinity"]);
        // "phase" must not be read as pH
        assert!(find_parameters("phase of the moon").is_empty());
        assert_eq!(find_parameters("dissolved oxygen near the surface"), vec!["DOXY"]);
    }

    #[test]
    fn lookup_by_alias_or_name() {
        assert_eq!(parameter_by_name("chlorophyll").map(|p| p.name), Some("CHLA"));
        assert_eq!(region_by_name("Arabian Sea").map(|r| r.name), Some("Arabian Sea"));
        assert!(is_bgc("NITRATE"));
        assert!(!is_bgc("salinity"));
    }
}
