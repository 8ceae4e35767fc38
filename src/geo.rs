//! Postal-code lookup and reachability distance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Centroid and region for one postal code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalArea {
    pub postal_code: String,
    pub region: String,
    pub lat: f64,
    pub lon: f64,
}

/// Postal code → region/coordinates. Consumed, never written, by the dispatch core.
pub trait RegionLookup: Send + Sync {
    fn lookup(&self, postal_code: &str) -> Option<PostalArea>;

    fn region_of(&self, postal_code: &str) -> Option<String> {
        self.lookup(postal_code).map(|a| a.region)
    }

    /// Great-circle distance between two postal-code centroids.
    /// `None` if either code is unknown.
    fn distance_km(&self, from: &str, to: &str) -> Option<f64> {
        let a = self.lookup(from)?;
        let b = self.lookup(to)?;
        Some(haversine_km(a.lat, a.lon, b.lat, b.lon))
    }
}

/// In-memory directory, loaded from the seed file.
#[derive(Debug, Default, Clone)]
pub struct PostalDirectory {
    areas: HashMap<String, PostalArea>,
}

impl PostalDirectory {
    pub fn new(areas: impl IntoIterator<Item = PostalArea>) -> Self {
        Self {
            areas: areas
                .into_iter()
                .map(|a| (normalize_postal_code(&a.postal_code), a))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

impl RegionLookup for PostalDirectory {
    fn lookup(&self, postal_code: &str) -> Option<PostalArea> {
        self.areas.get(&normalize_postal_code(postal_code)).cloned()
    }
}

/// Canonical postal code: whitespace removed, uppercased. Every postal-code
/// comparison and cache key goes through this.
pub fn normalize_postal_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Canonical region name: trimmed, Unicode-lowercased.
pub fn normalize_region(region: &str) -> String {
    region.trim().to_lowercase()
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let h = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> PostalDirectory {
        PostalDirectory::new([
            PostalArea {
                postal_code: "2000".into(),
                region: "Sydney".into(),
                lat: -33.8688,
                lon: 151.2093,
            },
            PostalArea {
                postal_code: "2060".into(),
                region: "North Sydney".into(),
                lat: -33.8390,
                lon: 151.2070,
            },
            PostalArea {
                postal_code: "3000".into(),
                region: "Melbourne".into(),
                lat: -37.8136,
                lon: 144.9631,
            },
        ])
    }

    #[test]
    fn lookup_normalizes_input() {
        let dir = directory();
        assert_eq!(dir.region_of(" 2000 ").as_deref(), Some("Sydney"));
        assert!(dir.lookup("9999").is_none());
    }

    #[test]
    fn normalizers_ignore_cosmetics() {
        assert_eq!(normalize_postal_code(" sw1a 1aa "), "SW1A1AA");
        assert_eq!(normalize_postal_code("20 00"), normalize_postal_code("2000"));
        assert_eq!(normalize_region("  ÉVRY "), normalize_region("évry"));
        assert_eq!(directory().region_of("20 00").as_deref(), Some("Sydney"));
    }

    #[test]
    fn nearby_codes_are_close() {
        let dir = directory();
        let near = dir.distance_km("2000", "2060").unwrap();
        assert!(near < 5.0, "got {near}");
        let far = dir.distance_km("2000", "3000").unwrap();
        assert!(far > 600.0 && far < 800.0, "got {far}");
    }

    #[test]
    fn unknown_code_has_no_distance() {
        assert!(directory().distance_km("2000", "0000").is_none());
    }

    #[test]
    fn zero_distance_to_self() {
        assert!(haversine_km(10.0, 20.0, 10.0, 20.0).abs() < 1e-9);
    }
}
