//! Scoring functions for retrieved hits

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Weights for merging parallel retrievals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeWeights {
    pub similarity: f32,
    pub exactness: f32,
}

impl Default for MergeWeights {
    fn default() -> Self {
        Self {
            similarity: 0.6,
            exactness: 0.4,
        }
    }
}

/// Weighted score combining vector similarity and filter exactness
pub fn merged_score(similarity: f32, exactness: f32, weights: &MergeWeights) -> f32 {
    weights.similarity * similarity.clamp(0.0, 1.0) + weights.exactness * exactness.clamp(0.0, 1.0)
}

/// Cosine similarity; 0.0 for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Great-circle distance in kilometres (haversine)
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Relevance of a hit at `distance_km` inside a search circle of `radius_km`
pub fn proximity_score(distance_km: f64, radius_km: f64) -> f32 {
    if radius_km <= 0.0 {
        return 0.0;
    }
    (1.0 - distance_km / radius_km).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // One degree of latitude is ~111.2 km
        let d = haversine_km(15.0, 68.0, 16.0, 68.0);
        assert!((d - 111.19).abs() < 0.5, "got {}", d);
        assert!(haversine_km(15.5, 68.2, 15.5, 68.2) < 1e-9);
    }

    #[test]
    fn proximity_decreases_with_distance() {
        assert_eq!(proximity_score(0.0, 100.0), 1.0);
        assert!(proximity_score(25.0, 100.0) > proximity_score(50.0, 100.0));
        assert_eq!(proximity_score(150.0, 100.0), 0.0);
    }

    #[test]
    fn merged_score_respects_weights() {
        let w = MergeWeights::default();
        let exact = merged_score(0.5, 1.0, &w);
        let loose = merged_score(0.5, 0.0, &w);
        assert!((exact - 0.7).abs() < 1e-6);
        assert!((loose - 0.3).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    }
}
