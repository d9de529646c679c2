//! External service boundary: reverse geocoding and routing.
//!
//! Both collaborators live outside the core and are allowed to fail or time
//! out; the engine degrades to raw coordinates or an external-navigation
//! hand-off instead of blocking marker rendering.

pub mod http;

use crate::{core::geo::LatLng, Result};
use async_trait::async_trait;

/// Lifecycle of an in-flight external lookup as the UI shell tracks it
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome<T> {
    Pending,
    Settled(T),
    Failed(String),
}

impl<T> ServiceOutcome<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Settled(value),
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn settled(&self) -> Option<&T> {
        match self {
            Self::Settled(value) => Some(value),
            _ => None,
        }
    }
}

/// A route between two coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub distance_m: f64,
    pub duration_s: f64,
    pub geometry: Vec<LatLng>,
}

/// Coordinate-to-address lookup
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn address(&self, lng: f64, lat: f64) -> Result<String>;
}

/// Route-between-two-points lookup
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, from: &LatLng, to: &LatLng) -> Result<RouteSummary>;
}

/// Raw-coordinate fallback shown when the geocoder fails or hasn't settled
pub fn coordinate_label(lng: f64, lat: f64) -> String {
    let ns = if lat >= 0.0 { 'N' } else { 'S' };
    let ew = if lng >= 0.0 { 'E' } else { 'W' };
    format!("{:.5}°{}, {:.5}°{}", lat.abs(), ns, lng.abs(), ew)
}

/// Hand-off deep link for an external navigation app, used when the
/// routing lookup fails
pub fn external_navigation_url(from: &LatLng, to: &LatLng) -> String {
    format!(
        "https://www.google.com/maps/dir/?api=1&origin={},{}&destination={},{}",
        from.lat, from.lng, to.lat, to.lng
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_label() {
        assert_eq!(coordinate_label(8.5417, 47.3769), "47.37690°N, 8.54170°E");
        assert_eq!(coordinate_label(-74.0060, -33.8688), "33.86880°S, 74.00600°W");
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: ServiceOutcome<i32> = ServiceOutcome::from_result(Ok(7));
        assert_eq!(ok.settled(), Some(&7));

        let err: ServiceOutcome<i32> =
            ServiceOutcome::from_result(Err(crate::NoteMapError::Service("timeout".into()).into()));
        assert!(matches!(err, ServiceOutcome::Failed(_)));
        assert!(ServiceOutcome::<i32>::Pending.is_pending());
    }

    #[test]
    fn test_external_navigation_url() {
        let url = external_navigation_url(&LatLng::new(47.0, 8.0), &LatLng::new(47.5, 8.5));
        assert!(url.contains("origin=47,8"));
        assert!(url.contains("destination=47.5,8.5"));
    }

    struct StaticGeocoder;

    #[async_trait]
    impl Geocoder for StaticGeocoder {
        async fn address(&self, _lng: f64, _lat: f64) -> crate::Result<String> {
            Ok("Bahnhofstrasse 1, Zürich".to_string())
        }
    }

    #[tokio::test]
    async fn test_geocoder_seam_is_object_safe() {
        let geocoder: Box<dyn Geocoder> = Box::new(StaticGeocoder);
        let outcome = ServiceOutcome::from_result(geocoder.address(8.54, 47.37).await);

        assert_eq!(
            outcome.settled().map(String::as_str),
            Some("Bahnhofstrasse 1, Zürich")
        );
    }
}
