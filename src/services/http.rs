use crate::{
    core::geo::LatLng,
    services::{Geocoder, RouteSummary, Router},
    NoteMapError, Result,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::time::Duration;

/// Shared async HTTP client with a custom User-Agent so that public
/// geocoding/routing servers don't reject the request, and a hard timeout
/// so a stalled lookup settles as failed instead of hanging the caller.
pub(crate) static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("notemap/0.1 (+https://github.com/example/notemap)")
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest async client")
});

/// Reverse geocoder against a Nominatim-compatible endpoint
pub struct HttpGeocoder {
    endpoint: String,
}

impl HttpGeocoder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for HttpGeocoder {
    fn default() -> Self {
        Self::new("https://nominatim.openstreetmap.org")
    }
}

fn reverse_geocode_url(endpoint: &str, lng: f64, lat: f64) -> String {
    format!(
        "{}/reverse?format=jsonv2&lat={}&lon={}",
        endpoint.trim_end_matches('/'),
        lat,
        lng
    )
}

fn parse_reverse_response(body: &serde_json::Value) -> Result<String> {
    body.get("display_name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| NoteMapError::Service("reverse geocode response had no display_name".into()).into())
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn address(&self, lng: f64, lat: f64) -> Result<String> {
        let url = reverse_geocode_url(&self.endpoint, lng, lat);
        log::debug!("reverse geocoding ({}, {})", lng, lat);

        let resp = HTTP_CLIENT.get(&url).send().await?;
        if !resp.status().is_success() {
            log::warn!("reverse geocode failed: HTTP {}", resp.status());
            return Err(NoteMapError::Service(format!("HTTP {}", resp.status())).into());
        }

        let body: serde_json::Value = resp.json().await?;
        parse_reverse_response(&body)
    }
}

/// Routing against an OSRM-compatible endpoint
pub struct HttpRouter {
    endpoint: String,
    profile: String,
}

impl HttpRouter {
    pub fn new(endpoint: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            profile: profile.into(),
        }
    }
}

impl Default for HttpRouter {
    fn default() -> Self {
        Self::new("https://router.project-osrm.org", "driving")
    }
}

fn route_url(endpoint: &str, profile: &str, from: &LatLng, to: &LatLng) -> String {
    format!(
        "{}/route/v1/{}/{},{};{},{}?overview=full&geometries=geojson",
        endpoint.trim_end_matches('/'),
        profile,
        from.lng,
        from.lat,
        to.lng,
        to.lat
    )
}

fn parse_route_response(body: &serde_json::Value) -> Result<RouteSummary> {
    let route = body
        .get("routes")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .ok_or_else(|| NoteMapError::Service("route response had no routes".into()))?;

    let distance_m = route.get("distance").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let duration_s = route.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0);

    let geometry = route
        .get("geometry")
        .and_then(|g| g.get("coordinates"))
        .and_then(|c| c.as_array())
        .map(|coords| {
            coords
                .iter()
                .filter_map(|pair| {
                    let lng = pair.get(0)?.as_f64()?;
                    let lat = pair.get(1)?.as_f64()?;
                    Some(LatLng::new(lat, lng))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(RouteSummary {
        distance_m,
        duration_s,
        geometry,
    })
}

#[async_trait]
impl Router for HttpRouter {
    async fn route(&self, from: &LatLng, to: &LatLng) -> Result<RouteSummary> {
        let url = route_url(&self.endpoint, &self.profile, from, to);
        log::debug!("routing {:?} -> {:?}", from, to);

        let resp = HTTP_CLIENT.get(&url).send().await?;
        if !resp.status().is_success() {
            log::warn!("route lookup failed: HTTP {}", resp.status());
            return Err(NoteMapError::Service(format!("HTTP {}", resp.status())).into());
        }

        let body: serde_json::Value = resp.json().await?;
        parse_route_response(&body)
    }
}
