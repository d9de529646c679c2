//! # notemap
//!
//! A spatial clustering and incremental marker rendering engine for
//! geotagged notes.
//!
//! Given a dynamically changing set of notes, a moving viewport, and a
//! continuous zoom level, this library groups nearby notes into clusters
//! appropriate to the current zoom, returns only what intersects the
//! viewport, diffs the result against the previously rendered marker set
//! into a minimal create/update/destroy patch, and places detail popups
//! next to an on-screen anchor without letting them run off-screen.
//!
//! Persistence, authentication, and the UI shell itself are external
//! collaborators; this crate is an in-process library consumed by one.

pub mod core;
pub mod engine;
pub mod markers;
pub mod services;
pub mod spatial;
pub mod store;
pub mod ui;

pub mod prelude;

// Re-export public API
pub use crate::core::{
    bounds::Bounds,
    geo::{LatLng, LatLngBounds, Point},
    tracker::ViewportTracker,
    viewport::Viewport,
};

pub use crate::store::{GeoPoint, GeoPointStore, PointRecord};

pub use crate::spatial::index::{ClusterConfig, ClusterIndex, ClusterNode};

pub use crate::markers::{
    reconciler::{MarkerPatch, MarkerProps, MarkerReconciler, RenderedMarker},
    renderer::MarkerRenderer,
};

pub use crate::ui::popup::{ArmSide, PlacementEngine, PopupConfig, PopupContent, PopupPlacement};

pub use crate::services::{Geocoder, RouteSummary, Router, ServiceOutcome};

pub use crate::engine::{EngineEvent, NoteMap};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum NoteMapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("External service error: {0}")]
    Service(String),
}

/// Error type alias for convenience
pub type Error = NoteMapError;
