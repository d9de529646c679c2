//! Prelude module for common notemap types and traits
//!
//! Re-exports the most commonly used types for easy importing with
//! `use notemap::prelude::*;`

pub use crate::core::{
    bounds::Bounds,
    geo::{LatLng, LatLngBounds, Point},
    tracker::ViewportTracker,
    viewport::Viewport,
};

pub use crate::store::{GeoPoint, GeoPointStore, PointRecord};

pub use crate::spatial::index::{ClusterConfig, ClusterIndex, ClusterNode};

pub use crate::markers::{
    reconciler::{MarkerKind, MarkerPatch, MarkerProps, MarkerReconciler, RenderedMarker},
    renderer::{MarkerRenderer, RecordingRenderer},
};

pub use crate::ui::popup::{
    ArmSide, PlacementEngine, PopupConfig, PopupContent, PopupPlacement,
};

pub use crate::services::{Geocoder, RouteSummary, Router, ServiceOutcome};

pub use crate::engine::{EngineEvent, EngineOptions, NoteMap};

pub use crate::{Error as NoteMapError, Result};

pub use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet, FxHasher};
