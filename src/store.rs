use crate::{core::geo::LatLng, NoteMapError, Result};
use crate::prelude::HashMap;
use serde::{Deserialize, Serialize};

/// A geotagged note: a unique id, a fixed coordinate, and an opaque payload.
///
/// Coordinates are immutable once stored; an edit is modeled as a payload
/// replacement (or a delete + insert when the note actually moves).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint<T> {
    pub id: String,
    pub lng: f64,
    pub lat: f64,
    pub payload: T,
}

impl<T> GeoPoint<T> {
    pub fn new(id: impl Into<String>, lng: f64, lat: f64, payload: T) -> Self {
        Self {
            id: id.into(),
            lng,
            lat,
            payload,
        }
    }

    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// The id + coordinate slice of a point, which is all the spatial index
/// consumes. Snapshots are cheap to clone and immune to later payload edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: String,
    pub lng: f64,
    pub lat: f64,
}

/// Owner of the current note set.
///
/// Mutations arrive from the external CRUD layer; the spatial index only
/// ever reads immutable snapshots, so it can never observe a torn write.
/// Every successful mutation bumps the epoch, which the engine uses to
/// discard stale background index builds.
pub struct GeoPointStore<T> {
    points: HashMap<String, GeoPoint<T>>,
    epoch: u64,
}

impl<T> GeoPointStore<T> {
    pub fn new() -> Self {
        Self {
            points: HashMap::default(),
            epoch: 0,
        }
    }

    /// Inserts a new point. Malformed coordinates and duplicate ids are
    /// rejected here so they never reach the index.
    pub fn insert(&mut self, point: GeoPoint<T>) -> Result<()> {
        let position = point.position();
        if !position.is_valid() {
            return Err(NoteMapError::InvalidCoordinates(format!(
                "point '{}' has lng={} lat={}",
                point.id, point.lng, point.lat
            ))
            .into());
        }
        if self.points.contains_key(&point.id) {
            return Err(NoteMapError::Store(format!("duplicate id '{}'", point.id)).into());
        }

        self.points.insert(point.id.clone(), point);
        self.epoch += 1;
        Ok(())
    }

    /// Replaces the payload of an existing point, coordinates untouched
    pub fn replace_payload(&mut self, id: &str, payload: T) -> Result<()> {
        match self.points.get_mut(id) {
            Some(point) => {
                point.payload = payload;
                self.epoch += 1;
                Ok(())
            }
            None => Err(NoteMapError::Store(format!("unknown id '{}'", id)).into()),
        }
    }

    /// Removes a point, returning it if present
    pub fn remove(&mut self, id: &str) -> Option<GeoPoint<T>> {
        let removed = self.points.remove(id);
        if removed.is_some() {
            self.epoch += 1;
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&GeoPoint<T>> {
        self.points.get(id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeoPoint<T>> {
        self.points.values()
    }

    pub fn clear(&mut self) {
        if !self.points.is_empty() {
            self.points.clear();
            self.epoch += 1;
        }
    }

    /// Monotonic mutation counter; drives last-build-wins index swaps
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Immutable snapshot of ids + coordinates for an index build
    pub fn snapshot(&self) -> Vec<PointRecord> {
        self.points
            .values()
            .map(|p| PointRecord {
                id: p.id.clone(),
                lng: p.lng,
                lat: p.lat,
            })
            .collect()
    }
}

impl<T> Default for GeoPointStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
