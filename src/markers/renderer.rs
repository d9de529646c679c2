use crate::{markers::reconciler::MarkerProps, Result};

/// Opaque visual resource issued by a renderer when a marker is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerHandle(u64);

impl MarkerHandle {
    /// Handle used for markers whose visual failed to build; the marker
    /// stays alive and renders as a neutral placeholder glyph.
    pub const PLACEHOLDER: MarkerHandle = MarkerHandle(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The seam between the reconciler and the UI shell's actual drawing.
///
/// Implementations are stateless visual leaves driven entirely by the patch
/// list; all lifecycle decisions stay in the reconciler.
pub trait MarkerRenderer {
    /// Builds the visual for a new marker and returns its handle
    fn create_marker(&mut self, props: &MarkerProps) -> Result<MarkerHandle>;

    /// Refreshes an existing marker's derived visual state (selection
    /// highlight, badge imagery). Must be idempotent.
    fn update_marker(&mut self, handle: MarkerHandle, props: &MarkerProps) -> Result<()>;

    /// Tears down a marker's visual. Infallible: a destroy is the last
    /// thing that ever happens to a handle.
    fn destroy_marker(&mut self, handle: MarkerHandle, key: &str);
}

/// Formats a cluster badge count, abbreviating large values
pub fn badge_label(count: usize) -> String {
    if count < 1000 {
        format!("{}", count)
    } else if count < 10_000 {
        format!("{:.1}k", count as f64 / 1000.0)
    } else {
        format!("{}k", count / 1000)
    }
}

/// Picks the badge image for a cluster at a given rotation tick.
///
/// Cluster badges cycle through their member imagery; the tick comes from
/// the shell's animation clock. Returns `None` when no imagery is
/// available, in which case the badge falls back to the count-only
/// placeholder.
pub fn cycle_badge_image<'a>(image_ids: &'a [String], tick: usize) -> Option<&'a str> {
    if image_ids.is_empty() {
        None
    } else {
        Some(image_ids[tick % image_ids.len()].as_str())
    }
}

/// Test renderer: records every operation and can be told to fail
/// creation for specific keys.
pub struct RecordingRenderer {
    next_handle: u64,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub destroyed: Vec<String>,
    failing_keys: Vec<String>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            created: Vec::new(),
            updated: Vec::new(),
            destroyed: Vec::new(),
            failing_keys: Vec::new(),
        }
    }

    pub fn fail_on(&mut self, key: &str) {
        self.failing_keys.push(key.to_string());
    }
}

impl Default for RecordingRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerRenderer for RecordingRenderer {
    fn create_marker(&mut self, props: &MarkerProps) -> Result<MarkerHandle> {
        if self.failing_keys.iter().any(|k| k == &props.key) {
            return Err(crate::NoteMapError::Render(format!(
                "simulated render failure for '{}'",
                props.key
            ))
            .into());
        }
        self.created.push(props.key.clone());
        let handle = MarkerHandle::new(self.next_handle);
        self.next_handle += 1;
        Ok(handle)
    }

    fn update_marker(&mut self, _handle: MarkerHandle, props: &MarkerProps) -> Result<()> {
        self.updated.push(props.key.clone());
        Ok(())
    }

    fn destroy_marker(&mut self, _handle: MarkerHandle, key: &str) {
        self.destroyed.push(key.to_string());
    }
}
