use crate::{
    core::{
        bounds::Bounds,
        geo::{LatLng, Point},
    },
    Result,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Which edge of the popup box carries the pointer arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmSide {
    /// Arm on the top edge; the popup sits below the marker
    Top,
    /// Arm on the bottom edge; the popup sits above the marker
    Bottom,
}

/// A computed popup position. Recomputed on every projection update while
/// the popup is open; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopupPlacement {
    pub left: f64,
    pub top: f64,
    pub arm_side: ArmSide,
    /// Where the arm sits along the box width, in percent
    pub arm_offset_percent: f64,
    /// False until the first successful placement, so the shell can fade
    /// the popup in instead of jumping it from the origin
    pub visible: bool,
    /// True when neither side had room and the popup may partially clip
    pub clipped: bool,
}

impl PopupPlacement {
    fn hidden() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            arm_side: ArmSide::Top,
            arm_offset_percent: 50.0,
            visible: false,
            clipped: false,
        }
    }
}

/// What an open popup shows. The placement engine is variant-agnostic; it
/// only ever sees an anchor and a measured size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PopupContent {
    Note(NoteContent),
    NewLocation(LocationContent),
    Friend(FriendContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteContent {
    pub note_id: String,
    pub title: String,
    pub body: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationContent {
    pub lng: f64,
    pub lat: f64,
    /// Reverse-geocoded address once the lookup settles; the shell shows
    /// raw coordinates until then (or if the lookup fails)
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendContent {
    pub friend_id: String,
    pub name: String,
    pub note_count: usize,
}

/// Popup geometry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PopupConfig {
    /// Fixed popup box width in pixels
    pub width: f64,
    /// Minimum gap kept between the box and the viewport edges
    pub margin: f64,
    /// Vertical clearance reserved so the box never overlaps the marker glyph
    pub marker_offset: f64,
    /// Height assumed before the box has ever been measured
    pub default_height: f64,
    /// Keeps the arm off the rounded corners, in percent of box width
    pub arm_margin_percent: f64,
    /// Delay of the one-shot remeasure after opening
    pub remeasure_delay_ms: u64,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            width: 280.0,
            margin: 8.0,
            marker_offset: 42.0,
            default_height: 120.0,
            arm_margin_percent: 8.0,
            remeasure_delay_ms: 100,
        }
    }
}

/// Places a popup next to an on-screen anchor without letting it run
/// off-screen.
///
/// The engine caches the last measured box height so a popup that hasn't
/// laid out yet (first frame after open) keeps the previous size instead of
/// flashing the default, and it retains the last good placement when the
/// projection fails mid-gesture.
pub struct PlacementEngine {
    config: PopupConfig,
    last_height: Option<f64>,
    last_placement: Option<PopupPlacement>,
    opened_at: Option<Instant>,
    remeasured: bool,
}

impl PlacementEngine {
    pub fn new(config: PopupConfig) -> Self {
        Self {
            config,
            last_height: None,
            last_placement: None,
            opened_at: None,
            remeasured: false,
        }
    }

    /// Marks a popup as opened. The previous placement is dropped (the new
    /// popup stays invisible until its first successful placement), but the
    /// measured height survives across opens.
    pub fn open(&mut self, now: Instant) {
        self.last_placement = None;
        self.opened_at = Some(now);
        self.remeasured = false;
    }

    pub fn close(&mut self) {
        self.last_placement = None;
        self.opened_at = None;
        self.remeasured = false;
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// One-shot trigger for the delayed re-placement that picks up the real
    /// measured height once the popup has laid out. Returns true exactly
    /// once per open, after the configured delay.
    pub fn needs_remeasure(&mut self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) if !self.remeasured => {
                if now.duration_since(opened) >= Duration::from_millis(self.config.remeasure_delay_ms)
                {
                    self.remeasured = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Computes the popup placement for the given anchor.
    ///
    /// `project` is the live geo-to-screen projection; `measured_height` is
    /// the actual rendered box height if it is known this frame. A failing
    /// projection silently retains the last known placement rather than
    /// snapping the popup to the origin.
    pub fn place<F>(
        &mut self,
        anchor: &LatLng,
        project: F,
        measured_height: Option<f64>,
        viewport_size: Point,
    ) -> PopupPlacement
    where
        F: Fn(&LatLng) -> Result<Point>,
    {
        let screen = match project(anchor) {
            Ok(p) if p.x.is_finite() && p.y.is_finite() => p,
            Ok(_) | Err(_) => {
                log::debug!("popup anchor projection failed, retaining last placement");
                return self
                    .last_placement
                    .clone()
                    .unwrap_or_else(PopupPlacement::hidden);
            }
        };

        if let Some(height) = measured_height {
            self.last_height = Some(height);
        }
        let height = self.last_height.unwrap_or(self.config.default_height);

        let cfg = &self.config;
        let space_above = screen.y - cfg.margin;
        let space_below = viewport_size.y - screen.y - cfg.margin;
        let needed = height + cfg.marker_offset;

        let (top, arm_side) = if space_below >= needed {
            (screen.y + cfg.marker_offset, ArmSide::Top)
        } else if space_above >= needed {
            (screen.y - cfg.marker_offset - height, ArmSide::Bottom)
        } else if space_below >= space_above {
            // Forced placement: not enough room on either side. The box may
            // partially clip, which callers treat as degraded, not an error.
            (screen.y + cfg.marker_offset, ArmSide::Top)
        } else {
            (screen.y - cfg.marker_offset - height, ArmSide::Bottom)
        };

        let left_max = (viewport_size.x - cfg.width - cfg.margin).max(cfg.margin);
        let left = (screen.x - cfg.width / 2.0).clamp(cfg.margin, left_max);

        let box_bounds = Bounds::from_origin_and_size(Point::new(left, top), cfg.width, height);
        let screen_bounds = Bounds::from_coords(0.0, 0.0, viewport_size.x, viewport_size.y);
        let clipped = !screen_bounds.contains_bounds(&box_bounds);

        // The arm keeps pointing at the anchor even when the box got
        // clamped horizontally.
        let arm_offset_percent = ((screen.x - left) / cfg.width * 100.0)
            .clamp(cfg.arm_margin_percent, 100.0 - cfg.arm_margin_percent);

        let placement = PopupPlacement {
            left,
            top,
            arm_side,
            arm_offset_percent,
            visible: true,
            clipped,
        };
        self.last_placement = Some(placement.clone());
        placement
    }

    /// The most recent successful placement, if any
    pub fn current(&self) -> Option<&PopupPlacement> {
        self.last_placement.as_ref()
    }

    pub fn config(&self) -> &PopupConfig {
        &self.config
    }
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new(PopupConfig::default())
    }
}
