use crate::core::viewport::Viewport;
use std::time::{Duration, Instant};

/// Default interval between viewport-driven cluster queries during movement
pub const DEFAULT_BOUNDS_UPDATE_INTERVAL_MS: u64 = 100;

/// Throttles the stream of viewport changes into at most one query per
/// interval of movement.
///
/// The throttle is trailing-edge: events inside the window only replace the
/// pending viewport (a superseded query is never executed), and when the
/// window elapses the query fires with the newest viewport, never the one
/// that opened the window. The settle event at the end of a movement always
/// fires exactly once, unconditionally, so the rendered markers are
/// eventually consistent with the final viewport.
///
/// Callers pass `now` explicitly; the tracker never reads the clock itself.
#[derive(Debug)]
pub struct ViewportTracker {
    interval: Duration,
    /// Start of the current throttle window; None while idle
    window_start: Option<Instant>,
    pending: Option<Viewport>,
}

impl ViewportTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            pending: None,
        }
    }

    pub fn with_default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_BOUNDS_UPDATE_INTERVAL_MS))
    }

    /// Feeds a move event. Returns the viewport to query with once per
    /// elapsed window; inside the window the event is stashed as the
    /// pending viewport, superseding any older pending one.
    pub fn on_move(&mut self, viewport: Viewport, now: Instant) -> Option<Viewport> {
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.pending = Some(viewport);
                None
            }
            Some(start) if now.duration_since(start) >= self.interval => {
                self.window_start = Some(now);
                self.pending = None;
                Some(viewport)
            }
            Some(_) => {
                self.pending = Some(viewport);
                None
            }
        }
    }

    /// Feeds the movement-end event. Always returns a viewport to query
    /// with: the one supplied here wins over any pending intermediate.
    pub fn on_settle(&mut self, viewport: Viewport, _now: Instant) -> Viewport {
        self.window_start = None;
        self.pending = None;
        viewport
    }

    /// Polls for a pending viewport whose throttle window has elapsed.
    /// Lets a shell without a reliable settle signal still drain the
    /// trailing update.
    pub fn poll(&mut self, now: Instant) -> Option<Viewport> {
        match (self.window_start, self.pending.take()) {
            (Some(start), Some(viewport)) if now.duration_since(start) >= self.interval => {
                self.window_start = Some(now);
                Some(viewport)
            }
            (_, stashed) => {
                self.pending = stashed;
                None
            }
        }
    }

    /// Whether an intermediate viewport is waiting for the window to elapse
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for ViewportTracker {
    fn default() -> Self {
        Self::with_default_interval()
    }
}
