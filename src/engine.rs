use crate::{
    core::{
        geo::{LatLng, LatLngBounds, Point},
        tracker::ViewportTracker,
        viewport::Viewport,
    },
    markers::{
        reconciler::{MarkerPatch, MarkerReconciler},
        renderer::MarkerRenderer,
    },
    spatial::index::{ClusterConfig, ClusterIndex, ClusterNode},
    store::{GeoPoint, GeoPointStore},
    ui::popup::{PlacementEngine, PopupConfig, PopupPlacement},
    Result,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub cluster: ClusterConfig,
    pub popup: PopupConfig,
    /// Minimum interval between viewport-driven cluster queries while the
    /// map is moving
    pub bounds_update_interval_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            popup: PopupConfig::default(),
            bounds_update_interval_ms: crate::core::tracker::DEFAULT_BOUNDS_UPDATE_INTERVAL_MS,
        }
    }
}

/// Events surfaced to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A cluster marker was clicked; the viewport has been flown to the
    /// zoom at which the cluster splits
    ClusterClick { id: u64, expansion_zoom: f64 },
    /// A single note marker was clicked and is now selected
    LeafClick { id: String },
    /// The selected key changed (including to none)
    SelectionChanged { key: Option<String> },
}

/// Result of a background index build
struct RebuildResult {
    epoch: u64,
    index: ClusterIndex,
}

/// The engine: owns the note store, the cluster index, the viewport, and
/// the rendered marker set, and turns mutations and viewport movement into
/// minimal marker patches.
///
/// Runs single-threaded; the only off-thread work is the optional
/// background index build, which runs to completion and is swapped in
/// atomically. A query never sees a half-built index, and a stale build is
/// discarded in favor of a newer one (last build wins).
pub struct NoteMap<T> {
    store: GeoPointStore<T>,
    index: Arc<ClusterIndex>,
    index_epoch: u64,
    options: EngineOptions,
    viewport: Viewport,
    tracker: ViewportTracker,
    reconciler: MarkerReconciler,
    placement: PlacementEngine,
    selection: Option<String>,
    /// Nodes from the most recent query; click dispatch resolves against
    /// this, so handlers can never act on stale captured state
    last_result: Vec<ClusterNode>,
    rebuild_tx: Sender<RebuildResult>,
    rebuild_rx: Receiver<RebuildResult>,
}

impl<T: Clone + Send + 'static> NoteMap<T> {
    pub fn new(viewport: Viewport, options: EngineOptions) -> Self {
        let (rebuild_tx, rebuild_rx) = unbounded();
        let index = Arc::new(ClusterIndex::build(&[], options.cluster.clone()));
        Self {
            store: GeoPointStore::new(),
            index,
            index_epoch: 0,
            tracker: ViewportTracker::new(Duration::from_millis(
                options.bounds_update_interval_ms,
            )),
            reconciler: MarkerReconciler::new(),
            placement: PlacementEngine::new(options.popup.clone()),
            selection: None,
            last_result: Vec::new(),
            viewport,
            options,
            rebuild_tx,
            rebuild_rx,
        }
    }

    pub fn with_defaults(viewport: Viewport) -> Self {
        Self::new(viewport, EngineOptions::default())
    }

    // --- mutation feed ------------------------------------------------------------------------

    /// Inserts a note and rebuilds the index
    pub fn insert_note(&mut self, note: GeoPoint<T>) -> Result<()> {
        self.store.insert(note)?;
        self.rebuild();
        Ok(())
    }

    /// Inserts many notes with a single index rebuild at the end.
    /// Individual malformed notes are rejected and returned; the rest of
    /// the batch still lands.
    pub fn insert_notes(
        &mut self,
        notes: impl IntoIterator<Item = GeoPoint<T>>,
    ) -> Vec<(GeoPoint<T>, crate::Error)> {
        let mut rejected = Vec::new();
        for note in notes {
            let probe = note.clone();
            if let Err(e) = self.store.insert(note) {
                let err = match e.downcast::<crate::Error>() {
                    Ok(err) => *err,
                    Err(other) => crate::Error::Store(other.to_string()),
                };
                log::warn!("rejected note '{}': {}", probe.id, err);
                rejected.push((probe, err));
            }
        }
        self.rebuild();
        rejected
    }

    /// Replaces a note's payload in place; coordinates stay fixed
    pub fn replace_note_payload(&mut self, id: &str, payload: T) -> Result<()> {
        self.store.replace_payload(id, payload)?;
        self.rebuild();
        Ok(())
    }

    /// Removes a note and rebuilds the index
    pub fn remove_note(&mut self, id: &str) -> Option<GeoPoint<T>> {
        let removed = self.store.remove(id);
        if removed.is_some() {
            let key = format!("leaf:{}", id);
            if self.selection.as_deref() == Some(key.as_str()) {
                self.selection = None;
                self.placement.close();
            }
            self.rebuild();
        }
        removed
    }

    // --- index lifecycle ----------------------------------------------------------------------

    /// Synchronous rebuild: build the new index to completion, then swap
    pub fn rebuild(&mut self) {
        let snapshot = self.store.snapshot();
        self.index = Arc::new(ClusterIndex::build(&snapshot, self.options.cluster.clone()));
        self.index_epoch = self.store.epoch();
    }

    /// Kicks off a rebuild off the interaction thread. The finished index
    /// arrives through `poll_rebuild`; results from superseded builds are
    /// discarded there.
    pub fn spawn_rebuild(&self) {
        let snapshot = self.store.snapshot();
        let config = self.options.cluster.clone();
        let epoch = self.store.epoch();
        let tx = self.rebuild_tx.clone();

        execute_blocking(move || {
            let index = ClusterIndex::build(&snapshot, config);
            let _ = tx.send(RebuildResult { epoch, index });
        });
    }

    /// Drains finished background builds and swaps in the newest one.
    /// Returns true if the index changed.
    pub fn poll_rebuild(&mut self) -> bool {
        let mut newest: Option<RebuildResult> = None;
        while let Ok(result) = self.rebuild_rx.try_recv() {
            if newest.as_ref().map_or(true, |n| result.epoch > n.epoch) {
                newest = Some(result);
            }
        }

        match newest {
            Some(result) if result.epoch > self.index_epoch => {
                self.index = Arc::new(result.index);
                self.index_epoch = result.epoch;
                true
            }
            Some(result) => {
                log::debug!(
                    "discarding stale index build (epoch {} <= {})",
                    result.epoch,
                    self.index_epoch
                );
                false
            }
            None => false,
        }
    }

    // --- viewport feed ------------------------------------------------------------------------

    /// Feeds an intermediate map-move event. Returns the applied patch when
    /// the throttle window lets the query through.
    pub fn on_viewport_moved(
        &mut self,
        viewport: Viewport,
        now: Instant,
        renderer: &mut dyn MarkerRenderer,
    ) -> Option<MarkerPatch> {
        self.viewport = viewport.clone();
        self.tracker
            .on_move(viewport, now)
            .map(|v| self.run_query(&v, renderer))
    }

    /// Feeds the movement-end event. Always queries, so the rendered set is
    /// eventually consistent with the final viewport.
    pub fn on_viewport_settled(
        &mut self,
        viewport: Viewport,
        now: Instant,
        renderer: &mut dyn MarkerRenderer,
    ) -> MarkerPatch {
        self.viewport = viewport.clone();
        let v = self.tracker.on_settle(viewport, now);
        self.run_query(&v, renderer)
    }

    /// Drains a pending throttled query whose window has elapsed
    pub fn poll_viewport(
        &mut self,
        now: Instant,
        renderer: &mut dyn MarkerRenderer,
    ) -> Option<MarkerPatch> {
        self.tracker.poll(now).map(|v| self.run_query(&v, renderer))
    }

    fn run_query(&mut self, viewport: &Viewport, renderer: &mut dyn MarkerRenderer) -> MarkerPatch {
        let nodes = self.index.query(&viewport.bounds(), viewport.zoom);
        let zoom_bucket = viewport.zoom.floor() as i32;
        self.last_result = nodes;
        self.reconciler.reconcile_and_apply(
            &self.last_result,
            self.selection.as_deref(),
            zoom_bucket,
            renderer,
        )
    }

    // --- read surface -------------------------------------------------------------------------

    pub fn query_viewport(&self, bbox: &LatLngBounds, zoom: f64) -> Vec<ClusterNode> {
        self.index.query(bbox, zoom)
    }

    pub fn cluster_expansion_zoom(&self, cluster_id: u64) -> Option<f64> {
        self.index.cluster_expansion_zoom(cluster_id)
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn note_count(&self) -> usize {
        self.store.len()
    }

    pub fn note(&self, id: &str) -> Option<&GeoPoint<T>> {
        self.store.get(id)
    }

    pub fn selection(&self) -> Option<&str> {
        self.selection.as_deref()
    }

    pub fn rendered_marker_count(&self) -> usize {
        self.reconciler.len()
    }

    // --- clicks & selection -------------------------------------------------------------------

    /// Dispatches a marker click by key. State is resolved from the current
    /// query result at call time, never from what a handler captured when
    /// the marker was created, so a click right after a reconciliation can
    /// at worst miss (return None), never act on a stale cluster.
    pub fn handle_click(
        &mut self,
        key: &str,
        now: Instant,
        renderer: &mut dyn MarkerRenderer,
    ) -> Option<EngineEvent> {
        let node = self.last_result.iter().find(|n| n.key() == key)?.clone();

        match node {
            ClusterNode::Cluster { id, .. } => {
                let expansion_zoom = self
                    .cluster_expansion_zoom(id)
                    .unwrap_or(self.viewport.zoom + 1.0)
                    .min(self.options.cluster.max_zoom as f64);
                self.viewport.fly_to(node.position(), expansion_zoom);

                // A fly-to ends a movement; query unconditionally.
                let viewport = self.viewport.clone();
                self.on_viewport_settled(viewport, now, renderer);

                Some(EngineEvent::ClusterClick { id, expansion_zoom })
            }
            ClusterNode::Leaf { id, .. } => {
                self.select(Some(key.to_string()), renderer);
                self.placement.open(now);
                Some(EngineEvent::LeafClick { id })
            }
        }
    }

    /// Changes the selected key and patches the affected markers (two
    /// updates, never a destroy/create)
    fn select(&mut self, key: Option<String>, renderer: &mut dyn MarkerRenderer) {
        if self.selection == key {
            return;
        }
        self.selection = key;
        let zoom_bucket = self.viewport.zoom.floor() as i32;
        self.reconciler.reconcile_and_apply(
            &self.last_result,
            self.selection.as_deref(),
            zoom_bucket,
            renderer,
        );
    }

    /// Clears the selection and closes the popup
    pub fn clear_selection(&mut self, renderer: &mut dyn MarkerRenderer) -> EngineEvent {
        self.select(None, renderer);
        self.placement.close();
        EngineEvent::SelectionChanged { key: None }
    }

    // --- popup --------------------------------------------------------------------------------

    /// Recomputes the popup placement for the selected note against the
    /// live viewport projection. Returns None when nothing is selected.
    pub fn place_popup(&mut self, measured_height: Option<f64>) -> Option<PopupPlacement> {
        let key = self.selection.as_deref()?;
        let point_id = key.strip_prefix("leaf:")?;
        let anchor = self.store.get(point_id)?.position();

        let viewport = self.viewport.clone();
        let placement = self.placement.place(
            &anchor,
            |lat_lng| Ok(viewport.lat_lng_to_pixel(lat_lng)),
            measured_height,
            viewport.size,
        );
        Some(placement)
    }

    /// One-shot remeasure trigger for the open popup
    pub fn popup_needs_remeasure(&mut self, now: Instant) -> bool {
        self.placement.needs_remeasure(now)
    }

    pub fn popup_placement(&self) -> Option<&PopupPlacement> {
        self.placement.current()
    }
}

/// Runs a CPU-bound task off the calling thread, via the tokio blocking
/// pool when the runtime feature is enabled
fn execute_blocking(task: impl FnOnce() + Send + 'static) {
    #[cfg(feature = "tokio-runtime")]
    {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(task);
            return;
        }
    }

    std::thread::spawn(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::renderer::RecordingRenderer;
    use crate::store::GeoPoint;

    fn zurich_viewport() -> Viewport {
        Viewport::new(LatLng::new(47.3769, 8.5417), 13.0, Point::new(800.0, 600.0))
    }

    fn engine_with_notes(notes: &[(&str, f64, f64)]) -> NoteMap<&'static str> {
        let mut engine = NoteMap::with_defaults(zurich_viewport());
        let rejected = engine.insert_notes(
            notes
                .iter()
                .map(|(id, lng, lat)| GeoPoint::new(*id, *lng, *lat, "payload"))
                .collect::<Vec<_>>(),
        );
        assert!(rejected.is_empty());
        engine
    }

    #[test]
    fn test_settle_renders_visible_notes() {
        let mut engine = engine_with_notes(&[("a", 8.5417, 47.3769), ("b", 139.65, 35.67)]);
        let mut renderer = RecordingRenderer::new();

        let viewport = zurich_viewport();
        let patch = engine.on_viewport_settled(viewport, Instant::now(), &mut renderer);

        // Only the note inside the viewport is rendered.
        assert_eq!(patch.creates.len(), 1);
        assert_eq!(patch.creates[0].key, "leaf:a");
        assert_eq!(engine.rendered_marker_count(), 1);
    }

    #[test]
    fn test_leaf_click_selects_and_opens_popup() {
        let mut engine = engine_with_notes(&[("a", 8.5417, 47.3769)]);
        let mut renderer = RecordingRenderer::new();
        let now = Instant::now();

        engine.on_viewport_settled(zurich_viewport(), now, &mut renderer);
        let event = engine.handle_click("leaf:a", now, &mut renderer);

        assert_eq!(event, Some(EngineEvent::LeafClick { id: "a".into() }));
        assert_eq!(engine.selection(), Some("leaf:a"));

        let placement = engine.place_popup(Some(160.0)).unwrap();
        assert!(placement.visible);
    }

    #[test]
    fn test_click_on_vanished_key_is_a_noop() {
        let mut engine = engine_with_notes(&[("a", 8.5417, 47.3769)]);
        let mut renderer = RecordingRenderer::new();
        let now = Instant::now();

        engine.on_viewport_settled(zurich_viewport(), now, &mut renderer);
        assert!(engine.handle_click("leaf:gone", now, &mut renderer).is_none());
    }

    #[test]
    fn test_cluster_click_flies_to_expansion_zoom() {
        // Two notes ~150 m apart cluster at zoom 13.
        let mut engine = engine_with_notes(&[("a", 8.5417, 47.3769), ("b", 8.5437, 47.3769)]);
        let mut renderer = RecordingRenderer::new();
        let now = Instant::now();

        let patch = engine.on_viewport_settled(zurich_viewport(), now, &mut renderer);
        assert_eq!(patch.creates.len(), 1);
        let key = patch.creates[0].key.clone();
        assert!(key.starts_with("cluster:"));

        let event = engine.handle_click(&key, now, &mut renderer).unwrap();
        match event {
            EngineEvent::ClusterClick { expansion_zoom, .. } => {
                assert!(expansion_zoom > 13.0);
                assert_eq!(engine.viewport().zoom, expansion_zoom);
            }
            other => panic!("expected cluster click, got {:?}", other),
        }

        // After flying to the expansion zoom the cluster is split.
        assert!(engine.rendered_marker_count() >= 2);
    }

    #[test]
    fn test_removing_selected_note_clears_selection() {
        let mut engine = engine_with_notes(&[("a", 8.5417, 47.3769)]);
        let mut renderer = RecordingRenderer::new();
        let now = Instant::now();

        engine.on_viewport_settled(zurich_viewport(), now, &mut renderer);
        engine.handle_click("leaf:a", now, &mut renderer);
        assert_eq!(engine.selection(), Some("leaf:a"));

        engine.remove_note("a");
        assert_eq!(engine.selection(), None);
        assert!(engine.place_popup(None).is_none());
    }

    #[test]
    fn test_mutations_rebuild_index() {
        let mut engine: NoteMap<&str> = NoteMap::with_defaults(zurich_viewport());
        let world = LatLngBounds::from_coords(-85.0, -180.0, 85.0, 180.0);

        assert!(engine.query_viewport(&world, 13.0).is_empty());

        engine
            .insert_note(GeoPoint::new("a", 8.5417, 47.3769, "x"))
            .unwrap();
        assert_eq!(engine.query_viewport(&world, 13.0).len(), 1);

        engine.remove_note("a");
        assert!(engine.query_viewport(&world, 13.0).is_empty());
    }

    #[test]
    fn test_insert_notes_rejects_bad_points_keeps_rest() {
        let mut engine: NoteMap<&str> = NoteMap::with_defaults(zurich_viewport());
        let rejected = engine.insert_notes(vec![
            GeoPoint::new("good", 8.5, 47.3, "x"),
            GeoPoint::new("bad", f64::NAN, 47.3, "x"),
        ]);

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0.id, "bad");
        assert_eq!(engine.note_count(), 1);
    }

    #[test]
    fn test_background_rebuild_last_build_wins() {
        let mut engine: NoteMap<&str> = NoteMap::with_defaults(zurich_viewport());
        let world = LatLngBounds::from_coords(-85.0, -180.0, 85.0, 180.0);

        // Mutate the store without the synchronous rebuild.
        engine.store.insert(GeoPoint::new("a", 8.5, 47.3, "x")).unwrap();
        assert!(engine.query_viewport(&world, 13.0).is_empty());

        engine.spawn_rebuild();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.poll_rebuild() {
            assert!(Instant::now() < deadline, "rebuild never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(engine.query_viewport(&world, 13.0).len(), 1);

        // A replay of the same (now stale) epoch is discarded.
        let _ = engine.rebuild_tx.send(RebuildResult {
            epoch: 0,
            index: ClusterIndex::build(&[], ClusterConfig::default()),
        });
        assert!(!engine.poll_rebuild());
        assert_eq!(engine.query_viewport(&world, 13.0).len(), 1);
    }
}
