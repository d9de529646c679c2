use crate::{
    core::geo::LatLng,
    markers::renderer::{MarkerHandle, MarkerRenderer},
    prelude::{HashMap, HashSet},
    spatial::index::ClusterNode,
};

use fxhash::FxHasher;
use std::hash::{Hash, Hasher};

/// What a rendered marker stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Cluster,
    Leaf,
}

/// A marker currently alive on screen. Created by a create patch, destroyed
/// by a destroy patch; exactly one per visible cluster-node key.
#[derive(Debug, Clone)]
pub struct RenderedMarker {
    pub key: String,
    pub kind: MarkerKind,
    pub last_zoom_bucket: i32,
    pub selected: bool,
    /// Hash over the sorted member point ids; a change means the cluster
    /// badge imagery must be refreshed
    pub members_hash: u64,
    /// Opaque visual resource issued by the renderer
    pub handle: MarkerHandle,
}

/// Everything a renderer needs to draw one marker
#[derive(Debug, Clone)]
pub struct MarkerProps {
    pub key: String,
    pub kind: MarkerKind,
    pub position: LatLng,
    pub point_count: usize,
    pub member_ids: Vec<String>,
    pub selected: bool,
    pub zoom_bucket: i32,
    pub members_hash: u64,
}

impl MarkerProps {
    fn from_node(node: &ClusterNode, selection: Option<&str>, zoom_bucket: i32) -> Self {
        let key = node.key();
        let selected = selection == Some(key.as_str());
        match node {
            ClusterNode::Cluster {
                point_count,
                member_ids,
                ..
            } => Self {
                members_hash: members_hash(member_ids),
                key,
                kind: MarkerKind::Cluster,
                position: node.position(),
                point_count: *point_count,
                member_ids: member_ids.clone(),
                selected,
                zoom_bucket,
            },
            ClusterNode::Leaf { id, .. } => Self {
                members_hash: 0,
                key,
                kind: MarkerKind::Leaf,
                position: node.position(),
                point_count: 1,
                member_ids: vec![id.clone()],
                selected,
                zoom_bucket,
            },
        }
    }
}

/// Minimal set of visual changes turning the previously rendered marker set
/// into the one implied by a fresh query
#[derive(Debug, Clone, Default)]
pub struct MarkerPatch {
    pub creates: Vec<MarkerProps>,
    pub updates: Vec<MarkerProps>,
    /// Keys of markers to tear down
    pub destroys: Vec<String>,
}

impl MarkerPatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.destroys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.destroys.len()
    }
}

/// Diffs cluster query results against the live marker set.
///
/// The live map is instance state owned by this reconciler (and by nothing
/// else); its lifetime is tied to whatever UI shell mounts it. Selection is
/// tracked by key, not by marker identity, so changing the selected note is
/// a pair of updates rather than a destroy/create and animation continuity
/// is preserved.
pub struct MarkerReconciler {
    markers: HashMap<String, RenderedMarker>,
}

impl MarkerReconciler {
    pub fn new() -> Self {
        Self {
            markers: HashMap::default(),
        }
    }

    /// Computes the minimal patch for `current`. Pure given the inputs and
    /// the live marker map: an unchanged marker produces no entry at all.
    pub fn reconcile(
        &self,
        current: &[ClusterNode],
        selection: Option<&str>,
        zoom_bucket: i32,
    ) -> MarkerPatch {
        let mut patch = MarkerPatch::default();
        let mut seen: HashSet<String> = HashSet::default();

        for node in current {
            let props = MarkerProps::from_node(node, selection, zoom_bucket);
            if !seen.insert(props.key.clone()) {
                // A key can only appear once per pass; duplicates in the
                // query result would otherwise double-create.
                log::warn!("duplicate key '{}' in query result, ignoring", props.key);
                continue;
            }

            match self.markers.get(&props.key) {
                None => patch.creates.push(props),
                Some(existing) => {
                    let badge_changed = existing.kind == MarkerKind::Cluster
                        && existing.members_hash != props.members_hash;
                    if existing.selected != props.selected || badge_changed {
                        patch.updates.push(props);
                    }
                }
            }
        }

        for key in self.markers.keys() {
            if !seen.contains(key) {
                patch.destroys.push(key.clone());
            }
        }
        patch.destroys.sort();

        patch
    }

    /// Applies a patch to the live map, driving the renderer.
    ///
    /// The pass is applied as a whole before control returns; creates and
    /// destroys of different passes never interleave. A renderer failure on
    /// one marker is logged and that marker falls back to the placeholder
    /// handle; it never blocks the rest of the patch.
    pub fn apply(&mut self, patch: &MarkerPatch, renderer: &mut dyn MarkerRenderer) {
        for key in &patch.destroys {
            if let Some(marker) = self.markers.remove(key) {
                renderer.destroy_marker(marker.handle, key);
            }
        }

        for props in &patch.creates {
            let handle = match renderer.create_marker(props) {
                Ok(handle) => handle,
                Err(e) => {
                    log::warn!("marker '{}' failed to render, using placeholder: {}", props.key, e);
                    MarkerHandle::PLACEHOLDER
                }
            };
            self.markers.insert(
                props.key.clone(),
                RenderedMarker {
                    key: props.key.clone(),
                    kind: props.kind,
                    last_zoom_bucket: props.zoom_bucket,
                    selected: props.selected,
                    members_hash: props.members_hash,
                    handle,
                },
            );
        }

        for props in &patch.updates {
            if let Some(marker) = self.markers.get_mut(&props.key) {
                if let Err(e) = renderer.update_marker(marker.handle, props) {
                    log::warn!("marker '{}' update failed: {}", props.key, e);
                }
                marker.selected = props.selected;
                marker.members_hash = props.members_hash;
                marker.last_zoom_bucket = props.zoom_bucket;
            }
        }
    }

    /// Convenience wrapper: reconcile and immediately apply
    pub fn reconcile_and_apply(
        &mut self,
        current: &[ClusterNode],
        selection: Option<&str>,
        zoom_bucket: i32,
        renderer: &mut dyn MarkerRenderer,
    ) -> MarkerPatch {
        let patch = self.reconcile(current, selection, zoom_bucket);
        self.apply(&patch, renderer);
        patch
    }

    pub fn get(&self, key: &str) -> Option<&RenderedMarker> {
        self.markers.get(key)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Keys of all currently live markers
    pub fn live_keys(&self) -> Vec<&str> {
        self.markers.keys().map(|k| k.as_str()).collect()
    }

    /// Tears down every marker (shell unmount)
    pub fn clear(&mut self, renderer: &mut dyn MarkerRenderer) {
        for (key, marker) in self.markers.drain() {
            renderer.destroy_marker(marker.handle, &key);
        }
    }
}

impl Default for MarkerReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash over the sorted member ids, independent of merge order
fn members_hash(ids: &[String]) -> u64 {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();

    let mut hasher = FxHasher::default();
    for id in sorted {
        id.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::renderer::RecordingRenderer;

    fn leaf(id: &str) -> ClusterNode {
        ClusterNode::Leaf {
            id: id.to_string(),
            lng: 8.5,
            lat: 47.3,
        }
    }

    fn cluster(id: u64, members: &[&str]) -> ClusterNode {
        ClusterNode::Cluster {
            id,
            lng: 8.5,
            lat: 47.3,
            point_count: members.len(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_initial_reconcile_creates_everything() {
        let reconciler = MarkerReconciler::new();
        let current = vec![leaf("a"), cluster(0, &["b", "c"])];

        let patch = reconciler.reconcile(&current, None, 10);
        assert_eq!(patch.creates.len(), 2);
        assert!(patch.updates.is_empty());
        assert!(patch.destroys.is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent_after_apply() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();
        let current = vec![leaf("a"), cluster(0, &["b", "c"])];

        reconciler.reconcile_and_apply(&current, None, 10, &mut renderer);

        let second = reconciler.reconcile(&current, None, 10);
        assert!(second.is_empty());
    }

    #[test]
    fn test_key_conservation() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();

        reconciler.reconcile_and_apply(&[leaf("a"), leaf("b")], None, 10, &mut renderer);
        reconciler.reconcile_and_apply(&[leaf("b"), leaf("c")], None, 10, &mut renderer);

        let mut keys = reconciler.live_keys();
        keys.sort();
        assert_eq!(keys, vec!["leaf:b", "leaf:c"]);
    }

    #[test]
    fn test_vanished_keys_destroyed_once() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();

        reconciler.reconcile_and_apply(&[leaf("a")], None, 10, &mut renderer);
        reconciler.reconcile_and_apply(&[], None, 10, &mut renderer);

        assert_eq!(renderer.destroyed, vec!["leaf:a"]);
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_selection_change_is_two_updates() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();
        let current = vec![leaf("a"), leaf("b")];

        reconciler.reconcile_and_apply(&current, Some("leaf:a"), 10, &mut renderer);

        let patch = reconciler.reconcile(&current, Some("leaf:b"), 10);
        assert!(patch.creates.is_empty());
        assert!(patch.destroys.is_empty());
        assert_eq!(patch.updates.len(), 2);

        let mut updated: Vec<&str> = patch.updates.iter().map(|s| s.key.as_str()).collect();
        updated.sort();
        assert_eq!(updated, vec!["leaf:a", "leaf:b"]);
    }

    #[test]
    fn test_cluster_member_change_triggers_update() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();

        reconciler.reconcile_and_apply(&[cluster(0, &["a", "b"])], None, 10, &mut renderer);

        // Same cluster id, one more member after a rebuild.
        let patch = reconciler.reconcile(&[cluster(0, &["a", "b", "c"])], None, 10);
        assert_eq!(patch.updates.len(), 1);
        assert_eq!(patch.updates[0].key, "cluster:0");
    }

    #[test]
    fn test_member_order_does_not_trigger_update() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();

        reconciler.reconcile_and_apply(&[cluster(0, &["a", "b"])], None, 10, &mut renderer);

        let patch = reconciler.reconcile(&[cluster(0, &["b", "a"])], None, 10);
        assert!(patch.is_empty());
    }

    #[test]
    fn test_render_failure_is_isolated() {
        let mut reconciler = MarkerReconciler::new();
        let mut renderer = RecordingRenderer::new();
        renderer.fail_on("leaf:bad");

        reconciler.reconcile_and_apply(&[leaf("bad"), leaf("good")], None, 10, &mut renderer);

        // Both markers are alive; the failed one carries the placeholder.
        assert_eq!(reconciler.len(), 2);
        assert_eq!(
            reconciler.get("leaf:bad").unwrap().handle,
            MarkerHandle::PLACEHOLDER
        );
        assert_ne!(
            reconciler.get("leaf:good").unwrap().handle,
            MarkerHandle::PLACEHOLDER
        );
    }

    #[test]
    fn test_duplicate_keys_in_query_create_once() {
        let reconciler = MarkerReconciler::new();
        let patch = reconciler.reconcile(&[leaf("a"), leaf("a")], None, 10);
        assert_eq!(patch.creates.len(), 1);
    }
}
