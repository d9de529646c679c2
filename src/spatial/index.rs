use crate::{
    core::geo::{LatLng, LatLngBounds, Point},
    prelude::{HashMap, HashSet},
    store::PointRecord,
};

use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

/// Configuration for the multi-resolution cluster index
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Cluster radius in screen pixels
    pub radius_px: f64,
    /// Coarsest indexed zoom level
    pub min_zoom: u8,
    /// Finest zoom level at which clustering still applies; above it every
    /// point is returned as its own leaf
    pub max_cluster_zoom: u8,
    /// Hard ceiling for expansion-zoom results
    pub max_zoom: u8,
    /// Minimum number of member points required to form a cluster
    pub min_points: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius_px: 80.0,
            min_zoom: 0,
            max_cluster_zoom: 16,
            max_zoom: 19,
            min_points: 2,
        }
    }
}

/// A node returned by a viewport query: either a synthetic cluster or a
/// single point left on its own at the queried zoom.
///
/// Nodes are value types regenerated per query and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterNode {
    Cluster {
        id: u64,
        lng: f64,
        lat: f64,
        point_count: usize,
        /// Ids of every underlying point, flattened through sub-clusters
        member_ids: Vec<String>,
    },
    Leaf {
        /// Id of the underlying point
        id: String,
        lng: f64,
        lat: f64,
    },
}

impl ClusterNode {
    /// Stable reconciliation key: `cluster:<id>` or `leaf:<point id>`
    pub fn key(&self) -> String {
        match self {
            ClusterNode::Cluster { id, .. } => format!("cluster:{}", id),
            ClusterNode::Leaf { id, .. } => format!("leaf:{}", id),
        }
    }

    pub fn position(&self) -> LatLng {
        match self {
            ClusterNode::Cluster { lng, lat, .. } => LatLng::new(*lat, *lng),
            ClusterNode::Leaf { lng, lat, .. } => LatLng::new(*lat, *lng),
        }
    }

    pub fn point_count(&self) -> usize {
        match self {
            ClusterNode::Cluster { point_count, .. } => *point_count,
            ClusterNode::Leaf { .. } => 1,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, ClusterNode::Cluster { .. })
    }
}

/// What a level node stands for
#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Point(String),
    Cluster(u64),
}

/// One entry in a per-level tree, positioned in world pixels at zoom 0
#[derive(Debug, Clone)]
struct LevelNode {
    x: f64,
    y: f64,
    lng: f64,
    lat: f64,
    count: usize,
    kind: NodeKind,
    members: Vec<String>,
    /// Stable processing order, inherited from the sorted input
    order: usize,
}

impl LevelNode {
    fn to_cluster_node(&self) -> ClusterNode {
        match &self.kind {
            NodeKind::Point(id) => ClusterNode::Leaf {
                id: id.clone(),
                lng: self.lng,
                lat: self.lat,
            },
            NodeKind::Cluster(id) => ClusterNode::Cluster {
                id: *id,
                lng: self.lng,
                lat: self.lat,
                point_count: self.count,
                member_ids: self.members.clone(),
            },
        }
    }
}

// --- rstar integration ---------------------------------------------------------------------

impl RTreeObject for LevelNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for LevelNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// Multi-resolution cluster structure over a point snapshot.
///
/// `build` partitions the point set per integer zoom level from
/// `max_cluster_zoom` down to `min_zoom` by greedy radius merging; `query`
/// returns the clusters/leaves of the floored zoom level intersecting a
/// bounding box. The index is immutable once built; point mutations build a
/// fresh index which the engine swaps in atomically.
pub struct ClusterIndex {
    config: ClusterConfig,
    /// Cluster levels indexed by `zoom - min_zoom`
    levels: Vec<RTree<LevelNode>>,
    /// Raw points, served for any zoom above `max_cluster_zoom`
    leaf_tree: RTree<LevelNode>,
    /// Finest zoom level at which each cluster id exists
    formed_at: HashMap<u64, u8>,
    point_count: usize,
}

impl ClusterIndex {
    /// Builds the index from a point snapshot.
    ///
    /// Points are sorted by id before merging, and merge order is the
    /// stable carry-forward of that order, so cluster shapes are
    /// deterministic for a given point set regardless of insertion history.
    /// Points with malformed coordinates are skipped (and logged), never
    /// aborting the rest of the build.
    pub fn build(points: &[PointRecord], config: ClusterConfig) -> Self {
        let mut records: Vec<&PointRecord> = points
            .iter()
            .filter(|p| {
                let ok = LatLng::new(p.lat, p.lng).is_valid();
                if !ok {
                    log::warn!(
                        "skipping point '{}' with malformed coordinates ({}, {})",
                        p.id,
                        p.lng,
                        p.lat
                    );
                }
                ok
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let leaves: Vec<LevelNode> = records
            .iter()
            .enumerate()
            .map(|(order, p)| {
                let projected = LatLng::new(p.lat, p.lng).project(0.0);
                LevelNode {
                    x: projected.x,
                    y: projected.y,
                    lng: p.lng,
                    lat: p.lat,
                    count: 1,
                    kind: NodeKind::Point(p.id.clone()),
                    members: vec![p.id.clone()],
                    order,
                }
            })
            .collect();

        let point_count = leaves.len();
        let leaf_tree = RTree::bulk_load(leaves.clone());

        let mut formed_at = HashMap::default();
        let mut next_cluster_id: u64 = 0;

        let level_count = (config.max_cluster_zoom - config.min_zoom) as usize + 1;
        let mut levels: Vec<RTree<LevelNode>> = Vec::with_capacity(level_count);
        levels.resize_with(level_count, RTree::new);

        let mut current = leaves;
        for zoom in (config.min_zoom..=config.max_cluster_zoom).rev() {
            current = Self::merge_level(
                current,
                zoom,
                &config,
                &mut next_cluster_id,
                &mut formed_at,
            );
            levels[(zoom - config.min_zoom) as usize] = RTree::bulk_load(current.clone());
        }

        Self {
            config,
            levels,
            leaf_tree,
            formed_at,
            point_count,
        }
    }

    /// Greedily merges one level's nodes with the pixel radius of `zoom`
    fn merge_level(
        nodes: Vec<LevelNode>,
        zoom: u8,
        config: &ClusterConfig,
        next_cluster_id: &mut u64,
        formed_at: &mut HashMap<u64, u8>,
    ) -> Vec<LevelNode> {
        // One screen pixel at `zoom` covers 1 / 2^zoom world pixels at zoom 0.
        let radius = config.radius_px / 2_f64.powi(zoom as i32);
        let tree = RTree::bulk_load(nodes.clone());

        let mut used: HashSet<usize> = HashSet::default();
        let mut merged = Vec::with_capacity(nodes.len());

        for node in &nodes {
            if used.contains(&node.order) {
                continue;
            }

            let mut neighbors: Vec<&LevelNode> = tree
                .locate_within_distance([node.x, node.y], radius * radius)
                .filter(|n| n.order != node.order && !used.contains(&n.order))
                .collect();
            neighbors.sort_by_key(|n| n.order);

            let total: usize = node.count + neighbors.iter().map(|n| n.count).sum::<usize>();

            if !neighbors.is_empty() && total >= config.min_points {
                used.insert(node.order);
                for n in &neighbors {
                    used.insert(n.order);
                }

                // Centroid: member-count-weighted mean of lng/lat, which
                // equals the flat mean over all underlying points.
                let mut lng = node.lng * node.count as f64;
                let mut lat = node.lat * node.count as f64;
                let mut members = node.members.clone();
                for n in &neighbors {
                    lng += n.lng * n.count as f64;
                    lat += n.lat * n.count as f64;
                    members.extend(n.members.iter().cloned());
                }
                lng /= total as f64;
                lat /= total as f64;

                let id = *next_cluster_id;
                *next_cluster_id += 1;
                formed_at.insert(id, zoom);

                let projected = LatLng::new(lat, lng).project(0.0);
                merged.push(LevelNode {
                    x: projected.x,
                    y: projected.y,
                    lng,
                    lat,
                    count: total,
                    kind: NodeKind::Cluster(id),
                    members,
                    order: node.order,
                });
            } else {
                // Too sparse to merge; the node is carried forward as-is
                // and keeps its identity at this level.
                used.insert(node.order);
                merged.push(node.clone());
            }
        }

        merged
    }

    /// Returns every cluster/leaf of the floored zoom level whose centroid
    /// falls inside the bounding box, expanded by one cluster radius at the
    /// edges so markers don't pop at the boundary.
    ///
    /// An invalid bbox or zoom yields an empty result (logged), never an
    /// error to the caller.
    pub fn query(&self, bbox: &LatLngBounds, zoom: f64) -> Vec<ClusterNode> {
        if !bbox.is_valid() || !zoom.is_finite() {
            log::warn!("rejecting cluster query with invalid bbox/zoom (zoom={})", zoom);
            return Vec::new();
        }

        let floored = zoom.floor();
        let (tree, level) = if floored > self.config.max_cluster_zoom as f64 {
            (&self.leaf_tree, self.config.max_cluster_zoom as i32 + 1)
        } else {
            let level = (floored as i32).clamp(
                self.config.min_zoom as i32,
                self.config.max_cluster_zoom as i32,
            );
            (
                &self.levels[(level - self.config.min_zoom as i32) as usize],
                level,
            )
        };

        // Envelope in zoom-0 world pixels, grown by one cluster radius at
        // the queried level.
        let sw = LatLng::new(bbox.south_west.lat, bbox.south_west.lng).project(0.0);
        let ne = LatLng::new(bbox.north_east.lat, bbox.north_east.lng).project(0.0);
        let radius = self.config.radius_px / 2_f64.powi(level);
        let envelope = AABB::from_corners(
            [sw.x.min(ne.x) - radius, sw.y.min(ne.y) - radius],
            [sw.x.max(ne.x) + radius, sw.y.max(ne.y) + radius],
        );

        let mut hits: Vec<&LevelNode> = tree.locate_in_envelope_intersecting(&envelope).collect();
        hits.sort_by_key(|n| n.order);
        hits.iter().map(|n| n.to_cluster_node()).collect()
    }

    /// The lowest zoom level at which the given cluster splits into two or
    /// more sub-clusters/leaves, clamped to the configured max zoom.
    ///
    /// A cluster id is carried unchanged to coarser levels, so the split
    /// happens one level below where the cluster was formed.
    pub fn cluster_expansion_zoom(&self, cluster_id: u64) -> Option<f64> {
        self.formed_at
            .get(&cluster_id)
            .map(|formed| ((formed + 1) as f64).min(self.config.max_zoom as f64))
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, lng: f64, lat: f64) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            lng,
            lat,
        }
    }

    fn world() -> LatLngBounds {
        LatLngBounds::from_coords(-85.0, -180.0, 85.0, 180.0)
    }

    #[test]
    fn test_empty_point_set() {
        let index = ClusterIndex::build(&[], ClusterConfig::default());

        assert!(index.is_empty());
        assert!(index.query(&world(), 10.0).is_empty());
        assert!(index.query(&world(), 19.0).is_empty());
    }

    #[test]
    fn test_single_point_is_always_a_leaf() {
        let index = ClusterIndex::build(&[record("a", 8.5, 47.3)], ClusterConfig::default());

        for zoom in [0.0, 5.0, 10.0, 16.0, 19.0] {
            let nodes = index.query(&world(), zoom);
            assert_eq!(nodes.len(), 1, "zoom {}", zoom);
            assert!(matches!(&nodes[0], ClusterNode::Leaf { id, .. } if id == "a"));
        }
    }

    #[test]
    fn test_coincident_pair_clusters_below_max_cluster_zoom() {
        let points = vec![record("a", 8.5, 47.3), record("b", 8.5, 47.3)];
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        let nodes = index.query(&world(), 10.0);
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            ClusterNode::Cluster {
                point_count,
                member_ids,
                ..
            } => {
                assert_eq!(*point_count, 2);
                assert_eq!(member_ids.len(), 2);
            }
            other => panic!("expected cluster, got {:?}", other),
        }

        // Above max_cluster_zoom the raw points come back.
        let leaves = index.query(&world(), 20.0);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|n| !n.is_cluster()));
    }

    #[test]
    fn test_malformed_point_skipped_not_fatal() {
        let points = vec![
            record("good", 8.5, 47.3),
            record("bad", f64::NAN, 47.3),
        ];
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        assert_eq!(index.point_count(), 1);
        assert_eq!(index.query(&world(), 19.0).len(), 1);
    }

    #[test]
    fn test_deterministic_across_input_order() {
        let a = vec![
            record("n1", 8.50, 47.30),
            record("n2", 8.51, 47.31),
            record("n3", 8.52, 47.29),
            record("n4", 9.50, 46.00),
        ];
        let mut b = a.clone();
        b.reverse();

        let keys = |points: &[PointRecord]| -> Vec<String> {
            ClusterIndex::build(points, ClusterConfig::default())
                .query(&world(), 8.0)
                .iter()
                .map(|n| n.key())
                .collect()
        };

        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn test_cluster_count_monotonic_in_zoom() {
        let mut points = Vec::new();
        for i in 0..30 {
            points.push(record(
                &format!("n{:02}", i),
                8.5 + (i % 6) as f64 * 0.01,
                47.3 + (i / 6) as f64 * 0.01,
            ));
        }
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        let mut previous = 0usize;
        for zoom in 0..=17 {
            let nodes = index.query(&world(), zoom as f64);
            assert!(
                nodes.len() >= previous,
                "node count shrank from {} to {} at zoom {}",
                previous,
                nodes.len(),
                zoom
            );
            // Every point stays covered at every level.
            let covered: usize = nodes.iter().map(|n| n.point_count()).sum();
            assert_eq!(covered, 30, "zoom {}", zoom);
            previous = nodes.len();
        }
    }

    #[test]
    fn test_centroid_is_mean_of_members() {
        let points = vec![
            record("a", 8.0, 47.0),
            record("b", 8.0002, 47.0),
            record("c", 8.0004, 47.0),
        ];
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        let nodes = index.query(&world(), 10.0);
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            ClusterNode::Cluster { lng, lat, .. } => {
                assert!((lng - 8.0002).abs() < 1e-9);
                assert!((lat - 47.0).abs() < 1e-9);
            }
            other => panic!("expected cluster, got {:?}", other),
        }
    }

    #[test]
    fn test_expansion_zoom_is_first_split_level() {
        // Two tight pairs ~0.02 deg apart: far enough to be separate
        // clusters at high zoom, merged into one at low zoom.
        let points = vec![
            record("a1", 8.500, 47.300),
            record("a2", 8.5001, 47.3001),
            record("b1", 8.520, 47.300),
            record("b2", 8.5201, 47.3001),
        ];
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        // Find a zoom where everything is one cluster of 4.
        let mut merged_cluster = None;
        for zoom in (0..=16).rev() {
            let nodes = index.query(&world(), zoom as f64);
            if nodes.len() == 1 && nodes[0].point_count() == 4 {
                if let ClusterNode::Cluster { id, .. } = nodes[0] {
                    merged_cluster = Some((id, zoom));
                    break;
                }
            }
        }
        let (id, seen_at) = merged_cluster.expect("expected a merged cluster of 4");

        let expansion = index.cluster_expansion_zoom(id).unwrap();
        assert!(expansion > seen_at as f64);

        // At the expansion zoom the query yields two or more nodes.
        let split = index.query(&world(), expansion);
        assert!(split.len() >= 2, "no split at zoom {}", expansion);
    }

    #[test]
    fn test_expansion_zoom_clamped_to_max_zoom() {
        let config = ClusterConfig {
            max_cluster_zoom: 16,
            max_zoom: 16,
            ..Default::default()
        };
        let points = vec![record("a", 8.5, 47.3), record("b", 8.5, 47.3)];
        let index = ClusterIndex::build(&points, config);

        let nodes = index.query(&world(), 16.0);
        if let ClusterNode::Cluster { id, .. } = nodes[0] {
            assert_eq!(index.cluster_expansion_zoom(id), Some(16.0));
        } else {
            panic!("expected cluster");
        }
    }

    #[test]
    fn test_unknown_cluster_id() {
        let index = ClusterIndex::build(&[record("a", 8.5, 47.3)], ClusterConfig::default());
        assert_eq!(index.cluster_expansion_zoom(999), None);
    }

    #[test]
    fn test_query_invalid_inputs_yield_empty() {
        let index = ClusterIndex::build(&[record("a", 8.5, 47.3)], ClusterConfig::default());

        let inverted = LatLngBounds::from_coords(50.0, 10.0, 40.0, 5.0);
        assert!(index.query(&inverted, 10.0).is_empty());
        assert!(index.query(&world(), f64::NAN).is_empty());
    }

    #[test]
    fn test_bbox_culling() {
        let points = vec![record("zurich", 8.54, 47.37), record("tokyo", 139.65, 35.67)];
        let index = ClusterIndex::build(&points, ClusterConfig::default());

        let around_zurich = LatLngBounds::from_coords(47.0, 8.0, 48.0, 9.0);
        let nodes = index.query(&around_zurich, 12.0);

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key(), "leaf:zurich");
    }
}
