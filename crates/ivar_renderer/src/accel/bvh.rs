//! Bounding Volume Hierarchy over indexed items.
//!
//! The same tree type serves both levels of the acceleration structure: leaves
//! of a bottom-level tree hold primitive indices, leaves of the top-level tree
//! hold object indices. Callers supply the bounds at build and refit time and
//! a visitor at traversal time.

use ivar_math::{Aabb, Interval, Ray as MathRay, Vec3};
use smallvec::SmallVec;

/// Hard limit on tree depth; deeper subtrees are collapsed into leaves.
pub const MAX_DEPTH: usize = 64;

/// Cost model for the surface area heuristic.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECTION_COST: f32 = 1.0;

/// How much effort the builder spends on tree quality.
///
/// Quality only affects traversal speed, never the hits a query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildQuality {
    /// Median split on the longest centroid axis
    Low,
    /// Binned SAH
    Medium,
    /// Finer binned SAH that splits down to single-item leaves
    High,
}

impl BuildQuality {
    fn bins(self) -> usize {
        match self {
            BuildQuality::Low => 0,
            BuildQuality::Medium => 16,
            BuildQuality::High => 64,
        }
    }
}

/// One item to place in the tree.
#[derive(Debug, Clone, Copy)]
pub struct BuildItem {
    pub index: u32,
    pub bounds: Aabb,
    pub centroid: Vec3,
}

impl BuildItem {
    pub fn new(index: u32, bounds: Aabb) -> Self {
        Self {
            index,
            bounds,
            centroid: bounds.centroid(),
        }
    }
}

/// BVH node - either a branch with two children or a leaf with items.
#[derive(Debug)]
pub enum BvhNode {
    /// Internal node with two children.
    Branch {
        left: Box<BvhNode>,
        right: Box<BvhNode>,
        bbox: Aabb,
    },
    /// Leaf node with a small number of items.
    Leaf { items: Vec<u32>, bbox: Aabb },
    /// Empty tree.
    Empty,
}

/// What a traversal visitor wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

impl BvhNode {
    /// Build a tree over `items`.
    pub fn build(items: Vec<BuildItem>, quality: BuildQuality, max_leaf_size: usize) -> Self {
        if items.is_empty() {
            return BvhNode::Empty;
        }
        let max_leaf_size = match quality {
            BuildQuality::High => 1,
            _ => max_leaf_size.max(1),
        };
        Self::build_recursive(items, quality, max_leaf_size, 0)
    }

    fn build_recursive(
        mut items: Vec<BuildItem>,
        quality: BuildQuality,
        max_leaf_size: usize,
        depth: usize,
    ) -> Self {
        let bbox = items
            .iter()
            .fold(Aabb::EMPTY, |acc, item| Aabb::surrounding(&acc, &item.bounds));

        debug_assert!(depth <= MAX_DEPTH, "BVH depth limit exceeded");
        if items.len() <= max_leaf_size || depth >= MAX_DEPTH {
            return Self::leaf(items, bbox);
        }

        let centroid_bounds = Aabb::from_point_iter(items.iter().map(|item| item.centroid));
        let axis = centroid_bounds.longest_axis();

        let split = match quality {
            BuildQuality::Low => None,
            _ => sah_split(&items, &bbox, &centroid_bounds, quality.bins()),
        };

        let mid = match split {
            Some(SahSplit { axis, position }) => {
                partition(&mut items, |item| item.centroid[axis] < position)
            }
            None if quality == BuildQuality::Medium && items.len() <= max_leaf_size * 4 => {
                // SAH prefers a leaf over any split.
                return Self::leaf(items, bbox);
            }
            None => {
                // Median split: sort by centroid on the longest axis, split in half.
                items.sort_unstable_by(|a, b| {
                    a.centroid[axis]
                        .partial_cmp(&b.centroid[axis])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                items.len() / 2
            }
        };

        // Coincident centroids can leave one side empty.
        let mid = if mid == 0 || mid == items.len() {
            items.len() / 2
        } else {
            mid
        };

        let right_items = items.split_off(mid);
        let left = Self::build_recursive(items, quality, max_leaf_size, depth + 1);
        let right = Self::build_recursive(right_items, quality, max_leaf_size, depth + 1);

        BvhNode::Branch {
            left: Box::new(left),
            right: Box::new(right),
            bbox,
        }
    }

    fn leaf(items: Vec<BuildItem>, bbox: Aabb) -> Self {
        BvhNode::Leaf {
            items: items.into_iter().map(|item| item.index).collect(),
            bbox,
        }
    }

    pub fn bounding_box(&self) -> Aabb {
        match self {
            BvhNode::Empty => Aabb::EMPTY,
            BvhNode::Leaf { bbox, .. } => *bbox,
            BvhNode::Branch { bbox, .. } => *bbox,
        }
    }

    /// Recompute boxes bottom-up from new item bounds, keeping the topology.
    pub fn refit(&mut self, bounds: &impl Fn(u32) -> Aabb) -> Aabb {
        match self {
            BvhNode::Empty => Aabb::EMPTY,
            BvhNode::Leaf { items, bbox } => {
                *bbox = items
                    .iter()
                    .fold(Aabb::EMPTY, |acc, &i| Aabb::surrounding(&acc, &bounds(i)));
                *bbox
            }
            BvhNode::Branch { left, right, bbox } => {
                let l = left.refit(bounds);
                let r = right.refit(bounds);
                *bbox = Aabb::surrounding(&l, &r);
                *bbox
            }
        }
    }

    /// Visit leaf items whose boxes the ray enters within `[t_min, *t_max]`.
    ///
    /// The visitor receives each item and the current `t_max`, which it may
    /// shorten to prune farther boxes. Near children are visited first.
    /// Returns false when the visitor stopped the traversal.
    pub fn traverse<F>(&self, ray: &MathRay, t_min: f32, t_max: &mut f32, visit: &mut F) -> bool
    where
        F: FnMut(u32, &mut f32) -> Visit,
    {
        let mut stack: SmallVec<[&BvhNode; MAX_DEPTH]> = SmallVec::new();
        stack.push(self);

        while let Some(node) = stack.pop() {
            match node {
                BvhNode::Empty => {}
                BvhNode::Leaf { items, bbox } => {
                    if bbox.intersect(ray, Interval::new(t_min, *t_max)).is_none() {
                        continue;
                    }
                    for &item in items {
                        if visit(item, t_max) == Visit::Stop {
                            return false;
                        }
                    }
                }
                BvhNode::Branch { left, right, bbox } => {
                    if bbox.intersect(ray, Interval::new(t_min, *t_max)).is_none() {
                        continue;
                    }
                    let range = Interval::new(t_min, *t_max);
                    let tl = left.bounding_box().intersect(ray, range);
                    let tr = right.bounding_box().intersect(ray, range);
                    match (tl, tr) {
                        (Some(a), Some(b)) if b < a => {
                            stack.push(left);
                            stack.push(right);
                        }
                        (Some(_), Some(_)) => {
                            stack.push(right);
                            stack.push(left);
                        }
                        (Some(_), None) => stack.push(left),
                        (None, Some(_)) => stack.push(right),
                        (None, None) => {}
                    }
                }
            }
        }
        true
    }

    /// Maximum depth of the tree.
    pub fn depth(&self) -> usize {
        match self {
            BvhNode::Empty | BvhNode::Leaf { .. } => 0,
            BvhNode::Branch { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    /// Count of leaf nodes, for build statistics.
    pub fn leaf_count(&self) -> usize {
        match self {
            BvhNode::Empty => 0,
            BvhNode::Leaf { .. } => 1,
            BvhNode::Branch { left, right, .. } => left.leaf_count() + right.leaf_count(),
        }
    }
}

struct SahSplit {
    axis: usize,
    position: f32,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

/// Binned SAH: bucket centroids per axis and sweep the bin boundaries.
///
/// Returns None when no split beats making a leaf.
fn sah_split(
    items: &[BuildItem],
    bbox: &Aabb,
    centroid_bounds: &Aabb,
    bins: usize,
) -> Option<SahSplit> {
    let parent_area = bbox.surface_area();
    if parent_area <= 0.0 {
        return None;
    }

    let mut best: Option<(f32, SahSplit)> = None;
    for axis in 0..3 {
        let extent = centroid_bounds.axis_interval(axis);
        if extent.size() <= 0.0 {
            continue;
        }

        let mut buckets = vec![
            Bin {
                bounds: Aabb::EMPTY,
                count: 0,
            };
            bins
        ];
        let scale = bins as f32 / extent.size();
        let bin_of = |c: f32| (((c - extent.min) * scale) as usize).min(bins - 1);
        for item in items {
            let b = &mut buckets[bin_of(item.centroid[axis])];
            b.bounds = Aabb::surrounding(&b.bounds, &item.bounds);
            b.count += 1;
        }

        // Right-to-left prefix of areas and counts.
        let mut right_area = vec![0.0; bins];
        let mut right_count = vec![0usize; bins];
        let mut acc = Aabb::EMPTY;
        let mut count = 0;
        for i in (1..bins).rev() {
            acc = Aabb::surrounding(&acc, &buckets[i].bounds);
            count += buckets[i].count;
            right_area[i] = acc.surface_area();
            right_count[i] = count;
        }

        let mut left = Aabb::EMPTY;
        let mut left_count = 0;
        for i in 1..bins {
            left = Aabb::surrounding(&left, &buckets[i - 1].bounds);
            left_count += buckets[i - 1].count;
            if left_count == 0 || right_count[i] == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECTION_COST
                    * (left.surface_area() * left_count as f32
                        + right_area[i] * right_count[i] as f32)
                    / parent_area;
            if best.as_ref().map_or(true, |(c, _)| cost < *c) {
                let position = extent.min + i as f32 / scale;
                best = Some((cost, SahSplit { axis, position }));
            }
        }
    }

    let leaf_cost = INTERSECTION_COST * items.len() as f32;
    match best {
        Some((cost, split)) if cost < leaf_cost => Some(split),
        _ => None,
    }
}

/// In-place partition; returns the number of items satisfying `pred`.
fn partition<T>(items: &mut [T], pred: impl Fn(&T) -> bool) -> usize {
    let mut left = 0;
    let mut right = items.len();
    while left < right {
        if pred(&items[left]) {
            left += 1;
        } else {
            right -= 1;
            items.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_boxes(n: usize) -> Vec<BuildItem> {
        (0..n)
            .map(|i| {
                let lo = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
                BuildItem::new(i as u32, Aabb::from_points(lo, lo + Vec3::ONE))
            })
            .collect()
    }

    fn collect_hits(bvh: &BvhNode, ray: &MathRay) -> Vec<u32> {
        let mut hits = Vec::new();
        let mut t_max = f32::MAX;
        bvh.traverse(ray, 0.0, &mut t_max, &mut |item, _| {
            hits.push(item);
            Visit::Continue
        });
        hits.sort_unstable();
        hits
    }

    #[test]
    fn test_bvh_empty() {
        let bvh = BvhNode::build(vec![], BuildQuality::Medium, 4);
        assert!(matches!(bvh, BvhNode::Empty));
        let ray = MathRay::new(Vec3::ZERO, Vec3::X, 0.0);
        assert!(collect_hits(&bvh, &ray).is_empty());
    }

    #[test]
    fn test_single_item_is_leaf() {
        let bvh = BvhNode::build(unit_boxes(1), BuildQuality::Low, 4);
        assert!(matches!(bvh, BvhNode::Leaf { .. }));
    }

    #[test]
    fn test_every_quality_finds_the_same_items() {
        let ray = MathRay::new(Vec3::new(10.5, 0.5, -5.0), Vec3::Z, 0.0);
        for quality in [BuildQuality::Low, BuildQuality::Medium, BuildQuality::High] {
            let bvh = BvhNode::build(unit_boxes(100), quality, 4);
            assert_eq!(collect_hits(&bvh, &ray), vec![5], "{:?}", quality);
            assert_eq!(bvh.bounding_box().x.max, 199.0);
        }
    }

    #[test]
    fn test_high_quality_uses_single_item_leaves() {
        let bvh = BvhNode::build(unit_boxes(17), BuildQuality::High, 4);
        assert_eq!(bvh.leaf_count(), 17);
        assert!(bvh.depth() < MAX_DEPTH);
    }

    #[test]
    fn test_coincident_centroids_terminate() {
        let items: Vec<_> = (0..50)
            .map(|i| BuildItem::new(i, Aabb::from_points(Vec3::ZERO, Vec3::ONE)))
            .collect();
        let bvh = BvhNode::build(items, BuildQuality::Medium, 4);
        let ray = MathRay::new(Vec3::new(0.5, 0.5, -1.0), Vec3::Z, 0.0);
        assert_eq!(collect_hits(&bvh, &ray).len(), 50);
    }

    #[test]
    fn test_stop_ends_traversal() {
        let bvh = BvhNode::build(unit_boxes(10), BuildQuality::Medium, 1);
        let ray = MathRay::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::X, 0.0);
        let mut visited = 0;
        let mut t_max = f32::MAX;
        let finished = bvh.traverse(&ray, 0.0, &mut t_max, &mut |_, _| {
            visited += 1;
            Visit::Stop
        });
        assert!(!finished);
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_refit_tracks_moved_items() {
        let mut bvh = BvhNode::build(unit_boxes(8), BuildQuality::Medium, 2);
        let moved = |i: u32| {
            let lo = Vec3::new(i as f32 * 2.0, 10.0, 0.0);
            Aabb::from_points(lo, lo + Vec3::ONE)
        };
        let root = bvh.refit(&moved);
        assert_eq!(root.y.min, 10.0);

        let ray = MathRay::new(Vec3::new(4.5, 10.5, -5.0), Vec3::Z, 0.0);
        assert_eq!(collect_hits(&bvh, &ray), vec![2]);
    }
}
