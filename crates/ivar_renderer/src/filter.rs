//! Intersection filters.
//!
//! Every candidate hit found during traversal goes through an
//! `IntersectContext`, which decides per query kind whether the hit is kept
//! as the closest hit, recorded and skipped, or ends the traversal. Both
//! backends drive the same context, so record-all semantics do not depend on
//! the traversal implementation.

use ivar_scene::{ObjectFlags, ShaderFlags};
use smallvec::SmallVec;

use crate::accel::PackedPrimitives;
use crate::intersection::Intersection;
use crate::sampling::LcgSampler;

/// Maximum number of hits a local (subsurface) query can record.
pub const LOCAL_MAX_HITS: usize = 4;

/// What a query is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Closest hit, no filtering.
    Regular,
    /// Every transparent hit up to `max_hits`; an opaque hit ends the query.
    ShadowAll { max_hits: usize },
    /// Hits on one object only, reservoir sampled past `max_hits`.
    Local { object: u32, max_hits: usize },
    /// Every hit on an object with a volume, up to `max_hits`.
    VolumeAll { max_hits: usize },
}

/// The filter's verdict on one candidate hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Keep as the current closest hit and shorten the ray.
    Accept,
    /// Skip and keep traversing at the current length.
    Ignore,
    /// Stop the whole traversal.
    Terminate,
}

/// Per-query filter state.
pub struct IntersectContext<'a> {
    pub kind: QueryKind,
    pack: &'a PackedPrimitives,
    sampler: Option<&'a mut LcgSampler>,
    /// Recorded hits, in traversal order
    pub hits: SmallVec<[Intersection; 8]>,
    /// Candidates counted, which may exceed the recorded hits
    pub num_hits: u32,
    /// An opaque hit ended a shadow query
    pub opaque_hit: Option<Intersection>,
    curve_backface_culling: bool,
}

impl<'a> IntersectContext<'a> {
    pub fn new(kind: QueryKind, pack: &'a PackedPrimitives) -> Self {
        Self {
            kind,
            pack,
            sampler: None,
            hits: SmallVec::new(),
            num_hits: 0,
            opaque_hit: None,
            curve_backface_culling: false,
        }
    }

    /// Attach the reservoir sampler a local query draws from.
    pub fn with_sampler(mut self, sampler: &'a mut LcgSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_curve_backface_culling(mut self, enabled: bool) -> Self {
        self.curve_backface_culling = enabled;
        self
    }

    /// True when the query only wants hits on `object`.
    #[inline]
    pub fn skips_object(&self, object: u32) -> bool {
        matches!(self.kind, QueryKind::Local { object: target, .. } if target != object)
    }

    /// Judge a candidate hit. `direction` is the world-space ray direction.
    pub fn filter(&mut self, hit: &Intersection, direction: ivar_math::Vec3) -> FilterResult {
        // Back-facing curve hits never reach the query-specific filter.
        if self.curve_backface_culling && hit.prim_type.is_curve() && direction.dot(hit.ng) > 0.0 {
            return FilterResult::Ignore;
        }

        match self.kind {
            QueryKind::Regular => FilterResult::Accept,
            QueryKind::ShadowAll { max_hits } => self.filter_shadow(hit, max_hits),
            QueryKind::Local { object, max_hits } => self.filter_local(hit, object, max_hits),
            QueryKind::VolumeAll { max_hits } => self.filter_volume(hit, max_hits),
        }
    }

    fn is_duplicate(&self, hit: &Intersection) -> bool {
        self.hits.iter().any(|h| h.same_hit(hit))
    }

    fn filter_shadow(&mut self, hit: &Intersection, max_hits: usize) -> FilterResult {
        let flags = self.pack.shader_flags_of(hit.prim);
        if !flags.contains(ShaderFlags::HAS_TRANSPARENT_SHADOW) {
            self.opaque_hit = Some(*hit);
            return FilterResult::Terminate;
        }
        if self.is_duplicate(hit) {
            return FilterResult::Ignore;
        }
        self.num_hits += 1;
        if self.hits.len() >= max_hits {
            // Past the cap; the caller treats the surplus as opaque.
            return FilterResult::Terminate;
        }
        self.hits.push(*hit);
        FilterResult::Ignore
    }

    fn filter_local(&mut self, hit: &Intersection, object: u32, max_hits: usize) -> FilterResult {
        if hit.object != object {
            return FilterResult::Ignore;
        }
        if self.hits.iter().any(|h| h.t == hit.t) {
            return FilterResult::Ignore;
        }
        self.num_hits += 1;
        if self.hits.len() < max_hits {
            self.hits.push(*hit);
            return FilterResult::Ignore;
        }
        // Reservoir sampling: keep each of the `num_hits` candidates with
        // probability max_hits / num_hits.
        let Some(sampler) = self.sampler.as_deref_mut() else {
            return FilterResult::Ignore;
        };
        let index = (sampler.next_u32() % self.num_hits) as usize;
        if index < max_hits {
            self.hits[index] = *hit;
        }
        FilterResult::Ignore
    }

    fn filter_volume(&mut self, hit: &Intersection, max_hits: usize) -> FilterResult {
        if !self.pack.object_flags_of(hit.object).contains(ObjectFlags::HAS_VOLUME) {
            return FilterResult::Ignore;
        }
        if self.is_duplicate(hit) {
            return FilterResult::Ignore;
        }
        self.num_hits += 1;
        self.hits.push(*hit);
        if self.hits.len() >= max_hits {
            return FilterResult::Terminate;
        }
        FilterResult::Ignore
    }
}
