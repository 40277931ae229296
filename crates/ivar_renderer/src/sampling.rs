//! Per-path sample streams.
//!
//! Every random decision a path makes reads a logical dimension: the base
//! dimensions drive the camera, then each bounce claims a block of
//! `BOUNCE_NUM` dimensions starting at the path's `rng_offset`. Two patterns
//! are available:
//!
//! - **Sobol-Burley**: Owen-scrambled Sobol points with a shuffled index
//!   (Burley 2020, "Practical Hash-based Owen Scrambling")
//! - **Correlated multi-jitter**: Kensler 2013, stratified for a known sample count
//!
//! Pixels are decorrelated with `hash_uint2(x, y) ^ seed`.

use ivar_math::{make_orthonormals, Vec3};
use serde::Deserialize;

/// Sample pattern used by every path of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPattern {
    #[default]
    SobolBurley,
    CorrelatedMultiJitter,
}

/// Logical sample dimensions.
pub mod dim {
    pub const FILTER_U: u32 = 0;
    pub const FILTER_V: u32 = 1;
    pub const LENS_U: u32 = 2;
    pub const LENS_V: u32 = 3;
    pub const TIME: u32 = 4;
    pub const BASE_NUM: u32 = 8;

    // Offsets within a bounce block
    pub const BSDF_U: u32 = 0;
    pub const BSDF_V: u32 = 1;
    pub const BSDF_PICK: u32 = 2;
    pub const LIGHT_U: u32 = 3;
    pub const LIGHT_V: u32 = 4;
    pub const LIGHT_TERMINATE: u32 = 5;
    pub const TERMINATE: u32 = 6;
    pub const PHASE_CHANNEL: u32 = 7;
    pub const SCATTER_DISTANCE: u32 = 8;
    pub const BSSRDF_U: u32 = 9;
    pub const BSSRDF_V: u32 = 10;
    pub const BSSRDF_AXIS: u32 = 11;
    pub const BOUNCE_NUM: u32 = 12;
}

// Bob Jenkins' lookup3 hash

#[inline]
fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

#[inline]
fn hash_final(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(rot(b, 14));
    a ^= c;
    a = a.wrapping_sub(rot(c, 11));
    b ^= a;
    b = b.wrapping_sub(rot(a, 25));
    c ^= b;
    c = c.wrapping_sub(rot(b, 16));
    a ^= c;
    a = a.wrapping_sub(rot(c, 4));
    b ^= a;
    b = b.wrapping_sub(rot(a, 14));
    c ^= b;
    c = c.wrapping_sub(rot(b, 24));
    c
}

pub fn hash_uint(kx: u32) -> u32 {
    let init = 0xdeadbeef_u32.wrapping_add((1 << 2) + 13);
    hash_final(init.wrapping_add(kx), init, init)
}

pub fn hash_uint2(kx: u32, ky: u32) -> u32 {
    let init = 0xdeadbeef_u32.wrapping_add((2 << 2) + 13);
    hash_final(init.wrapping_add(kx), init.wrapping_add(ky), init)
}

pub fn hash_uint3(kx: u32, ky: u32, kz: u32) -> u32 {
    let init = 0xdeadbeef_u32.wrapping_add((3 << 2) + 13);
    hash_final(
        init.wrapping_add(kx),
        init.wrapping_add(ky),
        init.wrapping_add(kz),
    )
}

/// Per-pixel hash that decorrelates the sample streams of neighbouring pixels.
pub fn pixel_rng_hash(x: u32, y: u32, seed: u32) -> u32 {
    hash_uint2(x, y) ^ seed
}

/// Map 32 random bits to [0, 1).
#[inline]
fn uint_to_float(x: u32) -> f32 {
    (x >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

// Sobol direction numbers (Joe and Kuo) for the first four dimensions.

const SOBOL_DIMS: usize = 4;

const fn sobol_directions() -> [[u32; 32]; SOBOL_DIMS] {
    // (degree, polynomial coefficients, initial direction numbers)
    const PARAMS: [(usize, u32, [u32; 3]); SOBOL_DIMS - 1] =
        [(1, 0, [1, 0, 0]), (2, 1, [1, 3, 0]), (3, 1, [1, 3, 1])];

    let mut table = [[0u32; 32]; SOBOL_DIMS];
    let mut k = 0;
    while k < 32 {
        table[0][k] = 1 << (31 - k);
        k += 1;
    }

    let mut d = 1;
    while d < SOBOL_DIMS {
        let (s, a, m) = PARAMS[d - 1];
        let mut k = 0;
        while k < 32 {
            if k < s {
                table[d][k] = m[k] << (31 - k);
            } else {
                let mut v = table[d][k - s] ^ (table[d][k - s] >> s);
                let mut i = 1;
                while i < s {
                    if (a >> (s - 1 - i)) & 1 == 1 {
                        v ^= table[d][k - i];
                    }
                    i += 1;
                }
                table[d][k] = v;
            }
            k += 1;
        }
        d += 1;
    }
    table
}

static SOBOL_TABLE: [[u32; 32]; SOBOL_DIMS] = sobol_directions();

fn sobol(index: u32, dimension: usize) -> u32 {
    let directions = &SOBOL_TABLE[dimension];
    let mut result = 0;
    let mut bits = index;
    let mut k = 0;
    while bits != 0 {
        if bits & 1 == 1 {
            result ^= directions[k];
        }
        bits >>= 1;
        k += 1;
    }
    result
}

#[inline]
fn laine_karras_permutation(mut x: u32, seed: u32) -> u32 {
    x = x.wrapping_add(seed);
    x ^= x.wrapping_mul(0x6c50b47c);
    x ^= x.wrapping_mul(0xb82f1e52);
    x ^= x.wrapping_mul(0xc7afe638);
    x ^= x.wrapping_mul(0x8d22f6e6);
    x
}

#[inline]
fn nested_uniform_scramble(x: u32, seed: u32) -> u32 {
    laine_karras_permutation(x.reverse_bits(), seed).reverse_bits()
}

#[inline]
fn hash_combine(seed: u32, v: u32) -> u32 {
    seed ^ (v
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
        .wrapping_add(0x9e3779b9))
}

fn sobol_burley(index: u32, sobol_dim: usize, seed: u32) -> f32 {
    let shuffled = nested_uniform_scramble(index, seed);
    let value = nested_uniform_scramble(sobol(shuffled, sobol_dim), hash_combine(seed, sobol_dim as u32));
    uint_to_float(value)
}

// Kensler's correlated multi-jittered sampling

fn cmj_permute(mut i: u32, l: u32, p: u32) -> u32 {
    if l <= 1 {
        return 0;
    }
    let mut w = l - 1;
    w |= w >> 1;
    w |= w >> 2;
    w |= w >> 4;
    w |= w >> 8;
    w |= w >> 16;
    loop {
        i ^= p;
        i = i.wrapping_mul(0xe170893d);
        i ^= p >> 16;
        i ^= (i & w) >> 4;
        i ^= p >> 8;
        i = i.wrapping_mul(0x0929eb3f);
        i ^= p >> 23;
        i ^= (i & w) >> 1;
        i = i.wrapping_mul(1 | p >> 27);
        i = i.wrapping_mul(0x6935fa69);
        i ^= (i & w) >> 11;
        i = i.wrapping_mul(0x74dcb303);
        i ^= (i & w) >> 2;
        i = i.wrapping_mul(0x9e501cc3);
        i ^= (i & w) >> 2;
        i = i.wrapping_mul(0xc860a3df);
        i &= w;
        i ^= i >> 5;
        if i < l {
            break;
        }
    }
    (i.wrapping_add(p)) % l
}

fn cmj_randfloat(mut i: u32, p: u32) -> f32 {
    i ^= p;
    i ^= i >> 17;
    i ^= i >> 10;
    i = i.wrapping_mul(0xb36534e5);
    i ^= i >> 12;
    i ^= i >> 21;
    i = i.wrapping_mul(0x93fc4795);
    i ^= 0xdf6e307f;
    i ^= i >> 17;
    i = i.wrapping_mul(1 | p >> 18);
    uint_to_float(i)
}

fn cmj_1d(sample: u32, num_samples: u32, p: u32) -> f32 {
    // Samples past the stratified set start a new, differently seeded set.
    let n = num_samples.max(1);
    let p = p ^ hash_uint(sample / n);
    let s = sample % n;
    let x = cmj_permute(s, n, p.wrapping_mul(0x68bc21eb));
    let jx = cmj_randfloat(s, p.wrapping_mul(0x967a889b));
    ((x as f32 + jx) / n as f32).min(ONE_MINUS_EPSILON)
}

fn cmj_2d(sample: u32, num_samples: u32, p: u32) -> (f32, f32) {
    let n = num_samples.max(1);
    let p = p ^ hash_uint(sample / n);
    let m = (n as f32).sqrt() as u32;
    let m = m.max(1);
    let rows = n.div_ceil(m);
    let s = cmj_permute(sample % n, n, p.wrapping_mul(0x51633e2d));
    let sx = cmj_permute(s % m, m, p.wrapping_mul(0xa511e9b3));
    let sy = cmj_permute(s / m, rows, p.wrapping_mul(0x63d83595));
    let jx = cmj_randfloat(s, p.wrapping_mul(0xa399d265));
    let jy = cmj_randfloat(s, p.wrapping_mul(0x711ad6a5));
    let x = ((s % m) as f32 + (sy as f32 + jx) / rows as f32) / m as f32;
    let y = ((s / m) as f32 + (sx as f32 + jy) / m as f32) / rows as f32;
    (x.min(ONE_MINUS_EPSILON), y.min(ONE_MINUS_EPSILON))
}

const ONE_MINUS_EPSILON: f32 = 1.0 - f32::EPSILON / 2.0;

/// Sample generator for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub pattern: SamplingPattern,
    /// Samples per pixel the frame is stratified for (multi-jitter only)
    pub num_samples: u32,
}

impl Sampler {
    pub fn new(pattern: SamplingPattern, num_samples: u32) -> Self {
        Self {
            pattern,
            num_samples,
        }
    }

    /// One value in [0, 1) for `dimension` of `sample` in the stream `rng_hash`.
    pub fn sample_1d(&self, rng_hash: u32, sample: u32, dimension: u32) -> f32 {
        let seed = rng_hash ^ hash_uint(dimension);
        match self.pattern {
            SamplingPattern::SobolBurley => sobol_burley(sample, 0, seed),
            SamplingPattern::CorrelatedMultiJitter => cmj_1d(sample, self.num_samples, seed),
        }
    }

    /// Two values in [0, 1), stratified jointly, for `dimension` and `dimension + 1`.
    pub fn sample_2d(&self, rng_hash: u32, sample: u32, dimension: u32) -> (f32, f32) {
        let seed = rng_hash ^ hash_uint(dimension);
        match self.pattern {
            SamplingPattern::SobolBurley => {
                let shuffled = nested_uniform_scramble(sample, seed);
                let x = nested_uniform_scramble(sobol(shuffled, 0), hash_combine(seed, 0));
                let y = nested_uniform_scramble(sobol(shuffled, 1), hash_combine(seed, 1));
                (uint_to_float(x), uint_to_float(y))
            }
            SamplingPattern::CorrelatedMultiJitter => cmj_2d(sample, self.num_samples, seed),
        }
    }
}

/// Linear congruential generator for reservoir decisions during traversal.
///
/// Passed explicitly by `&mut` into local queries so the traversal has no
/// hidden random state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcgSampler {
    state: u32,
}

impl LcgSampler {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Seed from a path's stream position so reruns are deterministic.
    pub fn for_path(rng_hash: u32, rng_offset: u32, sample: u32, scramble: u32) -> Self {
        Self::new(hash_uint3(rng_hash ^ scramble, rng_offset, sample))
    }

    /// Advance the generator; returns the hashed state, since the raw low
    /// bits of an LCG cycle with short periods.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1103515245).wrapping_add(12345);
        hash_uint(self.state)
    }

    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        uint_to_float(self.next_u32())
    }
}

/// Map a unit square sample to the unit disk, preserving stratification.
pub fn concentric_sample_disk(u: f32, v: f32) -> (f32, f32) {
    let a = 2.0 * u - 1.0;
    let b = 2.0 * v - 1.0;
    if a == 0.0 && b == 0.0 {
        return (0.0, 0.0);
    }
    let (r, phi) = if a * a > b * b {
        (a, std::f32::consts::FRAC_PI_4 * (b / a))
    } else {
        (b, std::f32::consts::FRAC_PI_2 - std::f32::consts::FRAC_PI_4 * (a / b))
    };
    (r * phi.cos(), r * phi.sin())
}

/// Cosine-weighted direction about `n`; returns the direction and its pdf.
pub fn sample_cos_hemisphere(n: Vec3, u: f32, v: f32) -> (Vec3, f32) {
    let (x, y) = concentric_sample_disk(u, v);
    let z = (1.0 - x * x - y * y).max(0.0).sqrt();
    let (t, b) = make_orthonormals(n);
    (x * t + y * b + z * n, z * std::f32::consts::FRAC_1_PI)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn assert_stratified_1d(values: &[f32]) {
        let n = values.len();
        let mut strata = vec![0; n];
        for &v in values {
            assert!((0.0..1.0).contains(&v));
            strata[(v * n as f32) as usize] += 1;
        }
        assert!(strata.iter().all(|&c| c == 1), "{:?}", strata);
    }

    #[test]
    fn test_sobol_directions_dim1() {
        // Second Sobol dimension: 1/2, 3/4, 1/4, ...
        assert_eq!(sobol(1, 1), 0x8000_0000);
        assert_eq!(sobol(2, 1), 0xc000_0000);
        assert_eq!(sobol(3, 1), 0x4000_0000);
    }

    #[test]
    fn test_sobol_burley_stratified_1d() {
        let sampler = Sampler::new(SamplingPattern::SobolBurley, 16);
        for hash in [0, 7, 0xdead_beef] {
            let values: Vec<f32> = (0..16).map(|s| sampler.sample_1d(hash, s, dim::BSDF_U)).collect();
            assert_stratified_1d(&values);
        }
    }

    #[test]
    fn test_sobol_burley_stratified_2d() {
        let sampler = Sampler::new(SamplingPattern::SobolBurley, 16);
        let mut cells = [[0; 4]; 4];
        for s in 0..16 {
            let (u, v) = sampler.sample_2d(42, s, dim::LIGHT_U);
            cells[(u * 4.0) as usize][(v * 4.0) as usize] += 1;
        }
        assert!(cells.iter().flatten().all(|&c| c == 1), "{:?}", cells);
    }

    #[test]
    fn test_cmj_stratified() {
        let sampler = Sampler::new(SamplingPattern::CorrelatedMultiJitter, 16);
        let values: Vec<f32> = (0..16).map(|s| sampler.sample_1d(3, s, dim::FILTER_U)).collect();
        assert_stratified_1d(&values);

        let mut rows = [0; 4];
        let mut cols = [0; 4];
        for s in 0..16 {
            let (u, v) = sampler.sample_2d(3, s, dim::LENS_U);
            cols[(u * 4.0) as usize] += 1;
            rows[(v * 4.0) as usize] += 1;
        }
        assert_eq!(cols, [4; 4]);
        assert_eq!(rows, [4; 4]);
    }

    #[test]
    fn test_dimensions_and_pixels_decorrelate() {
        let sampler = Sampler::new(SamplingPattern::SobolBurley, 1);
        let a = sampler.sample_1d(pixel_rng_hash(0, 0, 0), 0, 5);
        let b = sampler.sample_1d(pixel_rng_hash(1, 0, 0), 0, 5);
        let c = sampler.sample_1d(pixel_rng_hash(0, 0, 0), 0, 6);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_lcg_is_deterministic() {
        let mut a = LcgSampler::for_path(1, 2, 3, 4);
        let mut b = LcgSampler::for_path(1, 2, 3, 4);
        for _ in 0..8 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
        assert!((0.0..1.0).contains(&a.next_f32()));
    }

    #[test]
    fn test_cos_hemisphere_above_surface() {
        let n = Vec3::new(0.0, 1.0, 0.0);
        for i in 0..64 {
            let u = (i % 8) as f32 / 8.0 + 0.03;
            let v = (i / 8) as f32 / 8.0 + 0.05;
            let (d, pdf) = sample_cos_hemisphere(n, u, v);
            assert!((d.length() - 1.0).abs() < 1e-4);
            assert!(d.dot(n) >= 0.0);
            assert!((pdf - d.dot(n) / std::f32::consts::PI).abs() < 1e-4);
        }
    }
}
