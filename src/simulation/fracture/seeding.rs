use rand::{rngs::StdRng, Rng};

use crate::{floating_type_mod::FT, V3};

use super::ConvexPolyhedron;

const DIRECTIONAL_TRIES: usize = 64;
const UNIFORM_TRIES: usize = 256;

pub fn random_unit_vector(rng: &mut StdRng) -> V3 {
    loop {
        let v = V3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        let len_sq = v.norm_squared();
        if len_sq > 1e-4 && len_sq <= 1. {
            return v / len_sq.sqrt();
        }
    }
}

/**
 * The point inside `body` closest (along the line to `inside`) to `impact`.
 * An impact point on or slightly outside the surface is the common case.
 */
pub fn impact_anchor(body: &ConvexPolyhedron, inside: V3, impact: V3) -> V3 {
    if body.contains(impact) {
        return impact;
    }
    let (mut lo, mut hi) = (inside, impact);
    for _ in 0..32 {
        let mid = (lo + hi) * 0.5;
        if body.contains(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/**
 * Scatters `count` seeds inside `body`, the first one at `anchor`. Seed
 * distances to the anchor are R * u^bias (u uniform in [0, 1)), which for
 * bias > 1 concentrates seeds around the impact.
 */
pub fn scatter_seeds(body: &ConvexPolyhedron, anchor: V3, count: usize, bias: FT, rng: &mut StdRng) -> Vec<V3> {
    let radius = body
        .faces()
        .iter()
        .flatten()
        .map(|p| (p - anchor).norm())
        .fold(0., FT::max);
    let (aabb_min, aabb_max) = body.aabb();

    let mut seeds = Vec::with_capacity(count);
    if count == 0 {
        return seeds;
    }
    seeds.push(anchor);

    'seeds: while seeds.len() < count {
        for _ in 0..DIRECTIONAL_TRIES {
            let u: FT = rng.gen_range(0.0..1.0);
            let p = anchor + random_unit_vector(rng) * radius * u.powf(bias);
            if body.contains(p) {
                seeds.push(p);
                continue 'seeds;
            }
        }
        // thin bodies seen from a corner
        for _ in 0..UNIFORM_TRIES {
            let p = V3::from_fn(|d, _| rng.gen_range(aabb_min[d]..=aabb_max[d]));
            if body.contains(p) {
                seeds.push(p);
                continue 'seeds;
            }
        }
        break;
    }
    seeds
}

/// Greedily drops seeds closer than `min_distance` to an already accepted one.
pub fn filter_coincident_seeds(seeds: &[V3], min_distance: FT) -> Vec<V3> {
    let mut accepted: Vec<V3> = Vec::with_capacity(seeds.len());
    for &s in seeds {
        if accepted.iter().all(|a| (a - s).norm() >= min_distance) {
            accepted.push(s);
        }
    }
    accepted
}
