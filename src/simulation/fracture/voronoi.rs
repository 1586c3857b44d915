use crate::{floating_type_mod::FT, V3};

use super::ConvexPolyhedron;

/**
 * Voronoi cell of `seeds[i]` restricted to `body`: the body clipped by the
 * bisector half-space towards every other seed. Seeds are processed nearest
 * first; once a seed is farther away than twice the cell's radius around its
 * own seed, no remaining bisector can cut the cell.
 */
pub fn voronoi_cell(body: &ConvexPolyhedron, seeds: &[V3], i: usize) -> Option<ConvexPolyhedron> {
    let si = seeds[i];

    let mut others: Vec<(FT, usize)> = seeds
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != i)
        .map(|(j, sj)| ((sj - si).norm_squared(), j))
        .collect();
    others.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut cell = body.clone();
    for (dist_sq, j) in others {
        let cell_radius_sq = cell
            .faces()
            .iter()
            .flatten()
            .map(|p| (p - si).norm_squared())
            .fold(0., FT::max);
        if dist_sq > 4. * cell_radius_sq {
            break;
        }

        let sj = seeds[j];
        let n = sj - si;
        let d = n.dot(&((si + sj) * 0.5));
        cell = cell.clip(n, d)?;
    }
    Some(cell)
}

/// All cells in seed order. `None` marks seeds whose cell vanished.
pub fn voronoi_cells(body: &ConvexPolyhedron, seeds: &[V3]) -> Vec<Option<ConvexPolyhedron>> {
    (0..seeds.len()).map(|i| voronoi_cell(body, seeds, i)).collect()
}
