use rstar::{primitives::GeomWithData, RTree};

use crate::{floating_type_mod::FT, simulation_parameters::NeighborhoodSearchAlgorithm, V3, VI3};

// spatial hash mixing constants
const P1: u32 = 73856093;
const P2: u32 = 19349663;
const P3: u32 = 83492791;

const MIN_TABLE_SIZE: usize = 64;

/**
 * Uniform grid over the world box whose cells are stored in a hash table.
 *
 * Particles are bucketed with a counting sort, so `build` is O(n) and needs no
 * per-cell allocations. Positions outside the world box are clamped to the
 * nearest border cell; they are never dropped.
 */
pub struct SpatialGrid {
    cell_size: FT,
    cells_min: VI3,
    cells_max: VI3,

    // one entry per particle, the (clamped) cell it was sorted into
    particle_cell: Vec<VI3>,

    // bucket b holds sorted_ids[bucket_start[b]..bucket_start[b + 1]]
    bucket_start: Vec<u32>,
    sorted_ids: Vec<u32>,

    positions: Vec<V3>,
}

impl SpatialGrid {
    pub fn new(cell_size: FT, world_min: V3, world_max: V3) -> Self {
        assert!(cell_size > 0.);
        let cells_min = world_min.map(|x| (x / cell_size).floor() as i32);
        let cells_max = world_max.map(|x| (x / cell_size).floor() as i32);
        SpatialGrid {
            cell_size,
            cells_min,
            cells_max,
            particle_cell: Vec::new(),
            bucket_start: Vec::new(),
            sorted_ids: Vec::new(),
            positions: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> FT {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn cell_of(&self, x: V3) -> VI3 {
        VI3::from_fn(|d, _| {
            // `as` saturates and maps NaN to 0, the clamp does the rest
            let c = (x[d] / self.cell_size).floor() as i32;
            c.clamp(self.cells_min[d], self.cells_max[d])
        })
    }

    #[inline(always)]
    fn bucket_of(&self, cell: VI3) -> usize {
        let h = (cell.x as u32).wrapping_mul(P1) ^ (cell.y as u32).wrapping_mul(P2) ^ (cell.z as u32).wrapping_mul(P3);
        h as usize & (self.bucket_start.len() - 2)
    }

    pub fn build(&mut self, positions: &[V3]) {
        let n = positions.len();
        let table_size = (2 * n).next_power_of_two().max(MIN_TABLE_SIZE);

        self.positions.clear();
        self.positions.extend_from_slice(positions);

        let particle_cell = positions.iter().map(|&x| self.cell_of(x)).collect();
        self.particle_cell = particle_cell;

        self.bucket_start.clear();
        self.bucket_start.resize(table_size + 1, 0);

        for i in 0..n {
            let b = self.bucket_of(self.particle_cell[i]);
            self.bucket_start[b + 1] += 1;
        }
        for b in 0..table_size {
            self.bucket_start[b + 1] += self.bucket_start[b];
        }

        let mut fill: Vec<u32> = self.bucket_start[..table_size].to_vec();
        self.sorted_ids.clear();
        self.sorted_ids.resize(n, 0);
        for i in 0..n {
            let b = self.bucket_of(self.particle_cell[i]);
            self.sorted_ids[fill[b] as usize] = i as u32;
            fill[b] += 1;
        }
    }

    /**
     * Calls `f` with every particle index j where |x_j - point| < radius.
     * Only the cells within ceil(radius / cell_size) of the point's cell are
     * examined (27 cells when radius equals the cell size).
     */
    pub fn for_each_neighbor(&self, point: V3, radius: FT, mut f: impl FnMut(usize)) {
        if self.sorted_ids.is_empty() {
            return;
        }

        let range = ((radius / self.cell_size).ceil() as i32).max(1);
        let center = self.cell_of(point);
        let lo = VI3::from_fn(|d, _| (center[d] - range).max(self.cells_min[d]));
        let hi = VI3::from_fn(|d, _| (center[d] + range).min(self.cells_max[d]));
        let radius_sq = radius * radius;

        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    let cell = VI3::new(x, y, z);
                    let b = self.bucket_of(cell);
                    let bucket = &self.sorted_ids[self.bucket_start[b] as usize..self.bucket_start[b + 1] as usize];
                    for &j in bucket {
                        let j = j as usize;
                        // different cells can share a bucket
                        if self.particle_cell[j] != cell {
                            continue;
                        }
                        if (self.positions[j] - point).norm_squared() < radius_sq {
                            f(j);
                        }
                    }
                }
            }
        }
    }

    /// Clears `out` and fills it with the indices of all particles closer than `radius` to `point`.
    pub fn query_neighbors(&self, point: V3, radius: FT, out: &mut Vec<usize>) {
        out.clear();
        self.for_each_neighbor(point, radius, |j| out.push(j));
    }
}

type RTreeElem = GeomWithData<[FT; 3], usize>;

pub struct RStarIndex {
    tree: RTree<RTreeElem>,
    positions: Vec<V3>,
}

impl RStarIndex {
    pub fn new() -> Self {
        RStarIndex {
            tree: RTree::new(),
            positions: Vec::new(),
        }
    }

    pub fn build(&mut self, positions: &[V3]) {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        let elems: Vec<RTreeElem> = positions
            .iter()
            .enumerate()
            .map(|(idx, p)| RTreeElem::new([p.x, p.y, p.z], idx))
            .collect();
        self.tree = RTree::bulk_load(elems);
    }

    pub fn for_each_neighbor(&self, point: V3, radius: FT, mut f: impl FnMut(usize)) {
        let radius_sq = radius * radius;
        for elem in self.tree.locate_within_distance([point.x, point.y, point.z], radius_sq) {
            // locate_within_distance includes the boundary
            let j = elem.data;
            if (self.positions[j] - point).norm_squared() < radius_sq {
                f(j);
            }
        }
    }
}

impl Default for RStarIndex {
    fn default() -> Self {
        Self::new()
    }
}

pub enum NeighborhoodIndex {
    Grid(SpatialGrid),
    RStar(RStarIndex),
}

impl NeighborhoodIndex {
    pub fn new(algorithm: NeighborhoodSearchAlgorithm, support_radius: FT, world_min: V3, world_max: V3) -> Self {
        match algorithm {
            NeighborhoodSearchAlgorithm::Grid => {
                NeighborhoodIndex::Grid(SpatialGrid::new(support_radius, world_min, world_max))
            }
            NeighborhoodSearchAlgorithm::RStar => NeighborhoodIndex::RStar(RStarIndex::new()),
        }
    }

    pub fn build(&mut self, positions: &[V3]) {
        match self {
            NeighborhoodIndex::Grid(grid) => grid.build(positions),
            NeighborhoodIndex::RStar(rstar) => rstar.build(positions),
        }
    }

    pub fn for_each_neighbor(&self, point: V3, radius: FT, f: impl FnMut(usize)) {
        match self {
            NeighborhoodIndex::Grid(grid) => grid.for_each_neighbor(point, radius, f),
            NeighborhoodIndex::RStar(rstar) => rstar.for_each_neighbor(point, radius, f),
        }
    }

    pub fn neighbor_list(&self, point: V3, radius: FT) -> Vec<u32> {
        let mut list = Vec::new();
        self.for_each_neighbor(point, radius, |j| list.push(j as u32));
        list
    }
}

/// Neighbor lists of all particles for the current step. Every particle is its own neighbor.
pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn from_lists(neighs: Vec<Vec<u32>>) -> Self {
        NeighborhoodCache { neighs }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = usize> + 'a {
        self.neighs[i].iter().map(|&x| x as usize)
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn brute_force(positions: &[V3], point: V3, radius: FT) -> Vec<usize> {
        (0..positions.len())
            .filter(|&j| (positions[j] - point).norm_squared() < radius * radius)
            .collect()
    }

    fn random_points(rng: &mut StdRng, n: usize, extent: FT) -> Vec<V3> {
        (0..n)
            .map(|_| {
                vec3f(
                    rng.gen_range(-extent..extent),
                    rng.gen_range(-extent..extent),
                    rng.gen_range(-extent..extent),
                )
            })
            .collect()
    }

    fn check_completeness(index: &mut NeighborhoodIndex, seed: u64, n: usize, radius: FT) {
        let mut rng = StdRng::seed_from_u64(seed);
        // some particles lie outside the [-1, 1]^3 world box
        let positions = random_points(&mut rng, n, 1.3);
        index.build(&positions);

        let mut queries = random_points(&mut rng, 100, 1.6);
        queries.extend(positions.iter().take(100).cloned());

        for q in queries {
            let mut found = index.neighbor_list(q, radius).into_iter().map(|j| j as usize).collect::<Vec<_>>();
            found.sort_unstable();
            assert_eq!(found, brute_force(&positions, q, radius), "seed={} n={} q={:?}", seed, n, q);
        }
    }

    #[test]
    fn grid_matches_brute_force() {
        let h = 0.1;
        for seed in [1, 2, 3] {
            for n in [100, 1000, 10000] {
                let mut index =
                    NeighborhoodIndex::Grid(SpatialGrid::new(h, vec3f(-1., -1., -1.), vec3f(1., 1., 1.)));
                check_completeness(&mut index, seed, n, h);
            }
        }
    }

    #[test]
    fn grid_handles_radius_larger_than_cell() {
        let mut index = NeighborhoodIndex::Grid(SpatialGrid::new(0.05, vec3f(-1., -1., -1.), vec3f(1., 1., 1.)));
        check_completeness(&mut index, 7, 2000, 0.17);
    }

    #[test]
    fn rstar_matches_brute_force() {
        for seed in [1, 2, 3] {
            for n in [100, 1000, 10000] {
                let mut index = NeighborhoodIndex::RStar(RStarIndex::new());
                check_completeness(&mut index, seed, n, 0.1);
            }
        }
    }

    #[test]
    fn grid_query_with_empty_cells_and_empty_set() {
        let mut grid = SpatialGrid::new(0.1, vec3f(-3., -1., -3.), vec3f(3., 5., 3.));
        let mut out = vec![42];
        grid.query_neighbors(V3::zeros(), 0.1, &mut out);
        assert!(out.is_empty());

        grid.build(&[]);
        grid.query_neighbors(V3::zeros(), 0.1, &mut out);
        assert!(out.is_empty());

        grid.build(&[vec3f(0., 0., 0.), vec3f(2., 2., 2.)]);
        grid.query_neighbors(vec3f(0.05, 0., 0.), 0.1, &mut out);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn particles_outside_world_are_clamped_not_dropped() {
        let mut grid = SpatialGrid::new(0.1, vec3f(-1., -1., -1.), vec3f(1., 1., 1.));
        let far = vec3f(50., -20., 3.);
        grid.build(&[far, vec3f(0., 0., 0.)]);
        assert_eq!(grid.cell_of(far), grid.cell_of(vec3f(1., -1., 1.)));
        let mut out = Vec::new();
        grid.query_neighbors(far, 0.1, &mut out);
        assert_eq!(out, vec![0]);

        // NaN positions land in some cell instead of panicking
        grid.build(&[V3::from_element(FT::NAN)]);
        grid.query_neighbors(V3::zeros(), 0.1, &mut out);
        assert!(out.is_empty());
    }
}
