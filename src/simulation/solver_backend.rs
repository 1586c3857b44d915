use enum_dispatch::enum_dispatch;

use crate::{
    floating_type_mod::FT,
    neighborhood_search::{NeighborhoodCache, NeighborhoodIndex},
    sdf::Sdf,
    simulation::ParticleVec,
    simulation_parameters::{BackendType, SimulationParams},
    SimulationError, V3,
};

/**
 * The per-substep passes of the fluid solver. Each pass reads committed
 * attribute arrays and writes only its own output array, so particles can be
 * processed in any order. All passes except `max_speed` return the number of
 * particles whose new value was non-finite and got replaced by the previous one.
 */
#[enum_dispatch]
pub trait SolverBackendTrait {
    fn num_threads(&self) -> usize;

    fn build_neighborhood(&self, index: &mut NeighborhoodIndex, positions: &[V3], radius: FT) -> NeighborhoodCache;

    fn compute_densities(&self, neighs: &NeighborhoodCache, h: FT, particles: &mut ParticleVec) -> usize;

    fn compute_pressures(&self, params: &SimulationParams, particles: &mut ParticleVec) -> usize;

    fn compute_forces(
        &self,
        params: &SimulationParams,
        boundary: &[Sdf],
        neighs: &NeighborhoodCache,
        particles: &mut ParticleVec,
    ) -> usize;

    /// Writes `position_next`/`velocity_next`; the caller swaps them into place.
    fn integrate(&self, params: &SimulationParams, dt: FT, particles: &mut ParticleVec) -> usize;

    fn max_speed(&self, velocity: &[V3]) -> FT;
}

#[enum_dispatch(SolverBackendTrait)]
pub enum SolverBackend {
    ParallelBackend,
    SerialBackend,
}

impl SolverBackend {
    pub fn new(params: &SimulationParams) -> Result<SolverBackend, SimulationError> {
        Ok(match params.backend {
            BackendType::Parallel => ParallelBackend::new(params.num_threads)?.into(),
            BackendType::Serial => SerialBackend.into(),
        })
    }
}

fn is_finite(v: &V3) -> bool {
    v.iter().all(|x| x.is_finite())
}

macro_rules! decl_solver_passes {
    ($mod_name:ident, $concurrency:ident) => {
        mod $mod_name {
            use super::is_finite;
            use crate::{
                concurrency::$concurrency::*,
                floating_type_mod::FT,
                neighborhood_search::{NeighborhoodCache, NeighborhoodIndex},
                sdf::Sdf,
                simulation::ParticleVec,
                simulation_parameters::SimulationParams,
                sph_kernels::{cubic_kernel, cubic_kernel_gradient},
                V3,
            };

            pub fn build_neighborhood(
                index: &mut NeighborhoodIndex,
                positions: &[V3],
                radius: FT,
            ) -> NeighborhoodCache {
                index.build(positions);
                let index = &*index;
                NeighborhoodCache::from_lists(par_map_collect(positions.len(), |i| {
                    index.neighbor_list(positions[i], radius)
                }))
            }

            pub fn compute_densities(neighs: &NeighborhoodCache, h: FT, particles: &mut ParticleVec) -> usize {
                let mass = &particles.mass;
                let position = &particles.position;

                par_iter_reduce1(
                    &mut particles.density,
                    || 0,
                    |a, b| a + b,
                    |i, density_i| {
                        // includes j = i
                        let mut rho: FT = 0.;
                        for j in neighs.iter(i) {
                            rho += mass[j] * cubic_kernel((position[i] - position[j]).norm(), h);
                        }
                        if rho.is_finite() && rho > 0. {
                            *density_i = rho;
                            0
                        } else {
                            1
                        }
                    },
                )
            }

            pub fn compute_pressures(params: &SimulationParams, particles: &mut ParticleVec) -> usize {
                let density = &particles.density;

                par_iter_reduce1(
                    &mut particles.pressure,
                    || 0,
                    |a, b| a + b,
                    |i, pressure_i| {
                        let p = params.stiffness * (density[i] - params.rest_density);
                        if !p.is_finite() {
                            return 1;
                        }
                        *pressure_i = if params.tensile_pressure { p } else { p.max(0.) };
                        0
                    },
                )
            }

            pub fn compute_forces(
                params: &SimulationParams,
                boundary: &[Sdf],
                neighs: &NeighborhoodCache,
                particles: &mut ParticleVec,
            ) -> usize {
                let h = params.support_radius;
                let boundary_thickness = params.boundary_thickness * h;
                let viscosity_eps = 0.01 * h * h;

                let mass = &particles.mass;
                let position = &particles.position;
                let velocity = &particles.velocity;
                let density = &particles.density;
                let pressure = &particles.pressure;

                par_iter_reduce1(
                    &mut particles.force,
                    || 0,
                    |a, b| a + b,
                    |i, force_i| {
                        let x_i = position[i];
                        let v_i = velocity[i];
                        let m_i = mass[i];

                        let mut pressure_gradient = V3::zeros();
                        let mut velocity_laplacian = V3::zeros();
                        for j in neighs.iter(i) {
                            if j == i {
                                continue;
                            }
                            let x_ij = x_i - position[j];
                            let grad_w = cubic_kernel_gradient(x_ij, h);

                            pressure_gradient += mass[j] * (pressure[i] + pressure[j]) / (2. * density[j]) * grad_w;

                            let v_ij = v_i - velocity[j];
                            velocity_laplacian += mass[j] / density[j] * v_ij.dot(&x_ij)
                                / (x_ij.norm_squared() + viscosity_eps)
                                * grad_w;
                        }

                        let mut f = -m_i / density[i] * pressure_gradient
                            + m_i * params.viscosity * 10. * velocity_laplacian
                            + m_i * params.gravity;

                        // penalty spring inside a thin layer in front of each boundary
                        for sdf in boundary {
                            let (d, n) = sdf.probe_with_normal(x_i);
                            if d < boundary_thickness {
                                let penetration = boundary_thickness - d;
                                let a = params.boundary_stiffness * penetration - params.boundary_damping * v_i.dot(&n);
                                if a > 0. {
                                    f += m_i * a * n;
                                }
                            }
                        }

                        if is_finite(&f) {
                            *force_i = f;
                            0
                        } else {
                            1
                        }
                    },
                )
            }

            pub fn integrate(params: &SimulationParams, dt: FT, particles: &mut ParticleVec) -> usize {
                let mass = &particles.mass;
                let position = &particles.position;
                let velocity = &particles.velocity;
                let force = &particles.force;

                par_iter_reduce2(
                    &mut particles.position_next,
                    &mut particles.velocity_next,
                    || 0,
                    |a, b| a + b,
                    |i, x_next, v_next| {
                        // semi-implicit Euler
                        let mut v = velocity[i] + dt * force[i] / mass[i];
                        let mut x = position[i] + dt * v;

                        if !(is_finite(&x) && is_finite(&v)) {
                            *x_next = position[i];
                            *v_next = if is_finite(&velocity[i]) { velocity[i] } else { V3::zeros() };
                            return 1;
                        }

                        for d in 0..3 {
                            if x[d] < params.world_min[d] {
                                x[d] = params.world_min[d];
                                if v[d] < 0. {
                                    v[d] *= -params.wall_restitution;
                                }
                            } else if x[d] > params.world_max[d] {
                                x[d] = params.world_max[d];
                                if v[d] > 0. {
                                    v[d] *= -params.wall_restitution;
                                }
                            }
                        }

                        *x_next = x;
                        *v_next = v;
                        0
                    },
                )
            }

            pub fn max_speed(velocity: &[V3]) -> FT {
                par_reduce0(velocity.len(), || 0., FT::max, |i| {
                    let s = velocity[i].norm();
                    if s.is_finite() {
                        s
                    } else {
                        0.
                    }
                })
            }
        }
    };
}

decl_solver_passes!(parallel_passes, parallel);
decl_solver_passes!(serial_passes, serial);

/// Runs the passes on a dedicated rayon pool.
pub struct ParallelBackend {
    pool: rayon::ThreadPool,
}

impl ParallelBackend {
    /// `num_threads == 0` lets rayon pick the number of threads.
    pub fn new(num_threads: usize) -> Result<ParallelBackend, SimulationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sph-worker-{}", i))
            .build()
            .map_err(|e| SimulationError::Configuration(format!("cannot create worker pool: {}", e)))?;
        Ok(ParallelBackend { pool })
    }
}

impl SolverBackendTrait for ParallelBackend {
    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn build_neighborhood(&self, index: &mut NeighborhoodIndex, positions: &[V3], radius: FT) -> NeighborhoodCache {
        self.pool
            .install(|| parallel_passes::build_neighborhood(index, positions, radius))
    }

    fn compute_densities(&self, neighs: &NeighborhoodCache, h: FT, particles: &mut ParticleVec) -> usize {
        self.pool
            .install(|| parallel_passes::compute_densities(neighs, h, particles))
    }

    fn compute_pressures(&self, params: &SimulationParams, particles: &mut ParticleVec) -> usize {
        self.pool
            .install(|| parallel_passes::compute_pressures(params, particles))
    }

    fn compute_forces(
        &self,
        params: &SimulationParams,
        boundary: &[Sdf],
        neighs: &NeighborhoodCache,
        particles: &mut ParticleVec,
    ) -> usize {
        self.pool
            .install(|| parallel_passes::compute_forces(params, boundary, neighs, particles))
    }

    fn integrate(&self, params: &SimulationParams, dt: FT, particles: &mut ParticleVec) -> usize {
        self.pool
            .install(|| parallel_passes::integrate(params, dt, particles))
    }

    fn max_speed(&self, velocity: &[V3]) -> FT {
        self.pool.install(|| parallel_passes::max_speed(velocity))
    }
}

pub struct SerialBackend;

impl SolverBackendTrait for SerialBackend {
    fn num_threads(&self) -> usize {
        1
    }

    fn build_neighborhood(&self, index: &mut NeighborhoodIndex, positions: &[V3], radius: FT) -> NeighborhoodCache {
        serial_passes::build_neighborhood(index, positions, radius)
    }

    fn compute_densities(&self, neighs: &NeighborhoodCache, h: FT, particles: &mut ParticleVec) -> usize {
        serial_passes::compute_densities(neighs, h, particles)
    }

    fn compute_pressures(&self, params: &SimulationParams, particles: &mut ParticleVec) -> usize {
        serial_passes::compute_pressures(params, particles)
    }

    fn compute_forces(
        &self,
        params: &SimulationParams,
        boundary: &[Sdf],
        neighs: &NeighborhoodCache,
        particles: &mut ParticleVec,
    ) -> usize {
        serial_passes::compute_forces(params, boundary, neighs, particles)
    }

    fn integrate(&self, params: &SimulationParams, dt: FT, particles: &mut ParticleVec) -> usize {
        serial_passes::integrate(params, dt, particles)
    }

    fn max_speed(&self, velocity: &[V3]) -> FT {
        serial_passes::max_speed(velocity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vec3f, FluidSimulation};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_block(seed: u64, n: usize) -> Vec<V3> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| vec3f(rng.gen_range(-0.3..0.3), rng.gen_range(0.0..0.6), rng.gen_range(-0.3..0.3)))
            .collect()
    }

    #[test]
    fn serial_and_parallel_backends_agree() {
        let positions = random_block(5, 800);
        let n = positions.len();
        let mut results = Vec::new();
        for backend in [BackendType::Serial, BackendType::Parallel] {
            let mut params = SimulationParams::default();
            params.backend = backend;
            params.num_threads = 3;
            let mut fluid =
                FluidSimulation::new(params.clone(), vec![], &positions, &vec![V3::zeros(); n], &vec![0.1; n])
                    .unwrap();
            for _ in 0..5 {
                fluid.step(params.time_step);
            }
            results.push(fluid.positions().to_vec());
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn pool_size_follows_params() {
        let mut params = SimulationParams::default();
        params.num_threads = 2;
        assert_eq!(SolverBackend::new(&params).unwrap().num_threads(), 2);
        params.backend = BackendType::Serial;
        assert_eq!(SolverBackend::new(&params).unwrap().num_threads(), 1);
    }

    #[test]
    fn non_finite_force_keeps_committed_state() {
        let mut particles = ParticleVec::default(2);
        particles.mass = vec![1., 1.];
        particles.position = vec![vec3f(0., 0., 0.), vec3f(0.5, 0., 0.)];
        particles.velocity = vec![vec3f(1., 0., 0.), vec3f(0., 0., 0.)];
        particles.force = vec![vec3f(FT::NAN, 0., 0.), vec3f(0., 0., 0.)];

        let params = SimulationParams::default();
        let recovered = SerialBackend.integrate(&params, 0.01, &mut particles);
        assert_eq!(recovered, 1);
        assert_eq!(particles.position_next[0], vec3f(0., 0., 0.));
        assert_eq!(particles.velocity_next[0], vec3f(1., 0., 0.));
        assert_eq!(particles.position_next[1], vec3f(0.5, 0., 0.));
    }

    #[test]
    fn non_finite_density_keeps_previous_value() {
        let mut particles = ParticleVec::default(2);
        particles.mass = vec![1., 1.];
        particles.position = vec![vec3f(0., 0., 0.), vec3f(FT::NAN, 0., 0.)];
        particles.density = vec![1000., 1000.];
        let neighs = NeighborhoodCache::from_lists(vec![vec![0, 1], vec![1]]);

        let recovered = SerialBackend.compute_densities(&neighs, 0.1, &mut particles);
        assert_eq!(recovered, 2);
        assert_eq!(particles.density, vec![1000., 1000.]);
    }
}
