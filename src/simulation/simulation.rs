use std::fmt::Display;

use log::{debug, warn};
use num_traits::Float;

use crate::{
    counters::{PerformanceCounters, ValueCounters},
    floating_type_mod::FT,
    neighborhood_search::{NeighborhoodCache, NeighborhoodIndex},
    sdf::Sdf,
    simulation_parameters::SimulationParams,
    solver_backend::{SolverBackend, SolverBackendTrait},
    SimulationError, V3,
};

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn extend(&mut self, num_elements: usize) {
                $(
                    self.$field_name.extend((0..num_elements).map::<$field_type, _>(|_| $default_value));
                )*
            }

            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }

            pub fn len(&self) -> usize {
                self.position.len()
            }

            pub fn is_empty(&self) -> bool {
                self.position.is_empty()
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec {
        // never changes after creation
        pub mass: Vec<FT> | 0.,

        // committed state of the last substep
        pub position: Vec<V3> | V3::zeros(),
        pub velocity: Vec<V3> | V3::zeros(),

        // outputs of the density, pressure and force passes
        pub density: Vec<FT> | 0.,
        pub pressure: Vec<FT> | 0.,
        pub force: Vec<V3> | V3::zeros(),

        // integration output, swapped with position/velocity afterwards
        pub position_next: Vec<V3> | V3::zeros(),
        pub velocity_next: Vec<V3> | V3::zeros(),
    }
}

/// Recovered conditions of one clock tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepDiagnostics {
    // number of substeps the tick was split into
    pub courant_substeps: usize,
    // the tick needed more than `max_substeps` and ran with larger substeps than stable
    pub courant_limited: bool,
    pub instability_recoveries: usize,
    pub degenerate_cells_discarded: usize,
    pub fragments_culled: usize,
}

impl StepDiagnostics {
    pub fn combine(self, other: StepDiagnostics) -> StepDiagnostics {
        StepDiagnostics {
            courant_substeps: self.courant_substeps + other.courant_substeps,
            courant_limited: self.courant_limited || other.courant_limited,
            instability_recoveries: self.instability_recoveries + other.instability_recoveries,
            degenerate_cells_discarded: self.degenerate_cells_discarded + other.degenerate_cells_discarded,
            fragments_culled: self.fragments_culled + other.fragments_culled,
        }
    }
}

pub struct FluidSimulation {
    params: SimulationParams,
    particles: ParticleVec,
    neighs: NeighborhoodCache,
    index: NeighborhoodIndex,
    boundary: Vec<Sdf>,
    backend: SolverBackend,

    pub pcounters: PerformanceCounters,
    pub vcounters: ValueCounters,

    step_number: usize,
}

impl FluidSimulation {
    pub fn new(
        params: SimulationParams,
        boundary: Vec<Sdf>,
        fluid_particle_positions: &[V3],
        fluid_particle_velocities: &[V3],
        fluid_particle_masses: &[FT],
    ) -> Result<Self, SimulationError> {
        params.validate()?;

        let num_fluid_particles = fluid_particle_positions.len();
        if fluid_particle_velocities.len() != num_fluid_particles || fluid_particle_masses.len() != num_fluid_particles
        {
            return Err(SimulationError::Configuration(format!(
                "particle attribute lengths differ: {} positions, {} velocities, {} masses",
                num_fluid_particles,
                fluid_particle_velocities.len(),
                fluid_particle_masses.len()
            )));
        }
        if let Some(m) = fluid_particle_masses.iter().find(|m| !(m.is_finite() && **m > 0.)) {
            return Err(SimulationError::configuration("particle mass", "finite and > 0", m));
        }
        let all_finite = fluid_particle_positions
            .iter()
            .chain(fluid_particle_velocities.iter())
            .all(|x| x.iter().all(|c| c.is_finite()));
        if !all_finite {
            return Err(SimulationError::Configuration(
                "particle positions and velocities must be finite".to_string(),
            ));
        }

        let mut particles = ParticleVec::default(num_fluid_particles);
        particles.mass.copy_from_slice(fluid_particle_masses);
        particles.position.copy_from_slice(fluid_particle_positions);
        particles.velocity.copy_from_slice(fluid_particle_velocities);
        particles.density.iter_mut().for_each(|rho| *rho = params.rest_density);

        let backend = SolverBackend::new(&params)?;
        let index = NeighborhoodIndex::new(
            params.neighborhood_search_algorithm,
            params.support_radius,
            params.world_min,
            params.world_max,
        );

        debug!(
            "fluid simulation with {} particles, {} boundary primitives, {} worker threads",
            num_fluid_particles,
            boundary.len(),
            backend.num_threads()
        );

        Ok(FluidSimulation {
            params,
            particles,
            neighs: NeighborhoodCache::new(num_fluid_particles),
            index,
            boundary,
            backend,
            pcounters: PerformanceCounters::new(false),
            vcounters: ValueCounters::new(false),
            step_number: 0,
        })
    }

    pub fn set_statistics_enabled(&mut self, enabled: bool) {
        self.pcounters = PerformanceCounters::new(enabled);
        self.vcounters = ValueCounters::new(enabled);
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn boundary(&self) -> &[Sdf] {
        &self.boundary
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn positions(&self) -> &[V3] {
        &self.particles.position
    }

    pub fn velocities(&self) -> &[V3] {
        &self.particles.velocity
    }

    pub fn densities(&self) -> &[FT] {
        &self.particles.density
    }

    pub fn pressures(&self) -> &[FT] {
        &self.particles.pressure
    }

    pub fn masses(&self) -> &[FT] {
        &self.particles.mass
    }

    pub fn neighborhood(&self) -> &NeighborhoodCache {
        &self.neighs
    }

    pub fn total_mass(&self) -> FT {
        self.particles.mass.iter().sum()
    }

    /// Overwrites one particle's velocity, for scripted impulses.
    pub fn set_velocity(&mut self, i: usize, v: V3) {
        self.particles.velocity[i] = v;
    }

    /**
     * Largest substep for which the fastest particle moves less than
     * `cfl_factor` support radii. The speed of sound sqrt(k) of the state
     * equation is added so that a fluid at rest is also bounded, and an explicit
     * viscosity bound applies when viscosity is set.
     */
    pub fn stable_time_step(&self, max_speed: FT) -> FT {
        let h = self.params.support_radius;
        let signal_speed = max_speed + self.params.stiffness.sqrt();
        let mut dt = if signal_speed > 0. {
            self.params.cfl_factor * h / signal_speed
        } else {
            FT::INFINITY
        };
        if self.params.viscosity > 0. {
            dt = dt.min(0.125 * h * h / self.params.viscosity);
        }
        dt
    }

    /// Rebuilds the neighborhood and recomputes densities and pressures without moving particles.
    pub fn update_densities(&mut self) -> usize {
        let h = self.params.support_radius;
        self.neighs = self
            .backend
            .build_neighborhood(&mut self.index, &self.particles.position, h);
        let mut recovered = self.backend.compute_densities(&self.neighs, h, &mut self.particles);
        recovered += self.backend.compute_pressures(&self.params, &mut self.particles);
        recovered
    }

    /**
     * Advances the fluid by `dt`, split into as many substeps as the Courant
     * bound requires (at most `max_substeps`).
     */
    pub fn step(&mut self, dt: FT) -> StepDiagnostics {
        let mut diagnostics = StepDiagnostics::default();

        self.vcounters.add_value("particle-count", self.particles.len() as FT);
        self.pcounters.begin("fluid-step");

        let mut remaining = dt;
        while remaining > 0. {
            let max_speed = self.backend.max_speed(&self.particles.velocity);
            let dt_stable = self.stable_time_step(max_speed);

            let budget = self.params.max_substeps - diagnostics.courant_substeps;
            let mut num_substeps = ((remaining / dt_stable).ceil() as usize).max(1);
            if num_substeps > budget {
                if !diagnostics.courant_limited {
                    warn!(
                        "step {}: max speed {} needs {} substeps, limited to {}",
                        self.step_number,
                        max_speed,
                        diagnostics.courant_substeps + num_substeps,
                        self.params.max_substeps
                    );
                }
                diagnostics.courant_limited = true;
                num_substeps = budget;
            }

            let substep_dt = remaining / num_substeps as FT;
            debug!(
                "step {}: substep {} dt={} (max speed {})",
                self.step_number, diagnostics.courant_substeps, substep_dt, max_speed
            );

            let first_substep = diagnostics.courant_substeps == 0;
            diagnostics.instability_recoveries += self.substep(substep_dt, first_substep);
            diagnostics.courant_substeps += 1;

            remaining = if num_substeps == 1 { 0. } else { remaining - substep_dt };
        }

        self.pcounters.end("fluid-step");
        self.vcounters
            .add_value("substeps", diagnostics.courant_substeps as FT);

        if diagnostics.instability_recoveries > 0 {
            warn!(
                "step {}: recovered {} non-finite particle values",
                self.step_number, diagnostics.instability_recoveries
            );
        }

        self.step_number += 1;
        diagnostics
    }

    /// Pass timings of all substeps of one fluid step are summed into one counter value.
    fn substep(&mut self, dt: FT, first_substep: bool) -> usize {
        let h = self.params.support_radius;
        let particles = &mut self.particles;
        let end_pass: fn(&mut PerformanceCounters, &str) = if first_substep {
            PerformanceCounters::end
        } else {
            PerformanceCounters::end_add_to_last
        };

        self.pcounters.begin("neighborhood");
        self.neighs = self.backend.build_neighborhood(&mut self.index, &particles.position, h);
        end_pass(&mut self.pcounters, "neighborhood");

        self.pcounters.begin("density");
        let mut recovered = self.backend.compute_densities(&self.neighs, h, particles);
        recovered += self.backend.compute_pressures(&self.params, particles);
        end_pass(&mut self.pcounters, "density");

        self.pcounters.begin("forces");
        recovered += self
            .backend
            .compute_forces(&self.params, &self.boundary, &self.neighs, particles);
        end_pass(&mut self.pcounters, "forces");

        self.pcounters.begin("integrate");
        recovered += self.backend.integrate(&self.params, dt, particles);
        std::mem::swap(&mut particles.position, &mut particles.position_next);
        std::mem::swap(&mut particles.velocity, &mut particles.velocity_next);
        end_pass(&mut self.pcounters, "integrate");

        recovered
    }
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}
