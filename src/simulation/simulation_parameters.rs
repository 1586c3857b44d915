use crate::{error::SimulationError, floating_type_mod::FT, vec3f, V3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborhoodSearchAlgorithm {
    // hash-bucketed uniform grid with cell size = support radius
    Grid,
    RStar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    Parallel,
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    // -------------------
    // FLUID
    pub rest_density: FT,
    pub stiffness: FT,
    pub viscosity: FT,
    pub support_radius: FT,
    pub gravity: V3,

    // keep negative pressures (tensile variant)
    pub tensile_pressure: bool,

    // fixed tick of the simulation clock
    pub time_step: FT,
    pub cfl_factor: FT,
    pub max_substeps: usize,

    // penalty force of boundary primitives acting on fluid particles
    pub boundary_stiffness: FT,
    pub boundary_damping: FT,
    // given in "number of support radiuses"
    pub boundary_thickness: FT,

    // particles tunneling out of the world box get their velocity multiplied by -wall_restitution
    pub wall_restitution: FT,
    pub world_min: V3,
    pub world_max: V3,

    // 0 means "let rayon decide"
    pub num_threads: usize,
    pub backend: BackendType,
    pub neighborhood_search_algorithm: NeighborhoodSearchAlgorithm,

    // -------------------
    // FRACTURE
    pub material_strength: FT,
    pub material_density: FT,
    pub fracture_seed_count: usize,
    // exponent of the radial seed distribution around the impact point (1 = uniform radius)
    pub impact_bias: FT,
    // given as fraction of the body diameter
    pub min_seed_separation: FT,
    pub min_fracture_volume: FT,
    pub fracture_velocity_scale: FT,
    pub fracture_jitter: FT,
    pub seed: u64,

    // -------------------
    // RIGID FRAGMENTS
    pub contact_stiffness: FT,
    pub contact_damping: FT,
    pub contact_friction: FT,
    pub rigid_substeps: usize,
    pub min_fragment_mass: FT,
    pub angular_damping: FT,

    // cumulative number of recovered NaN/Inf events before the run is stopped
    pub max_instability_events: usize,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            rest_density: 1000.,
            stiffness: 20.,
            viscosity: 0.1,
            support_radius: 0.1,
            gravity: vec3f(0., -9.81, 0.),
            tensile_pressure: false,
            time_step: 1. / 60.,
            cfl_factor: 0.4,
            max_substeps: 64,
            boundary_stiffness: 5000.,
            boundary_damping: 20.,
            boundary_thickness: 0.5,
            wall_restitution: 0.5,
            world_min: vec3f(-3., -1., -3.),
            world_max: vec3f(3., 5., 3.),
            num_threads: 0,
            backend: BackendType::Parallel,
            neighborhood_search_algorithm: NeighborhoodSearchAlgorithm::Grid,
            material_strength: 100.,
            material_density: 1000.,
            fracture_seed_count: 12,
            impact_bias: 2.,
            min_seed_separation: 0.02,
            min_fracture_volume: 1e-4,
            fracture_velocity_scale: 1.,
            fracture_jitter: 0.25,
            seed: 0,
            contact_stiffness: 3000.,
            contact_damping: 30.,
            contact_friction: 0.5,
            rigid_substeps: 4,
            min_fragment_mass: 1e-3,
            angular_damping: 0.05,
            max_instability_events: 10000,
        }
    }
}

fn check(ok: bool, field: &str, requirement: &str, value: impl std::fmt::Debug) -> Result<(), SimulationError> {
    if ok {
        Ok(())
    } else {
        Err(SimulationError::configuration(field, requirement, value))
    }
}

fn positive(field: &str, value: FT) -> Result<(), SimulationError> {
    check(value.is_finite() && value > 0., field, "finite and > 0", value)
}

fn non_negative(field: &str, value: FT) -> Result<(), SimulationError> {
    check(value.is_finite() && value >= 0., field, "finite and >= 0", value)
}

impl SimulationParams {
    /// Rejects every constant outside its documented range. Called before a run starts.
    pub fn validate(&self) -> Result<(), SimulationError> {
        positive("rest_density", self.rest_density)?;
        non_negative("stiffness", self.stiffness)?;
        non_negative("viscosity", self.viscosity)?;
        positive("support_radius", self.support_radius)?;
        check(
            self.gravity.iter().all(|x| x.is_finite()),
            "gravity",
            "finite",
            self.gravity,
        )?;

        positive("time_step", self.time_step)?;
        check(
            self.cfl_factor > 0. && self.cfl_factor <= 1.,
            "cfl_factor",
            "in (0, 1]",
            self.cfl_factor,
        )?;
        check(self.max_substeps >= 1, "max_substeps", ">= 1", self.max_substeps)?;

        non_negative("boundary_stiffness", self.boundary_stiffness)?;
        non_negative("boundary_damping", self.boundary_damping)?;
        non_negative("boundary_thickness", self.boundary_thickness)?;
        check(
            (0. ..=1.).contains(&self.wall_restitution),
            "wall_restitution",
            "in [0, 1]",
            self.wall_restitution,
        )?;
        for d in 0..3 {
            check(
                self.world_min[d].is_finite() && self.world_max[d].is_finite() && self.world_min[d] < self.world_max[d],
                "world_min/world_max",
                "finite with world_min < world_max on every axis",
                (self.world_min, self.world_max),
            )?;
        }

        non_negative("material_strength", self.material_strength)?;
        positive("material_density", self.material_density)?;
        check(
            self.fracture_seed_count >= 2,
            "fracture_seed_count",
            ">= 2",
            self.fracture_seed_count,
        )?;
        check(
            self.impact_bias.is_finite() && self.impact_bias >= 1.,
            "impact_bias",
            ">= 1",
            self.impact_bias,
        )?;
        check(
            self.min_seed_separation.is_finite() && self.min_seed_separation >= 0. && self.min_seed_separation < 1.,
            "min_seed_separation",
            "in [0, 1)",
            self.min_seed_separation,
        )?;
        non_negative("min_fracture_volume", self.min_fracture_volume)?;
        non_negative("fracture_velocity_scale", self.fracture_velocity_scale)?;
        non_negative("fracture_jitter", self.fracture_jitter)?;

        non_negative("contact_stiffness", self.contact_stiffness)?;
        non_negative("contact_damping", self.contact_damping)?;
        non_negative("contact_friction", self.contact_friction)?;
        check(self.rigid_substeps >= 1, "rigid_substeps", ">= 1", self.rigid_substeps)?;
        non_negative("min_fragment_mass", self.min_fragment_mass)?;
        non_negative("angular_damping", self.angular_damping)?;

        Ok(())
    }

    pub fn is_inside_world(&self, x: V3) -> bool {
        (0..3).all(|d| x[d] >= self.world_min[d] && x[d] <= self.world_max[d])
    }
}

#[test]
fn default_params_are_valid() {
    SimulationParams::default().validate().unwrap();
}

#[test]
fn invalid_params_are_rejected() {
    let mut params = SimulationParams::default();
    params.support_radius = 0.;
    assert!(matches!(params.validate(), Err(SimulationError::Configuration(_))));

    let mut params = SimulationParams::default();
    params.rest_density = -1.;
    assert!(matches!(params.validate(), Err(SimulationError::Configuration(_))));

    let mut params = SimulationParams::default();
    params.world_min = params.world_max;
    assert!(matches!(params.validate(), Err(SimulationError::Configuration(_))));

    let mut params = SimulationParams::default();
    params.fracture_seed_count = 1;
    assert!(matches!(params.validate(), Err(SimulationError::Configuration(_))));
}

#[test]
fn params_from_partial_yaml() {
    let params: SimulationParams = serde_yaml::from_str("stiffness: 50.0\nbackend: Serial\n").unwrap();
    assert_eq!(params.stiffness, 50.);
    assert_eq!(params.backend, BackendType::Serial);
    assert_eq!(params.rest_density, 1000.);
}
