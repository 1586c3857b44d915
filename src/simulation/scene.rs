use std::path::Path;

use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    floating_type_mod::FT,
    fracture::{BodyId, ConvexPolyhedron, SolidBody},
    sdf::{Sdf, SdfConvex, SdfPlane},
    simulation_parameters::SimulationParams,
    sph_kernels::rest_lattice_mass,
    vec3f, SimulationError, V3,
};

fn zero_vector() -> V3 {
    V3::zeros()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FluidEmitter {
    /// Cubic lattice filling the box, first particle half a spacing away from `min`.
    Block {
        min: V3,
        max: V3,
        spacing: FT,
        #[serde(default = "zero_vector")]
        velocity: V3,
    },
    /// Uniformly distributed particles, seeded from the run seed.
    Random {
        min: V3,
        max: V3,
        count: usize,
        #[serde(default = "zero_vector")]
        velocity: V3,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SolidBodyConfig {
    Cuboid {
        center: V3,
        half_extents: V3,
        #[serde(default)]
        material_strength: Option<FT>,
        #[serde(default)]
        density: Option<FT>,
        #[serde(default = "zero_vector")]
        velocity: V3,
    },
    /// Closed convex mesh, faces given counter-clockwise seen from outside.
    Mesh {
        vertices: Vec<V3>,
        faces: Vec<Vec<usize>>,
        #[serde(default)]
        material_strength: Option<FT>,
        #[serde(default)]
        density: Option<FT>,
        #[serde(default = "zero_vector")]
        velocity: V3,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneConfig {
    pub normal: V3,
    pub offset: FT,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BoundaryConfig {
    /// Free space is `normal·x > offset`.
    Plane { normal: V3, offset: FT },
    /// Solid obstacle `normal·x <= offset` for every plane.
    ConvexHull { planes: Vec<PlaneConfig> },
    /// Solid axis-aligned box obstacle.
    Box { min: V3, max: V3 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub fluid: Vec<FluidEmitter>,
    pub bodies: Vec<SolidBodyConfig>,
    pub boundary: Vec<BoundaryConfig>,
}

/// Initial particle state produced by the emitters.
#[derive(Debug, Clone, Default)]
pub struct FluidInit {
    pub positions: Vec<V3>,
    pub velocities: Vec<V3>,
    pub masses: Vec<FT>,
}

fn check_region(min: V3, max: V3) -> Result<(), SimulationError> {
    if (0..3).all(|d| min[d].is_finite() && max[d].is_finite() && min[d] < max[d]) {
        Ok(())
    } else {
        Err(SimulationError::configuration(
            "emitter min/max",
            "finite with min < max on every axis",
            (min, max),
        ))
    }
}

impl SceneConfig {
    /// 2000 random particles in [-1, 1]^3 below a destructible unit cube at (0, 2, 0), resting on the world floor.
    pub fn demo() -> SceneConfig {
        SceneConfig {
            fluid: vec![FluidEmitter::Random {
                min: vec3f(-1., -1., -1.),
                max: vec3f(1., 1., 1.),
                count: 2000,
                velocity: V3::zeros(),
            }],
            bodies: vec![SolidBodyConfig::Cuboid {
                center: vec3f(0., 2., 0.),
                half_extents: vec3f(0.5, 0.5, 0.5),
                material_strength: None,
                density: None,
                velocity: V3::zeros(),
            }],
            boundary: vec![BoundaryConfig::Plane {
                normal: V3::y(),
                offset: -1.,
            }],
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<SceneConfig, SimulationError> {
        let yaml = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }

    pub fn build_fluid(&self, params: &SimulationParams) -> Result<FluidInit, SimulationError> {
        let h = params.support_radius;
        let mut fluid = FluidInit::default();

        for (emitter_index, emitter) in self.fluid.iter().enumerate() {
            let start = fluid.positions.len();
            match *emitter {
                FluidEmitter::Block {
                    min,
                    max,
                    spacing,
                    velocity,
                } => {
                    check_region(min, max)?;
                    if !(spacing.is_finite() && spacing > 0.) {
                        return Err(SimulationError::configuration("block spacing", "finite and > 0", spacing));
                    }
                    // tolerate extents that are a multiple of the spacing up to rounding
                    let counts = (max - min).map(|len| (len / spacing + 1e-4).floor() as usize);
                    let mass = rest_lattice_mass(spacing, h, params.rest_density);
                    for x in 0..counts.x {
                        for y in 0..counts.y {
                            for z in 0..counts.z {
                                let lattice = vec3f(x as FT + 0.5, y as FT + 0.5, z as FT + 0.5);
                                fluid.positions.push(min + lattice * spacing);
                                fluid.velocities.push(velocity);
                                fluid.masses.push(mass);
                            }
                        }
                    }
                }
                FluidEmitter::Random {
                    min,
                    max,
                    count,
                    velocity,
                } => {
                    check_region(min, max)?;
                    if count == 0 {
                        continue;
                    }
                    let extent = max - min;
                    let spacing = (extent.x * extent.y * extent.z / count as FT).cbrt();
                    let mass = rest_lattice_mass(spacing, h, params.rest_density);
                    let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(emitter_index as u64));
                    for _ in 0..count {
                        let u = vec3f(rng.gen(), rng.gen(), rng.gen());
                        fluid.positions.push(min + extent.component_mul(&u));
                        fluid.velocities.push(velocity);
                        fluid.masses.push(mass);
                    }
                }
            }
            info!("emitter {} created {} particles", emitter_index, fluid.positions.len() - start);
        }

        Ok(fluid)
    }

    /// Bodies get their index in `bodies` as id.
    pub fn build_bodies(&self, params: &SimulationParams) -> Result<Vec<SolidBody>, SimulationError> {
        self.bodies
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let (shape, material_strength, density, velocity) = match config {
                    SolidBodyConfig::Cuboid {
                        center,
                        half_extents,
                        material_strength,
                        density,
                        velocity,
                    } => (
                        ConvexPolyhedron::cuboid(*center, *half_extents)?,
                        *material_strength,
                        *density,
                        *velocity,
                    ),
                    SolidBodyConfig::Mesh {
                        vertices,
                        faces,
                        material_strength,
                        density,
                        velocity,
                    } => (
                        ConvexPolyhedron::from_mesh(vertices, faces)?,
                        *material_strength,
                        *density,
                        *velocity,
                    ),
                };
                let mut body = SolidBody::new(
                    i as BodyId,
                    shape,
                    material_strength.unwrap_or(params.material_strength),
                    density.unwrap_or(params.material_density),
                )?;
                body.velocity = velocity;
                Ok(body)
            })
            .collect()
    }

    pub fn build_boundary(&self) -> Result<Vec<Sdf>, SimulationError> {
        self.boundary
            .iter()
            .map(|config| -> Result<Sdf, SimulationError> {
                Ok(match config {
                    BoundaryConfig::Plane { normal, offset } => {
                        let len = normal.norm();
                        if !(len.is_finite() && len > 0. && offset.is_finite()) {
                            return Err(SimulationError::DegenerateGeometry(format!(
                                "boundary plane with normal {:?} and offset {}",
                                normal, offset
                            )));
                        }
                        SdfPlane::new(*normal, -offset / len).into()
                    }
                    BoundaryConfig::ConvexHull { planes } => {
                        SdfConvex::from_planes(planes.iter().map(|p| (p.normal, p.offset)))?.into()
                    }
                    BoundaryConfig::Box { min, max } => SdfConvex::new_box(*min, *max)?.into(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_scene_builds() {
        let params = SimulationParams::default();
        let scene = SceneConfig::demo();

        let fluid = scene.build_fluid(&params).unwrap();
        assert_eq!(fluid.positions.len(), 2000);
        assert!(fluid
            .positions
            .iter()
            .all(|x| x.iter().all(|c| (-1. ..=1.).contains(c))));

        let bodies = scene.build_bodies(&params).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].material_strength, params.material_strength);
        crate::assert_ft_approx_eq(bodies[0].mass(), 1000., 1e-2, || "unit cube mass".to_string());

        let boundary = scene.build_boundary().unwrap();
        assert_eq!(boundary.len(), 1);
        assert!(boundary[0].probe(vec3f(0., -0.5, 0.)) > 0.);
        assert!(boundary[0].probe(vec3f(0., -1.5, 0.)) < 0.);
    }

    #[test]
    fn random_emitter_is_seeded() {
        let mut params = SimulationParams::default();
        let scene = SceneConfig::demo();
        let a = scene.build_fluid(&params).unwrap();
        let b = scene.build_fluid(&params).unwrap();
        assert_eq!(a.positions, b.positions);

        params.seed = 7;
        let c = scene.build_fluid(&params).unwrap();
        assert_ne!(a.positions, c.positions);
    }

    #[test]
    fn block_emitter_fills_lattice() {
        let params = SimulationParams::default();
        let scene = SceneConfig {
            fluid: vec![FluidEmitter::Block {
                min: vec3f(0., 0., 0.),
                max: vec3f(0.5, 0.25, 0.25),
                spacing: 0.05,
                velocity: vec3f(1., 0., 0.),
            }],
            ..SceneConfig::default()
        };
        let fluid = scene.build_fluid(&params).unwrap();
        assert_eq!(fluid.positions.len(), 10 * 5 * 5);
        assert!(fluid.velocities.iter().all(|v| *v == vec3f(1., 0., 0.)));
        crate::assert_ft_approx_eq(fluid.positions[0].x, 0.025, 1e-6, || "first lattice point".to_string());
    }

    #[test]
    fn scene_from_yaml() {
        let yaml = r#"
fluid:
  - type: Block
    min: [0.0, 0.0, 0.0]
    max: [0.2, 0.2, 0.2]
    spacing: 0.05
bodies:
  - type: Cuboid
    center: [0.0, 2.0, 0.0]
    half_extents: [0.5, 0.25, 0.5]
    material_strength: 40.0
boundary:
  - type: Plane
    normal: [0.0, 2.0, 0.0]
    offset: -1.0
  - type: Box
    min: [1.0, -1.0, 1.0]
    max: [2.0, 0.0, 2.0]
"#;
        let scene: SceneConfig = serde_yaml::from_str(yaml).unwrap();
        let params = SimulationParams::default();
        assert_eq!(scene.build_fluid(&params).unwrap().positions.len(), 64);

        let bodies = scene.build_bodies(&params).unwrap();
        assert_eq!(bodies[0].material_strength, 40.);
        assert_eq!(bodies[0].density, params.material_density);

        let boundary = scene.build_boundary().unwrap();
        // 2y > -1
        crate::assert_ft_approx_eq(boundary[0].probe(vec3f(0., 0., 0.)), 0.5, 1e-6, || "plane".to_string());
        assert!(boundary[1].probe(vec3f(1.5, -0.5, 1.5)) < 0.);
    }

    #[test]
    fn invalid_scenes_are_rejected() {
        let params = SimulationParams::default();

        let scene = SceneConfig {
            fluid: vec![FluidEmitter::Block {
                min: vec3f(0., 0., 0.),
                max: vec3f(1., 1., 1.),
                spacing: 0.,
                velocity: V3::zeros(),
            }],
            ..SceneConfig::default()
        };
        assert!(matches!(scene.build_fluid(&params), Err(SimulationError::Configuration(_))));

        let scene = SceneConfig {
            bodies: vec![SolidBodyConfig::Mesh {
                vertices: vec![V3::zeros(), V3::x(), V3::y()],
                faces: vec![vec![0, 1, 2]],
                material_strength: None,
                density: None,
                velocity: V3::zeros(),
            }],
            ..SceneConfig::default()
        };
        assert!(matches!(
            scene.build_bodies(&params),
            Err(SimulationError::DegenerateGeometry(_))
        ));

        let scene = SceneConfig {
            boundary: vec![BoundaryConfig::Plane {
                normal: V3::zeros(),
                offset: 0.,
            }],
            ..SceneConfig::default()
        };
        assert!(matches!(
            scene.build_boundary(),
            Err(SimulationError::DegenerateGeometry(_))
        ));
    }
}
