pub use self::{
    polyhedron::{ConvexPolyhedron, MassProperties},
    seeding::{filter_coincident_seeds, impact_anchor, random_unit_vector, scatter_seeds},
    voronoi::{voronoi_cell, voronoi_cells},
};

mod polyhedron;
mod seeding;
mod voronoi;

use std::sync::Arc;

use log::{debug, info};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{floating_type_mod::FT, simulation_parameters::SimulationParams, SimulationError, V3};

pub type BodyId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub u64);

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cells smaller than this fraction of the body volume are discarded.
const MIN_CELL_VOLUME_RATIO: FT = 1e-9;

/// Destructible solid. Static until it is fractured.
#[derive(Debug, Clone)]
pub struct SolidBody {
    pub id: BodyId,
    pub shape: Arc<ConvexPolyhedron>,
    pub material_strength: FT,
    pub density: FT,
    pub velocity: V3,
    mass_properties: MassProperties,
}

impl SolidBody {
    pub fn new(
        id: BodyId,
        shape: ConvexPolyhedron,
        material_strength: FT,
        density: FT,
    ) -> Result<SolidBody, SimulationError> {
        if !(material_strength.is_finite() && material_strength >= 0.) {
            return Err(SimulationError::configuration("material_strength", "finite and >= 0", material_strength));
        }
        if !(density.is_finite() && density > 0.) {
            return Err(SimulationError::configuration("density", "finite and > 0", density));
        }
        let mass_properties = shape.mass_properties();
        if mass_properties.volume <= 0. {
            return Err(SimulationError::DegenerateGeometry(format!("solid body {} has no volume", id)));
        }
        Ok(SolidBody {
            id,
            shape: Arc::new(shape),
            material_strength,
            density,
            velocity: V3::zeros(),
            mass_properties,
        })
    }

    pub fn mass_properties(&self) -> &MassProperties {
        &self.mass_properties
    }

    pub fn volume(&self) -> FT {
        self.mass_properties.volume
    }

    pub fn mass(&self) -> FT {
        self.mass_properties.mass(self.density)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnchangedReason {
    BelowStrength,
    BelowMinimumVolume,
    // fewer than two usable seeds or cells
    TooFewSeeds,
}

/// Answer to a fracture request. New fragment ids appear in the next snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FractureOutcome {
    Unchanged(UnchangedReason),
    Fractured(Vec<FragmentId>),
}

/// A Voronoi cell of a fractured body with its initial rigid state (world frame).
#[derive(Debug, Clone)]
pub struct FragmentSpawn {
    pub shape: ConvexPolyhedron,
    pub mass_properties: MassProperties,
    pub density: FT,
    pub velocity: V3,
    pub angular_velocity: V3,
}

#[derive(Debug, Clone)]
pub struct FractureResult {
    pub fragments: Vec<FragmentSpawn>,
    pub degenerate_cells_discarded: usize,
}

#[derive(Debug, Clone)]
pub enum FractureEvaluation {
    Unchanged(UnchangedReason),
    Fractured(FractureResult),
}

/**
 * Splits `body` into Voronoi fragments if `impulse` reaches its material
 * strength.
 *
 * Each fragment receives the body velocity plus an outward kick
 * `fracture_velocity_scale * impulse / M / (1 + (dist / L)^2)` directed from the
 * impact point through its centroid (jittered by `fracture_jitter`), with
 * M the body mass, dist the centroid distance to the impact and L half the
 * body diameter. The angular velocity is the response to this kick applied at
 * the impact point.
 */
pub fn evaluate_fracture(
    body: &SolidBody,
    impact_point: V3,
    impulse: FT,
    params: &SimulationParams,
    rng: &mut StdRng,
) -> Result<FractureEvaluation, SimulationError> {
    if !impact_point.iter().all(|x| x.is_finite()) {
        return Err(SimulationError::InvalidImpact(format!(
            "impact point {:?} on body {} is not finite",
            impact_point, body.id
        )));
    }

    // also rejects NaN impulses
    if !(impulse >= body.material_strength) {
        debug!(
            "impulse {} on body {} is below material strength {}",
            impulse, body.id, body.material_strength
        );
        return Ok(FractureEvaluation::Unchanged(UnchangedReason::BelowStrength));
    }
    if body.volume() < params.min_fracture_volume {
        return Ok(FractureEvaluation::Unchanged(UnchangedReason::BelowMinimumVolume));
    }

    let shape = &*body.shape;
    let body_props = body.mass_properties();
    let diameter = shape.diameter();

    let anchor = impact_anchor(shape, body_props.centroid, impact_point);
    let seeds = scatter_seeds(shape, anchor, params.fracture_seed_count, params.impact_bias, rng);
    let seeds = filter_coincident_seeds(&seeds, params.min_seed_separation * diameter);
    if seeds.len() < 2 {
        return Ok(FractureEvaluation::Unchanged(UnchangedReason::TooFewSeeds));
    }

    let (cells, degenerate_cells_discarded) =
        non_degenerate_cells(shape, &seeds, MIN_CELL_VOLUME_RATIO * body.volume());
    if cells.len() < 2 {
        return Ok(FractureEvaluation::Unchanged(UnchangedReason::TooFewSeeds));
    }

    let base_speed = params.fracture_velocity_scale * impulse / body.mass();
    let falloff_length = 0.5 * diameter;

    let fragments = cells
        .into_iter()
        .map(|(shape, props)| {
            let offset = props.centroid - anchor;
            let dist = offset.norm();
            let outward = if dist > 1e-6 * diameter {
                offset / dist
            } else {
                random_unit_vector(rng)
            };
            let dir = (outward + params.fracture_jitter * random_unit_vector(rng))
                .try_normalize(1e-6)
                .unwrap_or(outward);

            let falloff = 1. / (1. + (dist / falloff_length).powi(2));
            let kick = dir * base_speed * falloff;

            let mass = props.mass(body.density);
            let angular_impulse = (anchor - props.centroid).cross(&(mass * kick));
            let angular_velocity = props
                .inertia(body.density)
                .try_inverse()
                .map(|inv| inv * angular_impulse)
                .unwrap_or_else(V3::zeros);

            FragmentSpawn {
                shape,
                mass_properties: props,
                density: body.density,
                velocity: body.velocity + kick,
                angular_velocity,
            }
        })
        .collect::<Vec<_>>();

    info!(
        "body {} fractured by impulse {} at {:?}: {} fragments, {} degenerate cells discarded",
        body.id,
        impulse,
        impact_point,
        fragments.len(),
        degenerate_cells_discarded
    );

    Ok(FractureEvaluation::Fractured(FractureResult {
        fragments,
        degenerate_cells_discarded,
    }))
}

/// Voronoi cells with more than `min_cell_volume`, and how many cells were dropped.
fn non_degenerate_cells(
    shape: &ConvexPolyhedron,
    seeds: &[V3],
    min_cell_volume: FT,
) -> (Vec<(ConvexPolyhedron, MassProperties)>, usize) {
    let mut discarded = 0;
    let mut cells = Vec::with_capacity(seeds.len());
    for cell in voronoi_cells(shape, seeds) {
        match cell {
            Some(cell) => {
                let props = cell.mass_properties();
                if props.volume > min_cell_volume {
                    cells.push((cell, props));
                } else {
                    discarded += 1;
                }
            }
            None => discarded += 1,
        }
    }
    if discarded > 0 {
        debug!("discarded {} degenerate cells of {} seeds", discarded, seeds.len());
    }
    (cells, discarded)
}
