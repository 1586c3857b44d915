use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    floating_type_mod::FT,
    fracture::{BodyId, ConvexPolyhedron, FragmentId, FragmentSpawn},
    sdf::{Sdf, SdfPlane},
    simulation_parameters::SimulationParams,
    M3, Q, V3,
};

/// Rigid piece of a fractured body. The mesh is given in body coordinates with the centroid at the origin.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub source_body: BodyId,
    pub mesh: Arc<ConvexPolyhedron>,
    local_vertices: Vec<V3>,

    pub mass: FT,
    inertia_body: M3,
    inv_inertia_body: M3,

    pub position: V3,
    pub orientation: Q,
    pub velocity: V3,
    pub angular_velocity: V3,
}

impl Fragment {
    pub fn from_spawn(id: FragmentId, source_body: BodyId, spawn: FragmentSpawn) -> Fragment {
        let props = spawn.mass_properties;
        let mesh = spawn.shape.translated(-props.centroid);
        let inertia_body = props.inertia(spawn.density);
        Fragment {
            id,
            source_body,
            local_vertices: mesh.vertices(),
            mesh: Arc::new(mesh),
            mass: props.mass(spawn.density),
            inertia_body,
            inv_inertia_body: inertia_body.try_inverse().unwrap_or_else(M3::zeros),
            position: props.centroid,
            orientation: Q::identity(),
            velocity: spawn.velocity,
            angular_velocity: spawn.angular_velocity,
        }
    }

    pub fn local_vertices(&self) -> &[V3] {
        &self.local_vertices
    }

    pub fn world_vertices(&self) -> impl Iterator<Item = V3> + '_ {
        self.local_vertices
            .iter()
            .map(move |v| self.position + self.orientation * *v)
    }

    pub fn world_inertia(&self) -> M3 {
        let r = self.orientation.to_rotation_matrix();
        r.matrix() * self.inertia_body * r.matrix().transpose()
    }

    pub fn world_inv_inertia(&self) -> M3 {
        let r = self.orientation.to_rotation_matrix();
        r.matrix() * self.inv_inertia_body * r.matrix().transpose()
    }

    /// Velocity of the material point at world offset `r` from the centroid.
    pub fn velocity_at(&self, r: V3) -> V3 {
        self.velocity + self.angular_velocity.cross(&r)
    }

    fn is_finite(&self) -> bool {
        self.position.iter().all(|x| x.is_finite())
            && self.velocity.iter().all(|x| x.is_finite())
            && self.angular_velocity.iter().all(|x| x.is_finite())
            && self.orientation.coords.iter().all(|x| x.is_finite())
    }

    /**
     * Sums gravity and penalty contact forces of all vertices below a boundary
     * and returns (force, torque about the centroid).
     */
    fn contact_forces(&self, params: &SimulationParams, boundary: &[Sdf], floor: &Sdf) -> (V3, V3) {
        let mut force = self.mass * params.gravity;
        let mut torque = V3::zeros();
        let vertex_mass = self.mass / self.local_vertices.len().max(1) as FT;

        for v in &self.local_vertices {
            let r = self.orientation * *v;
            let p = self.position + r;
            let vel = self.velocity_at(r);

            for sdf in boundary.iter().chain(std::iter::once(floor)) {
                let (d, n) = sdf.probe_with_normal(p);
                if d >= 0. {
                    continue;
                }
                let vn = vel.dot(&n);
                let normal_magnitude =
                    (vertex_mass * (params.contact_stiffness * -d - params.contact_damping * vn)).max(0.);

                // Coulomb-capped tangential damping
                let vt = vel - vn * n;
                let mut friction = -vertex_mass * params.contact_damping * vt;
                let friction_cap = params.contact_friction * normal_magnitude;
                let friction_norm = friction.norm();
                if friction_norm > friction_cap {
                    friction *= friction_cap / friction_norm;
                }

                let f = normal_magnitude * n + friction;
                force += f;
                torque += r.cross(&f);
            }
        }
        (force, torque)
    }

    fn integrate(&mut self, params: &SimulationParams, force: V3, torque: V3, dt: FT) {
        self.velocity += dt * force / self.mass;

        let inertia = self.world_inertia();
        let gyroscopic = self.angular_velocity.cross(&(inertia * self.angular_velocity));
        self.angular_velocity += dt * (self.world_inv_inertia() * (torque - gyroscopic));
        self.angular_velocity /= 1. + dt * params.angular_damping;

        self.position += dt * self.velocity;
        self.orientation = Q::from_scaled_axis(self.angular_velocity * dt) * self.orientation;
        self.orientation.renormalize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CullReason {
    OutOfBounds,
    BelowMinimumMass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CulledFragment {
    pub id: FragmentId,
    pub source_body: BodyId,
    pub reason: CullReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RigidStepResult {
    pub culled: Vec<CulledFragment>,
    pub instability_recoveries: usize,
}

/// Owns all fragments. Fragment ids are never reused within a run.
pub struct FragmentDynamics {
    fragments: Vec<Fragment>,
    next_id: u64,
}

impl Default for FragmentDynamics {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentDynamics {
    pub fn new() -> Self {
        FragmentDynamics {
            fragments: Vec::new(),
            next_id: 0,
        }
    }

    pub fn spawn(&mut self, source_body: BodyId, spawns: Vec<FragmentSpawn>) -> Vec<FragmentId> {
        spawns
            .into_iter()
            .map(|spawn| {
                let id = FragmentId(self.next_id);
                self.next_id += 1;
                self.fragments.push(Fragment::from_spawn(id, source_body, spawn));
                id
            })
            .collect()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn get(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.id == id)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn total_mass(&self) -> FT {
        self.fragments.iter().map(|f| f.mass).sum()
    }

    fn cull(&mut self, reason: CullReason, predicate: impl Fn(&Fragment) -> bool, culled: &mut Vec<CulledFragment>) {
        self.fragments.retain(|f| {
            if predicate(f) {
                info!(
                    "culled fragment {} of body {} ({:?}, mass {}, position {:?})",
                    f.id, f.source_body, reason, f.mass, f.position
                );
                culled.push(CulledFragment {
                    id: f.id,
                    source_body: f.source_body,
                    reason,
                });
                false
            } else {
                true
            }
        });
    }

    /**
     * Advances all fragments by `dt` in `rigid_substeps` substeps. Contacts are
     * resolved against `boundary` and the floor of the world box, fragments that
     * are too light or left the world box are removed and reported.
     */
    pub fn step(&mut self, params: &SimulationParams, boundary: &[Sdf], dt: FT) -> RigidStepResult {
        let mut result = RigidStepResult::default();

        let min_mass = params.min_fragment_mass;
        self.cull(CullReason::BelowMinimumMass, |f| f.mass < min_mass, &mut result.culled);

        let floor: Sdf = SdfPlane::new(V3::y(), -params.world_min.y).into();
        let substeps = params.rigid_substeps.max(1);
        let h = dt / substeps as FT;

        for fragment in &mut self.fragments {
            for _ in 0..substeps {
                let committed = fragment.clone();
                let (force, torque) = fragment.contact_forces(params, boundary, &floor);
                fragment.integrate(params, force, torque, h);
                if !fragment.is_finite() {
                    warn!("fragment {} became non-finite, restoring its last state", fragment.id);
                    *fragment = committed;
                    fragment.velocity = V3::zeros();
                    fragment.angular_velocity = V3::zeros();
                    result.instability_recoveries += 1;
                    break;
                }
            }
        }

        self.cull(
            CullReason::OutOfBounds,
            |f| !params.is_inside_world(f.position),
            &mut result.culled,
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fracture::MassProperties, vec3f};

    fn cube_spawn(center: V3, half: FT, velocity: V3, angular_velocity: V3) -> FragmentSpawn {
        let shape = ConvexPolyhedron::cuboid(center, V3::from_element(half)).unwrap();
        let mass_properties: MassProperties = shape.mass_properties();
        FragmentSpawn {
            shape,
            mass_properties,
            density: 1000.,
            velocity,
            angular_velocity,
        }
    }

    #[test]
    fn fragment_comes_to_rest_on_ground() {
        let params = SimulationParams::default();
        let ground: Sdf = SdfPlane::new(V3::y(), 0.).into();
        let mut dynamics = FragmentDynamics::new();
        dynamics.spawn(0, vec![cube_spawn(vec3f(0., 1., 0.), 0.1, V3::zeros(), V3::zeros())]);

        for _ in 0..300 {
            let result = dynamics.step(&params, &[ground.clone()], params.time_step);
            assert!(result.culled.is_empty());
        }
        let f = &dynamics.fragments()[0];
        assert!((f.position.y - 0.1).abs() < 0.02, "y={}", f.position.y);
        assert!(f.velocity.norm() < 0.05);
        assert!(f.world_vertices().all(|p| p.y > -0.02));
    }

    #[test]
    fn free_flight_follows_gravity_and_spins() {
        let mut params = SimulationParams::default();
        params.angular_damping = 0.;
        let mut dynamics = FragmentDynamics::new();
        let omega = vec3f(0., 0., 2.);
        dynamics.spawn(0, vec![cube_spawn(vec3f(0., 4., 0.), 0.1, vec3f(1., 0., 0.), omega)]);

        let steps = 30;
        for _ in 0..steps {
            dynamics.step(&params, &[], params.time_step);
        }
        let t = steps as FT * params.time_step;
        let f = &dynamics.fragments()[0];
        assert!((f.velocity - vec3f(1., -9.81 * t, 0.)).norm() < 1e-3);
        // inertia of a cube is isotropic, so the spin stays constant
        assert!((f.angular_velocity - omega).norm() < 1e-4);
        assert!((f.orientation.angle() - 2. * t).abs() < 1e-3);
    }

    #[test]
    fn light_and_escaped_fragments_are_culled() {
        let params = SimulationParams::default();
        let mut dynamics = FragmentDynamics::new();
        let ids = dynamics.spawn(
            7,
            vec![
                // 1e-6 m^3 * 1000 = 1e-3 kg is the minimum, this one is lighter
                cube_spawn(vec3f(0., 2., 0.), 0.004, V3::zeros(), V3::zeros()),
                cube_spawn(vec3f(2.99, 2., 0.), 0.1, vec3f(50., 0., 0.), V3::zeros()),
                cube_spawn(vec3f(0., 2., 0.), 0.1, V3::zeros(), V3::zeros()),
            ],
        );
        assert_eq!(ids, vec![FragmentId(0), FragmentId(1), FragmentId(2)]);

        let result = dynamics.step(&params, &[], params.time_step);
        assert_eq!(
            result.culled,
            vec![
                CulledFragment {
                    id: ids[0],
                    source_body: 7,
                    reason: CullReason::BelowMinimumMass
                },
                CulledFragment {
                    id: ids[1],
                    source_body: 7,
                    reason: CullReason::OutOfBounds
                },
            ]
        );
        assert_eq!(dynamics.len(), 1);
        assert!(dynamics.get(ids[2]).is_some());

        // ids are not reused
        let next = dynamics.spawn(7, vec![cube_spawn(vec3f(0., 2., 0.), 0.1, V3::zeros(), V3::zeros())]);
        assert_eq!(next, vec![FragmentId(3)]);
    }

    #[test]
    fn friction_slows_sliding_fragment() {
        let params = SimulationParams::default();
        let ground: Sdf = SdfPlane::new(V3::y(), 0.).into();
        let mut dynamics = FragmentDynamics::new();
        dynamics.spawn(0, vec![cube_spawn(vec3f(0., 0.1, 0.), 0.1, vec3f(1., 0., 0.), V3::zeros())]);
        for _ in 0..120 {
            dynamics.step(&params, &[ground.clone()], params.time_step);
        }
        let f = &dynamics.fragments()[0];
        assert!(f.velocity.x.abs() < 0.1, "vx={}", f.velocity.x);
        assert!(f.position.x > 0.);
    }
}
