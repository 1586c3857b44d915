//! End-to-end runs of the simulation clock: fluid, fracture and fragments together.

use std::time::Duration;

use sph_fracture::{
    assert_ft_approx_eq,
    floating_type_mod::FT,
    fracture::{FractureOutcome, UnchangedReason},
    scene::{FluidEmitter, SceneConfig, SolidBodyConfig},
    simulation_parameters::{BackendType, SimulationParams},
    spawn, vec3f, SimulationClock, SimulationError, SnapshotDelivery, V3,
};

fn block_scene(half_width: FT, spacing: FT, material_strength: FT) -> SceneConfig {
    SceneConfig {
        fluid: vec![FluidEmitter::Block {
            min: vec3f(-half_width, -1., -half_width),
            max: vec3f(half_width, -1. + 2. * half_width, half_width),
            spacing,
            velocity: V3::zeros(),
        }],
        bodies: vec![SolidBodyConfig::Cuboid {
            center: vec3f(0., 1.5, 0.),
            half_extents: vec3f(0.3, 0.3, 0.3),
            material_strength: Some(material_strength),
            density: Some(800.),
            velocity: vec3f(0., -1., 0.),
        }],
        ..SceneConfig::demo()
    }
}

fn parallel_params(num_threads: usize) -> SimulationParams {
    SimulationParams {
        backend: BackendType::Parallel,
        num_threads,
        ..SimulationParams::default()
    }
}

#[test]
fn runs_are_deterministic_for_fixed_seed_and_threads() {
    let run = || {
        let mut clock = SimulationClock::new(parallel_params(3), &block_scene(0.2, 0.05, 100.)).unwrap();
        clock.schedule_fracture(10, 0, vec3f(0., 1.8, 0.), 300.).unwrap();
        let mut last = clock.latest_snapshot();
        for _ in 0..100 {
            last = clock.tick().unwrap();
        }
        last
    };

    let a = run();
    let b = run();
    assert_eq!(a.step, 100);
    assert_eq!(a.particle_positions, b.particle_positions);
    assert_eq!(a.fragments.len(), b.fragments.len());
    assert!(!a.fragments.is_empty());
    for (fa, fb) in a.fragments.iter().zip(b.fragments.iter()) {
        assert_eq!(fa.id, fb.id);
        assert_eq!(fa.position, fb.position);
        assert_eq!(fa.orientation, fb.orientation);
    }
}

#[test]
fn fast_particles_subdivide_the_step() {
    let mut scene = block_scene(0.1, 0.05, 100.);
    scene.fluid.push(FluidEmitter::Block {
        min: vec3f(1., 1., 1.),
        max: vec3f(1.05, 1.05, 1.05),
        spacing: 0.05,
        velocity: vec3f(0., 0., -80.),
    });
    let mut clock = SimulationClock::new(parallel_params(2), &scene).unwrap();

    let snapshot = clock.tick().unwrap();
    assert!(snapshot.diagnostics.courant_substeps > 1);
    assert_eq!(snapshot.diagnostics.instability_recoveries, 0);
    assert!(snapshot
        .particle_positions
        .iter()
        .all(|x| x.iter().all(|c| c.is_finite())));
}

#[test]
fn fracture_is_a_threshold() {
    let mut clock = SimulationClock::new(parallel_params(2), &block_scene(0.1, 0.05, 100.)).unwrap();

    let outcome = clock.request_fracture(0, vec3f(0.3, 1.5, 0.), 99.).unwrap();
    assert_eq!(outcome, FractureOutcome::Unchanged(UnchangedReason::BelowStrength));
    let snapshot = clock.tick().unwrap();
    assert!(snapshot.fragments.is_empty());
    assert_eq!(snapshot.intact_bodies.len(), 1);

    match clock.request_fracture(0, vec3f(0.3, 1.5, 0.), 101.).unwrap() {
        FractureOutcome::Fractured(ids) => assert!(ids.len() >= 2),
        other => panic!("unexpected {:?}", other),
    }
    let snapshot = clock.tick().unwrap();
    assert!(snapshot.fragments.len() >= 2);
    assert!(snapshot.intact_bodies.is_empty());
}

#[test]
fn fracture_conserves_body_mass() {
    for seed_count in [4, 12, 40] {
        let params = SimulationParams {
            fracture_seed_count: seed_count,
            ..parallel_params(2)
        };
        let mut clock = SimulationClock::new(params, &block_scene(0.1, 0.05, 100.)).unwrap();
        let body_mass = clock.bodies()[0].mass();
        assert_ft_approx_eq(body_mass, 0.216 * 800., 1e-2, || "body mass".to_string());

        clock.request_fracture(0, vec3f(-0.3, 1.6, 0.1), 500.).unwrap();
        assert_ft_approx_eq(clock.fragments().total_mass(), body_mass, 1e-3 * body_mass, || {
            format!("{} seeds", seed_count)
        });
    }
}

#[test]
fn particle_count_is_constant() {
    let mut clock = SimulationClock::new(parallel_params(2), &block_scene(0.2, 0.05, 10.)).unwrap();
    let n = clock.latest_snapshot().particle_positions.len();
    assert_eq!(n, 8 * 8 * 8);
    let mass = clock.fluid().total_mass();

    clock.schedule_fracture(5, 0, vec3f(0., 1.2, 0.), 50.).unwrap();
    for _ in 0..60 {
        let snapshot = clock.tick().unwrap();
        assert_eq!(snapshot.particle_positions.len(), n);
    }
    assert_eq!(clock.fluid().total_mass(), mass);
    assert!(!clock.fragments().is_empty());
}

#[test]
fn lattice_interior_is_at_rest_density() {
    let params = SimulationParams::default();
    let clock = SimulationClock::new(params.clone(), &block_scene(0.25, 0.05, 100.)).unwrap();
    let fluid = clock.fluid();

    let h = params.support_radius;
    let (min, max) = (vec3f(-0.25, -1., -0.25), vec3f(0.25, -0.5, 0.25));
    let mut interior = 0;
    for (x, rho) in fluid.positions().iter().zip(fluid.densities()) {
        if (0..3).all(|d| x[d] - min[d] > h && max[d] - x[d] > h) {
            interior += 1;
            assert_ft_approx_eq(*rho, params.rest_density, 1e-3 * params.rest_density, || {
                format!("density at {:?}", x)
            });
        }
    }
    assert!(interior > 0);
}

#[test]
fn threaded_clock_serves_fracture_requests() {
    let clock = SimulationClock::new(parallel_params(2), &block_scene(0.1, 0.05, 100.)).unwrap();
    let mut handle = spawn(clock, None, SnapshotDelivery::Every).unwrap();

    let ids = match handle.request_fracture(0, vec3f(0., 1.8, 0.), 400.).unwrap() {
        FractureOutcome::Fractured(ids) => ids,
        other => panic!("unexpected {:?}", other),
    };
    assert!(matches!(
        handle.request_fracture(0, vec3f(0., 1.8, 0.), 400.),
        Err(SimulationError::UnknownBody(0))
    ));

    let mut published = Vec::new();
    while published.len() < ids.len() {
        let snapshot = handle.recv_snapshot_timeout(Duration::from_secs(60)).unwrap();
        assert!(snapshot.new_fragments.is_empty() || snapshot.intact_bodies.is_empty());
        published.extend(snapshot.new_fragments.iter().copied());
    }
    assert_eq!(published, ids);

    handle.stop();
    let clock = handle.join().unwrap();
    assert!(clock.bodies().is_empty());
    assert!(clock.step_number() > 0);
}

#[test]
fn worker_stops_after_max_steps() {
    let clock = SimulationClock::new(parallel_params(2), &block_scene(0.1, 0.05, 100.)).unwrap();
    let mut handle = spawn(clock, Some(5), SnapshotDelivery::Latest).unwrap();

    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(5));
    }
    let latest = handle.try_latest().unwrap();
    assert!(latest.step <= 5);

    let clock = handle.join().unwrap();
    assert_eq!(clock.step_number(), 5);

    let mut clock = clock;
    assert_eq!(clock.tick().unwrap().step, 6);
}
