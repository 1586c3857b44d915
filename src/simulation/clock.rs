use std::{
    sync::{
        mpsc::{channel, sync_channel, Receiver, Sender, SyncSender, TryRecvError},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    counters::write_statistics,
    floating_type_mod::FT,
    fracture::{evaluate_fracture, BodyId, ConvexPolyhedron, FractureEvaluation, FractureOutcome, FragmentId, SolidBody},
    rigid_dynamics::{CulledFragment, FragmentDynamics},
    scene::SceneConfig,
    simulation_parameters::SimulationParams,
    FluidSimulation, SimulationError, StepDiagnostics, Q, V3,
};

/// Pose of a fragment. `mesh` is in body coordinates (centroid at the origin).
#[derive(Debug, Clone)]
pub struct FragmentTransform {
    pub id: FragmentId,
    pub source_body: BodyId,
    pub position: V3,
    pub orientation: Q,
    pub mesh: Arc<ConvexPolyhedron>,
}

impl FragmentTransform {
    pub fn world_vertices(&self) -> impl Iterator<Item = V3> + '_ {
        self.mesh
            .vertices()
            .into_iter()
            .map(move |v| self.position + self.orientation * v)
    }
}

/// A solid body that has not been fractured yet. Its mesh is in world coordinates.
#[derive(Debug, Clone)]
pub struct BodySnapshot {
    pub id: BodyId,
    pub mesh: Arc<ConvexPolyhedron>,
}

/// Read-only state after a fully committed tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub step: usize,
    pub time: FT,
    pub particle_positions: Vec<V3>,
    pub fragments: Vec<FragmentTransform>,
    pub intact_bodies: Vec<BodySnapshot>,
    // fragments created by fracture requests since the previous snapshot
    pub new_fragments: Vec<FragmentId>,
    pub culled: Vec<CulledFragment>,
    pub diagnostics: StepDiagnostics,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledImpact {
    step: usize,
    body: BodyId,
    impact_point: V3,
    impulse: FT,
}

/**
 * Owns the complete simulation state and advances it in fixed ticks of
 * `time_step`. Fracture requests are evaluated between ticks only, so every
 * snapshot reflects a state in which all passes of a step have committed.
 */
pub struct SimulationClock {
    params: SimulationParams,
    fluid: FluidSimulation,
    bodies: Vec<SolidBody>,
    fragments: FragmentDynamics,

    step: usize,
    time: FT,

    fracture_events: u64,
    scheduled: Vec<ScheduledImpact>,
    new_fragments: Vec<FragmentId>,
    pending_diagnostics: StepDiagnostics,

    instability_events: usize,
    diverged: bool,

    latest: Arc<Snapshot>,
}

impl SimulationClock {
    pub fn new(params: SimulationParams, scene: &SceneConfig) -> Result<SimulationClock, SimulationError> {
        params.validate()?;

        let fluid_init = scene.build_fluid(&params)?;
        let bodies = scene.build_bodies(&params)?;
        let boundary = scene.build_boundary()?;

        let mut fluid = FluidSimulation::new(
            params.clone(),
            boundary,
            &fluid_init.positions,
            &fluid_init.velocities,
            &fluid_init.masses,
        )?;
        let mut pending_diagnostics = StepDiagnostics::default();
        pending_diagnostics.instability_recoveries += fluid.update_densities();

        info!(
            "simulation with {} particles, {} solid bodies, {} boundary primitives (dt={})",
            fluid.len(),
            bodies.len(),
            fluid.boundary().len(),
            params.time_step
        );

        let mut clock = SimulationClock {
            params,
            fluid,
            bodies,
            fragments: FragmentDynamics::new(),
            step: 0,
            time: 0.,
            fracture_events: 0,
            scheduled: Vec::new(),
            new_fragments: Vec::new(),
            pending_diagnostics,
            instability_events: 0,
            diverged: false,
            latest: Arc::new(Snapshot {
                step: 0,
                time: 0.,
                particle_positions: Vec::new(),
                fragments: Vec::new(),
                intact_bodies: Vec::new(),
                new_fragments: Vec::new(),
                culled: Vec::new(),
                diagnostics: StepDiagnostics::default(),
            }),
        };
        clock.latest = Arc::new(clock.make_snapshot(Vec::new(), StepDiagnostics::default()));
        Ok(clock)
    }

    pub fn set_statistics_enabled(&mut self, enabled: bool) {
        self.fluid.set_statistics_enabled(enabled);
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn step_number(&self) -> usize {
        self.step
    }

    pub fn time(&self) -> FT {
        self.time
    }

    pub fn fluid(&self) -> &FluidSimulation {
        &self.fluid
    }

    pub fn bodies(&self) -> &[SolidBody] {
        &self.bodies
    }

    pub fn fragments(&self) -> &FragmentDynamics {
        &self.fragments
    }

    pub fn instability_events(&self) -> usize {
        self.instability_events
    }

    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        self.latest.clone()
    }

    pub fn statistics(&self) -> String {
        write_statistics(&self.fluid.pcounters, &self.fluid.vcounters)
    }

    /**
     * Fractures `body` if `impulse` reaches its material strength. The body is
     * replaced by its fragments immediately; they are published with the next
     * snapshot.
     */
    pub fn request_fracture(
        &mut self,
        body: BodyId,
        impact_point: V3,
        impulse: FT,
    ) -> Result<FractureOutcome, SimulationError> {
        let index = self
            .bodies
            .iter()
            .position(|b| b.id == body)
            .ok_or(SimulationError::UnknownBody(body))?;

        // one random stream per fracture event
        self.fracture_events += 1;
        let mut rng =
            StdRng::seed_from_u64(self.params.seed ^ self.fracture_events.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        self.fluid.pcounters.begin("fracture");
        let evaluation = evaluate_fracture(&self.bodies[index], impact_point, impulse, &self.params, &mut rng);
        self.fluid.pcounters.end("fracture");

        match evaluation? {
            FractureEvaluation::Unchanged(reason) => {
                debug!("body {} unchanged by impulse {}: {:?}", body, impulse, reason);
                Ok(FractureOutcome::Unchanged(reason))
            }
            FractureEvaluation::Fractured(result) => {
                let body = self.bodies.remove(index);
                self.pending_diagnostics.degenerate_cells_discarded += result.degenerate_cells_discarded;
                let ids = self.fragments.spawn(body.id, result.fragments);
                self.new_fragments.extend(ids.iter().copied());
                Ok(FractureOutcome::Fractured(ids))
            }
        }
    }

    /// Queues an impact that is applied right before tick `step` runs.
    pub fn schedule_fracture(
        &mut self,
        step: usize,
        body: BodyId,
        impact_point: V3,
        impulse: FT,
    ) -> Result<(), SimulationError> {
        if !self.bodies.iter().any(|b| b.id == body) {
            return Err(SimulationError::UnknownBody(body));
        }
        self.scheduled.push(ScheduledImpact {
            step,
            body,
            impact_point,
            impulse,
        });
        Ok(())
    }

    /**
     * Runs one fixed step: scheduled impacts, the fluid (Courant subdivided),
     * then the rigid fragments. Returns the snapshot of the committed state or
     * `Diverged` once the recovered instabilities exceed `max_instability_events`.
     */
    pub fn tick(&mut self) -> Result<Arc<Snapshot>, SimulationError> {
        if self.diverged {
            return Err(self.diverged_error());
        }

        let due: Vec<ScheduledImpact> = self.scheduled.iter().filter(|s| s.step <= self.step).copied().collect();
        self.scheduled.retain(|s| s.step > self.step);
        for impact in due {
            match self.request_fracture(impact.body, impact.impact_point, impact.impulse) {
                Ok(outcome) => info!("scheduled impact on body {}: {:?}", impact.body, outcome),
                Err(err) => warn!("scheduled impact on body {} skipped: {}", impact.body, err),
            }
        }

        let dt = self.params.time_step;
        self.fluid.pcounters.begin("simulation-step");

        let mut diagnostics = self.fluid.step(dt);

        self.fluid.pcounters.begin("rigid");
        let rigid = self.fragments.step(&self.params, self.fluid.boundary(), dt);
        self.fluid.pcounters.end("rigid");

        self.fluid.pcounters.end("simulation-step");

        diagnostics.instability_recoveries += rigid.instability_recoveries;
        diagnostics.fragments_culled += rigid.culled.len();
        diagnostics = diagnostics.combine(std::mem::take(&mut self.pending_diagnostics));

        self.step += 1;
        self.time += dt;
        self.instability_events += diagnostics.instability_recoveries;

        self.latest = Arc::new(self.make_snapshot(rigid.culled, diagnostics));

        if self.instability_events > self.params.max_instability_events {
            self.diverged = true;
            let err = self.diverged_error();
            error!("step {}: {}", self.step, err);
            return Err(err);
        }

        Ok(self.latest.clone())
    }

    fn diverged_error(&self) -> SimulationError {
        SimulationError::Diverged {
            events: self.instability_events,
            threshold: self.params.max_instability_events,
        }
    }

    fn make_snapshot(&mut self, culled: Vec<CulledFragment>, diagnostics: StepDiagnostics) -> Snapshot {
        Snapshot {
            step: self.step,
            time: self.time,
            particle_positions: self.fluid.positions().to_vec(),
            fragments: self
                .fragments
                .fragments()
                .iter()
                .map(|f| FragmentTransform {
                    id: f.id,
                    source_body: f.source_body,
                    position: f.position,
                    orientation: f.orientation,
                    mesh: f.mesh.clone(),
                })
                .collect(),
            intact_bodies: self
                .bodies
                .iter()
                .map(|b| BodySnapshot {
                    id: b.id,
                    mesh: b.shape.clone(),
                })
                .collect(),
            new_fragments: std::mem::take(&mut self.new_fragments),
            culled,
            diagnostics,
        }
    }
}

pub enum SimulationCommand {
    Fracture {
        body: BodyId,
        impact_point: V3,
        impulse: FT,
        reply: Sender<Result<FractureOutcome, SimulationError>>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDelivery {
    /**
     * The worker never waits. Only the newest unread snapshot is kept; the
     * `new_fragments` and `culled` of snapshots it replaces are carried over
     * into it.
     */
    Latest,
    /// The worker blocks until the consumer took the previous snapshots.
    Every,
}

const SNAPSHOT_QUEUE_CAPACITY: usize = 4;

/// Returns `newer` with the events of the unread `skipped` snapshot prepended.
fn carry_events(skipped: &Snapshot, newer: Arc<Snapshot>) -> Arc<Snapshot> {
    if skipped.new_fragments.is_empty() && skipped.culled.is_empty() {
        return newer;
    }
    let mut merged = Snapshot::clone(&newer);
    merged.new_fragments = skipped.new_fragments.iter().chain(&newer.new_fragments).copied().collect();
    merged.culled = skipped.culled.iter().chain(&newer.culled).copied().collect();
    Arc::new(merged)
}

#[derive(Default)]
struct LatestState {
    unread: Option<Arc<Snapshot>>,
    closed: bool,
}

/// Single-value mailbox behind `SnapshotDelivery::Latest`.
#[derive(Default)]
struct LatestSnapshot {
    state: Mutex<LatestState>,
    changed: Condvar,
}

impl LatestSnapshot {
    fn lock(&self) -> MutexGuard<'_, LatestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: Arc<Snapshot>) {
        let mut state = self.lock();
        let snapshot = match state.unread.take() {
            Some(skipped) => carry_events(&skipped, snapshot),
            None => snapshot,
        };
        state.unread = Some(snapshot);
        self.changed.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    fn take(&self) -> Option<Arc<Snapshot>> {
        self.lock().unread.take()
    }

    /// `None` once the worker is gone and everything was read, or on timeout.
    fn wait(&self, timeout: Option<Duration>) -> Option<Arc<Snapshot>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if let Some(snapshot) = state.unread.take() {
                return Some(snapshot);
            }
            if state.closed {
                return None;
            }
            state = match deadline {
                None => self.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Worker side of the snapshot transport.
enum SnapshotSink {
    Every(SyncSender<Arc<Snapshot>>),
    Latest(Arc<LatestSnapshot>),
}

impl SnapshotSink {
    /// Returns false once the consumer is gone.
    fn deliver(&self, snapshot: Arc<Snapshot>) -> bool {
        match self {
            SnapshotSink::Every(sender) => sender.send(snapshot).is_ok(),
            SnapshotSink::Latest(slot) => {
                slot.publish(snapshot);
                Arc::strong_count(slot) > 1
            }
        }
    }
}

impl Drop for SnapshotSink {
    fn drop(&mut self) {
        // also runs when the worker panics, so waiting consumers wake up
        if let SnapshotSink::Latest(slot) = self {
            slot.close();
        }
    }
}

/// Consumer side of the snapshot transport.
enum SnapshotSource {
    Every(Receiver<Arc<Snapshot>>),
    Latest(Arc<LatestSnapshot>),
}

/// Handle to a clock running on its own thread.
pub struct SimulationHandle {
    commands: Sender<SimulationCommand>,
    snapshots: SnapshotSource,
    latest: Option<Arc<Snapshot>>,
    max_steps: Option<usize>,
    worker: JoinHandle<Result<SimulationClock, SimulationError>>,
}

/**
 * Moves `clock` onto a dedicated worker thread that ticks until `max_steps`
 * ticks have run (if given), a stop is requested or the run diverges.
 * Commands are handled between ticks only.
 */
pub fn spawn(
    clock: SimulationClock,
    max_steps: Option<usize>,
    delivery: SnapshotDelivery,
) -> Result<SimulationHandle, SimulationError> {
    let (command_tx, command_rx) = channel();
    let (sink, source) = match delivery {
        SnapshotDelivery::Every => {
            let (snapshot_tx, snapshot_rx) = sync_channel(SNAPSHOT_QUEUE_CAPACITY);
            (SnapshotSink::Every(snapshot_tx), SnapshotSource::Every(snapshot_rx))
        }
        SnapshotDelivery::Latest => {
            let slot = Arc::new(LatestSnapshot::default());
            (SnapshotSink::Latest(slot.clone()), SnapshotSource::Latest(slot))
        }
    };

    let worker = std::thread::Builder::new()
        .name("simulation-clock".to_string())
        .spawn(move || run_worker(clock, max_steps, command_rx, sink))?;

    Ok(SimulationHandle {
        commands: command_tx,
        snapshots: source,
        latest: None,
        max_steps,
        worker,
    })
}

fn run_worker(
    mut clock: SimulationClock,
    max_steps: Option<usize>,
    commands: Receiver<SimulationCommand>,
    snapshots: SnapshotSink,
) -> Result<SimulationClock, SimulationError> {
    let mut ticks = 0;
    let mut consumer_connected = true;
    loop {
        loop {
            match commands.try_recv() {
                Ok(SimulationCommand::Fracture {
                    body,
                    impact_point,
                    impulse,
                    reply,
                }) => {
                    // the requester may have given up waiting
                    let _ = reply.send(clock.request_fracture(body, impact_point, impulse));
                }
                Ok(SimulationCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    info!("simulation stopped at step {}", clock.step_number());
                    return Ok(clock);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if max_steps.map_or(false, |max| ticks >= max) {
            info!("simulation finished after {} steps", ticks);
            return Ok(clock);
        }

        let snapshot = clock.tick()?;
        ticks += 1;

        if consumer_connected {
            consumer_connected = snapshots.deliver(snapshot);
        }
    }
}

impl SimulationHandle {
    /// Blocks until the worker evaluated the request between two ticks.
    pub fn request_fracture(
        &self,
        body: BodyId,
        impact_point: V3,
        impulse: FT,
    ) -> Result<FractureOutcome, SimulationError> {
        let (reply_tx, reply_rx) = channel();
        self.commands
            .send(SimulationCommand::Fracture {
                body,
                impact_point,
                impulse,
                reply: reply_tx,
            })
            .map_err(|_| SimulationError::Stopped)?;
        reply_rx.recv().map_err(|_| SimulationError::Stopped)?
    }

    /// Blocks for the next snapshot. `None` once the worker finished and all snapshots were read.
    pub fn recv_snapshot(&mut self) -> Option<Arc<Snapshot>> {
        let snapshot = match &self.snapshots {
            SnapshotSource::Every(receiver) => receiver.recv().ok(),
            SnapshotSource::Latest(slot) => slot.wait(None),
        };
        self.remember(snapshot)
    }

    pub fn recv_snapshot_timeout(&mut self, timeout: Duration) -> Option<Arc<Snapshot>> {
        let snapshot = match &self.snapshots {
            SnapshotSource::Every(receiver) => receiver.recv_timeout(timeout).ok(),
            SnapshotSource::Latest(slot) => slot.wait(Some(timeout)),
        };
        self.remember(snapshot)
    }

    /**
     * Newest snapshot seen so far, without blocking. Events of queued
     * snapshots skipped over here are carried into the returned one the first
     * time it is returned.
     */
    pub fn try_latest(&mut self) -> Option<Arc<Snapshot>> {
        let unread = match &self.snapshots {
            SnapshotSource::Every(receiver) => receiver
                .try_iter()
                .reduce(|skipped, newer| carry_events(&skipped, newer)),
            SnapshotSource::Latest(slot) => slot.take(),
        };
        if unread.is_some() {
            self.latest = unread;
        }
        self.latest.clone()
    }

    fn remember(&mut self, snapshot: Option<Arc<Snapshot>>) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = &snapshot {
            self.latest = Some(snapshot.clone());
        }
        snapshot
    }

    /// Honored after the tick in progress has committed.
    pub fn stop(&self) {
        let _ = self.commands.send(SimulationCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /**
     * Waits for the worker and returns the clock, or the error that ended the
     * run. A worker without a step limit is stopped first; one with a limit
     * runs its remaining steps.
     */
    pub fn join(self) -> Result<SimulationClock, SimulationError> {
        let SimulationHandle {
            commands,
            snapshots,
            max_steps,
            worker,
            ..
        } = self;
        // unblocks a worker waiting on a full queue
        drop(snapshots);
        let commands = match max_steps {
            Some(_) => Some(commands),
            // a disconnected command channel stops the worker
            None => {
                drop(commands);
                None
            }
        };

        let result = worker.join().map_err(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            SimulationError::WorkerPanicked(message)
        })?;
        drop(commands);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fracture::UnchangedReason,
        scene::{FluidEmitter, SolidBodyConfig},
        vec3f,
    };

    fn small_scene() -> SceneConfig {
        SceneConfig {
            fluid: vec![FluidEmitter::Block {
                min: vec3f(-0.2, -1., -0.2),
                max: vec3f(0.2, -0.6, 0.2),
                spacing: 0.05,
                velocity: V3::zeros(),
            }],
            bodies: vec![SolidBodyConfig::Cuboid {
                center: vec3f(0., 1., 0.),
                half_extents: vec3f(0.25, 0.25, 0.25),
                material_strength: Some(50.),
                density: None,
                velocity: V3::zeros(),
            }],
            ..SceneConfig::demo()
        }
    }

    fn serial_params() -> SimulationParams {
        SimulationParams {
            backend: crate::simulation_parameters::BackendType::Serial,
            ..SimulationParams::default()
        }
    }

    #[test]
    fn initial_snapshot_shows_scene() {
        let clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        let snapshot = clock.latest_snapshot();
        assert_eq!(snapshot.step, 0);
        assert_eq!(snapshot.particle_positions.len(), 8 * 8 * 8);
        assert_eq!(snapshot.intact_bodies.len(), 1);
        assert!(snapshot.fragments.is_empty());
    }

    #[test]
    fn fragments_are_published_with_next_snapshot() {
        let mut clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        clock.tick().unwrap();

        let outcome = clock.request_fracture(0, vec3f(0.25, 1., 0.), 80.).unwrap();
        let ids = match outcome {
            FractureOutcome::Fractured(ids) => ids,
            other => panic!("unexpected {:?}", other),
        };
        assert!(ids.len() >= 2);

        // published state is unchanged until the next tick commits
        assert_eq!(clock.latest_snapshot().intact_bodies.len(), 1);
        assert!(clock.latest_snapshot().fragments.is_empty());

        let snapshot = clock.tick().unwrap();
        assert!(snapshot.intact_bodies.is_empty());
        assert_eq!(snapshot.new_fragments, ids);
        assert_eq!(snapshot.fragments.len(), ids.len());
        for fragment in &snapshot.fragments {
            assert!(fragment.world_vertices().all(|v| (v - vec3f(0., 1., 0.)).amax() < 0.35));
        }

        let next = clock.tick().unwrap();
        assert!(next.new_fragments.is_empty());

        // the body is gone for good
        assert!(matches!(
            clock.request_fracture(0, vec3f(0.25, 1., 0.), 80.),
            Err(SimulationError::UnknownBody(0))
        ));
    }

    #[test]
    fn weak_impacts_leave_body_in_place() {
        let mut clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        let outcome = clock.request_fracture(0, vec3f(0., 1.25, 0.), 49.).unwrap();
        assert_eq!(outcome, FractureOutcome::Unchanged(UnchangedReason::BelowStrength));
        let snapshot = clock.tick().unwrap();
        assert_eq!(snapshot.intact_bodies.len(), 1);
        assert!(snapshot.fragments.is_empty());
    }

    #[test]
    fn scheduled_impact_fires_at_step() {
        let mut clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        clock.schedule_fracture(2, 0, vec3f(0., 1.25, 0.), 100.).unwrap();
        assert!(matches!(
            clock.schedule_fracture(2, 7, V3::zeros(), 100.),
            Err(SimulationError::UnknownBody(7))
        ));

        assert_eq!(clock.tick().unwrap().intact_bodies.len(), 1);
        assert_eq!(clock.tick().unwrap().intact_bodies.len(), 1);
        let snapshot = clock.tick().unwrap();
        assert!(snapshot.intact_bodies.is_empty());
        assert!(!snapshot.new_fragments.is_empty());
    }

    #[test]
    fn divergence_stops_the_run() {
        let params = SimulationParams {
            max_instability_events: 0,
            ..serial_params()
        };
        let mut clock = SimulationClock::new(params, &small_scene()).unwrap();
        clock.fluid.set_velocity(0, vec3f(FT::NAN, 0., 0.));

        assert!(matches!(clock.tick(), Err(SimulationError::Diverged { .. })));
        // later ticks do not run
        let step = clock.step_number();
        assert!(matches!(clock.tick(), Err(SimulationError::Diverged { .. })));
        assert_eq!(clock.step_number(), step);
    }

    #[test]
    fn latest_delivery_keeps_events_of_skipped_snapshots() {
        let mut clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        let ids = match clock.request_fracture(0, vec3f(0.25, 1., 0.), 80.).unwrap() {
            FractureOutcome::Fractured(ids) => ids,
            other => panic!("unexpected {:?}", other),
        };

        // nobody reads while the worker runs, every snapshot but the last is replaced
        let mut handle = spawn(clock, Some(8), SnapshotDelivery::Latest).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let latest = handle.try_latest().unwrap();
        assert_eq!(latest.step, 8);
        assert_eq!(latest.new_fragments, ids);
        assert!(handle.recv_snapshot_timeout(Duration::from_millis(10)).is_none());

        let clock = handle.join().unwrap();
        assert_eq!(clock.step_number(), 8);
    }

    #[test]
    fn carried_events_keep_their_order() {
        let clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        let culled = |id| CulledFragment {
            id: FragmentId(id),
            source_body: 0,
            reason: crate::rigid_dynamics::CullReason::BelowMinimumMass,
        };
        let mut older = Snapshot::clone(&clock.latest_snapshot());
        older.new_fragments = vec![FragmentId(0), FragmentId(1)];
        older.culled = vec![culled(0)];
        let mut newer = older.clone();
        newer.step = 1;
        newer.new_fragments = vec![FragmentId(2)];
        newer.culled = vec![culled(1)];

        let merged = carry_events(&older, Arc::new(newer));
        assert_eq!(merged.step, 1);
        assert_eq!(merged.new_fragments, vec![FragmentId(0), FragmentId(1), FragmentId(2)]);
        assert_eq!(merged.culled, vec![culled(0), culled(1)]);

        let quiet = Arc::new(Snapshot::clone(&clock.latest_snapshot()));
        assert!(Arc::ptr_eq(&carry_events(&clock.latest_snapshot(), quiet.clone()), &quiet));
    }

    #[test]
    fn join_stops_unlimited_worker() {
        let clock = SimulationClock::new(serial_params(), &small_scene()).unwrap();
        let mut handle = spawn(clock, None, SnapshotDelivery::Latest).unwrap();
        assert!(handle.recv_snapshot_timeout(Duration::from_secs(60)).is_some());
        let clock = handle.join().unwrap();
        assert!(clock.step_number() >= 1);
    }
}
