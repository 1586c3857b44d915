use std::collections::HashMap;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{error, info};

use crate::{
    floating_type_mod::FT,
    fracture::BodyId,
    scene::SceneConfig,
    simulation_parameters::SimulationParams,
    spawn, vec3f, SimulationClock, SimulationError, SnapshotDelivery, V3,
};

use super::vtk_exporter::VtkExporter;

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

const DEFAULT_STEPS: usize = 600;
const PROGRESS_INTERVAL: usize = 60;

fn with_run_options<'a, 'b>(subcommand: App<'a, 'b>) -> App<'a, 'b> {
    subcommand
        .arg(
            Arg::with_name("STEPS")
                .long("steps")
                .short("n")
                .takes_value(true)
                .help("Number of fixed steps to simulate (default 600)"),
        )
        .arg(
            Arg::with_name("MAX_SECONDS")
                .long("max-seconds")
                .short("s")
                .takes_value(true)
                .conflicts_with("STEPS")
                .help("Stop simulation after the given amount of simulated seconds"),
        )
        .arg(
            Arg::with_name("IMPACT")
                .long("impact")
                .short("i")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Impact applied before the given step: BODY,X,Y,Z,IMPULSE,STEP"),
        )
        .arg(
            Arg::with_name("STATISTICS_ENABLED")
                .help("Track performance of individual steps")
                .short("p")
                .long("statistics-enabled")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("STATISTICS_PATH")
                .long("statistics-path")
                .short("w")
                .takes_value(true)
                .help("Where to write statistics to"),
        )
        .arg(
            Arg::with_name("VTK_DIR")
                .long("vtk-dir")
                .takes_value(true)
                .help("Export every snapshot as VTK poly data into this folder"),
        )
}

pub fn start() {
    let matches = App::new("SPH Fracture Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(with_run_options(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation parameters (defaults if omitted)")
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup (demo scene if omitted)")
                        .index(2),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .takes_value(true)
                        .help("Overwrite individual simulation parameters"),
                ),
        ))
        .subcommand(with_run_options(
            SubCommand::with_name("demo").about("Run the built-in scene: fluid block below a destructible cube"),
        ))
        .get_matches();

    let default_level = match matches.occurrences_of("v") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let result = match matches.subcommand() {
        ("run", Some(run_matches)) => run_matches_params(run_matches).and_then(|(params, scene)| {
            run_simulation(params, scene, run_matches)
        }),
        ("demo", Some(demo_matches)) => run_simulation(SimulationParams::default(), SceneConfig::demo(), demo_matches),
        _ => Ok(()),
    };

    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run_matches_params(matches: &ArgMatches) -> Result<(SimulationParams, SceneConfig), SimulationError> {
    let params = load_simulation_params(
        matches.value_of("SIMULATION_CONFIG"),
        matches.value_of("OVERWRITE_CONFIG_FILE"),
    )?;
    let scene = match matches.value_of("SCENE_CONFIG") {
        Some(path) => SceneConfig::from_yaml_file(path)?,
        None => SceneConfig::demo(),
    };
    Ok((params, scene))
}

/**
 * Reads the parameter file (the defaults without one) and replaces the keys
 * given in the overwrite file before deserializing.
 */
fn load_simulation_params(
    path: Option<&str>,
    overwrite_path: Option<&str>,
) -> Result<SimulationParams, SimulationError> {
    let mut simulation_params_serde: serde_yaml::Value = match path {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_yaml::to_value(SimulationParams::default())?,
    };
    if simulation_params_serde.is_null() {
        simulation_params_serde = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }

    if let Some(overwrite_path) = overwrite_path {
        let overwrite_config_str = std::fs::read_to_string(overwrite_path)?;
        let overwrite_config: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(&overwrite_config_str)?;
        let mapping = simulation_params_serde.as_mapping_mut().ok_or_else(|| {
            SimulationError::Configuration(format!(
                "{} does not contain a mapping of parameters",
                path.unwrap_or("<defaults>")
            ))
        })?;
        for (k, v) in overwrite_config.into_iter() {
            mapping.insert(serde_yaml::Value::String(k), v);
        }
    }

    Ok(serde_yaml::from_value(simulation_params_serde)?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Impact {
    body: BodyId,
    point: V3,
    impulse: FT,
    step: usize,
}

fn parse_impact(s: &str) -> Result<Impact, SimulationError> {
    let invalid = || SimulationError::configuration("--impact", "BODY,X,Y,Z,IMPULSE,STEP", s);
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(invalid());
    }
    let number = |i: usize| parts[i].parse::<FT>().map_err(|_| invalid());
    Ok(Impact {
        body: parts[0].parse().map_err(|_| invalid())?,
        point: vec3f(number(1)?, number(2)?, number(3)?),
        impulse: number(4)?,
        step: parts[5].parse().map_err(|_| invalid())?,
    })
}

fn parse_number<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, SimulationError> {
    matches
        .value_of(name)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| SimulationError::configuration(name, "a number", v))
        })
        .transpose()
}

fn run_simulation(params: SimulationParams, scene: SceneConfig, matches: &ArgMatches) -> Result<(), SimulationError> {
    let counters_enabled = matches.is_present("STATISTICS_ENABLED");
    let statistics_path_opt = matches.value_of("STATISTICS_PATH");

    let impacts = matches
        .values_of("IMPACT")
        .into_iter()
        .flatten()
        .map(parse_impact)
        .collect::<Result<Vec<_>, _>>()?;

    let steps = match (parse_number::<usize>(matches, "STEPS")?, parse_number::<FT>(matches, "MAX_SECONDS")?) {
        (Some(steps), _) => steps,
        (None, Some(max_seconds)) => (max_seconds / params.time_step).ceil().max(0.) as usize,
        (None, None) => DEFAULT_STEPS,
    };

    let mut clock = SimulationClock::new(params, &scene)?;
    clock.set_statistics_enabled(counters_enabled);
    for impact in &impacts {
        clock.schedule_fracture(impact.step, impact.body, impact.point, impact.impulse)?;
    }

    let mut vtk_exporter = matches
        .value_of("VTK_DIR")
        .map(|dir| VtkExporter::new(dir, "sph-fracture"))
        .transpose()?;
    if let Some(vtk_exporter) = &mut vtk_exporter {
        vtk_exporter.add_snapshot(&clock.latest_snapshot())?;
    }

    let delivery = if vtk_exporter.is_some() {
        SnapshotDelivery::Every
    } else {
        SnapshotDelivery::Latest
    };

    info!("simulating {} steps", steps);
    let started = std::time::Instant::now();
    let mut handle = spawn(clock, Some(steps), delivery)?;

    // with `Latest` delivery intermediate steps may be skipped
    let mut next_progress = PROGRESS_INTERVAL;
    while let Some(snapshot) = handle.recv_snapshot() {
        if let Some(vtk_exporter) = &mut vtk_exporter {
            vtk_exporter.add_snapshot(&snapshot)?;
        }
        for id in &snapshot.new_fragments {
            info!("{:05}: fragment {} spawned", snapshot.step, id);
        }
        if snapshot.step >= next_progress {
            next_progress = (snapshot.step / PROGRESS_INTERVAL + 1) * PROGRESS_INTERVAL;
            info!(
                "{:05}: t={:.3}s {} fluid particles, {} fragments, {} intact bodies, {} substeps",
                snapshot.step,
                snapshot.time,
                snapshot.particle_positions.len(),
                snapshot.fragments.len(),
                snapshot.intact_bodies.len(),
                snapshot.diagnostics.courant_substeps
            );
        }
    }

    let clock = handle.join()?;
    info!(
        "finished {} steps ({:.3}s simulated) in {:.2}s wall time, {} instability events",
        clock.step_number(),
        clock.time(),
        started.elapsed().as_secs_f64(),
        clock.instability_events()
    );

    if counters_enabled {
        let s = clock.statistics();
        print!("{}", s);
        if let Some(statistics_path) = statistics_path_opt {
            std::fs::write(statistics_path, s)?;
        }
    }

    Ok(())
}
