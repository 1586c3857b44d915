use thiserror::Error;

use crate::fracture::BodyId;

/// Fatal conditions. Recoverable numerical trouble never ends up here, it is
/// counted in [`StepDiagnostics`](crate::StepDiagnostics) instead.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("invalid impact: {0}")]
    InvalidImpact(String),

    #[error("unknown solid body {0}")]
    UnknownBody(BodyId),

    #[error("simulation diverged: {events} instability events (threshold {threshold})")]
    Diverged { events: usize, threshold: usize },

    #[error("simulation worker stopped")]
    Stopped,

    #[error("simulation worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SimulationError {
    pub fn configuration(field: &str, requirement: &str, value: impl std::fmt::Debug) -> Self {
        SimulationError::Configuration(format!("`{}` must be {} (got {:?})", field, requirement, value))
    }
}
