/*!
Real-time simulation core for deformable and destructible phenomena: an SPH fluid
solver and a Voronoi based rigid-body fracture system driven by a fixed-step clock.
*/

mod platform;
mod simulation;

pub use simulation::*;

pub use platform::start;
