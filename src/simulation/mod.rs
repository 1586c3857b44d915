pub mod clock;
pub mod concurrency;
pub mod counters;
pub mod error;
pub mod fracture;
pub mod neighborhood_search;
pub mod rigid_dynamics;
pub mod scene;
pub mod sdf;
pub mod simulation;
pub mod simulation_parameters;
pub mod solver_backend;
pub mod sph_kernels;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, PI, TAU};
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, PI, TAU};
}

use floating_type_mod::FT;

use nalgebra::{SMatrix, SVector, UnitQuaternion};

#[allow(dead_code)]
pub type V<FT, const D: usize> = SVector<FT, D>;
pub type M<FT, const D: usize> = SMatrix<FT, D, D>;

pub type V3 = V<FT, 3>;
pub type VI3 = V<IT, 3>;
pub type M3 = M<FT, 3>;
pub type Q = UnitQuaternion<FT>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub use clock::*;
pub use error::*;
pub use simulation::*;
