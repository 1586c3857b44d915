pub use self::{sdf::Sdf, sdf_convex::SdfConvex, sdf_plane::SdfPlane};

mod sdf;
mod sdf_convex;
mod sdf_plane;
