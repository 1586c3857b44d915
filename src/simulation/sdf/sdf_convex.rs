use crate::{floating_type_mod::FT, SimulationError, V3};

/**
 * Solid convex obstacle given as intersection of half-spaces n·x <= offset
 * (normals point out of the solid). Probing returns the largest plane distance,
 * which equals the true distance inside and near faces and underestimates it
 * close to edges and corners.
 */
#[derive(Clone, Debug)]
pub struct SdfConvex {
    planes: Vec<(V3, FT)>,
}

impl SdfConvex {
    pub fn from_planes(planes: impl IntoIterator<Item = (V3, FT)>) -> Result<SdfConvex, SimulationError> {
        let mut normalized = Vec::new();
        for (n, offset) in planes {
            let len = n.norm();
            if !(len.is_finite() && len > 0. && offset.is_finite()) {
                return Err(SimulationError::DegenerateGeometry(format!(
                    "convex boundary plane with normal {:?} and offset {}",
                    n, offset
                )));
            }
            normalized.push((n / len, offset / len));
        }
        if normalized.len() < 4 {
            return Err(SimulationError::DegenerateGeometry(format!(
                "convex boundary needs at least 4 planes, got {}",
                normalized.len()
            )));
        }
        Ok(SdfConvex { planes: normalized })
    }

    pub fn new_box(min: V3, max: V3) -> Result<SdfConvex, SimulationError> {
        if (0..3).any(|d| !(min[d] < max[d])) {
            return Err(SimulationError::DegenerateGeometry(format!(
                "box boundary with min {:?} and max {:?}",
                min, max
            )));
        }
        SdfConvex::from_planes((0..3).flat_map(|d| {
            let mut n = V3::zeros();
            n[d] = 1.;
            [(n, max[d]), (-n, -min[d])]
        }))
    }

    pub fn probe_with_normal(&self, x: V3) -> (FT, V3) {
        let mut best = (FT::NEG_INFINITY, V3::zeros());
        for &(n, offset) in &self.planes {
            let d = n.dot(&x) - offset;
            if d > best.0 {
                best = (d, n);
            }
        }
        best
    }

    pub fn probe(&self, x: V3) -> FT {
        self.probe_with_normal(x).0
    }
}
