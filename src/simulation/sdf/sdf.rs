use crate::{floating_type_mod::FT, V3};

use super::{SdfConvex, SdfPlane};

/**
 * Static boundary geometry. `probe` is positive in free space and negative
 * inside the boundary; the normal returned with it points towards free space.
 */
#[derive(Clone, Debug)]
pub enum Sdf {
    SdfPlane(SdfPlane),
    SdfConvex(SdfConvex),
}

impl From<SdfPlane> for Sdf {
    fn from(v: SdfPlane) -> Sdf {
        Sdf::SdfPlane(v)
    }
}

impl From<SdfConvex> for Sdf {
    fn from(v: SdfConvex) -> Sdf {
        Sdf::SdfConvex(v)
    }
}

impl Sdf {
    pub fn probe(&self, x: V3) -> FT {
        match self {
            Sdf::SdfPlane(sdf) => sdf.probe(x),
            Sdf::SdfConvex(sdf) => sdf.probe(x),
        }
    }

    pub fn probe_with_normal(&self, x: V3) -> (FT, V3) {
        match self {
            Sdf::SdfPlane(sdf) => sdf.probe_with_normal(x),
            Sdf::SdfConvex(sdf) => sdf.probe_with_normal(x),
        }
    }

    /**
     * This gradient is NOT normalized.
     */
    pub fn finite_diff_gradient(&self, x: V3, eps: FT) -> V3 {
        let inv_2eps = 1. / (2. * eps);

        let iter = (0..3).map(|i| {
            let mut xp = x;
            let mut xn = x;
            xp[i] += eps;
            xn[i] -= eps;
            (self.probe(xp) - self.probe(xn)) * inv_2eps
        });

        V3::from_iterator(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;

    #[test]
    fn normals_match_finite_differences() {
        let sdfs: Vec<Sdf> = vec![
            SdfPlane::new(vec3f(0., 1., 0.), 1.).into(),
            SdfPlane::new(vec3f(-1., 1., 0.), 0.3).into(),
            SdfConvex::new_box(vec3f(-0.5, -0.5, -0.5), vec3f(0.5, 1., 0.5)).unwrap().into(),
        ];
        // points away from edges so the max-plane field is differentiable
        let points = [vec3f(0.1, 0.2, 0.05), vec3f(0.9, 0.1, -0.1), vec3f(-0.1, -1.5, 0.2)];
        for sdf in &sdfs {
            for &x in &points {
                let (_, n) = sdf.probe_with_normal(x);
                let g = sdf.finite_diff_gradient(x, 1e-3);
                assert!((n - g).norm() < 1e-2, "normal {:?} gradient {:?} at {:?}", n, g, x);
            }
        }
    }

    #[test]
    fn boundary_sign_convention() {
        let ground: Sdf = SdfPlane::new(vec3f(0., 1., 0.), 1.).into();
        assert!(ground.probe(vec3f(0., 0., 0.)) > 0.);
        assert!(ground.probe(vec3f(0., -1.5, 0.)) < 0.);

        let obstacle: Sdf = SdfConvex::new_box(vec3f(-1., -1., -1.), vec3f(1., 1., 1.)).unwrap().into();
        assert!(obstacle.probe(vec3f(0., 0., 0.)) < 0.);
        assert!(obstacle.probe(vec3f(2., 0., 0.)) > 0.);
        let (d, n) = obstacle.probe_with_normal(vec3f(0., 0.9, 0.));
        assert!((d + 0.1).abs() < 1e-5);
        assert_eq!(n, vec3f(0., 1., 0.));
    }

    #[test]
    fn degenerate_convex_boundaries_are_rejected() {
        assert!(SdfConvex::new_box(vec3f(0., 0., 0.), vec3f(1., 0., 1.)).is_err());
        assert!(SdfConvex::from_planes(vec![(V3::zeros(), 1.); 4]).is_err());
    }
}
