use std::collections::HashSet;

use crate::{floating_type_mod::FT, SimulationError, M3, V3};

/// Relative tolerance (times the diameter) for plane classification and vertex merging.
const GEOMETRY_EPS: FT = 1e-5;

/// Volume, centroid and inertia tensor (about the centroid) of a solid with unit density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassProperties {
    pub volume: FT,
    pub centroid: V3,
    pub inertia_unit_density: M3,
}

impl MassProperties {
    pub fn mass(&self, density: FT) -> FT {
        self.volume * density
    }

    pub fn inertia(&self, density: FT) -> M3 {
        self.inertia_unit_density * density
    }
}

/**
 * Closed convex polyhedron stored as a list of planar faces. The vertices of
 * every face are ordered counter-clockwise when looking at the face from
 * outside, so the right-hand normal points out of the solid.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ConvexPolyhedron {
    faces: Vec<Vec<V3>>,
}

fn face_area_vector(face: &[V3]) -> V3 {
    let p0 = face[0];
    let mut n = V3::zeros();
    for k in 1..face.len() - 1 {
        n += (face[k] - p0).cross(&(face[k + 1] - p0));
    }
    n * 0.5
}

fn dedup_points(points: &mut Vec<V3>, eps: FT) {
    let mut unique: Vec<V3> = Vec::with_capacity(points.len());
    for &p in points.iter() {
        if !unique.iter().any(|q| (p - *q).norm() <= eps) {
            unique.push(p);
        }
    }
    *points = unique;
}

impl ConvexPolyhedron {
    pub fn cuboid(center: V3, half_extents: V3) -> Result<ConvexPolyhedron, SimulationError> {
        if !half_extents.iter().all(|&h| h.is_finite() && h > 0.) || !center.iter().all(|c| c.is_finite()) {
            return Err(SimulationError::DegenerateGeometry(format!(
                "cuboid at {:?} with half extents {:?}",
                center, half_extents
            )));
        }

        let mut faces = Vec::with_capacity(6);
        for a in 0..3 {
            let b = (a + 1) % 3;
            let c = (a + 2) % 3;
            for s in [1., -1.] {
                let mut quad: Vec<V3> = [(-1., -1.), (1., -1.), (1., 1.), (-1., 1.)]
                    .iter()
                    .map(|&(u, v)| {
                        let mut p = V3::zeros();
                        p[a] = s * half_extents[a];
                        p[b] = u * half_extents[b];
                        p[c] = v * half_extents[c];
                        center + p
                    })
                    .collect();
                // e_b x e_c = e_a, the quad above faces +e_a
                if s < 0. {
                    quad.reverse();
                }
                faces.push(quad);
            }
        }
        Ok(ConvexPolyhedron { faces })
    }

    /**
     * Builds a polyhedron from an indexed mesh. The mesh must be closed and
     * manifold (every directed edge has exactly one opposite twin), faces must
     * be oriented outwards and the solid must be convex with positive volume.
     */
    pub fn from_mesh(vertices: &[V3], faces: &[Vec<usize>]) -> Result<ConvexPolyhedron, SimulationError> {
        let degenerate = |msg: String| Err(SimulationError::DegenerateGeometry(msg));

        if vertices.iter().any(|v| !v.iter().all(|c| c.is_finite())) {
            return degenerate("mesh has non-finite vertices".to_string());
        }
        if faces.len() < 4 {
            return degenerate(format!("mesh has {} faces, a closed solid needs at least 4", faces.len()));
        }

        let mut edges = HashSet::new();
        for (f, face) in faces.iter().enumerate() {
            if face.len() < 3 {
                return degenerate(format!("face {} has {} vertices", f, face.len()));
            }
            for k in 0..face.len() {
                let a = face[k];
                let b = face[(k + 1) % face.len()];
                if a >= vertices.len() || b >= vertices.len() {
                    return degenerate(format!("face {} references a vertex out of range", f));
                }
                if a == b {
                    return degenerate(format!("face {} repeats vertex {}", f, a));
                }
                if !edges.insert((a, b)) {
                    return degenerate(format!("directed edge ({}, {}) is used twice (non-manifold or inconsistently oriented)", a, b));
                }
            }
        }
        if let Some((a, b)) = edges.iter().find(|(a, b)| !edges.contains(&(*b, *a))) {
            return degenerate(format!("edge ({}, {}) has no opposite edge (mesh is not closed)", a, b));
        }

        let polyhedron = ConvexPolyhedron {
            faces: faces
                .iter()
                .map(|face| face.iter().map(|&i| vertices[i]).collect())
                .collect(),
        };

        let eps = GEOMETRY_EPS * polyhedron.diameter().max(FT::MIN_POSITIVE);
        for (f, face) in polyhedron.faces.iter().enumerate() {
            let area = face_area_vector(face);
            if area.norm() <= eps * eps {
                return degenerate(format!("face {} has zero area", f));
            }
            let n = area.normalize();
            let outside = polyhedron
                .faces
                .iter()
                .flatten()
                .any(|v| n.dot(&(v - face[0])) > 10. * eps);
            if outside {
                return degenerate(format!("mesh is not convex or face {} points inwards", f));
            }
        }

        if polyhedron.volume() <= 0. {
            return degenerate("mesh has no volume".to_string());
        }

        Ok(polyhedron)
    }

    pub fn faces(&self) -> &[Vec<V3>] {
        &self.faces
    }

    /// Distinct vertices (merged within a small tolerance).
    pub fn vertices(&self) -> Vec<V3> {
        let mut points: Vec<V3> = self.faces.iter().flatten().cloned().collect();
        dedup_points(&mut points, GEOMETRY_EPS * self.diameter());
        points
    }

    pub fn to_indexed(&self) -> (Vec<V3>, Vec<Vec<usize>>) {
        let eps = GEOMETRY_EPS * self.diameter();
        let vertices = self.vertices();
        let faces = self
            .faces
            .iter()
            .map(|face| {
                let mut indices: Vec<usize> = face
                    .iter()
                    .filter_map(|p| vertices.iter().position(|q| (p - q).norm() <= eps))
                    .collect();
                indices.dedup();
                if indices.len() > 1 && indices.first() == indices.last() {
                    indices.pop();
                }
                indices
            })
            .filter(|indices| indices.len() >= 3)
            .collect();
        (vertices, faces)
    }

    pub fn aabb(&self) -> (V3, V3) {
        let mut min = V3::from_element(FT::INFINITY);
        let mut max = V3::from_element(FT::NEG_INFINITY);
        for p in self.faces.iter().flatten() {
            min = min.inf(p);
            max = max.sup(p);
        }
        (min, max)
    }

    /// Diagonal of the bounding box.
    pub fn diameter(&self) -> FT {
        let (min, max) = self.aabb();
        (max - min).norm()
    }

    pub fn translated(&self, offset: V3) -> ConvexPolyhedron {
        ConvexPolyhedron {
            faces: self
                .faces
                .iter()
                .map(|face| face.iter().map(|p| p + offset).collect())
                .collect(),
        }
    }

    pub fn contains(&self, x: V3) -> bool {
        let eps = GEOMETRY_EPS * self.diameter();
        self.faces.iter().all(|face| {
            let n = face_area_vector(face).normalize();
            n.dot(&(x - face[0])) <= eps
        })
    }

    pub fn volume(&self) -> FT {
        self.mass_properties().volume
    }

    /**
     * Decomposes the solid into tetrahedra (vertex mean, fan triangle of a face)
     * and sums their volumes, first moments and covariance matrices.
     */
    pub fn mass_properties(&self) -> MassProperties {
        let vertex_count = self.faces.iter().map(|f| f.len()).sum::<usize>().max(1);
        let r0 = self.faces.iter().flatten().fold(V3::zeros(), |acc, p| acc + p) / vertex_count as FT;

        let mut volume: FT = 0.;
        let mut first_moment = V3::zeros();
        let mut covariance = M3::zeros();

        for face in &self.faces {
            let a = face[0] - r0;
            for k in 1..face.len() - 1 {
                let b = face[k] - r0;
                let c = face[k + 1] - r0;
                let v = a.dot(&b.cross(&c)) / 6.;
                let sum = a + b + c;
                volume += v;
                first_moment += v * sum / 4.;
                covariance += v / 20. * (a * a.transpose() + b * b.transpose() + c * c.transpose() + sum * sum.transpose());
            }
        }

        if volume <= 0. || !volume.is_finite() {
            return MassProperties {
                volume: 0.,
                centroid: r0,
                inertia_unit_density: M3::zeros(),
            };
        }

        let offset = first_moment / volume;
        let covariance_centroid = covariance - volume * offset * offset.transpose();
        MassProperties {
            volume,
            centroid: r0 + offset,
            inertia_unit_density: M3::identity() * covariance_centroid.trace() - covariance_centroid,
        }
    }

    /**
     * Intersects the solid with the half-space n·x <= d. Returns `None` if
     * nothing with positive volume remains.
     */
    pub fn clip(&self, n: V3, d: FT) -> Option<ConvexPolyhedron> {
        let eps = GEOMETRY_EPS * self.diameter();
        let side = |p: &V3| {
            let dist = n.dot(p) - d;
            if dist > eps {
                1
            } else if dist < -eps {
                -1
            } else {
                0
            }
        };

        let sides: Vec<Vec<i32>> = self.faces.iter().map(|f| f.iter().map(side).collect()).collect();
        if sides.iter().flatten().all(|&s| s <= 0) {
            return Some(self.clone());
        }
        if sides.iter().flatten().all(|&s| s >= 0) {
            return None;
        }

        let mut faces = Vec::with_capacity(self.faces.len() + 1);
        let mut cap = Vec::new();
        let mut face_on_plane = false;

        for (face, face_sides) in self.faces.iter().zip(sides.iter()) {
            let mut clipped = Vec::with_capacity(face.len() + 2);
            for k in 0..face.len() {
                let kn = (k + 1) % face.len();
                let (p, q) = (face[k], face[kn]);
                let (sp, sq) = (face_sides[k], face_sides[kn]);
                if sp <= 0 {
                    clipped.push(p);
                }
                if sp == 0 {
                    cap.push(p);
                }
                if sp * sq < 0 {
                    let dp = n.dot(&p) - d;
                    let dq = n.dot(&q) - d;
                    let x = p + (q - p) * (dp / (dp - dq));
                    clipped.push(x);
                    cap.push(x);
                }
            }
            if face_sides.iter().all(|&s| s == 0) {
                face_on_plane = true;
            }
            dedup_points(&mut clipped, eps);
            if clipped.len() >= 3 && face_area_vector(&clipped).norm() > eps * eps {
                faces.push(clipped);
            }
        }

        dedup_points(&mut cap, eps);
        if !face_on_plane && cap.len() >= 3 {
            let center = cap.iter().fold(V3::zeros(), |acc, p| acc + p) / cap.len() as FT;
            let n_hat = n.normalize();
            let u = (cap[0] - center).normalize();
            let v = n_hat.cross(&u);
            // u x v = n, ascending angle is counter-clockwise seen from +n (outside)
            cap.sort_by(|a, b| {
                let angle = |p: &V3| (p - center).dot(&v).atan2((p - center).dot(&u));
                angle(a).partial_cmp(&angle(b)).unwrap_or(std::cmp::Ordering::Equal)
            });
            if face_area_vector(&cap).norm() > eps * eps {
                faces.push(cap);
            }
        }

        if faces.len() < 4 {
            return None;
        }
        let result = ConvexPolyhedron { faces };
        if result.volume() <= eps * eps * eps {
            return None;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_ft_approx_eq, vec3f};

    fn tetrahedron() -> (Vec<V3>, Vec<Vec<usize>>) {
        let vertices = vec![
            vec3f(0., 0., 0.),
            vec3f(1., 0., 0.),
            vec3f(0., 1., 0.),
            vec3f(0., 0., 1.),
        ];
        let faces = vec![vec![0, 2, 1], vec![0, 1, 3], vec![0, 3, 2], vec![1, 2, 3]];
        (vertices, faces)
    }

    #[test]
    fn cuboid_mass_properties() {
        let cube = ConvexPolyhedron::cuboid(vec3f(0., 2., 0.), vec3f(0.5, 0.5, 1.)).unwrap();
        let props = cube.mass_properties();
        assert_ft_approx_eq(props.volume, 2., 1e-5, || "volume".to_string());
        assert!((props.centroid - vec3f(0., 2., 0.)).norm() < 1e-5);

        // I_xx = m (b^2 + c^2) / 12 with full side lengths
        let i = props.inertia_unit_density;
        assert_ft_approx_eq(i[(0, 0)], 2. * (1. + 4.) / 12., 1e-4, || "Ixx".to_string());
        assert_ft_approx_eq(i[(1, 1)], 2. * (1. + 4.) / 12., 1e-4, || "Iyy".to_string());
        assert_ft_approx_eq(i[(2, 2)], 2. * (1. + 1.) / 12., 1e-4, || "Izz".to_string());
        assert!(i[(0, 1)].abs() < 1e-5);

        assert!(cube.contains(vec3f(0.4, 2.4, -0.9)));
        assert!(!cube.contains(vec3f(0.6, 2., 0.)));
        assert_eq!(cube.vertices().len(), 8);
        let (vertices, faces) = cube.to_indexed();
        let rebuilt = ConvexPolyhedron::from_mesh(&vertices, &faces).unwrap();
        assert_ft_approx_eq(rebuilt.volume(), 2., 1e-5, || "rebuilt volume".to_string());
    }

    #[test]
    fn tetrahedron_from_mesh() {
        let (vertices, faces) = tetrahedron();
        let tet = ConvexPolyhedron::from_mesh(&vertices, &faces).unwrap();
        let props = tet.mass_properties();
        assert_ft_approx_eq(props.volume, 1. / 6., 1e-6, || "volume".to_string());
        assert!((props.centroid - V3::from_element(0.25)).norm() < 1e-6);
    }

    #[test]
    fn invalid_meshes_are_rejected() {
        let (vertices, faces) = tetrahedron();

        // open
        let r = ConvexPolyhedron::from_mesh(&vertices, &faces[..3]);
        assert!(matches!(r, Err(SimulationError::DegenerateGeometry(_))));

        // one face flipped
        let mut flipped = faces.clone();
        flipped[3].reverse();
        let r = ConvexPolyhedron::from_mesh(&vertices, &flipped);
        assert!(matches!(r, Err(SimulationError::DegenerateGeometry(_))));

        // all faces flipped: closed and manifold but inside out
        let inverted: Vec<Vec<usize>> = faces.iter().map(|f| f.iter().rev().cloned().collect()).collect();
        let r = ConvexPolyhedron::from_mesh(&vertices, &inverted);
        assert!(matches!(r, Err(SimulationError::DegenerateGeometry(_))));

        let mut out_of_range = faces.clone();
        out_of_range[0][0] = 17;
        let r = ConvexPolyhedron::from_mesh(&vertices, &out_of_range);
        assert!(matches!(r, Err(SimulationError::DegenerateGeometry(_))));

        // bipyramid whose lower apex is pushed up into the solid
        let a = vec3f(1., 0., 0.);
        let b = vec3f(0., 1., 0.);
        let c = vec3f(-1., -1., 0.);
        let dented = vec![a, b, c, vec3f(0., 0., 1.), vec3f(0., 0., 0.5)];
        let faces_dented = vec![
            vec![0, 1, 3],
            vec![1, 2, 3],
            vec![2, 0, 3],
            vec![1, 0, 4],
            vec![2, 1, 4],
            vec![0, 2, 4],
        ];
        let r = ConvexPolyhedron::from_mesh(&dented, &faces_dented);
        assert!(matches!(r, Err(SimulationError::DegenerateGeometry(_))));

        // same mesh with the apex below the base is fine
        let mut bipyramid = dented.clone();
        bipyramid[4] = vec3f(0., 0., -1.);
        ConvexPolyhedron::from_mesh(&bipyramid, &faces_dented).unwrap();
    }

    #[test]
    fn clipping_cube() {
        let cube = ConvexPolyhedron::cuboid(V3::zeros(), vec3f(1., 1., 1.)).unwrap();

        let half = cube.clip(vec3f(1., 0., 0.), 0.).unwrap();
        assert_ft_approx_eq(half.volume(), 4., 1e-4, || "half".to_string());
        assert_eq!(half.faces().len(), 6);

        // corner cut: tetrahedron with legs of length 1 removed
        let cut = cube.clip(vec3f(1., 1., 1.), 2.).unwrap();
        assert_ft_approx_eq(cut.volume(), 8. - 1. / 6., 1e-4, || "corner".to_string());
        assert_eq!(cut.faces().len(), 7);

        // diagonal plane through the center
        let diag = cube.clip(vec3f(1., 1., 1.), 0.).unwrap();
        assert_ft_approx_eq(diag.volume(), 4., 1e-4, || "diagonal".to_string());

        assert!(cube.clip(vec3f(0., 1., 0.), -1.).is_none());
        assert!(cube.clip(vec3f(0., 1., 0.), -2.).is_none());
        assert_eq!(cube.clip(vec3f(0., 1., 0.), 1.).unwrap(), cube);

        // clipped result is a valid closed mesh again
        let (vertices, faces) = cut.to_indexed();
        ConvexPolyhedron::from_mesh(&vertices, &faces).unwrap();
    }
}
