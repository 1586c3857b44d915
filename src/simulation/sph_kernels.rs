use crate::{
    floating_type_mod::{FT, PI},
    V3,
};

/**
 * Below this fraction of the support radius the gradient is treated as zero
 * (the direction of `diff` is undefined for coincident particles).
 */
pub const MIN_GRADIENT_DISTANCE_RATIO: FT = 1.0e-5;

/**
 * Cubic spline on q = r / h where h is the support radius.
 * A NaN distance yields NaN, so a corrupted neighbor makes the density sum
 * non-finite.
 */
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q.is_nan() {
        FT::NAN
    } else if q < 0.5 {
        6. * (q * q * q - q * q) + 1.
    } else if q < 1. {
        let v = 1. - q;
        2. * (v * v * v)
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        18. * q * q - 12. * q
    } else if q < 1. {
        let v = 1. - q;
        -6. * v * v
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_second_deriv(q: FT) -> FT {
    if q < 0.5 {
        36. * q - 12.
    } else if q < 1. {
        12. * (1. - q)
    } else {
        0.
    }
}

#[inline(always)]
fn norm_factor(h: FT) -> FT {
    8. / (PI * (h * h * h))
}

/**
 * r is the distance to the center.
 * h is the support radius: W(r, h) = 0 for r >= h.
 */
pub fn cubic_kernel(r: FT, h: FT) -> FT {
    norm_factor(h) * cubic_kernel_unnormalized(r / h)
}

/**
 * Calculate the derivative dW/dx where W=kernel(|x-y|, h) and x-y=diff.
 */
pub fn cubic_kernel_gradient(mut diff: V3, h: FT) -> V3 {
    let r = diff.norm();
    let q: FT = r / h;
    if q <= MIN_GRADIENT_DISTANCE_RATIO || q >= 1. {
        return V3::zeros();
    }
    diff.unscale_mut(r);

    norm_factor(h) * cubic_kernel_unnormalized_deriv(q) / h * diff
}

/**
 * Laplacian of W in 3D: (f''(q) + 2 f'(q) / q) / h^2 scaled by the norm factor.
 * f'(q) / q stays finite for q -> 0 since f'(q) = 18q^2 - 12q near the center.
 */
pub fn cubic_kernel_laplacian(r: FT, h: FT) -> FT {
    let q = r / h;
    if q >= 1. {
        return 0.;
    }
    let deriv_by_q = if q < 0.5 {
        18. * q - 12.
    } else {
        let v = 1. - q;
        -6. * v * v / q
    };
    norm_factor(h) / (h * h) * (cubic_kernel_unnormalized_second_deriv(q) + 2. * deriv_by_q)
}

/// Iterates all integer offsets of a cube with "radius" dist.
pub fn iterate_grid_neighbors(dist: i32, mut f: impl FnMut([i32; 3])) {
    for z in -dist..=dist {
        for y in -dist..=dist {
            for x in -dist..=dist {
                f([x, y, z]);
            }
        }
    }
}

/**
 * Mass per particle such that a particle inside an infinite cubic lattice with
 * the given spacing has exactly the rest density.
 */
pub fn rest_lattice_mass(spacing: FT, h: FT, rest_density: FT) -> FT {
    let range = (h / spacing).ceil() as i32;
    let mut weight_sum = 0.;
    iterate_grid_neighbors(range, |[x, y, z]| {
        let offset = V3::new(x as FT, y as FT, z as FT) * spacing;
        weight_sum += cubic_kernel(offset.norm(), h);
    });
    rest_density / weight_sum
}

#[test]
fn cubic_kernel_3d_integration_test() {
    for h in [0.05, 0.1, 1.0, 2.5] {
        let grid_size = 80;
        let cube_len = 2. * h / grid_size as FT;
        let cube_volume = (cube_len * cube_len * cube_len) as f64;

        let mut integral: f64 = 0.;
        iterate_grid_neighbors(grid_size / 2, |[x, y, z]| {
            if x == grid_size / 2 || y == grid_size / 2 || z == grid_size / 2 {
                return;
            }
            let integration_point = V3::new(
                (x as FT + 0.5) * cube_len,
                (y as FT + 0.5) * cube_len,
                (z as FT + 0.5) * cube_len,
            );
            integral += cubic_kernel(integration_point.norm(), h) as f64 * cube_volume;
        });

        println!("Integration of 3D cubic kernel with h={:.2}: {}", h, integral);
        assert!((integral - 1.).abs() < 2e-3, "h={} integral={}", h, integral);
    }
}

#[test]
fn cubic_kernel_compact_support() {
    let h = 0.3;
    assert!(cubic_kernel(0., h) > 0.);
    assert_eq!(cubic_kernel(h, h), 0.);
    assert_eq!(cubic_kernel(1.5 * h, h), 0.);
    assert_eq!(cubic_kernel_gradient(V3::new(h, 0., 0.), h), V3::zeros());
    assert_eq!(cubic_kernel_laplacian(h * 1.01, h), 0.);
}

#[test]
fn cubic_kernel_passes_nan_through() {
    let h = 0.1;
    assert!(cubic_kernel(FT::NAN, h).is_nan());
    assert!(cubic_kernel_gradient(V3::new(FT::NAN, 0., 0.), h).x.is_nan());
    assert!(cubic_kernel_laplacian(FT::NAN, h).is_nan());
    assert_eq!(cubic_kernel(FT::INFINITY, h), 0.);
}

#[test]
fn cubic_kernel_gradient_is_zero_at_center() {
    let g = cubic_kernel_gradient(V3::zeros(), 0.1);
    assert_eq!(g, V3::zeros());
    let g = cubic_kernel_gradient(V3::new(1e-9, 0., 0.), 0.1);
    assert!(g.iter().all(|x| x.is_finite()));
    assert!(cubic_kernel_laplacian(0., 0.1).is_finite());
}

#[test]
fn cubic_kernel_3d_derivative_test() {
    let h = 1.;
    let test_grid_size = 20;
    let diff = h * 1e-2;
    let diff_half = diff * 0.5;

    let probe_offset = 2.4 * h / test_grid_size as FT;

    iterate_grid_neighbors(test_grid_size / 2, |[x, y, z]| {
        let probe_point = V3::new(
            (x as FT + 0.5) * probe_offset,
            (y as FT + 0.5) * probe_offset,
            (z as FT + 0.5) * probe_offset,
        );

        let analytical_deriv = cubic_kernel_gradient(probe_point, h);

        let w = |p: V3| cubic_kernel(p.norm(), h);
        let approx_deriv = V3::new(
            (w(probe_point + V3::new(diff_half, 0., 0.)) - w(probe_point - V3::new(diff_half, 0., 0.))) / diff,
            (w(probe_point + V3::new(0., diff_half, 0.)) - w(probe_point - V3::new(0., diff_half, 0.))) / diff,
            (w(probe_point + V3::new(0., 0., diff_half)) - w(probe_point - V3::new(0., 0., diff_half))) / diff,
        );
        let absolute_error = analytical_deriv - approx_deriv;

        assert!(
            absolute_error.amax() < 0.01,
            "at {:?}: analytical={:?} approx={:?}",
            probe_point,
            analytical_deriv,
            approx_deriv
        );
    });
}

#[test]
fn cubic_kernel_laplacian_integrates_to_zero() {
    // divergence theorem: the gradient vanishes on the support boundary
    let h = 1.;
    let n = 20000;
    let dr = h / n as FT;
    let mut integral: f64 = 0.;
    let mut abs_integral: f64 = 0.;
    for k in 0..n {
        let r = (k as FT + 0.5) * dr;
        let value = (4. * PI * r * r * cubic_kernel_laplacian(r, h) * dr) as f64;
        integral += value;
        abs_integral += value.abs();
    }
    assert!(abs_integral > 1.);
    assert!(integral.abs() < 1e-3 * abs_integral, "integral={}", integral);
}

#[test]
fn rest_lattice_mass_reproduces_rest_density() {
    let spacing = 0.05;
    let h = 0.1;
    let rest_density = 1000.;
    let mass = rest_lattice_mass(spacing, h, rest_density);
    let mut density = 0.;
    iterate_grid_neighbors(3, |[x, y, z]| {
        let offset = V3::new(x as FT, y as FT, z as FT) * spacing;
        density += mass * cubic_kernel(offset.norm(), h);
    });
    crate::assert_ft_approx_eq(density, rest_density, 0.01, || "lattice density".to_string());
}
