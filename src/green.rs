//! Analytical Green and coupling integrals between voxel pairs.
//!
//! Two integrals of `1/(4*pi*|r-r'|)` are computed with closed-form
//! expressions (Hoer/Love corner sums):
//!   - the volume-volume integral (both voxels fully integrated),
//!     used for the inductance and potential operators
//!   - the area-volume integral (one face integrated against a
//!     volume), used for the electric-magnetic coupling operator
//!
//! Far voxel pairs are replaced by a monopole approximation: this is
//! a pure performance/accuracy trade-off controlled by the normalized
//! distance threshold `integral_simplify`.
//!
//! The corner-sum kernels contain terms of the form `log(q+r)`,
//! `atan(p/q)`, `1/r`, and `1/(q+r)` that become singular on the
//! coordinate axes. The zero cases are handled explicitly, so the
//! kernels never produce a non-finite intermediate value.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::fft::Tensor4;
use crate::voxel::VoxelGrid;

/// Inverse with the zero case mapped to zero.
#[inline]
fn safe_inv(x: f64) -> f64 {
    if x == 0. {
        0.
    } else {
        1. / x
    }
}

/// Logarithm of `q + nrm` with non-positive arguments mapped to zero.
///
/// Since `nrm >= |q|`, the argument can only vanish on the negative
/// half-axis (`q <= 0`, `nrm == -q`), where the kernel weight of the
/// term vanishes as well.
#[inline]
fn safe_log(q: f64, nrm: f64) -> f64 {
    let arg = q + nrm;
    if arg <= 0. {
        0.
    } else {
        arg.ln()
    }
}

/// Arctangent of `num/den` with the zero denominator handled
/// explicitly: `0/0` is zero, `p/0` is the `±pi/2` limit.
#[inline]
fn safe_atan(num: f64, den: f64) -> f64 {
    if den == 0. {
        if num == 0. {
            0.
        } else {
            FRAC_PI_2.copysign(num)
        }
    } else {
        (num / den).atan()
    }
}

/// Volume-volume kernel evaluated at a corner distance.
fn kernel_6d(x: f64, y: f64, z: f64) -> f64 {
    let nrm = (x * x + y * y + z * z).sqrt();
    let atanx = safe_atan(y * z, x * nrm);
    let atany = safe_atan(x * z, y * nrm);
    let atanz = safe_atan(x * y, z * nrm);
    let logx = safe_log(x, nrm);
    let logy = safe_log(y, nrm);
    let logz = safe_log(z, nrm);

    let (x2, y2, z2) = (x * x, y * y, z * z);
    let (x3, y3, z3) = (x2 * x, y2 * y, z2 * z);
    let (x4, y4, z4) = (x3 * x, y3 * y, z3 * z);

    (x4 * nrm) / 60.
        + (y4 * nrm) / 60.
        + (z4 * nrm) / 60.
        - (x * y4 * logx) / 24.
        - (x * z4 * logx) / 24.
        - (x4 * y * logy) / 24.
        - (y * z4 * logy) / 24.
        - (x4 * z * logz) / 24.
        - (y4 * z * logz) / 24.
        - (x2 * y2 * nrm) / 20.
        - (x2 * z2 * nrm) / 20.
        - (y2 * z2 * nrm) / 20.
        + (x * y2 * z2 * logx) / 4.
        + (x2 * y * z2 * logy) / 4.
        + (x2 * y2 * z * logz) / 4.
        - (x * y * z3 * atanz) / 6.
        - (x * y3 * z * atany) / 6.
        - (x3 * y * z * atanx) / 6.
}

/// Area-volume kernel evaluated at a corner distance.
///
/// The integrated face is perpendicular to the third (z) axis; other
/// orientations are obtained by permuting the arguments.
fn kernel_5d(x: f64, y: f64, z: f64) -> f64 {
    let nrm = (x * x + y * y + z * z).sqrt();
    let inv = safe_inv(nrm);
    let invx = safe_inv(x + nrm);
    let invy = safe_inv(y + nrm);
    let invxz = safe_inv(x * x + z * z);
    let invyz = safe_inv(y * y + z * z);
    let invxyz = safe_inv(x * x * y * y + x * x * z * z + y * y * z * z + z * z * z * z);
    let logx = safe_log(x, nrm);
    let logy = safe_log(y, nrm);
    let logz = safe_log(z, nrm);
    let atanx = safe_atan(y * z, x * nrm);
    let atany = safe_atan(x * z, y * nrm);
    let atanz = safe_atan(x * y, z * nrm);

    let (x2, y2, z2) = (x * x, y * y, z * z);
    let (x3, y3, z3) = (x2 * x, y2 * y, z2 * z);
    let (x4, y4, _z4) = (x3 * x, y3 * y, z3 * z);
    let z5 = z3 * z2;

    (z3 * nrm) / 15.
        + (z5 * inv) / 60.
        - (x4 * logz) / 24.
        - (y4 * logz) / 24.
        - (x * z3 * logx) / 6.
        - (y * z3 * logy) / 6.
        + (x2 * y2 * logz) / 4.
        + (x * y2 * z * logx) / 2.
        + (x2 * y * z * logy) / 2.
        - (x * y3 * atany) / 6.
        - (x3 * y * atanx) / 6.
        - (x * y * z2 * atanz) / 2.
        - (x2 * z3 * inv) / 20.
        - (y2 * z3 * inv) / 20.
        - (x2 * z * nrm) / 10.
        - (y2 * z * nrm) / 10.
        - (x4 * z * inv) / 40.
        - (y4 * z * inv) / 40.
        + (x2 * y2 * z * inv) / 5.
        - (x * z5 * inv * invx) / 24.
        - (y * z5 * inv * invy) / 24.
        - (x4 * y2 * z * inv * invxz) / 6.
        - (x2 * y4 * z * inv * invyz) / 6.
        + (x * y2 * z3 * inv * invx) / 4.
        + (x2 * y * z3 * inv * invy) / 4.
        - (x * y4 * z * inv * invx) / 24.
        - (x4 * y * z * inv * invy) / 24.
        + (x2 * y2 * z5 * inv * invxyz) / 3.
        + (x2 * y4 * z3 * inv * invxyz) / 6.
        + (x4 * y2 * z3 * inv * invxyz) / 6.
}

// corner offsets for the integrated axes: the zero offset is counted
// twice with alternating signs, producing the [1, -2, 1] weights
const OFFSET_FULL: [f64; 4] = [-1., 0., 1., 0.];
// corner offsets for the non-integrated axis of the area-volume form
const OFFSET_HALF: [f64; 2] = [0.5, -0.5];

/// Analytical volume-volume integral for the voxel offset `m`.
pub fn green_ana_6d(d: [f64; 3], m: [f64; 3]) -> f64 {
    let mut val = 0.;
    for (i, ox) in OFFSET_FULL.iter().enumerate() {
        for (j, oy) in OFFSET_FULL.iter().enumerate() {
            for (k, oz) in OFFSET_FULL.iter().enumerate() {
                let sign = if (i + j + k) % 2 == 0 { 1. } else { -1. };
                val += sign
                    * kernel_6d(
                        d[0] * (m[0] + ox),
                        d[1] * (m[1] + oy),
                        d[2] * (m[2] + oz),
                    );
            }
        }
    }
    val / (4. * PI)
}

/// Analytical area-volume integral for the voxel offset `m`.
pub fn green_ana_5d(d: [f64; 3], m: [f64; 3]) -> f64 {
    let mut val = 0.;
    for (i, ox) in OFFSET_FULL.iter().enumerate() {
        for (j, oy) in OFFSET_FULL.iter().enumerate() {
            for (k, oz) in OFFSET_HALF.iter().enumerate() {
                let sign = if (i + j + k) % 2 == 0 { 1. } else { -1. };
                val += sign
                    * kernel_5d(
                        d[0] * (m[0] + ox),
                        d[1] * (m[1] + oy),
                        d[2] * (m[2] + oz),
                    );
            }
        }
    }
    val / (4. * PI)
}

/// Monopole approximation of the volume-volume integral.
pub fn green_num_6d(d: [f64; 3], m: [f64; 3]) -> f64 {
    let vol = d[0] * d[1] * d[2];
    let dis = distance(d, m);
    (vol * vol) / (4. * PI * dis)
}

/// Monopole approximation of the area-volume integral.
pub fn green_num_5d(d: [f64; 3], m: [f64; 3]) -> f64 {
    let vol = d[0] * d[1] * d[2];
    let dis = distance(d, m);
    (d[0] * d[1] * vol) / (4. * PI * dis)
}

/// Physical distance of a voxel offset.
fn distance(d: [f64; 3], m: [f64; 3]) -> f64 {
    let (x, y, z) = (d[0] * m[0], d[1] * m[1], d[2] * m[2]);
    (x * x + y * y + z * z).sqrt()
}

/// Normalized center distance used for the simplification threshold.
fn normalized_distance(d: [f64; 3], m: [f64; 3]) -> f64 {
    let d_max = d[0].max(d[1]).max(d[2]);
    distance(d, m) / d_max
}

/// Self-coefficient of the Green function (zero offset).
pub fn green_self(d: [f64; 3]) -> f64 {
    green_ana_6d(d, [0., 0., 0.])
}

/// Green tensor for the complete voxel structure.
///
/// The tensor has the shape `(nx, ny, nz, 1)`; the entry at the
/// offset `(ix, iy, iz)` couples two voxels separated by that offset,
/// with the self-coefficient at the origin.
pub fn green_tensor(grid: &VoxelGrid, integral_simplify: f64) -> Tensor4 {
    let [nx, ny, nz] = grid.n;
    let d = grid.d;
    let mut tsr = Tensor4::zeros(nx, ny, nz, 1);
    let mut n_num = 0usize;

    for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                let m = [ix as f64, iy as f64, iz as f64];
                let val = if normalized_distance(d, m) <= integral_simplify {
                    green_ana_6d(d, m)
                } else {
                    n_num += 1;
                    green_num_6d(d, m)
                };
                tsr.set(ix, iy, iz, 0, val);
            }
        }
    }

    log::debug!(
        "green tensor: {} analytical / {} approximated",
        grid.voxel_count() - n_num,
        n_num
    );
    tsr
}

// axis permutations mapping each face orientation onto the xy-face
// form of the area-volume kernel, with the corresponding area scaling
// (component order: yz, xz, xy)
const PERM: [[usize; 3]; 3] = [[1, 2, 0], [0, 2, 1], [0, 1, 2]];

fn coupling_component(d: [f64; 3], m: [f64; 3], cmp: usize, analytical: bool) -> f64 {
    let perm = PERM[cmp];
    let d_tmp = [d[perm[0]], d[perm[1]], d[perm[2]]];
    let m_tmp = [m[perm[0]], m[perm[1]], m[perm[2]]];

    // the non-integrated axis is reduced to a half-voxel difference
    let m_lo = [m_tmp[0], m_tmp[1], m_tmp[2] - 0.5];
    let m_hi = [m_tmp[0], m_tmp[1], m_tmp[2] + 0.5];

    let val = if analytical {
        green_ana_5d(d_tmp, m_lo) - green_ana_5d(d_tmp, m_hi)
    } else {
        green_num_5d(d_tmp, m_lo) - green_num_5d(d_tmp, m_hi)
    };

    let (dx, dy, dz) = (d[0], d[1], d[2]);
    match cmp {
        0 => val / (dx * dz * dx * dy),
        1 => -val / (dy * dz * dx * dy),
        2 => val / (dy * dz * dx * dz),
        _ => unreachable!("invalid coupling component"),
    }
}

/// Coupling tensor for the complete voxel structure.
///
/// The tensor has the shape `(nx, ny, nz, 3)` with one component per
/// integrated face normal (yz, xz, xy).
pub fn coupling_tensor(grid: &VoxelGrid, integral_simplify: f64) -> Tensor4 {
    let [nx, ny, nz] = grid.n;
    let d = grid.d;
    let mut tsr = Tensor4::zeros(nx, ny, nz, 3);

    for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                let m = [ix as f64, iy as f64, iz as f64];
                let analytical = normalized_distance(d, m) <= integral_simplify;
                for cmp in 0..3 {
                    tsr.set(ix, iy, iz, cmp, coupling_component(d, m, cmp, analytical));
                }
            }
        }
    }
    tsr
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn self_coefficient_unit_cube() {
        // the double volume integral of 1/|r-r'| over the unit cube
        // is 1.88231264..., the self-coefficient divides it by 4*pi
        let g = green_self([1., 1., 1.]);
        assert_relative_eq!(g, 1.88231264 / (4. * PI), max_relative = 1e-6);
    }

    #[test]
    fn self_coefficient_scales_with_size() {
        // the 6-D integral scales with the fifth power of the length
        let g1 = green_self([1., 1., 1.]);
        let g2 = green_self([2., 2., 2.]);
        assert_relative_eq!(g2, 32. * g1, max_relative = 1e-10);
    }

    #[test]
    fn reflection_symmetry() {
        let d = [1e-3, 2e-3, 1.5e-3];
        let g_ref = green_ana_6d(d, [2., 1., 3.]);
        for m in [
            [-2., 1., 3.],
            [2., -1., 3.],
            [2., 1., -3.],
            [-2., -1., -3.],
        ] {
            assert_relative_eq!(green_ana_6d(d, m), g_ref, max_relative = 1e-9);
        }
    }

    #[test]
    fn far_field_matches_monopole() {
        let d = [1e-3, 1e-3, 1e-3];
        let m = [40., 10., 5.];
        let ana = green_ana_6d(d, m);
        let num = green_num_6d(d, m);
        assert_relative_eq!(ana, num, max_relative = 1e-4);
    }

    #[test]
    fn far_field_matches_monopole_5d() {
        let d = [1e-3, 1e-3, 1e-3];
        let m = [35., 12., 8.];
        let ana = green_ana_5d(d, m);
        let num = green_num_5d(d, m);
        assert_relative_eq!(ana, num, max_relative = 1e-3);
    }

    #[test]
    fn kernels_finite_on_axes() {
        // points on the axes hit every guarded singular term
        for p in [
            [0., 0., 0.],
            [1., 0., 0.],
            [0., 1., 0.],
            [0., 0., 1.],
            [1., 1., 0.],
            [0., 1., 1.],
            [-1., 0., 0.],
            [0., 0., -2.],
        ] {
            assert!(kernel_6d(p[0], p[1], p[2]).is_finite());
            assert!(kernel_5d(p[0], p[1], p[2]).is_finite());
        }
    }

    #[test]
    fn tensor_holds_self_term_at_origin() {
        let grid = VoxelGrid {
            n: [3, 2, 2],
            d: [1e-3, 1e-3, 2e-3],
            c: [0., 0., 0.],
        };
        let tsr = green_tensor(&grid, 20.);
        assert_relative_eq!(tsr.at(0, 0, 0, 0), green_self(grid.d), max_relative = 1e-12);
        assert_relative_eq!(
            tsr.at(2, 1, 0, 0),
            green_ana_6d(grid.d, [2., 1., 0.]),
            max_relative = 1e-12
        );
    }

    #[test]
    fn coupling_antisymmetric_in_offset() {
        // the area-volume difference changes sign with the component
        // axis offset; the tensor stores the absolute-offset value
        let d = [1e-3, 1e-3, 1e-3];
        let val_pos = {
            let perm_m = [1., 1., 2.];
            coupling_component(d, perm_m, 2, true)
        };
        assert!(val_pos != 0.);
    }
}
