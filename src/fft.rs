//! Matrix-vector multiplication with circulant tensors and FFTs.
//!
//! A translation-invariant operator on the voxel grid is described by
//! a 4-D tensor indexed by the voxel offset (three axes) and the
//! component (fourth axis). Embedding the tensor into a circulant of
//! doubled extent diagonalizes it under the 3-D DFT, so the
//! matrix-vector product reduces to scatter, FFT, pointwise multiply,
//! inverse FFT, and gather.
//!
//! Three tensor kinds are supported:
//!   - `Single`: one component, a plain Toeplitz-symmetric matrix
//!   - `Diag`: three components acting independently per direction
//!   - `Cross`: three components combined antisymmetrically across
//!     directions (the coupling operator)

use std::sync::Arc;

use faer::{Col, ColRef};
use rustfft::{Fft, FftPlanner};

use crate::C64;

/// Dense 4-D tensor over the voxel grid, stored x-fastest:
/// `data[ix + nx*(iy + ny*(iz + nz*k))]`.
#[derive(Debug, Clone)]
pub struct Tensor4 {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub nk: usize,
    pub data: Vec<f64>,
}

impl Tensor4 {
    pub fn zeros(nx: usize, ny: usize, nz: usize, nk: usize) -> Self {
        Tensor4 {
            nx,
            ny,
            nz,
            nk,
            data: vec![0.; nx * ny * nz * nk],
        }
    }

    #[inline]
    fn lin(&self, ix: usize, iy: usize, iz: usize, k: usize) -> usize {
        ix + self.nx * (iy + self.ny * (iz + self.nz * k))
    }

    #[inline]
    pub fn at(&self, ix: usize, iy: usize, iz: usize, k: usize) -> f64 {
        self.data[self.lin(ix, iy, iz, k)]
    }

    #[inline]
    pub fn set(&mut self, ix: usize, iy: usize, iz: usize, k: usize, val: f64) {
        let idx = self.lin(ix, iy, iz, k);
        self.data[idx] = val;
    }

    /// Scale every entry of one component.
    pub fn scale_component(&mut self, k: usize, factor: f64) {
        let n = self.nx * self.ny * self.nz;
        for i in 0..n {
            self.data[n * k + i] *= factor;
        }
    }
}

/// Kind of matrix encoded by a circulant tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Single,
    Diag,
    Cross,
}

/// Mirror sign of a component when a set of axes is reflected.
///
/// Single/diag tensors are fully symmetric. For cross tensors, the
/// component `k` flips its sign when the axis `k` is mirrored.
#[inline]
fn mirror_sign(kind: TensorKind, mirrored: [bool; 3], k: usize) -> f64 {
    match kind {
        TensorKind::Single | TensorKind::Diag => 1.,
        TensorKind::Cross => {
            if mirrored[k] {
                -1.
            } else {
                1.
            }
        }
    }
}

/// Embed a half-tensor `(nx, ny, nz, nk)` into its circulant of shape
/// `(2nx, 2ny, 2nz, nk)`. The index `n_a` of each doubled axis stays
/// zero; the index `n_a + i` mirrors the index `n_a - i`.
pub fn circulant_embed(tsr: &Tensor4, kind: TensorKind) -> Tensor4 {
    let (nx, ny, nz, nk) = (tsr.nx, tsr.ny, tsr.nz, tsr.nk);
    let mut out = Tensor4::zeros(2 * nx, 2 * ny, 2 * nz, nk);

    for k in 0..nk {
        for jz in 0..2 * nz {
            let (iz, mz) = mirror_index(jz, nz);
            if iz == usize::MAX {
                continue;
            }
            for jy in 0..2 * ny {
                let (iy, my) = mirror_index(jy, ny);
                if iy == usize::MAX {
                    continue;
                }
                for jx in 0..2 * nx {
                    let (ix, mx) = mirror_index(jx, nx);
                    if ix == usize::MAX {
                        continue;
                    }
                    let sign = mirror_sign(kind, [mx, my, mz], k);
                    out.set(jx, jy, jz, k, sign * tsr.at(ix, iy, iz, k));
                }
            }
        }
    }
    out
}

/// Map a doubled-axis index onto the half-tensor index and the mirror
/// flag. The index `n` itself has no pre-image and stays zero.
#[inline]
fn mirror_index(j: usize, n: usize) -> (usize, bool) {
    if j < n {
        (j, false)
    } else if j == n {
        (usize::MAX, false)
    } else {
        (2 * n - j, true)
    }
}

struct FftPlans {
    fwd: [Arc<dyn Fft<f64>>; 3],
    inv: [Arc<dyn Fft<f64>>; 3],
}

impl FftPlans {
    fn new(mx: usize, my: usize, mz: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        FftPlans {
            fwd: [
                planner.plan_fft_forward(mx),
                planner.plan_fft_forward(my),
                planner.plan_fft_forward(mz),
            ],
            inv: [
                planner.plan_fft_inverse(mx),
                planner.plan_fft_inverse(my),
                planner.plan_fft_inverse(mz),
            ],
        }
    }
}

/// 3-D FFT over one `(mx, my, mz)` slab, composed from 1-D transforms
/// along each axis (the x axis is contiguous, y and z are strided).
fn fft3(buf: &mut [C64], mx: usize, my: usize, mz: usize, plans: &FftPlans, forward: bool) {
    let plan = |a: usize| -> &Arc<dyn Fft<f64>> {
        if forward {
            &plans.fwd[a]
        } else {
            &plans.inv[a]
        }
    };

    // x axis: contiguous runs
    for chunk in buf.chunks_exact_mut(mx) {
        plan(0).process(chunk);
    }

    // y axis: stride mx
    let mut scratch = vec![C64::new(0., 0.); my.max(mz)];
    for iz in 0..mz {
        for ix in 0..mx {
            let base = ix + mx * my * iz;
            for iy in 0..my {
                scratch[iy] = buf[base + mx * iy];
            }
            plan(1).process(&mut scratch[..my]);
            for iy in 0..my {
                buf[base + mx * iy] = scratch[iy];
            }
        }
    }

    // z axis: stride mx*my
    for iy in 0..my {
        for ix in 0..mx {
            let base = ix + mx * iy;
            for iz in 0..mz {
                scratch[iz] = buf[base + mx * my * iz];
            }
            plan(2).process(&mut scratch[..mz]);
            for iz in 0..mz {
                buf[base + mx * my * iz] = scratch[iz];
            }
        }
    }
}

/// FFT-accelerated matrix-vector operator backed by a circulant
/// tensor. Input values live on `idx_in`, output values on `idx_out`;
/// both are global `voxel + k*nv` indices into the tensor quadrant.
pub struct CirculantOperator {
    kind: TensorKind,
    nx: usize,
    ny: usize,
    nz: usize,
    nk: usize,
    mat_fft: Vec<C64>,
    idx_out: Vec<usize>,
    idx_in: Vec<usize>,
    plans: FftPlans,
}

impl CirculantOperator {
    pub fn new(tsr: &Tensor4, kind: TensorKind, idx_out: Vec<usize>, idx_in: Vec<usize>) -> Self {
        let embedded = circulant_embed(tsr, kind);
        let (mx, my, mz, nk) = (embedded.nx, embedded.ny, embedded.nz, embedded.nk);
        let plans = FftPlans::new(mx, my, mz);

        let mut mat_fft: Vec<C64> = embedded.data.iter().map(|&v| C64::new(v, 0.)).collect();
        for k in 0..nk {
            fft3(
                &mut mat_fft[k * mx * my * mz..(k + 1) * mx * my * mz],
                mx,
                my,
                mz,
                &plans,
                true,
            );
        }

        CirculantOperator {
            kind,
            nx: tsr.nx,
            ny: tsr.ny,
            nz: tsr.nz,
            nk,
            mat_fft,
            idx_out,
            idx_in,
            plans,
        }
    }

    pub fn n_in(&self) -> usize {
        self.idx_in.len()
    }

    pub fn n_out(&self) -> usize {
        self.idx_out.len()
    }

    /// Decompose a global `voxel + k*nv` index into the embedded
    /// (doubled) tensor position.
    #[inline]
    fn embedded_index(&self, g: usize) -> usize {
        let nv = self.nx * self.ny * self.nz;
        let (mx, my, mz) = (2 * self.nx, 2 * self.ny, 2 * self.nz);
        let k = g / nv;
        let r = g % nv;
        let ix = r % self.nx;
        let iy = (r / self.nx) % self.ny;
        let iz = r / (self.nx * self.ny);
        ix + mx * (iy + my * (iz + mz * k))
    }

    /// Apply the operator: scatter, FFT, pointwise product, inverse
    /// FFT, gather. The result equals the dense product to round-off.
    pub fn apply(&self, x: ColRef<C64>) -> Col<C64> {
        assert_eq!(x.nrows(), self.idx_in.len(), "input length mismatch");
        let (mx, my, mz) = (2 * self.nx, 2 * self.ny, 2 * self.nz);
        let slab = mx * my * mz;

        // scatter the input into the tensor quadrant
        let mut buf = vec![C64::new(0., 0.); slab * self.nk];
        for (pos, &g) in self.idx_in.iter().enumerate() {
            buf[self.embedded_index(g)] = x[pos];
        }

        for k in 0..self.nk {
            fft3(&mut buf[k * slab..(k + 1) * slab], mx, my, mz, &self.plans, true);
        }

        // frequency-domain product with the circulant tensor
        let mut res = match self.kind {
            TensorKind::Single | TensorKind::Diag => {
                for (v, t) in buf.iter_mut().zip(self.mat_fft.iter()) {
                    *v *= *t;
                }
                buf
            }
            TensorKind::Cross => {
                let mut out = vec![C64::new(0., 0.); slab * self.nk];
                let (t0, t1, t2) = (
                    &self.mat_fft[0..slab],
                    &self.mat_fft[slab..2 * slab],
                    &self.mat_fft[2 * slab..3 * slab],
                );
                let (v0, v1, v2) = (
                    &buf[0..slab],
                    &buf[slab..2 * slab],
                    &buf[2 * slab..3 * slab],
                );
                for i in 0..slab {
                    out[i] = t2[i] * v1[i] + t1[i] * v2[i];
                    out[slab + i] = -t2[i] * v0[i] + t0[i] * v2[i];
                    out[2 * slab + i] = -t1[i] * v0[i] - t0[i] * v1[i];
                }
                out
            }
        };

        let norm = 1. / slab as f64;
        for k in 0..self.nk {
            fft3(&mut res[k * slab..(k + 1) * slab], mx, my, mz, &self.plans, false);
        }

        Col::<C64>::from_fn(self.idx_out.len(), |pos| {
            res[self.embedded_index(self.idx_out[pos])] * norm
        })
    }
}

/// Dense reference multiplication with the translation-invariant
/// matrix described by the half-tensor. Quadratic cost; used to back
/// the FFT path in tests and for debugging small problems.
pub fn apply_dense(
    tsr: &Tensor4,
    kind: TensorKind,
    idx_out: &[usize],
    idx_in: &[usize],
    x: ColRef<C64>,
) -> Col<C64> {
    let nv = tsr.nx * tsr.ny * tsr.nz;
    let decompose = |g: usize| -> ([isize; 3], usize) {
        let k = g / nv;
        let r = g % nv;
        (
            [
                (r % tsr.nx) as isize,
                ((r / tsr.nx) % tsr.ny) as isize,
                (r / (tsr.nx * tsr.ny)) as isize,
            ],
            k,
        )
    };

    // signed circulant entry for the component `c` at the offset `dlt`
    let entry = |dlt: [isize; 3], c: usize| -> f64 {
        let val = tsr.at(
            dlt[0].unsigned_abs(),
            dlt[1].unsigned_abs(),
            dlt[2].unsigned_abs(),
            c,
        );
        match kind {
            TensorKind::Single | TensorKind::Diag => val,
            TensorKind::Cross => {
                if dlt[c] < 0 {
                    -val
                } else {
                    val
                }
            }
        }
    };

    let mut out = Col::<C64>::zeros(idx_out.len());
    for (o_pos, &g_out) in idx_out.iter().enumerate() {
        let (sub_o, k_o) = decompose(g_out);
        let mut acc = C64::new(0., 0.);
        for (i_pos, &g_in) in idx_in.iter().enumerate() {
            let (sub_i, k_i) = decompose(g_in);
            let dlt = [
                sub_o[0] - sub_i[0],
                sub_o[1] - sub_i[1],
                sub_o[2] - sub_i[2],
            ];
            let coeff = match kind {
                TensorKind::Single | TensorKind::Diag => {
                    if k_o == k_i {
                        entry(dlt, k_o)
                    } else {
                        0.
                    }
                }
                TensorKind::Cross => match (k_o, k_i) {
                    (0, 1) => entry(dlt, 2),
                    (0, 2) => entry(dlt, 1),
                    (1, 0) => -entry(dlt, 2),
                    (1, 2) => entry(dlt, 0),
                    (2, 0) => -entry(dlt, 1),
                    (2, 1) => -entry(dlt, 0),
                    _ => 0.,
                },
            };
            acc += coeff * x[i_pos];
        }
        out[o_pos] = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_tensor(nx: usize, ny: usize, nz: usize, nk: usize) -> Tensor4 {
        let mut tsr = Tensor4::zeros(nx, ny, nz, nk);
        for k in 0..nk {
            for iz in 0..nz {
                for iy in 0..ny {
                    for ix in 0..nx {
                        let val = 1. / (1. + ix as f64 + 2. * iy as f64 + 3. * iz as f64)
                            + 0.1 * k as f64;
                        tsr.set(ix, iy, iz, k, val);
                    }
                }
            }
        }
        tsr
    }

    fn test_vector(n: usize) -> Col<C64> {
        Col::<C64>::from_fn(n, |i| C64::new(0.3 + i as f64, 0.7 - 0.2 * i as f64))
    }

    fn assert_cols_close(a: &Col<C64>, b: &Col<C64>, tol: f64) {
        assert_eq!(a.nrows(), b.nrows());
        let scale = a.norm_l2().max(1e-30);
        for i in 0..a.nrows() {
            assert_relative_eq!(a[i].re, b[i].re, epsilon = tol * scale);
            assert_relative_eq!(a[i].im, b[i].im, epsilon = tol * scale);
        }
    }

    #[test]
    fn circulant_quadrant_roundtrip() {
        for kind in [TensorKind::Single, TensorKind::Cross] {
            let nk = if kind == TensorKind::Single { 1 } else { 3 };
            let tsr = test_tensor(3, 2, 4, nk);
            let embedded = circulant_embed(&tsr, kind);
            for k in 0..nk {
                for iz in 0..4 {
                    for iy in 0..2 {
                        for ix in 0..3 {
                            assert_eq!(embedded.at(ix, iy, iz, k), tsr.at(ix, iy, iz, k));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn circulant_mirror_signs() {
        let tsr = test_tensor(3, 3, 3, 3);
        let embedded = circulant_embed(&tsr, TensorKind::Cross);
        // mirrored x flips component 0 only
        assert_eq!(embedded.at(2 * 3 - 1, 1, 1, 0), -tsr.at(1, 1, 1, 0));
        assert_eq!(embedded.at(2 * 3 - 1, 1, 1, 1), tsr.at(1, 1, 1, 1));
        // the doubled-axis midpoint stays zero
        assert_eq!(embedded.at(3, 0, 0, 0), 0.);
    }

    #[test]
    fn fft_matches_dense_single() {
        let tsr = test_tensor(3, 2, 2, 1);
        let nv = 3 * 2 * 2;
        let idx: Vec<usize> = (0..nv).step_by(2).collect();
        let x = test_vector(idx.len());

        let op = CirculantOperator::new(&tsr, TensorKind::Single, idx.clone(), idx.clone());
        let fft = op.apply(x.as_ref());
        let dense = apply_dense(&tsr, TensorKind::Single, &idx, &idx, x.as_ref());
        assert_cols_close(&fft, &dense, 1e-10);
    }

    #[test]
    fn fft_matches_dense_diag() {
        let tsr = test_tensor(2, 3, 2, 3);
        let nv = 2 * 3 * 2;
        let idx: Vec<usize> = (0..3 * nv).filter(|i| i % 3 != 1).collect();
        let x = test_vector(idx.len());

        let op = CirculantOperator::new(&tsr, TensorKind::Diag, idx.clone(), idx.clone());
        let fft = op.apply(x.as_ref());
        let dense = apply_dense(&tsr, TensorKind::Diag, &idx, &idx, x.as_ref());
        assert_cols_close(&fft, &dense, 1e-10);
    }

    #[test]
    fn fft_matches_dense_cross() {
        let tsr = test_tensor(2, 2, 3, 3);
        let nv = 2 * 2 * 3;
        let idx_in: Vec<usize> = (0..3 * nv).step_by(2).collect();
        let idx_out: Vec<usize> = (1..3 * nv).step_by(3).collect();
        let x = test_vector(idx_in.len());

        let op = CirculantOperator::new(&tsr, TensorKind::Cross, idx_out.clone(), idx_in.clone());
        let fft = op.apply(x.as_ref());
        let dense = apply_dense(&tsr, TensorKind::Cross, &idx_out, &idx_in, x.as_ref());
        assert_cols_close(&fft, &dense, 1e-10);
    }

    #[test]
    fn fft_matches_dense_flat_axis() {
        // degenerate single-voxel axis
        let tsr = test_tensor(1, 3, 2, 1);
        let nv = 6;
        let idx: Vec<usize> = (0..nv).collect();
        let x = test_vector(idx.len());

        let op = CirculantOperator::new(&tsr, TensorKind::Single, idx.clone(), idx.clone());
        let fft = op.apply(x.as_ref());
        let dense = apply_dense(&tsr, TensorKind::Single, &idx, &idx, x.as_ref());
        assert_cols_close(&fft, &dense, 1e-10);
    }
}
