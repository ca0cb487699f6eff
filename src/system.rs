//! Construction of the PEEC equation system.
//!
//! The equations are ordered as the solution vector:
//! electric face KVL, electric voxel KCL, source equations, magnetic
//! face KVL, magnetic voxel KCL. The full system is never assembled:
//! matrix-free operators provide the products with the electric block,
//! the magnetic block, and the two coupling blocks.
//!
//! The preconditioner treats the electric and magnetic blocks
//! separately. In each block the diagonal impedance part is
//! eliminated with a Schur complement; the complement is sparse
//! (an admittance-weighted graph Laplacian plus the source coupling)
//! and is factorized once per sweep.

use faer::prelude::Solve;
use faer::sparse::{SparseColMat, Triplet};
use faer::{Col, ColRef, Mat};

use crate::constants::laplace_s;
use crate::domain::{ProblemIndexing, SourceType, SourceVectors};
use crate::fft::CirculantOperator;
use crate::operators::CouplingOperators;
use crate::options::{FactorizationLibrary, FactorizationOptions};
use crate::voxel::FaceTopology;
use crate::C64;

/// Sizes and offsets of the solution vector
/// `[I_fc | V_vc | I_src | I_fm | V_vm]`.
#[derive(Debug, Clone, Copy)]
pub struct SolutionLayout {
    pub n_fc: usize,
    pub n_vc: usize,
    pub n_src: usize,
    pub n_fm: usize,
    pub n_vm: usize,
}

impl SolutionLayout {
    pub fn n_dof_electric(&self) -> usize {
        self.n_fc + self.n_vc + self.n_src
    }

    pub fn n_dof_magnetic(&self) -> usize {
        self.n_fm + self.n_vm
    }

    pub fn n_dof_total(&self) -> usize {
        self.n_dof_electric() + self.n_dof_magnetic()
    }
}

/// Source coupling blocks, stored compactly: every source row `s`
/// connects a single electric voxel `vc_row[s]`.
///
/// The blocks are:
///   - voxel/source: `-1` at `(vc_row[s], s)`
///   - source/voxel: the internal admittance (current sources) or
///     `+1` (voltage sources) at `(s, vc_row[s])`
///   - source/source: diagonal `1` (current) or the internal
///     impedance (voltage)
#[derive(Debug, Clone)]
pub struct SourceCoupling {
    pub vc_row: Vec<usize>,
    pub elem: Vec<C64>,
    pub n_src_c: usize,
}

impl SourceCoupling {
    pub fn build(indexing: &ProblemIndexing, src: &SourceVectors) -> Self {
        let n_src_c = indexing.idx_src_c.len();
        let n_src = indexing.n_src();
        let mut vc_row = vec![0usize; n_src];
        let mut elem = vec![C64::new(0., 0.); n_src];

        for pos in indexing.source_pos.values() {
            for (i, &row) in pos.pos_src.iter().enumerate() {
                vc_row[row] = pos.pos_vc[i];
                elem[row] = match pos.source_type {
                    SourceType::Current => src.element_src_c[row],
                    SourceType::Voltage => src.element_src_v[row - n_src_c],
                };
            }
        }

        SourceCoupling {
            vc_row,
            elem,
            n_src_c,
        }
    }

    pub fn n_src(&self) -> usize {
        self.vc_row.len()
    }

    /// Product of the voxel/source block with the source currents.
    pub fn apply_vc_src(&self, i_src: ColRef<C64>, n_vc: usize) -> Col<C64> {
        let mut out = Col::<C64>::zeros(n_vc);
        for (s, &row) in self.vc_row.iter().enumerate() {
            out[row] -= i_src[s];
        }
        out
    }

    /// Product of the source/voxel block with the voxel potentials.
    pub fn apply_src_vc(&self, v_vc: ColRef<C64>) -> Col<C64> {
        Col::<C64>::from_fn(self.n_src(), |s| {
            if s < self.n_src_c {
                self.elem[s] * v_vc[self.vc_row[s]]
            } else {
                v_vc[self.vc_row[s]]
            }
        })
    }

    /// Product of the diagonal source/source block.
    pub fn apply_src_src(&self, i_src: ColRef<C64>) -> Col<C64> {
        Col::<C64>::from_fn(self.n_src(), |s| {
            if s < self.n_src_c {
                i_src[s]
            } else {
                self.elem[s] * i_src[s]
            }
        })
    }
}

/// Right-hand side vectors: the excitations sit in the source
/// equations, everything else is zero.
pub fn source_rhs(layout: &SolutionLayout, src: &SourceVectors) -> (Col<C64>, Col<C64>) {
    let mut rhs_c = Col::<C64>::zeros(layout.n_dof_electric());
    let offset = layout.n_fc + layout.n_vc;
    for (i, &v) in src.value_src_c.iter().enumerate() {
        rhs_c[offset + i] = v;
    }
    for (i, &v) in src.value_src_v.iter().enumerate() {
        rhs_c[offset + src.value_src_c.len() + i] = v;
    }
    let rhs_m = Col::<C64>::zeros(layout.n_dof_magnetic());
    (rhs_c, rhs_m)
}

/// Matrix-free action of the electric block.
pub struct ElectricSystem<'a> {
    pub freq: f64,
    pub topo: &'a FaceTopology,
    pub r_vec: &'a Col<C64>,
    pub l_op: &'a CirculantOperator,
    pub src: &'a SourceCoupling,
}

impl ElectricSystem<'_> {
    pub fn apply(&self, sol: ColRef<C64>) -> Col<C64> {
        let n_fc = self.topo.n_f();
        let n_vc = self.topo.n_v();
        let n_src = self.src.n_src();
        let s = laplace_s(self.freq);

        let i_fc = sol.subrows(0, n_fc);
        let v_vc = sol.subrows(n_fc, n_vc);
        let i_src = sol.subrows(n_fc + n_vc, n_src);

        // face KVL: impedance drop against the potential difference
        let grad_v = self.topo.apply_transpose(v_vc);
        let mut rhs_kvl = if self.freq == 0. {
            Col::<C64>::zeros(n_fc)
        } else {
            let mut ind = self.l_op.apply(i_fc);
            for k in 0..n_fc {
                ind[k] *= s;
            }
            ind
        };
        for k in 0..n_fc {
            rhs_kvl[k] += self.r_vec[k] * i_fc[k] - grad_v[k];
        }

        // voxel KCL with the source injections
        let mut rhs_kcl = self.topo.apply(i_fc);
        let inj = self.src.apply_vc_src(i_src, n_vc);
        for i in 0..n_vc {
            rhs_kcl[i] += inj[i];
        }

        // source equations
        let con = self.src.apply_src_vc(v_vc);
        let own = self.src.apply_src_src(i_src);

        let mut out = Col::<C64>::zeros(n_fc + n_vc + n_src);
        for k in 0..n_fc {
            out[k] = rhs_kvl[k];
        }
        for i in 0..n_vc {
            out[n_fc + i] = rhs_kcl[i];
        }
        for s_i in 0..n_src {
            out[n_fc + n_vc + s_i] = con[s_i] + own[s_i];
        }
        out
    }
}

/// Matrix-free action of the magnetic block (DC-stable form).
pub struct MagneticSystem<'a> {
    pub topo: &'a FaceTopology,
    pub r_vec: &'a Col<C64>,
    pub p_op: Option<&'a CirculantOperator>,
}

impl MagneticSystem<'_> {
    pub fn apply(&self, sol: ColRef<C64>) -> Col<C64> {
        let n_fm = self.topo.n_f();
        let n_vm = self.topo.n_v();
        if n_fm + n_vm == 0 {
            return Col::<C64>::zeros(0);
        }

        let i_fm = sol.subrows(0, n_fm);
        let v_vm = sol.subrows(n_fm, n_vm);

        let grad_v = self.topo.apply_transpose(v_vm);
        let div_i = self.topo.apply(i_fm);
        let pot = match self.p_op {
            Some(op) => op.apply(div_i.as_ref()),
            None => div_i,
        };

        let mut out = Col::<C64>::zeros(n_fm + n_vm);
        for k in 0..n_fm {
            out[k] = self.r_vec[k] * i_fm[k] - grad_v[k];
        }
        for i in 0..n_vm {
            out[n_fm + i] = pot[i] + v_vm[i];
        }
        out
    }
}

/// Coupling contributions between the two blocks.
#[derive(Clone, Copy)]
pub struct CouplingSystem<'a> {
    pub freq: f64,
    pub layout: SolutionLayout,
    pub ops: Option<&'a CouplingOperators>,
}

impl CouplingSystem<'_> {
    /// Magnetic-to-electric contribution (face KVL rows only).
    pub fn apply_electric(&self, sol_m: ColRef<C64>) -> Col<C64> {
        let mut out = Col::<C64>::zeros(self.layout.n_dof_electric());
        if let Some(ops) = self.ops {
            if self.freq != 0. {
                let s = laplace_s(self.freq);
                let i_fm = sol_m.subrows(0, self.layout.n_fm);
                let cpl = ops.apply_electric(i_fm);
                for k in 0..self.layout.n_fc {
                    out[k] = s * cpl[k];
                }
            }
        }
        out
    }

    /// Electric-to-magnetic contribution (face KVL rows only).
    pub fn apply_magnetic(&self, sol_c: ColRef<C64>) -> Col<C64> {
        let mut out = Col::<C64>::zeros(self.layout.n_dof_magnetic());
        if let Some(ops) = self.ops {
            let i_fc = sol_c.subrows(0, self.layout.n_fc);
            let cpl = ops.apply_magnetic(i_fc);
            for k in 0..self.layout.n_fm {
                out[k] = -cpl[k];
            }
        }
        out
    }
}

/// Assembled sparse Schur complement (kept for the condition check).
#[derive(Debug, Clone)]
pub struct SchurMatrix {
    pub n: usize,
    pub triplets: Vec<Triplet<usize, usize, C64>>,
}

impl SchurMatrix {
    pub fn to_sparse(&self) -> Option<SparseColMat<usize, C64>> {
        SparseColMat::try_new_from_triplets(self.n, self.n, &self.triplets).ok()
    }
}

/// Solve closure wrapping a sparse factorization.
pub type SolveFn = Box<dyn Fn(ColRef<C64>) -> Col<C64> + Send + Sync>;

/// Factorize a sparse matrix, returning a solve closure.
///
/// A failed factorization is logged and reported as `None`: the
/// caller degrades gracefully (identity preconditioner) and the
/// condition check flags the problem.
pub fn factorize(
    name: &str,
    mat: &SchurMatrix,
    options: &FactorizationOptions,
) -> Option<SolveFn> {
    if mat.n == 0 {
        return None;
    }

    let sparse = match mat.to_sparse() {
        Some(m) => m,
        None => {
            log::warn!("matrix assembly failure: {name}");
            return None;
        }
    };

    log::debug!(
        "factorization: {name} / size ({}, {}) / nnz {}",
        mat.n,
        mat.n,
        mat.triplets.len()
    );

    let factorization = match options.library {
        FactorizationLibrary::SparseLu => sparse.sp_lu(),
    };
    match factorization {
        Ok(lu) => Some(Box::new(move |rhs: ColRef<C64>| {
            let b = Mat::<C64>::from_fn(rhs.nrows(), 1, |i, _| rhs[i]);
            let x = lu.solve(&b);
            Col::<C64>::from_fn(x.nrows(), |i| x[(i, 0)])
        })),
        Err(_) => {
            log::warn!("factorization failure: {name}");
            None
        }
    }
}

enum PcdKind<'a> {
    Electric { src: &'a SourceCoupling },
    Magnetic { p_vec: &'a Col<C64> },
}

/// Schur-complement preconditioner of one block.
///
/// The diagonal admittance eliminates the face equations; the sparse
/// complement over the remaining unknowns is solved with its LU
/// factorization. Without a valid factorization the complement solve
/// degrades to the identity.
pub struct SchurPreconditioner<'a> {
    topo: &'a FaceTopology,
    y: Col<C64>,
    factor: Option<SolveFn>,
    kind: PcdKind<'a>,
}

impl SchurPreconditioner<'_> {
    pub fn apply(&self, rhs: ColRef<C64>) -> Col<C64> {
        let n_a = self.topo.n_f();
        let n_b = rhs.nrows() - n_a;
        let rhs_a = rhs.subrows(0, n_a);
        let rhs_b = rhs.subrows(n_a, n_b);

        // y*rhs_a and its divergence
        let ya = Col::<C64>::from_fn(n_a, |k| self.y[k] * rhs_a[k]);
        let div = self.topo.apply(ya.as_ref());

        // t = rhs_b - A_21*(y*rhs_a)
        let mut t = Col::<C64>::zeros(n_b);
        match &self.kind {
            PcdKind::Electric { .. } => {
                let n_vc = self.topo.n_v();
                for i in 0..n_vc {
                    t[i] = rhs_b[i] - div[i];
                }
                for s in n_vc..n_b {
                    t[s] = rhs_b[s];
                }
            }
            PcdKind::Magnetic { p_vec } => {
                for i in 0..n_b {
                    t[i] = rhs_b[i] - p_vec[i] * div[i];
                }
            }
        }

        let sol_b = match &self.factor {
            Some(factor) => factor(t.as_ref()),
            None => t,
        };

        // sol_a = y*(rhs_a - A_12*sol_b) with A_12 = -A^T (voxel part)
        let grad = self
            .topo
            .apply_transpose(sol_b.subrows(0, self.topo.n_v()));
        let mut out = Col::<C64>::zeros(n_a + n_b);
        for k in 0..n_a {
            out[k] = self.y[k] * (rhs_a[k] + grad[k]);
        }
        for i in 0..n_b {
            out[n_a + i] = sol_b[i];
        }
        out
    }
}

/// Admittance-weighted Laplacian triplets `A*diag(y)*A^T`, with an
/// optional per-row scaling and offset on the diagonal.
///
/// The diagonal is accumulated first so every matrix entry appears in
/// exactly one triplet (two adjacent voxels share a single face).
fn laplacian_triplets(
    topo: &FaceTopology,
    y: &Col<C64>,
    row_scale: Option<&Col<C64>>,
    diag_offset: C64,
    out: &mut Vec<Triplet<usize, usize, C64>>,
) {
    let scale = |row: usize| -> C64 {
        match row_scale {
            Some(p) => p[row],
            None => C64::new(1., 0.),
        }
    };

    let mut diag = vec![diag_offset; topo.n_v()];
    for k in 0..topo.n_f() {
        let (p, n) = (topo.pos[k], topo.neg[k]);
        let val = y[k];
        diag[p] += scale(p) * val;
        diag[n] += scale(n) * val;
        out.push(Triplet {
            row: p,
            col: n,
            val: -(scale(p) * val),
        });
        out.push(Triplet {
            row: n,
            col: p,
            val: -(scale(n) * val),
        });
    }
    for (row, &val) in diag.iter().enumerate() {
        out.push(Triplet { row, col: row, val });
    }
}

/// Electric preconditioner: Schur complement of the impedance block
/// `Z = R + s*L_self` over the voxel and source equations.
pub fn electric_preconditioner<'a>(
    freq: f64,
    topo: &'a FaceTopology,
    r_vec: &Col<C64>,
    l_vec: &Col<C64>,
    src: &'a SourceCoupling,
    options: &FactorizationOptions,
) -> (SchurPreconditioner<'a>, SchurMatrix) {
    let s = laplace_s(freq);
    let y = Col::<C64>::from_fn(topo.n_f(), |k| 1. / (r_vec[k] + s * l_vec[k]));

    let n_vc = topo.n_v();
    let n = n_vc + src.n_src();
    let mut triplets = Vec::with_capacity(4 * topo.n_f() + 3 * src.n_src());

    // voxel/voxel block: the face-admittance Laplacian
    laplacian_triplets(topo, &y, None, C64::new(0., 0.), &mut triplets);

    // source blocks
    for (s_i, &row) in src.vc_row.iter().enumerate() {
        triplets.push(Triplet {
            row,
            col: n_vc + s_i,
            val: C64::new(-1., 0.),
        });
        let (con, own) = if s_i < src.n_src_c {
            (src.elem[s_i], C64::new(1., 0.))
        } else {
            (C64::new(1., 0.), src.elem[s_i])
        };
        triplets.push(Triplet {
            row: n_vc + s_i,
            col: row,
            val: con,
        });
        triplets.push(Triplet {
            row: n_vc + s_i,
            col: n_vc + s_i,
            val: own,
        });
    }

    let mat = SchurMatrix { n, triplets };
    let factor = factorize("electric", &mat, options);
    (
        SchurPreconditioner {
            topo,
            y,
            factor,
            kind: PcdKind::Electric { src },
        },
        mat,
    )
}

/// Magnetic preconditioner: DC-stable Schur complement
/// `S = I + diag(P)*A*diag(1/R)*A^T`.
pub fn magnetic_preconditioner<'a>(
    topo: &'a FaceTopology,
    r_vec: &Col<C64>,
    p_vec: &'a Col<C64>,
    options: &FactorizationOptions,
) -> (SchurPreconditioner<'a>, SchurMatrix) {
    let y = Col::<C64>::from_fn(topo.n_f(), |k| 1. / r_vec[k]);

    let n = topo.n_v();
    let mut triplets = Vec::with_capacity(4 * topo.n_f() + n);
    laplacian_triplets(topo, &y, Some(p_vec), C64::new(1., 0.), &mut triplets);

    let mat = SchurMatrix { n, triplets };
    let factor = factorize("magnetic", &mat, options);
    (
        SchurPreconditioner {
            topo,
            y,
            factor,
            kind: PcdKind::Magnetic { p_vec },
        },
        mat,
    )
}
