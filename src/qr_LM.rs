//! Pivoted QR factorization of a streamed augmented matrix `[A|b]` and the
//! triangular solvers the LM algorithm needs on top of it.
//!
//! The input is a collection of [`AugmentedRow`] values, one per data point.
//! Each Householder step touches the rows only through one associative
//! aggregation (dot products against the pivot column plus the pivot row
//! itself) and one element-wise map (the reflection), so the decomposition
//! runs unchanged on any [`DataSet`] backend. The numerics follow MINPACK's
//! `QRFAC`/`QRSOLV` pair.
#![allow(clippy::excessive_precision)]

use crate::dataset::DataSet;
use crate::utils::{enorm, epsmch};
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};

/// One row of the augmented system `[A|b]`: the coefficients `a`, the
/// right-hand side value `b` and the index `i` of the originating data
/// point. After the decomposition the rows with `i < n` carry the reduced
/// square system.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedRow {
    pub a: DVector<f64>,
    pub b: f64,
    pub i: usize,
}

/// Result of the pivoted decomposition.
///
/// `R` is `n×n` upper triangular with its diagonal kept separately in
/// `r_diag`; `qtb` holds the first `n` entries of `Qᵀb`; `ipvt[j]` is the
/// original index of the column standing at position `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct QR {
    r: DMatrix<f64>,
    r_diag: DVector<f64>,
    qtb: DVector<f64>,
    ipvt: Vec<usize>,
    ac_norms: DVector<f64>,
    b_norm: f64,
    n: usize,
}

/// Output of [`QR::qr_solve`]: the solution together with the modified
/// triangular factor `S` (strictly lower part of `s`, diagonal in `s_diag`)
/// needed for the Newton correction in the damping-parameter search.
#[derive(Debug, Clone)]
pub struct RegularizedSolve {
    pub x: DVector<f64>,
    pub s: DMatrix<f64>,
    pub s_diag: DVector<f64>,
}

impl QR {
    /// Decompose the streamed `[A|b]` with `n` columns, optionally with
    /// column pivoting.
    pub fn new<D: DataSet<AugmentedRow>>(rows: D, n: usize, pivoting: bool) -> Self {
        assert!(n > 0, "qr: column count must be positive");
        assert!(rows.size() > 0, "qr: row stream is empty");

        // One associative pass for the column norms and ||b||.
        let (col_sumsq, b_sumsq) = rows.aggregate(
            (DVector::<f64>::zeros(n), 0.0f64),
            |(mut s, mut bs), row| {
                assert_eq!(row.a.len(), n, "qr: row length does not match column count");
                for k in 0..n {
                    s[k] += row.a[k] * row.a[k];
                }
                bs += row.b * row.b;
                (s, bs)
            },
            |a, b| (a.0 + b.0, a.1 + b.1),
        );
        let ac_norms = col_sumsq.map(f64::sqrt);
        let b_norm = b_sumsq.sqrt();

        // r_diag doubles as the table of remaining column norms while the
        // factorization runs; wnorm backs the downdate recompute guard.
        let mut r_diag = ac_norms.clone();
        let mut wnorm = ac_norms.clone();
        let mut ipvt: Vec<usize> = (0..n).collect();
        let mut rows = rows;

        for j in 0..n {
            if pivoting {
                let mut kmax = j;
                for k in (j + 1)..n {
                    if r_diag[k] > r_diag[kmax] {
                        kmax = k;
                    }
                }
                if kmax != j {
                    r_diag.swap_rows(j, kmax);
                    wnorm.swap_rows(j, kmax);
                    ipvt.swap(j, kmax);
                    rows = rows.map(move |row| {
                        let mut row = row.clone();
                        row.a.swap_rows(j, kmax);
                        row
                    });
                }
            }

            // Dot products of column j against every trailing column and b,
            // restricted to rows i >= j, plus the pivot row itself.
            let (dots, b_dot, rowj) = rows.aggregate(
                (
                    DVector::<f64>::zeros(n),
                    0.0f64,
                    None::<(DVector<f64>, f64)>,
                ),
                |(mut d, mut bd, mut pj), row| {
                    if row.i >= j {
                        let ajj = row.a[j];
                        for k in j..n {
                            d[k] += ajj * row.a[k];
                        }
                        bd += ajj * row.b;
                        if row.i == j {
                            pj = Some((row.a.clone(), row.b));
                        }
                    }
                    (d, bd, pj)
                },
                |a, b| (a.0 + b.0, a.1 + b.1, a.2.or(b.2)),
            );

            let Some((rowj_a, rowj_b)) = rowj else {
                r_diag[j] = 0.0;
                continue;
            };
            let s_j = dots[j];
            if s_j == 0.0 {
                // rank-deficient column: leave the rows untouched
                r_diag[j] = 0.0;
                continue;
            }
            let mut aj_norm = s_j.sqrt();
            if rowj_a[j] < 0.0 {
                aj_norm = -aj_norm;
            }

            // Householder reflection H = I - v vᵀ / beta with
            // v_i = a_ij + aj_norm * e_j; each row only needs its own v_i,
            // the aggregated dot products and the pivot row.
            let beta = s_j + aj_norm * rowj_a[j];
            let mut g = DVector::<f64>::zeros(n);
            for k in j..n {
                g[k] = (dots[k] + aj_norm * rowj_a[k]) / beta;
            }
            let g_b = (b_dot + aj_norm * rowj_b) / beta;

            // Pivot-row values after the reflection, needed for the norm
            // downdates below.
            let v_j = rowj_a[j] + aj_norm;
            let rowj_new: Vec<f64> = ((j + 1)..n).map(|k| rowj_a[k] - v_j * g[k]).collect();

            rows = rows.map(move |row| {
                if row.i < j {
                    return row.clone();
                }
                let mut row = row.clone();
                let v = row.a[j] + if row.i == j { aj_norm } else { 0.0 };
                for k in j..n {
                    row.a[k] -= v * g[k];
                }
                row.b -= v * g_b;
                row
            });

            // Downdate the remaining column norms,
            // see "Lapack Working Note 176".
            for (idx, k) in ((j + 1)..n).enumerate() {
                if r_diag[k] == 0.0 {
                    continue;
                }
                let temp = (rowj_new[idx] / r_diag[k]).powi(2);
                r_diag[k] *= (1.0 - temp).max(0.0).sqrt();
                if 0.05 * (r_diag[k] / wnorm[k]).powi(2) <= epsmch::<f64>() {
                    let fresh = rows
                        .aggregate(
                            0.0f64,
                            |acc, row| {
                                if row.i > j {
                                    acc + row.a[k] * row.a[k]
                                } else {
                                    acc
                                }
                            },
                            |a, b| a + b,
                        )
                        .sqrt();
                    r_diag[k] = fresh;
                    wnorm[k] = fresh;
                }
            }
            r_diag[j] = -aj_norm;
        }

        // Rows below index n only contribute to ||b||; the reduced square
        // system lives in the rows indexed 0..n.
        let mut r = DMatrix::<f64>::zeros(n, n);
        let mut qtb = DVector::<f64>::zeros(n);
        for row in rows
            .filter(|row| row.i < n)
            .to_vec()
            .into_iter()
            .sorted_by_key(|row| row.i)
        {
            for k in 0..n {
                r[(row.i, k)] = row.a[k];
            }
            qtb[row.i] = row.b;
        }

        Self {
            r,
            r_diag,
            qtb,
            ipvt,
            ac_norms,
            b_norm,
            n,
        }
    }

    /// Plain linear least squares: decompose (with pivoting) and
    /// back-substitute in one go.
    pub fn solve<D: DataSet<AugmentedRow>>(rows: D, n: usize) -> DVector<f64> {
        Self::new(rows, n, true).solution()
    }

    /// Entry `(i, j)` of the triangular factor. The strict lower triangle is
    /// zero by construction; indices outside `0..n` are a caller bug.
    pub fn r(&self, i: usize, j: usize) -> f64 {
        assert!(
            i < self.n && j < self.n,
            "qr: R index ({}, {}) out of range for n = {}",
            i,
            j,
            self.n
        );
        if i == j {
            self.r_diag[i]
        } else if i < j {
            self.r[(i, j)]
        } else {
            0.0
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn ipvt(&self) -> &[usize] {
        &self.ipvt
    }

    pub fn qtb(&self) -> &DVector<f64> {
        &self.qtb
    }

    pub fn ac_norm(&self, j: usize) -> f64 {
        self.ac_norms[j]
    }

    pub fn b_norm(&self) -> f64 {
        self.b_norm
    }

    /// Index of the first zero diagonal entry, `n` for full rank.
    pub fn nsing(&self) -> usize {
        (0..self.n)
            .position(|j| self.r_diag[j] == 0.0)
            .unwrap_or(self.n)
    }

    /// Least-squares solution by back-substitution. Columns beyond the first
    /// zero diagonal entry do not contribute; their unknowns come out as 0.
    pub fn solution(&self) -> DVector<f64> {
        let n = self.n;
        let nsing = self.nsing();
        let mut w = self.qtb.clone();
        for j in nsing..n {
            w[j] = 0.0;
        }
        for j in (0..nsing).rev() {
            let mut sum = 0.0;
            for k in (j + 1)..nsing {
                sum += self.r(j, k) * w[k];
            }
            w[j] = (w[j] - sum) / self.r_diag[j];
        }
        let mut x = DVector::zeros(n);
        for j in 0..n {
            x[self.ipvt[j]] = w[j];
        }
        x
    }

    /// Solve the regularized system `min ||[A; D] x - [b; 0]||` for the
    /// diagonal matrix `diag` (given in original column order). The diagonal
    /// is folded into `R` row by row with Givens rotations, exactly as in
    /// MINPACK's `QRSOLV`; columns whose `diag` entry is zero are skipped.
    pub fn qr_solve(&self, diag: &DVector<f64>) -> RegularizedSolve {
        let n = self.n;
        assert_eq!(diag.len(), n, "qr: diagonal length does not match column count");

        // S starts out as Rᵀ in the lower triangle.
        let mut s = DMatrix::<f64>::zeros(n, n);
        for j in 0..n {
            for i in j..n {
                s[(i, j)] = self.r(j, i);
            }
        }
        let mut rhs = self.qtb.clone();
        let mut s_diag = DVector::<f64>::zeros(n);
        let mut row_d = DVector::<f64>::zeros(n);

        for j in 0..n {
            let l = self.ipvt[j];
            if diag[l] != 0.0 {
                for k in j..n {
                    row_d[k] = 0.0;
                }
                row_d[j] = diag[l];

                // Rotate the diagonal entry into S, chasing the fill along
                // the row and carrying the extra rhs component in qtbpj.
                let mut qtbpj = 0.0;
                for k in j..n {
                    if row_d[k] == 0.0 {
                        continue;
                    }
                    let r_kk = s[(k, k)];
                    let (sin, cos) = if r_kk.abs() < row_d[k].abs() {
                        let cot = r_kk / row_d[k];
                        let sin = 0.5 / (0.25 + 0.25 * cot * cot).sqrt();
                        (sin, sin * cot)
                    } else {
                        let tan = row_d[k] / r_kk;
                        let cos = 0.5 / (0.25 + 0.25 * tan * tan).sqrt();
                        (cos * tan, cos)
                    };

                    s[(k, k)] = cos * r_kk + sin * row_d[k];
                    let temp = cos * rhs[k] + sin * qtbpj;
                    qtbpj = -sin * rhs[k] + cos * qtbpj;
                    rhs[k] = temp;

                    for i in (k + 1)..n {
                        let temp = cos * s[(i, k)] + sin * row_d[i];
                        row_d[i] = -sin * s[(i, k)] + cos * row_d[i];
                        s[(i, k)] = temp;
                    }
                }
            }
            s_diag[j] = s[(j, j)];
            s[(j, j)] = self.r_diag[j];
        }

        // Back-substitute against S.
        let nsing = (0..n).position(|j| s_diag[j] == 0.0).unwrap_or(n);
        for j in nsing..n {
            rhs[j] = 0.0;
        }
        for j in (0..nsing).rev() {
            let mut sum = 0.0;
            for i in (j + 1)..nsing {
                sum += s[(i, j)] * rhs[i];
            }
            rhs[j] = (rhs[j] - sum) / s_diag[j];
        }

        let mut x = DVector::zeros(n);
        for j in 0..n {
            x[self.ipvt[j]] = rhs[j];
        }
        RegularizedSolve { x, s, s_diag }
    }

    /// `||A x||`, computed as `||R Pᵀ x||`.
    pub fn a_x_norm(&self, x: &DVector<f64>) -> f64 {
        let mut acc = DVector::<f64>::zeros(self.n);
        for j in 0..self.n {
            let w = x[self.ipvt[j]];
            for i in 0..=j {
                acc[i] += self.r(i, j) * w;
            }
        }
        enorm(&acc)
    }

    /// Largest cosine between `b` and any column of `A`, rescaled by the
    /// initial column norms. Serves as the scale-invariant gradient probe.
    pub fn max_scaled_gradient(&self, f_norm: f64) -> f64 {
        if f_norm == 0.0 {
            return 0.0;
        }
        let mut g = 0.0f64;
        for j in 0..self.n {
            let scale = self.ac_norms[self.ipvt[j]];
            if scale == 0.0 {
                continue;
            }
            let mut sum = 0.0;
            for i in 0..=j {
                sum += self.r(i, j) * (self.qtb[i] / f_norm);
            }
            g = g.max((sum / scale).abs());
        }
        g
    }
}
