//! Damping-parameter search for the trust-region sub-problem.
#![allow(clippy::excessive_precision)]

use crate::qr_LM::QR;
use crate::utils::{dwarf, enorm};
use log::info;
use nalgebra::DVector;

/// Candidate step produced by [`lm_par`].
pub struct LMParameter {
    pub par: f64,
    pub step: DVector<f64>,
    pub dx: DVector<f64>,
    pub dx_norm: f64,
}

/// Find `par >= 0` such that the length of the scaled, diagonally
/// regularized Gauss-Newton step
///
///   (AᵀA + par·DᵀD) p = Aᵀb
///
/// is within 10% of the trust-region radius `delta`, or `par = 0` when the
/// unconstrained step is already interior. The search brackets `par` between
/// bounds derived from the column norms and `R`, then refines with an
/// approximate Newton iteration, at most `max_iter` trials.
///
/// This resembles `LMPAR` from MINPACK; for the underlying theory see
/// More, "The Levenberg-Marquardt algorithm: Implementation and theory"
/// (1978).
pub fn lm_par(
    qr: &QR,
    diag: &DVector<f64>,
    delta: f64,
    par0: f64,
    max_iter: usize,
) -> LMParameter {
    const P1: f64 = 0.1;
    const P001: f64 = 1.0e-3;
    debug_assert!(delta > 0.0);
    debug_assert!(par0 >= 0.0);
    debug_assert!(!diag.iter().any(|&d| d == 0.0));

    let n = qr.n();
    let nsing = qr.nsing();

    // Gauss-Newton direction, rank-deficient columns contributing nothing.
    let mut x = qr.solution();
    let mut dx = x.component_mul(diag);
    let mut dx_norm = enorm(&dx);
    let mut fp = dx_norm - delta;
    if fp <= P1 * delta {
        info!("lm_par: Gauss-Newton step interior, dx_norm = {}", dx_norm);
        return LMParameter {
            par: 0.0,
            step: x,
            dx,
            dx_norm,
        };
    }

    // Lower bound: zero when A is rank deficient, otherwise the Newton step
    // of phi(par) = ||D p(par)|| - delta at par = 0.
    let mut par_low = if nsing == n {
        let mut w = DVector::<f64>::zeros(n);
        for j in 0..n {
            let l = qr.ipvt()[j];
            w[j] = diag[l] * (dx[l] / dx_norm);
        }
        for j in 0..n {
            let mut sum = 0.0;
            for i in 0..j {
                sum += qr.r(i, j) * w[i];
            }
            w[j] = (w[j] - sum) / qr.r(j, j);
        }
        let temp = enorm(&w);
        ((fp / delta) / temp) / temp
    } else {
        0.0
    };

    // Upper bound: ||D⁻¹ Aᵀ b|| / delta, read off the triangular factor.
    let g_norm;
    let mut par_up = {
        let mut w = DVector::<f64>::zeros(n);
        for j in 0..n {
            let mut sum = 0.0;
            for i in 0..=j {
                sum += qr.r(i, j) * qr.qtb()[i];
            }
            w[j] = sum / diag[qr.ipvt()[j]];
        }
        g_norm = enorm(&w);
        let up = g_norm / delta;
        if up == 0.0 { dwarf::<f64>() / delta.min(P1) } else { up }
    };

    let mut par = par0.max(par_low).min(par_up);
    if par == 0.0 {
        par = g_norm / dx_norm;
    }

    let mut iter = 0usize;
    loop {
        iter += 1;
        if par == 0.0 {
            par = dwarf::<f64>().max(P001 * par_up);
        }

        let scaled = diag.map(|d| par.sqrt() * d);
        let solved = qr.qr_solve(&scaled);
        x = solved.x;
        dx = x.component_mul(diag);
        dx_norm = enorm(&dx);
        let fp_old = fp;
        fp = dx_norm - delta;

        if fp.abs() <= P1 * delta
            || (par_low == 0.0 && fp <= fp_old && fp_old < 0.0)
            || iter >= max_iter
        {
            break;
        }

        // Newton correction through the S factor of the regularized solve.
        let mut w = DVector::<f64>::zeros(n);
        for j in 0..n {
            let l = qr.ipvt()[j];
            w[j] = diag[l] * (dx[l] / dx_norm);
        }
        for j in 0..n {
            w[j] /= solved.s_diag[j];
            let temp = w[j];
            for i in (j + 1)..n {
                w[i] -= solved.s[(i, j)] * temp;
            }
        }
        let temp = enorm(&w);
        let par_c = ((fp / delta) / temp) / temp;

        if fp > 0.0 {
            par_low = par_low.max(par);
        }
        if fp < 0.0 {
            par_up = par_up.min(par);
        }
        par = par_low.max(par + par_c);
    }

    LMParameter {
        par,
        step: x,
        dx,
        dx_norm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SeqDataSet;
    use crate::qr_LM::AugmentedRow;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn qr_from(a: &DMatrix<f64>, b: &DVector<f64>, pivoting: bool) -> QR {
        let rows: Vec<AugmentedRow> = (0..a.nrows())
            .map(|i| AugmentedRow {
                a: a.row(i).transpose(),
                b: b[i],
                i,
            })
            .collect();
        QR::new(SeqDataSet::from(rows), a.ncols(), pivoting)
    }

    #[test]
    fn test_interior_step_gives_zero_par() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 1.0, 2.0, 5.0, 3.0, 1.0, 3.0, 6.0]);
        let b = DVector::from_vec(vec![0.01, -0.02, 0.005]);
        let qr = qr_from(&a, &b, true);

        let diag = DVector::from_element(3, 1.0);
        let param = lm_par(&qr, &diag, 100.0, 0.0, 10);
        assert_eq!(param.par, 0.0);
        assert_relative_eq!(param.step, qr.solution(), epsilon = 1e-12);
    }

    #[test]
    fn test_constrained_step_lands_on_boundary() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let b = DVector::from_vec(vec![10.0, -7.0, 4.0]);
        let qr = qr_from(&a, &b, false);

        let diag = DVector::from_element(3, 1.0);
        let delta = 0.5;
        let param = lm_par(&qr, &diag, delta, 0.0, 10);
        assert!(param.par > 0.0);
        assert!((param.dx_norm - delta).abs() <= 0.1 * delta);
        // the regularized step shrinks but keeps the Gauss-Newton direction
        // for this identity system
        let gn = qr.solution();
        let cos = param.step.dot(&gn) / (param.step.norm() * gn.norm());
        assert_relative_eq!(cos, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_rank_deficient_system_does_not_panic() {
        let a = DMatrix::from_row_slice(
            4,
            3,
            &[30.0, 30.0, 24.0, 43.0, 43.0, 39.0, 34.0, 34.0, -10.0, 26.0, 26.0, -34.0],
        );
        let b = DVector::from_vec(vec![1.0, 2.0, 5.0, 4.0]);
        let qr = qr_from(&a, &b, true);

        let diag = DVector::from_vec(vec![2.0, 1.0, 1.5]);
        let param = lm_par(&qr, &diag, 0.25, 0.0, 10);
        assert!(param.par.is_finite());
        assert!(param.step.iter().all(|v| v.is_finite()));
        assert!(param.dx_norm.is_finite());
    }
}
