//! Trust-region Levenberg-Marquardt driver.
//!
//! The outer loop rebuilds the augmented `[J|r]` row stream at the current
//! parameters, decomposes it and delegates step selection to the inner loop;
//! the inner loop calls [`lm_par`] for a candidate step, scores it against
//! the predicted reduction and adapts the damping parameter and trust-region
//! radius. Thresholds and update rules follow MINPACK's `LMDIF`/`LMDER`.
use crate::problem_LM::RegressionFunction;
use crate::qr_LM::QR;
use crate::trust_region_LM::lm_par;
use crate::utils::enorm;
use log::{debug, info};
use nalgebra::DVector;
use std::fmt;

/// Hyperparameters of the minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct LMConfig {
    /// Relative error desired in the sum of squares.
    pub tol: f64,
    /// Maximum number of outer (Jacobian-rebuilding) iterations.
    pub max_iter: usize,
    /// Forward-difference step for numeric Jacobians.
    pub eps: f64,
    /// Relative error desired between consecutive iterates.
    pub x_tol: f64,
    /// Orthogonality desired between the residuals and the Jacobian columns.
    pub g_tol: f64,
    /// Minimum actual/predicted reduction ratio for a step to be accepted.
    pub ratio_tol: f64,
    /// Factor for the initial trust-region radius.
    pub step_bound: f64,
    /// Machine precision used by the termination tests.
    pub epsmch: f64,
    /// Maximum step-acceptance attempts per outer iteration.
    pub max_inner_iter: usize,
    /// Maximum trials of the damping-parameter search.
    pub max_step_length_iter: usize,
    /// Column pivoting for the internal QR decompositions.
    pub use_pivoting: bool,
}

impl Default for LMConfig {
    fn default() -> Self {
        Self {
            tol: 1.49012e-8,
            max_iter: 10,
            eps: 1e-8,
            x_tol: 1.49012e-8,
            g_tol: 0.0,
            ratio_tol: 1e-4,
            step_bound: 100.0,
            epsmch: 2.22044604926e-16,
            max_inner_iter: 10,
            max_step_length_iter: 10,
            use_pivoting: false,
        }
    }
}

impl LMConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tol(self, tol: f64) -> Self {
        Self { tol, ..self }
    }

    #[must_use]
    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self { max_iter, ..self }
    }

    #[must_use]
    pub fn with_eps(self, eps: f64) -> Self {
        Self { eps, ..self }
    }

    #[must_use]
    pub fn with_x_tol(self, x_tol: f64) -> Self {
        Self { x_tol, ..self }
    }

    #[must_use]
    pub fn with_g_tol(self, g_tol: f64) -> Self {
        Self { g_tol, ..self }
    }

    #[must_use]
    pub fn with_ratio_tol(self, ratio_tol: f64) -> Self {
        Self { ratio_tol, ..self }
    }

    #[must_use]
    pub fn with_step_bound(self, step_bound: f64) -> Self {
        Self { step_bound, ..self }
    }

    #[must_use]
    pub fn with_epsmch(self, epsmch: f64) -> Self {
        Self { epsmch, ..self }
    }

    #[must_use]
    pub fn with_max_inner_iter(self, max_inner_iter: usize) -> Self {
        Self {
            max_inner_iter,
            ..self
        }
    }

    #[must_use]
    pub fn with_max_step_length_iter(self, max_step_length_iter: usize) -> Self {
        Self {
            max_step_length_iter,
            ..self
        }
    }

    #[must_use]
    pub fn with_pivoting(self, use_pivoting: bool) -> Self {
        Self {
            use_pivoting,
            ..self
        }
    }

    /// Check the configuration. Only non-positive `tol`, `max_iter` or `eps`
    /// are rejected; everything else is the caller's judgement call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tol > 0.0) {
            return Err(ConfigError::NonPositiveTol(self.tol));
        }
        if self.max_iter == 0 {
            return Err(ConfigError::ZeroMaxIter);
        }
        if !(self.eps > 0.0) {
            return Err(ConfigError::NonPositiveEps(self.eps));
        }
        Ok(())
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    NonPositiveTol(f64),
    ZeroMaxIter,
    NonPositiveEps(f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NonPositiveTol(v) => write!(f, "tol must be positive, got {}", v),
            ConfigError::ZeroMaxIter => write!(f, "max_iter must be positive"),
            ConfigError::NonPositiveEps(v) => write!(f, "eps must be positive, got {}", v),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Outcome of the minimization. Iteration exhaustion is not an error: the
/// best parameters found so far come back with `converged = false` and the
/// caller judges quality from `residual_norm`.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub parameters: DVector<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    pub converged: bool,
}

struct LMState {
    x: DVector<f64>,
    diag: DVector<f64>,
    x_norm: f64,
    delta: f64,
    par: f64,
    f_norm: f64,
    first_trust_region: bool,
}

struct InnerOutcome {
    stopping: bool,
    converged: bool,
}

/// Minimize the sum of squared residuals of `f` starting from `x0`.
///
/// Fails only on invalid configuration; numerical degeneracy and iteration
/// exhaustion are reported through [`FitReport`].
pub fn minimize<F: RegressionFunction>(
    f: &F,
    x0: &DVector<f64>,
    config: &LMConfig,
) -> Result<FitReport, ConfigError> {
    config.validate()?;
    let n = x0.len();
    assert!(n > 0, "minimize requires at least one parameter");

    let mut st = LMState {
        x: x0.clone(),
        diag: DVector::from_element(n, 1.0),
        x_norm: 0.0,
        delta: 0.0,
        par: 0.0,
        f_norm: f.apply(x0).sqrt(),
        first_trust_region: true,
    };
    let mut converged = false;
    let mut iterations = 0usize;

    for outer in 0..config.max_iter {
        iterations = outer + 1;

        let rows = f.jacobian_and_residuals_matrix(&st.x);
        let qr = QR::new(rows, n, config.use_pivoting);
        st.f_norm = qr.b_norm();
        if st.f_norm == 0.0 {
            converged = true;
            break;
        }

        // The scaling never shrinks, which keeps badly scaled columns from
        // oscillating the trust region.
        if outer == 0 {
            for j in 0..n {
                st.diag[j] = qr.ac_norm(j).max(1.0);
            }
            st.x_norm = enorm(&st.x.component_mul(&st.diag));
            st.delta = if st.x_norm == 0.0 {
                config.step_bound
            } else {
                config.step_bound * st.x_norm
            };
        } else {
            for j in 0..n {
                st.diag[j] = st.diag[j].max(qr.ac_norm(j));
            }
        }

        let g_norm = qr.max_scaled_gradient(st.f_norm);
        info!(
            "lm outer {}: residual norm {:.6e}, gnorm {:.3e}, delta {:.3e}",
            outer, st.f_norm, g_norm, st.delta
        );
        if g_norm <= config.g_tol {
            converged = true;
            break;
        }
        if g_norm <= config.epsmch {
            break;
        }

        let outcome = inner_loop(f, &qr, config, &mut st);
        if outcome.stopping {
            converged = outcome.converged;
            break;
        }
    }

    Ok(FitReport {
        parameters: st.x,
        residual_norm: st.f_norm,
        iterations,
        converged,
    })
}

fn inner_loop<F: RegressionFunction>(
    f: &F,
    qr: &QR,
    config: &LMConfig,
    st: &mut LMState,
) -> InnerOutcome {
    const P1: f64 = 0.1;
    const P25: f64 = 0.25;
    const P75: f64 = 0.75;
    const HALF: f64 = 0.5;

    st.par = 0.0;
    let mut inner = 0usize;
    loop {
        let param = lm_par(qr, &st.diag, st.delta, st.par, config.max_step_length_iter);
        st.par = param.par;
        let p_norm = param.dx_norm;

        if st.first_trust_region && p_norm < st.delta {
            st.delta = p_norm;
        }
        st.first_trust_region = false;

        let trial = &st.x - &param.step;
        let f_norm1 = f.apply(&trial).sqrt();

        let actual = if P1 * f_norm1 < st.f_norm {
            1.0 - (f_norm1 / st.f_norm).powi(2)
        } else {
            -1.0
        };
        let temp1 = (qr.a_x_norm(&param.step) / st.f_norm).powi(2);
        let temp2 = (st.par.sqrt() * p_norm / st.f_norm).powi(2);
        let predicted = temp1 + temp2 / HALF;
        let dir_der = -(temp1 + temp2);
        let ratio = if predicted == 0.0 {
            0.0
        } else {
            actual / predicted
        };
        debug!(
            "lm inner {}: ratio {:.3e}, par {:.3e}, pnorm {:.3e}",
            inner, ratio, st.par, p_norm
        );

        if ratio <= P25 {
            let mut temp = if actual >= 0.0 {
                HALF
            } else {
                HALF * dir_der / (dir_der + HALF * actual)
            };
            if P1 * f_norm1 >= st.f_norm || temp < P1 {
                temp = P1;
            }
            st.delta = temp * st.delta.min(p_norm * 10.0);
            st.par /= temp;
        } else if st.par == 0.0 || ratio >= P75 {
            st.delta = p_norm / HALF;
            st.par *= HALF;
        }
        debug_assert!(
            st.delta.is_finite() && st.delta > 0.0,
            "trust-region radius degenerated"
        );

        let accepted = ratio >= config.ratio_tol;
        if accepted {
            st.x = trial;
            st.x_norm = enorm(&st.x.component_mul(&st.diag));
            st.f_norm = f_norm1;
        }

        // convergence tests
        let ftol_ok = actual.abs() <= config.tol && predicted <= config.tol && HALF * ratio <= 1.0;
        let xtol_ok = st.delta <= config.x_tol * st.x_norm;
        if ftol_ok || xtol_ok {
            return InnerOutcome {
                stopping: true,
                converged: true,
            };
        }
        // termination tests: the bounds cannot be met at machine precision
        let ftol_eps =
            actual.abs() <= config.epsmch && predicted <= config.epsmch && HALF * ratio <= 1.0;
        let xtol_eps = st.delta <= config.epsmch * st.x_norm;
        if ftol_eps || xtol_eps {
            return InnerOutcome {
                stopping: true,
                converged: false,
            };
        }

        inner += 1;
        if accepted || inner >= config.max_inner_iter {
            return InnerOutcome {
                stopping: false,
                converged: false,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem_LM::{DataPoint, PointwiseRegression};
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn linear_points() -> Vec<DataPoint> {
        (1..=10)
            .map(|i| {
                let x = i as f64 / 10.0;
                DataPoint {
                    x: DVector::from_vec(vec![x]),
                    y: 2.0 + 3.0 * x,
                }
            })
            .collect()
    }

    fn linear_problem() -> PointwiseRegression<impl Fn(&DVector<f64>, &DVector<f64>) -> f64> {
        PointwiseRegression::new(
            linear_points(),
            |p: &DVector<f64>, x: &DVector<f64>| p[0] + p[1] * x[0],
            1e-8,
        )
    }

    #[test]
    fn test_linear_regression_converges() {
        let problem = linear_problem();
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let report = minimize(&problem, &x0, &LMConfig::default()).unwrap();

        assert!(report.converged);
        assert!(report.iterations <= 10);
        assert_relative_eq!(report.parameters[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(report.parameters[1], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_linear_regression_with_pivoting_matches() {
        let problem = linear_problem();
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let config = LMConfig::default().with_pivoting(true);
        let report = minimize(&problem, &x0, &config).unwrap();
        assert_relative_eq!(report.parameters[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(report.parameters[1], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_max_iter_rejected() {
        let problem = linear_problem();
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let config = LMConfig::default().with_max_iter(0);
        assert_eq!(
            minimize(&problem, &x0, &config).unwrap_err(),
            ConfigError::ZeroMaxIter
        );
        assert!(LMConfig::default().with_tol(0.0).validate().is_err());
        assert!(LMConfig::default().with_eps(-1.0).validate().is_err());
    }

    #[test]
    fn test_builder_setters_cover_every_field() {
        let config = LMConfig::new()
            .with_tol(1e-10)
            .with_max_iter(25)
            .with_eps(1e-7)
            .with_x_tol(1e-9)
            .with_g_tol(1e-12)
            .with_ratio_tol(1e-3)
            .with_step_bound(50.0)
            .with_epsmch(1e-15)
            .with_max_inner_iter(5)
            .with_max_step_length_iter(7)
            .with_pivoting(true);

        assert_eq!(
            config,
            LMConfig {
                tol: 1e-10,
                max_iter: 25,
                eps: 1e-7,
                x_tol: 1e-9,
                g_tol: 1e-12,
                ratio_tol: 1e-3,
                step_bound: 50.0,
                epsmch: 1e-15,
                max_inner_iter: 5,
                max_step_length_iter: 7,
                use_pivoting: true,
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_iteration_stays_finite() {
        let problem = linear_problem();
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let config = LMConfig::default().with_max_iter(1);
        let report = minimize(&problem, &x0, &config).unwrap();

        assert_eq!(report.iterations, 1);
        assert!(report.parameters.iter().all(|v| v.is_finite()));
        assert!(report.residual_norm.is_finite());
    }

    #[test]
    fn test_start_at_optimum_terminates() {
        let problem = linear_problem();
        let x0 = DVector::from_vec(vec![2.0, 3.0]);
        let report = minimize(&problem, &x0, &LMConfig::default()).unwrap();
        assert!(report.converged);
        assert!(report.residual_norm < 1e-10);
        assert_relative_eq!(report.parameters[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(report.parameters[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_randomized_problems_stay_finite() {
        // rough fuzz over data, starting points and iteration budgets; the
        // report must always be finite no matter how tight the budget
        let mut rng = StdRng::seed_from_u64(1234);
        for _ in 0..25 {
            let a = 4.0 * rng.random::<f64>() - 2.0;
            let b = 4.0 * rng.random::<f64>() - 2.0;
            let points: Vec<DataPoint> = (0..8)
                .map(|i| {
                    let x = i as f64 * 0.25;
                    DataPoint {
                        x: DVector::from_vec(vec![x]),
                        y: a + b * x + 0.1 * (rng.random::<f64>() - 0.5),
                    }
                })
                .collect();
            let problem = PointwiseRegression::new(
                points,
                |p: &DVector<f64>, x: &DVector<f64>| p[0] + p[1] * x[0],
                1e-8,
            );
            let x0 = DVector::from_vec(vec![
                10.0 * (rng.random::<f64>() - 0.5),
                10.0 * (rng.random::<f64>() - 0.5),
            ]);
            let max_iter = 1 + (rng.random::<f64>() * 5.0) as usize;
            let config = LMConfig::default().with_max_iter(max_iter);
            let report = minimize(&problem, &x0, &config).unwrap();

            assert!(report.iterations <= max_iter);
            assert!(report.parameters.iter().all(|v| v.is_finite()));
            assert!(report.residual_norm.is_finite());
        }
    }

    #[test]
    fn test_rank_deficient_jacobian_does_not_panic() {
        // two perfectly collinear predictors
        let points: Vec<DataPoint> = (1..=6)
            .map(|i| {
                let x = i as f64;
                DataPoint {
                    x: DVector::from_vec(vec![x, x]),
                    y: 5.0 * x,
                }
            })
            .collect();
        let problem = PointwiseRegression::new(
            points,
            |p: &DVector<f64>, x: &DVector<f64>| p[0] * x[0] + p[1] * x[1],
            1e-8,
        );
        let x0 = DVector::from_vec(vec![1.0, 1.0]);
        let report = minimize(&problem, &x0, &LMConfig::default()).unwrap();
        assert!(report.parameters.iter().all(|v| v.is_finite()));
        // any split of the coefficient between the twin columns fits
        let total = report.parameters[0] + report.parameters[1];
        assert_relative_eq!(total, 5.0, epsilon = 1e-4);
    }
}
