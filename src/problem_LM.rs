//! Residual problems for the least-squares solver.
//!
//! A [`RegressionFunction`] turns parameters into the augmented `[J|r]` row
//! stream the QR decomposition consumes. [`PointwiseRegression`] is the
//! common case: one residual per observed data point, with the Jacobian
//! taken by forward differences.
use crate::dataset::{DataSet, SeqDataSet};
use crate::qr_LM::AugmentedRow;
use nalgebra::DVector;

/// One observation: a predictor vector and the measured response.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub x: DVector<f64>,
    pub y: f64,
}

/// A least-squares problem seen through its linearization.
///
/// Residuals follow the `model - measurement` convention, so the local
/// linear model at `params` is `r(params) - J * step` and the minimizer
/// moves by `params - step`.
pub trait RegressionFunction {
    type Rows: DataSet<AugmentedRow>;

    /// Residual of a single observation at `params`.
    fn residual(&self, params: &DVector<f64>, point: &DataPoint) -> f64;

    /// Gradient of the residual with respect to `params`, and the residual
    /// itself.
    fn jacobian_and_residual(&self, params: &DVector<f64>, point: &DataPoint)
    -> (DVector<f64>, f64);

    /// The full augmented system `[J|r]` at `params`, one row per
    /// observation, indexed in data order.
    fn jacobian_and_residuals_matrix(&self, params: &DVector<f64>) -> Self::Rows;

    /// Sum of squared residuals at `params`.
    fn apply(&self, params: &DVector<f64>) -> f64;
}

/// Pointwise model fitting over an in-memory collection, with numeric
/// forward-difference derivatives.
pub struct PointwiseRegression<M> {
    data: SeqDataSet<DataPoint>,
    model: M,
    eps: f64,
}

impl<M> PointwiseRegression<M>
where
    M: Fn(&DVector<f64>, &DVector<f64>) -> f64 + Send + Sync,
{
    pub fn new(points: Vec<DataPoint>, model: M, eps: f64) -> Self {
        assert!(eps > 0.0, "finite-difference step must be positive");
        Self {
            data: SeqDataSet::from(points),
            model,
            eps,
        }
    }

    pub fn data(&self) -> &SeqDataSet<DataPoint> {
        &self.data
    }
}

impl<M> RegressionFunction for PointwiseRegression<M>
where
    M: Fn(&DVector<f64>, &DVector<f64>) -> f64 + Send + Sync,
{
    type Rows = SeqDataSet<AugmentedRow>;

    fn residual(&self, params: &DVector<f64>, point: &DataPoint) -> f64 {
        (self.model)(params, &point.x) - point.y
    }

    fn jacobian_and_residual(
        &self,
        params: &DVector<f64>,
        point: &DataPoint,
    ) -> (DVector<f64>, f64) {
        let n = params.len();
        let r0 = self.residual(params, point);
        let mut grad = DVector::zeros(n);
        let mut shifted = params.clone();
        for k in 0..n {
            // step scales with the parameter so huge and tiny magnitudes
            // both keep significant digits
            let h = self.eps * params[k].abs().max(1.0);
            shifted[k] = params[k] + h;
            grad[k] = (self.residual(&shifted, point) - r0) / h;
            shifted[k] = params[k];
        }
        (grad, r0)
    }

    fn jacobian_and_residuals_matrix(&self, params: &DVector<f64>) -> Self::Rows {
        let rows: Vec<AugmentedRow> = self
            .data
            .zip_with_index()
            .into_iter()
            .map(|(point, i)| {
                let (grad, r) = self.jacobian_and_residual(params, &point);
                AugmentedRow {
                    a: grad,
                    b: r,
                    i,
                }
            })
            .collect();
        SeqDataSet::from(rows)
    }

    fn apply(&self, params: &DVector<f64>) -> f64 {
        self.data.aggregate(
            0.0,
            |acc, point| {
                let r = self.residual(params, point);
                acc + r * r
            },
            |a, b| a + b,
        )
    }
}
