//! High level curve fitting: give it data, a model closure and an initial
//! guess, get fitted parameters and goodness of fit back.
use crate::LM_optimization::{ConfigError, FitReport, LMConfig, minimize};
use crate::problem_LM::{DataPoint, PointwiseRegression};
use log::info;
use nalgebra::DVector;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};

/// Fit a scalar model `y = model(params, x)` to measured `(x, y)` pairs.
pub struct Fitting<M>
where
    M: Fn(&DVector<f64>, f64) -> f64 + Send + Sync,
{
    pub x_data: Vec<f64>,
    pub y_data: Vec<f64>,
    model: M,
    pub initial_guess: DVector<f64>,
    pub config: LMConfig,
    pub loglevel: Option<String>,
    pub result: Option<FitReport>,
    pub r_squared: Option<f64>,
}

impl<M> Fitting<M>
where
    M: Fn(&DVector<f64>, f64) -> f64 + Send + Sync,
{
    pub fn new(x_data: Vec<f64>, y_data: Vec<f64>, model: M, initial_guess: Vec<f64>) -> Self {
        Self {
            x_data,
            y_data,
            model,
            initial_guess: DVector::from_vec(initial_guess),
            config: LMConfig::default(),
            loglevel: Some("info".to_string()),
            result: None,
            r_squared: None,
        }
    }

    pub fn set_config(&mut self, config: LMConfig) {
        self.config = config;
    }

    pub fn set_loglevel(&mut self, loglevel: Option<String>) {
        if let Some(level) = &loglevel {
            assert!(
                level == "debug"
                    || level == "info"
                    || level == "warn"
                    || level == "error"
                    || level == "off"
                    || level == "none",
                "loglevel must be debug/info/warn/error or off/none"
            );
        }
        self.loglevel = loglevel;
    }

    fn run_fit(&mut self) -> Result<FitReport, ConfigError> {
        assert!(!self.x_data.is_empty(), "x_data must not be empty");
        assert_eq!(
            self.x_data.len(),
            self.y_data.len(),
            "x_data and y_data must have the same length"
        );

        let points: Vec<DataPoint> = self
            .x_data
            .iter()
            .zip(self.y_data.iter())
            .map(|(&x, &y)| DataPoint {
                x: DVector::from_vec(vec![x]),
                y,
            })
            .collect();
        let model = &self.model;
        let problem = PointwiseRegression::new(
            points,
            move |p: &DVector<f64>, xv: &DVector<f64>| model(p, xv[0]),
            self.config.eps,
        );
        let report = minimize(&problem, &self.initial_guess, &self.config)?;

        let mean = self.y_data.iter().sum::<f64>() / self.y_data.len() as f64;
        let ss_tot: f64 = self.y_data.iter().map(|y| (y - mean).powi(2)).sum();
        let ss_res = report.residual_norm.powi(2);
        self.r_squared = if ss_tot > 0.0 {
            Some(1.0 - ss_res / ss_tot)
        } else {
            None
        };
        info!(
            "fit finished after {} iterations, residual norm {:.6e}",
            report.iterations, report.residual_norm
        );
        self.result = Some(report.clone());
        Ok(report)
    }

    // wrapper around the fit to set up logging
    pub fn fit(&mut self) -> Result<FitReport, ConfigError> {
        let is_logging_disabled = self
            .loglevel
            .as_ref()
            .map(|level| level == "off" || level == "none")
            .unwrap_or(false);

        if is_logging_disabled {
            self.run_fit()
        } else {
            let loglevel = self.loglevel.clone();
            let log_option = if let Some(level) = loglevel {
                match level.as_str() {
                    "debug" => LevelFilter::Debug,
                    "info" => LevelFilter::Info,
                    "warn" => LevelFilter::Warn,
                    "error" => LevelFilter::Error,
                    _ => panic!("loglevel must be debug, info, warn or error"),
                }
            } else {
                LevelFilter::Info
            };
            let logger_instance = CombinedLogger::init(vec![TermLogger::new(
                log_option,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            )]);

            match logger_instance {
                Ok(()) => {
                    let res = self.run_fit();
                    info!("fitting ended");
                    res
                }
                Err(_) => self.run_fit(),
            }
        }
    }

    /// Evaluate the fitted model at `x`. Panics if called before `fit`.
    pub fn eval(&self, x: f64) -> f64 {
        let report = self
            .result
            .as_ref()
            .unwrap_or_else(|| panic!("eval called before fit"));
        (self.model)(&report.parameters, x)
    }

    pub fn get_result(&self) -> Option<FitReport> {
        self.result.clone()
    }
}
