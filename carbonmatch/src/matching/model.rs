//! Matching model specification and propensity estimation.
//!
//! The model specification is built explicitly from the base covariate
//! list plus an "augmented" flag, rather than mutated mid-pipeline, so the
//! conditional inclusion of the pre-intervention deforestation rate is
//! testable on its own.
//!
//! Propensity scores come from a binomial regression of the treatment
//! indicator on the covariates, fit per stratum with iteratively
//! reweighted least squares. Strata with too few treatment pixels (or a
//! failed fit) fall back to a standardized distance on the raw covariates,
//! since logistic regression is unreliable with very few positive cases.

use crate::error::PipelineError;
use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the derived pre-intervention deforestation-rate covariate.
pub const DEFOR_RATE_TERM: &str = "defor_rate";

/// The covariate terms entering the propensity model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub terms: Vec<String>,
}

impl ModelSpec {
    pub fn new(base_covariates: Vec<String>) -> Self {
        Self {
            terms: base_covariates,
        }
    }

    /// Extend the specification with the deforestation-rate term when the
    /// covariate is computable for the site being matched.
    pub fn with_deforestation_rate(mut self, augmented: bool) -> Self {
        if augmented && !self.terms.iter().any(|t| t == DEFOR_RATE_TERM) {
            self.terms.push(DEFOR_RATE_TERM.to_string());
        }
        self
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::MissingArtifact(path.to_path_buf()));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

const IRLS_MAX_ITER: usize = 25;
const IRLS_TOL: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-10;

/// Fit a logistic regression of `labels` on `rows` and return the fitted
/// probabilities, or `None` when the solve fails (singular design,
/// non-finite values).
///
/// Covariates are standardized internally for numerical stability; fitted
/// probabilities are unaffected by the affine rescaling.
pub fn fit_propensity(rows: &[Vec<f64>], labels: &[bool]) -> Option<Vec<f64>> {
    let n = rows.len();
    if n == 0 || n != labels.len() {
        return None;
    }
    let k = rows[0].len();

    let (means, sds) = column_moments(rows, k);
    let x = DMatrix::from_fn(n, k + 1, |r, c| {
        if c == 0 {
            1.0
        } else {
            let j = c - 1;
            if sds[j] > 0.0 {
                (rows[r][j] - means[j]) / sds[j]
            } else {
                0.0
            }
        }
    });
    let y = DVector::from_fn(n, |r, _| if labels[r] { 1.0 } else { 0.0 });

    let mut beta = DVector::zeros(k + 1);
    for _ in 0..IRLS_MAX_ITER {
        let eta = &x * &beta;
        let mu = eta.map(|e: f64| 1.0 / (1.0 + (-e).exp()));
        let w = mu.map(|m: f64| (m * (1.0 - m)).max(MIN_WEIGHT));

        // Working response z = eta + (y - mu) / w
        let mut z = eta.clone();
        for i in 0..n {
            z[i] += (y[i] - mu[i]) / w[i];
        }

        // Weighted normal equations: (X'WX) beta = X'Wz
        let mut xw = x.clone();
        for i in 0..n {
            for c in 0..k + 1 {
                xw[(i, c)] *= w[i];
            }
        }
        let xtwx = x.transpose() * &xw;
        let xtwz = xw.transpose() * &z;

        let next = match Cholesky::new(xtwx.clone()) {
            Some(ch) => ch.solve(&xtwz),
            None => xtwx.lu().solve(&xtwz)?,
        };
        if next.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let delta = (&next - &beta).amax();
        beta = next;
        if delta < IRLS_TOL {
            break;
        }
    }

    let eta = &x * &beta;
    Some(eta.iter().map(|e| 1.0 / (1.0 + (-e).exp())).collect())
}

/// Distance matrix on raw covariates, standardized per column over the
/// pooled treatment and control rows. Columns with zero spread contribute
/// nothing.
pub fn standardized_distances(treat: &[Vec<f64>], control: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let k = treat.first().or(control.first()).map_or(0, Vec::len);
    let pooled: Vec<Vec<f64>> = treat.iter().chain(control.iter()).cloned().collect();
    let (_, sds) = column_moments(&pooled, k);

    treat
        .iter()
        .map(|t| {
            control
                .iter()
                .map(|c| {
                    let mut sum = 0.0;
                    for j in 0..k {
                        if sds[j] > 0.0 {
                            sum += ((t[j] - c[j]) / sds[j]).powi(2);
                        }
                    }
                    sum.sqrt()
                })
                .collect()
        })
        .collect()
}

/// Distance matrix from fitted propensity scores: absolute score
/// difference per treatment/control pair.
pub fn propensity_distances(treat_scores: &[f64], control_scores: &[f64]) -> Vec<Vec<f64>> {
    treat_scores
        .iter()
        .map(|t| control_scores.iter().map(|c| (t - c).abs()).collect())
        .collect()
}

fn column_moments(rows: &[Vec<f64>], k: usize) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len().max(1) as f64;
    let mut means = vec![0.0; k];
    for row in rows {
        for j in 0..k {
            means[j] += row[j];
        }
    }
    for m in &mut means {
        *m /= n;
    }
    let mut vars = vec![0.0; k];
    for row in rows {
        for j in 0..k {
            vars[j] += (row[j] - means[j]).powi(2);
        }
    }
    let sds = vars.iter().map(|v| (v / n).sqrt()).collect();
    (means, sds)
}
