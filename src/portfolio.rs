use crate::config::{EngineConfig, RunConfig};
use crate::data::{self, PriceTable};
use crate::error::{PortfolioError, PortfolioResult};
use crate::report::OptimizationReport;
use crate::sampler::{self, SamplePoint};
use crate::solver::{dot, ConstrainedProblem, EqualityConstraint, Solution, SolverOptions};
use crate::stats::{self, ReturnStatistics};
use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Volatility below this is treated as zero: the Sharpe ratio is undefined there.
pub const MIN_VOLATILITY: f64 = 1e-10;

/// Relative pivot floor for the positive-definiteness check.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Accepted |Σw − 1| before a solver result is renormalized.
const SIMPLEX_TOLERANCE: f64 = 1e-9;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// A weight vector together with its model return, volatility and Sharpe ratio.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    /// `(expected_return − risk_free_rate) / volatility`; `None` at zero volatility.
    pub sharpe: Option<f64>,
}

/// Pins the portfolio's expected return for a minimum-volatility solve.
#[derive(Clone, Copy, Debug)]
pub struct ReturnConstraint<'a> {
    pub expected_returns: &'a [f64],
    pub target: f64,
}

/// One efficient-frontier solve. Failed targets keep their slot so the
/// sequence stays aligned with the requested targets.
#[derive(Clone, Debug)]
pub struct FrontierPoint {
    pub target_return: f64,
    pub result: Result<PortfolioMetrics, PortfolioError>,
}

impl FrontierPoint {
    pub fn metrics(&self) -> Option<&PortfolioMetrics> {
        self.result.as_ref().ok()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Math
// ──────────────────────────────────────────────────────────────────────────────

pub fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    dot(weights, means)
}

pub fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

pub fn portfolio_volatility(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    portfolio_variance(weights, cov).max(0.0).sqrt()
}

pub fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free_rate: f64) -> Option<f64> {
    if volatility > MIN_VOLATILITY {
        Some((expected_return - risk_free_rate) / volatility)
    } else {
        None
    }
}

pub fn evaluate(weights: Vec<f64>, means: &[f64], cov: &[Vec<f64>], risk_free_rate: f64) -> PortfolioMetrics {
    let expected_return = portfolio_return(&weights, means);
    let volatility = portfolio_volatility(&weights, cov);
    PortfolioMetrics {
        sharpe: sharpe_ratio(expected_return, volatility, risk_free_rate),
        weights,
        expected_return,
        volatility,
    }
}

fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    mat.iter().map(|row| dot(row, v)).collect()
}

pub fn equal_weights(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

/// Checks shapes, finiteness and symmetry of the estimation inputs.
pub fn validate_inputs(expected_returns: &[f64], cov: &[Vec<f64>]) -> PortfolioResult<()> {
    let n = expected_returns.len();
    if n == 0 {
        return Err(PortfolioError::InsufficientInstruments { required: 1, actual: 0 });
    }
    if cov.len() != n {
        return Err(PortfolioError::DimensionMismatch { expected: n, actual: cov.len() });
    }
    if let Some(row) = cov.iter().find(|row| row.len() != n) {
        return Err(PortfolioError::DimensionMismatch { expected: n, actual: row.len() });
    }
    if expected_returns.iter().chain(cov.iter().flatten()).any(|v| !v.is_finite()) {
        return Err(PortfolioError::InvalidInput("non-finite expected return or covariance entry".into()));
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let scale = cov[i][j].abs().max(cov[j][i].abs()).max(1.0);
            if (cov[i][j] - cov[j][i]).abs() > 1e-10 * scale {
                return Err(PortfolioError::InvalidInput(format!(
                    "covariance matrix is not symmetric at ({}, {})",
                    i, j
                )));
            }
        }
    }
    Ok(())
}

/// Rejects covariance matrices that are singular or numerically close to it
/// (zero-variance instruments, duplicated instruments, too few observations).
pub fn check_positive_definite(cov: &[Vec<f64>]) -> PortfolioResult<()> {
    let n = cov.len();
    let max_diag = (0..n).map(|i| cov[i][i]).fold(0.0_f64, f64::max);
    if max_diag <= 0.0 {
        return Err(PortfolioError::SingularCovariance("all instruments have zero variance".into()));
    }
    let floor = PIVOT_TOLERANCE * max_diag;

    // Cholesky factorization; a non-positive pivot means the matrix is not PD.
    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let mut pivot = cov[j][j];
        for k in 0..j {
            pivot -= l[j][k] * l[j][k];
        }
        if pivot <= floor {
            return Err(PortfolioError::SingularCovariance(format!(
                "pivot {:.3e} at instrument {} (zero variance, duplicate instrument, or too few observations)",
                pivot, j
            )));
        }
        let d = pivot.sqrt();
        l[j][j] = d;
        for i in (j + 1)..n {
            let mut s = cov[i][j];
            for k in 0..j {
                s -= l[i][k] * l[j][k];
            }
            l[i][j] = s / d;
        }
    }
    Ok(())
}

/// Clamps into [0, 1] and rescales so the weights sum to exactly one.
fn renormalize(mut weights: Vec<f64>) -> PortfolioResult<Vec<f64>> {
    weights.iter_mut().for_each(|w| *w = w.clamp(0.0, 1.0));
    let sum: f64 = weights.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Err(PortfolioError::InvalidInput("solver returned a degenerate weight vector".into()));
    }
    if (sum - 1.0).abs() > SIMPLEX_TOLERANCE {
        warn!("Renormalizing solver weights (sum={:.12})", sum);
    }
    weights.iter_mut().for_each(|w| *w /= sum);
    Ok(weights)
}

// ──────────────────────────────────────────────────────────────────────────────
// Solvers
// ──────────────────────────────────────────────────────────────────────────────

fn simplex_problem<'a>(
    n: usize,
    objective: impl Fn(&[f64]) -> f64 + 'a,
    gradient: impl Fn(&[f64], &mut [f64]) + 'a,
) -> ConstrainedProblem<'a> {
    ConstrainedProblem::new(objective, vec![0.0; n], vec![1.0; n])
        .with_gradient(gradient)
        .subject_to(EqualityConstraint::linear(vec![1.0; n], 1.0))
}

/// Long-only weights maximizing `(w·μ − r_f) / √(wᵀΣw)`, started from equal weights.
///
/// With at least one instrument above the risk-free rate the ratio is
/// quasi-concave on the simplex and the local optimum is global. Otherwise the
/// solve is repeated from the best single instrument and the better of the
/// candidates (that instrument included) is returned.
pub fn maximize_sharpe(
    expected_returns: &[f64],
    cov: &[Vec<f64>],
    risk_free_rate: f64,
    options: &SolverOptions,
) -> PortfolioResult<Vec<f64>> {
    validate_inputs(expected_returns, cov)?;
    check_positive_definite(cov)?;
    let n = expected_returns.len();

    let objective = |w: &[f64]| {
        let vol = portfolio_volatility(w, cov);
        -(portfolio_return(w, expected_returns) - risk_free_rate) / vol
    };
    let gradient = |w: &[f64], g: &mut [f64]| {
        let sigma_w = mat_vec_mul(cov, w);
        let vol = dot(w, &sigma_w).max(0.0).sqrt();
        let excess = portfolio_return(w, expected_returns) - risk_free_rate;
        let vol3 = vol * vol * vol;
        for i in 0..g.len() {
            g[i] = -expected_returns[i] / vol + excess * sigma_w[i] / vol3;
        }
    };
    let problem = simplex_problem(n, objective, gradient);

    let has_positive_excess = expected_returns.iter().any(|&m| m > risk_free_rate);
    if has_positive_excess {
        let solution = problem.minimize(&equal_weights(n), options)?;
        log_solution("max-sharpe", &solution);
        return renormalize(solution.x);
    }

    let vertex_sharpe = |i: usize| (expected_returns[i] - risk_free_rate) / cov[i][i].sqrt();
    let best = (0..n).max_by(|&a, &b| vertex_sharpe(a).total_cmp(&vertex_sharpe(b))).unwrap_or(0);
    let mut vertex = vec![0.0; n];
    vertex[best] = 1.0;

    let mut candidates = vec![vertex.clone()];
    for start in [equal_weights(n), vertex] {
        match problem.minimize(&start, options) {
            Ok(solution) => {
                log_solution("max-sharpe", &solution);
                candidates.push(renormalize(solution.x)?);
            }
            Err(e) => debug!("Max-Sharpe start discarded: {}", e),
        }
    }

    let sharpe_of = |w: &[f64]| (portfolio_return(w, expected_returns) - risk_free_rate) / portfolio_volatility(w, cov);
    let mut best_weights = candidates.swap_remove(0);
    for w in candidates {
        if sharpe_of(&w) > sharpe_of(&best_weights) {
            best_weights = w;
        }
    }
    Ok(best_weights)
}

fn log_solution(label: &str, solution: &Solution) {
    debug!(
        "{} solved: objective={:.6e}, iterations={}, violation={:.2e}, stationarity={:.2e}",
        label, solution.objective, solution.iterations, solution.violation, solution.stationarity
    );
}

/// Feasible point for `w·μ = target`: equal weights blended with the
/// instrument at the matching extreme of `μ`.
fn feasible_start(expected_returns: &[f64], target: f64) -> Vec<f64> {
    let n = expected_returns.len();
    let equal = equal_weights(n);
    let mean = portfolio_return(&equal, expected_returns);
    let pick = |better: fn(f64, f64) -> bool| {
        (0..n).fold(0, |acc, i| if better(expected_returns[i], expected_returns[acc]) { i } else { acc })
    };
    let idx = if target >= mean { pick(|a, b| a > b) } else { pick(|a, b| a < b) };
    let extreme = expected_returns[idx];
    if (extreme - mean).abs() <= f64::EPSILON {
        return equal;
    }
    let theta = ((extreme - target) / (extreme - mean)).clamp(0.0, 1.0);
    let mut weights: Vec<f64> = equal.iter().map(|w| w * theta).collect();
    weights[idx] += 1.0 - theta;
    weights
}

/// Long-only weights minimizing `√(wᵀΣw)`, optionally pinning `w·μ` to a target.
///
/// A target outside `[min μ, max μ]` cannot be reached by any long-only
/// portfolio and fails with `InfeasibleTarget` before the solver runs.
pub fn minimize_volatility(
    cov: &[Vec<f64>],
    return_constraint: Option<ReturnConstraint<'_>>,
    options: &SolverOptions,
) -> PortfolioResult<Vec<f64>> {
    let n = cov.len();
    match return_constraint {
        Some(rc) => validate_inputs(rc.expected_returns, cov)?,
        None => validate_inputs(&vec![0.0; n], cov)?,
    }
    check_positive_definite(cov)?;

    let objective = |w: &[f64]| portfolio_volatility(w, cov);
    let gradient = |w: &[f64], g: &mut [f64]| {
        let sigma_w = mat_vec_mul(cov, w);
        let vol = dot(w, &sigma_w).max(0.0).sqrt();
        for i in 0..g.len() {
            g[i] = sigma_w[i] / vol;
        }
    };

    let mut problem = simplex_problem(n, objective, gradient);
    if let Some(rc) = return_constraint {
        check_target_reachable(rc)?;
        if let Some(vertex) = extreme_vertex(rc) {
            return Ok(vertex);
        }
        problem = problem.subject_to(EqualityConstraint::linear(rc.expected_returns.to_vec(), rc.target));
    }

    let start = match return_constraint {
        Some(rc) => feasible_start(rc.expected_returns, rc.target),
        None => equal_weights(n),
    };
    let solution = problem.minimize(&start, options)?;
    log_solution("min-volatility", &solution);
    renormalize(solution.x)
}

fn check_target_reachable(rc: ReturnConstraint<'_>) -> PortfolioResult<()> {
    let min = rc.expected_returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max = rc.expected_returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let slack = 1e-12 * min.abs().max(max.abs()).max(1.0);
    if !rc.target.is_finite() || rc.target < min - slack || rc.target > max + slack {
        return Err(PortfolioError::InfeasibleTarget { target: rc.target, min, max });
    }
    Ok(())
}

/// At `min μ` or `max μ` with a single instrument attaining it, the only
/// long-only portfolio meeting the target is that instrument alone.
fn extreme_vertex(rc: ReturnConstraint<'_>) -> Option<Vec<f64>> {
    let mu = rc.expected_returns;
    let slack = 1e-12 * mu.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let hits: Vec<usize> = (0..mu.len()).filter(|&i| (mu[i] - rc.target).abs() <= slack).collect();
    let [only] = hits.as_slice() else {
        return None;
    };
    let extreme = mu.iter().all(|&v| v <= mu[*only] + slack) || mu.iter().all(|&v| v >= mu[*only] - slack);
    if !extreme {
        return None;
    }
    let mut weights = vec![0.0; mu.len()];
    weights[*only] = 1.0;
    Some(weights)
}

/// `k` evenly spaced target returns from `min μ` to `max μ` inclusive.
pub fn frontier_targets(expected_returns: &[f64], k: usize) -> Vec<f64> {
    let min = expected_returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max = expected_returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    match k {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (k - 1) as f64;
            (0..k)
                .map(|i| if i == k - 1 { max } else { min + step * i as f64 })
                .collect()
        }
    }
}

/// Solves one minimum-volatility problem per target return, in parallel.
///
/// The output has one entry per target in the same order. A target that is
/// unreachable or does not converge fails only its own entry; malformed or
/// singular inputs fail the whole trace.
pub fn trace_frontier(
    expected_returns: &[f64],
    cov: &[Vec<f64>],
    target_returns: &[f64],
    risk_free_rate: f64,
    options: &SolverOptions,
) -> PortfolioResult<Vec<FrontierPoint>> {
    validate_inputs(expected_returns, cov)?;
    check_positive_definite(cov)?;

    info!("Tracing efficient frontier over {} target returns...", target_returns.len());

    let points: Vec<FrontierPoint> = target_returns
        .par_iter()
        .map(|&target| {
            let constraint = ReturnConstraint { expected_returns, target };
            let result = minimize_volatility(cov, Some(constraint), options)
                .map(|w| evaluate(w, expected_returns, cov, risk_free_rate));
            if let Err(e) = &result {
                warn!("Frontier point at target {:.4} failed: {}", target, e);
            }
            FrontierPoint { target_return: target, result }
        })
        .collect();

    let solved = points.iter().filter(|p| p.result.is_ok()).count();
    info!("Frontier traced: {}/{} points solved", solved, points.len());
    Ok(points)
}

// ──────────────────────────────────────────────────────────────────────────────
// Engine
// ──────────────────────────────────────────────────────────────────────────────

/// Entry point holding the run parameters; every computation reads them from here.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
    config: EngineConfig,
}

impl PortfolioEngine {
    pub fn new(config: EngineConfig) -> PortfolioResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn estimate(&self, table: &PriceTable) -> PortfolioResult<ReturnStatistics> {
        stats::estimate(table, self.config.annualization_factor)
    }

    pub fn sample(&self, stats: &ReturnStatistics) -> PortfolioResult<Vec<SamplePoint>> {
        sampler::sample(
            &stats.expected_returns,
            &stats.covariance,
            self.config.sample_count,
            self.config.risk_free_rate,
            self.config.seed,
        )
    }

    pub fn maximize_sharpe(&self, stats: &ReturnStatistics) -> PortfolioResult<PortfolioMetrics> {
        let weights = maximize_sharpe(
            &stats.expected_returns,
            &stats.covariance,
            self.config.risk_free_rate,
            &self.config.solver,
        )?;
        Ok(self.evaluate(weights, stats))
    }

    pub fn minimize_volatility(&self, stats: &ReturnStatistics, target: Option<f64>) -> PortfolioResult<PortfolioMetrics> {
        let constraint = target.map(|target| ReturnConstraint {
            expected_returns: &stats.expected_returns,
            target,
        });
        let weights = minimize_volatility(&stats.covariance, constraint, &self.config.solver)?;
        Ok(self.evaluate(weights, stats))
    }

    pub fn frontier_targets(&self, stats: &ReturnStatistics) -> Vec<f64> {
        frontier_targets(&stats.expected_returns, self.config.frontier_points)
    }

    pub fn trace_frontier(&self, stats: &ReturnStatistics, targets: &[f64]) -> PortfolioResult<Vec<FrontierPoint>> {
        trace_frontier(
            &stats.expected_returns,
            &stats.covariance,
            targets,
            self.config.risk_free_rate,
            &self.config.solver,
        )
    }

    pub fn evaluate(&self, weights: Vec<f64>, stats: &ReturnStatistics) -> PortfolioMetrics {
        evaluate(weights, &stats.expected_returns, &stats.covariance, self.config.risk_free_rate)
    }

    /// Estimation, sampling, both single-point solves and the frontier.
    pub fn run(&self, table: &PriceTable) -> PortfolioResult<OptimizationReport> {
        let stats = self.estimate(table)?;
        self.run_with_statistics(stats)
    }

    pub fn run_with_statistics(&self, stats: ReturnStatistics) -> PortfolioResult<OptimizationReport> {
        info!(
            "Optimizing portfolio with {} assets, {} random samples...",
            stats.num_instruments(),
            self.config.sample_count
        );
        for ((symbol, ret), vol) in stats
            .symbols
            .iter()
            .zip(stats.expected_returns.iter())
            .zip(stats.asset_volatilities())
        {
            info!("  {}: E[r]={:.4}, σ={:.4}", symbol, ret, vol);
        }

        let samples = self.sample(&stats)?;
        let max_sharpe = self.maximize_sharpe(&stats)?;
        let min_volatility = self.minimize_volatility(&stats, None)?;
        let targets = self.frontier_targets(&stats);
        let frontier = self.trace_frontier(&stats, &targets)?;

        Ok(OptimizationReport::new(
            stats,
            self.config.risk_free_rate,
            max_sharpe,
            min_volatility,
            frontier,
            samples,
        ))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Top-Level Command: Run Portfolio Optimization
// ──────────────────────────────────────────────────────────────────────────────

/// Full pipeline: fetch prices → estimate → sample → optimize → frontier.
pub async fn run_portfolio_optimization(run: &RunConfig) -> Result<OptimizationReport> {
    run.validate()?;
    info!(
        "=== Portfolio Optimizer ===\n  Assets: {:?}\n  Range: {} .. {}\n  Risk-free: {:.2}%\n  Samples: {}\n  Frontier points: {}",
        run.symbols,
        run.start,
        run.end,
        run.engine.risk_free_rate * 100.0,
        run.engine.sample_count,
        run.engine.frontier_points
    );

    let engine = PortfolioEngine::new(run.engine.clone())?;
    let table = data::fetch_price_table(&run.symbols, run.start, run.end, run.fetch_budget).await?;

    let report = tokio::task::spawn_blocking(move || engine.run(&table)).await??;
    Ok(report)
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
