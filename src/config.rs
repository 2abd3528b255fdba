use crate::error::{PortfolioError, PortfolioResult};
use crate::solver::SolverOptions;
use chrono::NaiveDate;
use rayon::ThreadPoolBuilder;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Periods per year for daily closes.
pub const TRADING_DAYS: f64 = 252.0;
/// Annual risk-free rate used in Sharpe calculations.
pub const RISK_FREE_RATE: f64 = 0.02;
/// Number of random portfolios drawn by the sampler.
pub const DEFAULT_SAMPLE_COUNT: usize = 10_000;
/// Number of evenly spaced target returns on the efficient frontier.
pub const DEFAULT_FRONTIER_POINTS: usize = 50;
/// Wall-clock budget for the whole market-data retrieval.
pub const DEFAULT_FETCH_BUDGET_SECS: u64 = 120;

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Parameters for the estimation and optimization engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub risk_free_rate: f64,
    pub annualization_factor: f64,
    pub sample_count: usize,
    pub frontier_points: usize,
    /// Sampler seed; `None` draws one from system entropy.
    pub seed: Option<u64>,
    pub solver: SolverOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: RISK_FREE_RATE,
            annualization_factor: TRADING_DAYS,
            sample_count: DEFAULT_SAMPLE_COUNT,
            frontier_points: DEFAULT_FRONTIER_POINTS,
            seed: None,
            solver: SolverOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> PortfolioResult<()> {
        if !self.risk_free_rate.is_finite() {
            return Err(PortfolioError::InvalidInput("risk-free rate must be finite".into()));
        }
        if !self.annualization_factor.is_finite() || self.annualization_factor <= 0.0 {
            return Err(PortfolioError::InvalidInput(format!(
                "annualization factor must be positive, got {}",
                self.annualization_factor
            )));
        }
        if self.frontier_points == 0 {
            return Err(PortfolioError::InvalidInput("frontier needs at least one point".into()));
        }
        if self.solver.max_outer_iterations == 0 || self.solver.max_inner_iterations == 0 {
            return Err(PortfolioError::InvalidInput("solver iteration limits must be positive".into()));
        }
        Ok(())
    }
}

/// Everything one optimization run needs, fixed before any computation starts.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub fetch_budget: std::time::Duration,
    pub engine: EngineConfig,
}

impl RunConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbols.len() < 2 {
            return Err(anyhow::anyhow!(
                "Portfolio optimization requires at least 2 symbols. Example: --tickers AAPL,MSFT,GOOGL"
            ));
        }
        if self.start >= self.end {
            return Err(anyhow::anyhow!("start date {} must be before end date {}", self.start, self.end));
        }
        self.engine.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> RunConfig {
        RunConfig {
            symbols: vec!["AAPL".into(), "MSFT".into()],
            start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            fetch_budget: std::time::Duration::from_secs(DEFAULT_FETCH_BUDGET_SECS),
            engine: EngineConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(run_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let cfg = EngineConfig {
            annualization_factor: -1.0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            frontier_points: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut run = run_config();
        run.symbols.truncate(1);
        assert!(run.validate().is_err());

        let mut run = run_config();
        run.end = run.start;
        assert!(run.validate().is_err());
    }
}
