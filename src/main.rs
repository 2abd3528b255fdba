mod config;
mod data;
mod error;
mod portfolio;
mod report;
mod sampler;
mod solver;
mod stats;

use chrono::NaiveDate;
use clap::Parser;
use config::{EngineConfig, RunConfig};
use solver::SolverOptions;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "frontier-opt: long-only mean-variance portfolio optimization over historical prices",
    after_help = "EXAMPLES:
    # Maximum Sharpe, minimum volatility and the efficient frontier for four tickers
    cargo run --release -- --tickers AAPL,MSFT,GOOGL,AMZN --start 2020-01-01 --end 2023-12-31

    # Reproducible sample cloud, machine-readable output
    cargo run --release -- --tickers SPY,TLT,GLD --start 2018-01-01 --end 2024-01-01 --seed 42 --json

    # Use Polygon instead of Yahoo
    PORTFOLIO_DATA_PROVIDER=polygon POLYGON_API_KEY=... cargo run --release -- --tickers NVDA,QQQ --start 2022-01-01 --end 2024-01-01"
)]
struct Args {
    /// Comma-separated ticker symbols (at least 2), e.g. AAPL,MSFT,GOOGL
    #[arg(long, value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// First date of the price history (YYYY-MM-DD)
    #[arg(long)]
    start: NaiveDate,

    /// End of the price history, exclusive (YYYY-MM-DD)
    #[arg(long)]
    end: NaiveDate,

    /// Annual risk-free rate used in Sharpe ratios (default: 0.02)
    #[arg(long, default_value_t = config::RISK_FREE_RATE)]
    risk_free_rate: f64,

    /// Number of random portfolios to sample (default: 10000)
    #[arg(long, default_value_t = config::DEFAULT_SAMPLE_COUNT)]
    samples: usize,

    /// Number of target returns on the efficient frontier (default: 50)
    #[arg(long, default_value_t = config::DEFAULT_FRONTIER_POINTS)]
    frontier_points: usize,

    /// Periods per year used to annualize daily statistics (default: 252)
    #[arg(long, default_value_t = config::TRADING_DAYS)]
    annualization: f64,

    /// Seed for the random sampler. Omit for a fresh cloud every run.
    #[arg(long)]
    seed: Option<u64>,

    /// Outer iteration cap for the constrained solver (default: 60)
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Print the full report as JSON instead of the console summary
    #[arg(long)]
    json: bool,

    /// Include every sampled portfolio in the JSON output (requires --json)
    #[arg(long, requires = "json")]
    json_samples: bool,

    /// Wall-clock budget for downloading market data, in seconds (default: 120)
    #[arg(long, default_value_t = config::DEFAULT_FETCH_BUDGET_SECS)]
    fetch_timeout_secs: u64,
}

impl Args {
    fn into_run_config(self) -> RunConfig {
        let mut solver = SolverOptions::default();
        if let Some(max) = self.max_iterations {
            solver.max_outer_iterations = max;
        }
        RunConfig {
            symbols: self.tickers,
            start: self.start,
            end: self.end,
            fetch_budget: std::time::Duration::from_secs(self.fetch_timeout_secs),
            engine: EngineConfig {
                risk_free_rate: self.risk_free_rate,
                annualization_factor: self.annualization,
                sample_count: self.samples,
                frontier_points: self.frontier_points,
                seed: self.seed,
                solver,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frontier_opt=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let json = args.json;
    let json_samples = args.json_samples;
    let run = args.into_run_config();

    let report = match portfolio::run_portfolio_optimization(&run).await {
        Ok(report) => report,
        Err(e) => {
            error!("Portfolio optimization failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if json {
        match report.to_json(json_samples) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        report::print_report(&report);
    }

    info!("Portfolio optimization completed.");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_defaults() {
        let args = Args::try_parse_from([
            "frontier-opt",
            "--tickers",
            "AAPL,MSFT,GOOGL",
            "--start",
            "2020-01-01",
            "--end",
            "2023-01-01",
        ])
        .unwrap();
        let run = args.into_run_config();
        assert_eq!(run.symbols, vec!["AAPL", "MSFT", "GOOGL"]);
        assert_eq!(run.engine.sample_count, 10_000);
        assert_eq!(run.engine.frontier_points, 50);
        assert_eq!(run.engine.seed, None);
        assert_eq!(run.engine.risk_free_rate, 0.02);
        assert!(run.validate().is_ok());
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "frontier-opt",
            "--tickers",
            "SPY,TLT",
            "--start",
            "2018-01-01",
            "--end",
            "2024-01-01",
            "--seed",
            "42",
            "--samples",
            "500",
            "--max-iterations",
            "20",
            "--risk-free-rate",
            "0.0",
        ])
        .unwrap();
        let run = args.into_run_config();
        assert_eq!(run.engine.seed, Some(42));
        assert_eq!(run.engine.sample_count, 500);
        assert_eq!(run.engine.solver.max_outer_iterations, 20);
        assert_eq!(run.engine.risk_free_rate, 0.0);
    }

    #[test]
    fn test_json_samples_requires_json() {
        let base = ["frontier-opt", "--tickers", "A,B", "--start", "2020-01-01", "--end", "2021-01-01"];
        let mut alone = base.to_vec();
        alone.push("--json-samples");
        assert!(Args::try_parse_from(alone).is_err());

        let mut both = base.to_vec();
        both.extend(["--json", "--json-samples"]);
        let args = Args::try_parse_from(both).unwrap();
        assert!(args.json && args.json_samples);
    }

    #[test]
    fn test_args_reject_bad_date() {
        assert!(Args::try_parse_from(["frontier-opt", "--tickers", "A,B", "--start", "2020-13-01", "--end", "2021-01-01"]).is_err());
    }
}
