use crate::portfolio::{FrontierPoint, PortfolioMetrics};
use crate::sampler::{self, SamplePoint};
use crate::stats::ReturnStatistics;
use serde::Serialize;

/// Serializable view of one frontier solve: exactly one of `metrics` and
/// `error` is present.
#[derive(Clone, Debug, Serialize)]
pub struct FrontierRow {
    pub target_return: f64,
    pub metrics: Option<PortfolioMetrics>,
    pub error: Option<String>,
}

impl From<FrontierPoint> for FrontierRow {
    fn from(point: FrontierPoint) -> Self {
        let (metrics, error) = match point.result {
            Ok(m) => (Some(m), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            target_return: point.target_return,
            metrics,
            error,
        }
    }
}

/// Everything one optimization run produces.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizationReport {
    pub symbols: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub asset_volatilities: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub annualization_factor: f64,
    pub risk_free_rate: f64,
    pub max_sharpe: PortfolioMetrics,
    pub min_volatility: PortfolioMetrics,
    pub frontier: Vec<FrontierRow>,
    pub best_sample: Option<SamplePoint>,
    pub samples: Vec<SamplePoint>,
}

impl OptimizationReport {
    pub fn new(
        stats: ReturnStatistics,
        risk_free_rate: f64,
        max_sharpe: PortfolioMetrics,
        min_volatility: PortfolioMetrics,
        frontier: Vec<FrontierPoint>,
        samples: Vec<SamplePoint>,
    ) -> Self {
        let best_sample = sampler::best_by_sharpe(&samples).cloned();
        let asset_volatilities = stats.asset_volatilities();
        Self {
            symbols: stats.symbols,
            expected_returns: stats.expected_returns,
            asset_volatilities,
            covariance: stats.covariance,
            annualization_factor: stats.annualization_factor,
            risk_free_rate,
            max_sharpe,
            min_volatility,
            frontier: frontier.into_iter().map(FrontierRow::from).collect(),
            best_sample,
            samples,
        }
    }

    pub fn solved_frontier(&self) -> impl Iterator<Item = (f64, &PortfolioMetrics)> {
        self.frontier
            .iter()
            .filter_map(|row| row.metrics.as_ref().map(|m| (row.target_return, m)))
    }

    pub fn to_json(&self, include_samples: bool) -> serde_json::Result<String> {
        if include_samples {
            serde_json::to_string_pretty(self)
        } else {
            let mut trimmed = self.clone();
            trimmed.samples.clear();
            serde_json::to_string_pretty(&trimmed)
        }
    }
}

fn fmt_sharpe(sharpe: Option<f64>) -> String {
    match sharpe {
        Some(s) => format!("{:>7.3}", s),
        None => "    n/a".to_string(),
    }
}

fn print_portfolio(title: &str, symbols: &[String], m: &PortfolioMetrics) {
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  {:<58}║", title);
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Expected Annual Return : {:>+7.2}%                         ║", m.expected_return * 100.0);
    println!("║  Expected Annual Vol    : {:>7.2}%                         ║", m.volatility * 100.0);
    println!("║  Sharpe Ratio           : {}                          ║", fmt_sharpe(m.sharpe));
    println!("║                                                            ║");
    for (symbol, w) in symbols.iter().zip(m.weights.iter()) {
        println!("║    {:<8} {:>7.2}%                                         ║", symbol, w * 100.0);
    }
}

/// Boxed console summary of a finished run.
pub fn print_report(report: &OptimizationReport) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Mean-Variance Portfolio Report               ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol     E[Ann.Ret]   Ann.Vol                           ║");
    for ((symbol, ret), vol) in report
        .symbols
        .iter()
        .zip(report.expected_returns.iter())
        .zip(report.asset_volatilities.iter())
    {
        println!("║  {:<8}  {:>+8.2}%   {:>7.2}%                           ║", symbol, ret * 100.0, vol * 100.0);
    }
    println!("║  Risk-free rate: {:>5.2}%                                    ║", report.risk_free_rate * 100.0);

    print_portfolio("Maximum Sharpe Ratio", &report.symbols, &report.max_sharpe);
    print_portfolio("Minimum Volatility", &report.symbols, &report.min_volatility);
    if let Some(best) = &report.best_sample {
        print_portfolio("Best Random Sample", &report.symbols, best);
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Efficient Frontier                                        ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║   Target      Return      Vol     Sharpe                   ║");
    for row in &report.frontier {
        match &row.metrics {
            Some(m) => println!(
                "║  {:>+7.2}%   {:>+7.2}%   {:>6.2}%   {}                  ║",
                row.target_return * 100.0,
                m.expected_return * 100.0,
                m.volatility * 100.0,
                fmt_sharpe(m.sharpe)
            ),
            None => println!("║  {:>+7.2}%   (unsolved)                                   ║", row.target_return * 100.0),
        }
    }
    let unsolved = report.frontier.iter().filter(|r| r.metrics.is_none()).count();
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Samples: {:>6}   Frontier points: {:>3} ({} unsolved)       ║",
        report.samples.len(),
        report.frontier.len(),
        unsolved
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("  Note: mean-variance optimization uses historical estimates.");
    println!("  Past returns do not guarantee future results.\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortfolioError;

    fn metrics(weights: Vec<f64>, ret: f64, vol: f64, sharpe: Option<f64>) -> PortfolioMetrics {
        PortfolioMetrics {
            weights,
            expected_return: ret,
            volatility: vol,
            sharpe,
        }
    }

    fn report() -> OptimizationReport {
        let stats = ReturnStatistics {
            symbols: vec!["AAA".into(), "BBB".into()],
            expected_returns: vec![0.10, 0.20],
            covariance: vec![vec![0.04, 0.0], vec![0.0, 0.09]],
            returns: Vec::new(),
            annualization_factor: 252.0,
        };
        let frontier = vec![
            FrontierPoint {
                target_return: 0.1,
                result: Ok(metrics(vec![1.0, 0.0], 0.1, 0.2, Some(0.4))),
            },
            FrontierPoint {
                target_return: 0.3,
                result: Err(PortfolioError::InfeasibleTarget { target: 0.3, min: 0.1, max: 0.2 }),
            },
        ];
        let samples = vec![
            metrics(vec![0.5, 0.5], 0.15, 0.18, Some(0.7)),
            metrics(vec![0.2, 0.8], 0.18, 0.25, Some(0.64)),
            metrics(vec![0.9, 0.1], 0.11, 0.0, None),
        ];
        OptimizationReport::new(
            stats,
            0.02,
            metrics(vec![0.4, 0.6], 0.16, 0.2, Some(0.7)),
            metrics(vec![0.7, 0.3], 0.13, 0.17, Some(0.65)),
            frontier,
            samples,
        )
    }

    #[test]
    fn test_report_keeps_failed_frontier_rows() {
        let r = report();
        assert_eq!(r.frontier.len(), 2);
        assert!(r.frontier[0].metrics.is_some() && r.frontier[0].error.is_none());
        assert!(r.frontier[1].metrics.is_none());
        assert!(r.frontier[1].error.as_deref().unwrap().contains("0.3"));
        assert_eq!(r.solved_frontier().count(), 1);
        approx::assert_abs_diff_eq!(r.asset_volatilities[0], 0.2, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(r.asset_volatilities[1], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_best_sample_by_sharpe() {
        let r = report();
        assert_eq!(r.best_sample.as_ref().unwrap().weights, vec![0.5, 0.5]);
    }

    #[test]
    fn test_json_output() {
        let r = report();
        let full: serde_json::Value = serde_json::from_str(&r.to_json(true).unwrap()).unwrap();
        assert_eq!(full["samples"].as_array().unwrap().len(), 3);
        assert!(full["samples"][2]["sharpe"].is_null());
        assert_eq!(full["frontier"][1]["metrics"], serde_json::Value::Null);

        let trimmed: serde_json::Value = serde_json::from_str(&r.to_json(false).unwrap()).unwrap();
        assert!(trimmed["samples"].as_array().unwrap().is_empty());
        assert_eq!(trimmed["symbols"][1], "BBB");
    }
}
