use crate::data::PriceTable;
use crate::error::{PortfolioError, PortfolioResult};
use serde::Serialize;
use tracing::{debug, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Return Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Annualized return and co-movement estimates derived from a price table.
///
/// Computed once per run and then treated as read-only input by the sampler
/// and all solvers.
#[derive(Clone, Debug, Serialize)]
pub struct ReturnStatistics {
    pub symbols: Vec<String>,
    /// Annualized mean simple return per instrument.
    pub expected_returns: Vec<f64>,
    /// Annualized sample covariance (N×N, symmetric).
    pub covariance: Vec<Vec<f64>>,
    /// Per-period simple returns, one row per period, one column per instrument.
    #[serde(skip)]
    pub returns: Vec<Vec<f64>>,
    pub annualization_factor: f64,
}

impl ReturnStatistics {
    pub fn num_instruments(&self) -> usize {
        self.expected_returns.len()
    }

    /// Annualized volatility of each instrument on its own.
    pub fn asset_volatilities(&self) -> Vec<f64> {
        self.covariance
            .iter()
            .enumerate()
            .map(|(i, row)| row[i].max(0.0).sqrt())
            .collect()
    }
}

/// Converts a cleaned price table into annualized expected returns and covariance.
///
/// Requires at least two instruments and two aligned dates. The covariance is
/// not regularized: with fewer return rows than instruments it is singular,
/// which the solvers report on their own.
pub fn estimate(table: &PriceTable, annualization_factor: f64) -> PortfolioResult<ReturnStatistics> {
    let n = table.num_instruments();
    if n < 2 {
        return Err(PortfolioError::InsufficientInstruments { required: 2, actual: n });
    }
    if table.len() < 2 {
        return Err(PortfolioError::InsufficientData { required: 2, actual: table.len() });
    }
    if !annualization_factor.is_finite() || annualization_factor <= 0.0 {
        return Err(PortfolioError::InvalidInput(format!(
            "annualization factor must be positive, got {}",
            annualization_factor
        )));
    }

    let returns = table.simple_returns()?;
    if returns.len() <= n {
        warn!(
            "Only {} return observations for {} instruments; covariance will be singular",
            returns.len(),
            n
        );
    }

    let means = column_means(&returns);
    let cov = sample_covariance(&returns, &means);

    let expected_returns: Vec<f64> = means.iter().map(|m| m * annualization_factor).collect();
    let covariance: Vec<Vec<f64>> = cov
        .into_iter()
        .map(|row| row.into_iter().map(|c| c * annualization_factor).collect())
        .collect();

    debug!(
        "Estimated statistics for {} instruments over {} periods",
        n,
        returns.len()
    );

    Ok(ReturnStatistics {
        symbols: table.symbols().to_vec(),
        expected_returns,
        covariance,
        returns,
        annualization_factor,
    })
}

/// Column-wise arithmetic mean of a row-major return matrix.
pub fn column_means(rows: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let m = rows.len() as f64;
    let mut sums = vec![0.0; first.len()];
    for row in rows {
        for (s, v) in sums.iter_mut().zip(row.iter()) {
            *s += v;
        }
    }
    sums.into_iter().map(|s| s / m).collect()
}

/// Sample covariance (n − 1 denominator) of a row-major return matrix.
///
/// A single observation has no spread; the result is then the zero matrix.
pub fn sample_covariance(rows: &[Vec<f64>], means: &[f64]) -> Vec<Vec<f64>> {
    let n = means.len();
    let denom = (rows.len().saturating_sub(1)).max(1) as f64;

    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let mut sum = 0.0;
            for row in rows {
                sum += (row[i] - means[i]) * (row[j] - means[j]);
            }
            let covariance = sum / denom;
            cov[i][j] = covariance;
            cov[j][i] = covariance;
        }
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn table(symbols: &[&str], rows: &[&[f64]]) -> PriceTable {
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (day(i as u32 + 1), r.iter().map(|p| Some(*p)).collect()))
            .collect();
        PriceTable::from_rows(symbols.iter().map(|s| s.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn test_single_instrument_returns_and_mean() {
        let t = table(&["AAA"], &[&[100.0], &[110.0], &[121.0]]);
        let returns = t.simple_returns().unwrap();
        assert_eq!(returns.len(), 2);
        assert_relative_eq!(returns[0][0], 0.10, epsilon = 1e-12);
        assert_relative_eq!(returns[1][0], 0.10, epsilon = 1e-12);

        let means = column_means(&returns);
        assert_relative_eq!(means[0], 0.10, epsilon = 1e-12);
    }

    #[test]
    fn test_estimate_annualizes_mean_and_covariance() {
        let t = table(
            &["AAA", "BBB"],
            &[&[100.0, 50.0], &[110.0, 49.0], &[121.0, 51.45], &[108.9, 51.45]],
        );
        let stats = estimate(&t, 252.0).unwrap();
        let raw = estimate(&t, 1.0).unwrap();

        assert_eq!(stats.returns.len(), 3);
        assert_eq!(stats.expected_returns.len(), 2);
        for i in 0..2 {
            assert_relative_eq!(stats.expected_returns[i], raw.expected_returns[i] * 252.0, epsilon = 1e-10);
            for j in 0..2 {
                assert_relative_eq!(stats.covariance[i][j], raw.covariance[i][j] * 252.0, epsilon = 1e-10);
                assert_relative_eq!(stats.covariance[i][j], stats.covariance[j][i], epsilon = 1e-15);
            }
        }

        // AAA: +10%, +10%, -10% → mean 0.0333.., sample variance 0.0133..
        assert_relative_eq!(raw.expected_returns[0], 0.1 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(raw.covariance[0][0], 0.04 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_estimate_rejects_single_instrument() {
        let t = table(&["AAA"], &[&[100.0], &[110.0]]);
        assert!(matches!(
            estimate(&t, 252.0),
            Err(PortfolioError::InsufficientInstruments { actual: 1, .. })
        ));
    }

    #[test]
    fn test_estimate_rejects_single_date() {
        let t = table(&["AAA", "BBB"], &[&[100.0, 20.0]]);
        assert!(matches!(
            estimate(&t, 252.0),
            Err(PortfolioError::InsufficientData { actual: 1, .. })
        ));
    }

    #[test]
    fn test_estimate_rejects_bad_annualization() {
        let t = table(&["AAA", "BBB"], &[&[100.0, 20.0], &[101.0, 21.0]]);
        assert!(matches!(estimate(&t, 0.0), Err(PortfolioError::InvalidInput(_))));
    }

    #[test]
    fn test_single_return_row_gives_zero_covariance() {
        let rows = vec![vec![0.1, 0.2]];
        let means = column_means(&rows);
        let cov = sample_covariance(&rows, &means);
        assert!(cov.iter().flatten().all(|c| *c == 0.0));
    }
}
