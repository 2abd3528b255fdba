use crate::error::PortfolioResult;
use crate::portfolio::{evaluate, validate_inputs, PortfolioMetrics};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Open01};
use rayon::prelude::*;
use tracing::info;

/// One Monte Carlo draw: weights plus return, volatility and Sharpe ratio.
pub type SamplePoint = PortfolioMetrics;

/// Draws per RNG stream. Streams are seeded from the base seed and their
/// index, so the cloud is identical for a given seed whatever the thread count.
const DRAWS_PER_STREAM: usize = 512;

/// Generates a random weight vector on the unit simplex by normalizing
/// independent Uniform(0, 1) draws. Biased toward the interior; not a uniform
/// simplex sampler.
pub fn random_simplex_weights(n: usize, rng: &mut impl rand::Rng) -> Vec<f64> {
    let raw: Vec<f64> = (0..n).map(|_| Open01.sample(rng)).collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| v / sum).collect()
}

/// Monte Carlo cloud of feasible portfolios, in draw order.
///
/// Each point carries its weights, expected return, volatility and Sharpe
/// ratio `(return − risk_free_rate) / volatility`; the Sharpe ratio is `None`
/// for a zero-volatility draw.
pub fn sample(
    expected_returns: &[f64],
    cov: &[Vec<f64>],
    count: usize,
    risk_free_rate: f64,
    seed: Option<u64>,
) -> PortfolioResult<Vec<SamplePoint>> {
    validate_inputs(expected_returns, cov)?;
    let n = expected_returns.len();
    let base_seed = seed.unwrap_or_else(rand::random::<u64>);

    info!("Sampling {} random portfolios over {} assets (seed={})", count, n, base_seed);

    let streams = count.div_ceil(DRAWS_PER_STREAM);
    let chunks: Vec<Vec<SamplePoint>> = (0..streams)
        .into_par_iter()
        .map(|stream| {
            let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(stream as u64));
            let len = DRAWS_PER_STREAM.min(count - stream * DRAWS_PER_STREAM);
            (0..len)
                .map(|_| {
                    let weights = random_simplex_weights(n, &mut rng);
                    evaluate(weights, expected_returns, cov, risk_free_rate)
                })
                .collect()
        })
        .collect();

    Ok(chunks.into_iter().flatten().collect())
}

/// Highest-Sharpe point of a cloud, skipping points without a defined ratio.
pub fn best_by_sharpe(points: &[SamplePoint]) -> Option<&SamplePoint> {
    points
        .iter()
        .filter_map(|p| p.sharpe.map(|s| (s, p)))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, p)| p)
}
