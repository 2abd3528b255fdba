use thiserror::Error;

/// Errors raised by the estimation and optimization engine.
///
/// Data retrieval and CLI orchestration use `anyhow`; everything below the
/// price table speaks this type so callers can tell numerical trouble apart
/// from missing data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
    #[error("Need at least {required} instruments, got {actual}")]
    InsufficientInstruments { required: usize, actual: usize },

    #[error("Insufficient data: need at least {required} aligned observations, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Invalid price {price} for {symbol} at row {row}")]
    InvalidPrice { symbol: String, row: usize, price: f64 },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Singular or ill-conditioned covariance matrix: {0}")]
    SingularCovariance(String),

    #[error("Target return {target:.6} outside achievable range [{min:.6}, {max:.6}]")]
    InfeasibleTarget { target: f64, min: f64, max: f64 },

    #[error("Optimization failed to converge after {iterations} iterations (violation={violation:.3e}, stationarity={stationarity:.3e})")]
    ConvergenceFailed {
        iterations: usize,
        violation: f64,
        stationarity: f64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type PortfolioResult<T> = Result<T, PortfolioError>;
