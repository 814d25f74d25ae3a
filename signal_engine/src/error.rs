use thiserror::Error;

/// Typed error hierarchy for the signal pipeline.
///
/// Library code returns these; the binary wraps them with `anyhow::Context`.
/// The scanner classifies failures per symbol by variant: data and
/// persistence failures leave the candle watermark untouched so the candle
/// is retried on the next cycle.
#[derive(Error, Debug)]
pub enum ScanError {
    // -- Data -----------------------------------------------------------------
    #[error("data error: {0}")]
    Data(String),

    // -- Market data transport -----------------------------------------------
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    // -- Configuration ---------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Persistence -----------------------------------------------------------
    #[error("persistence error: {0}")]
    Persistence(String),

    // -- Paper ledger ----------------------------------------------------------
    #[error("position error: {0}")]
    Position(String),

    // -- Forwarded errors ------------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Shorthand for the ubiquitous "not enough candles" failure.
    pub fn insufficient(what: &str, need: usize, got: usize) -> Self {
        ScanError::Data(format!("not enough data points for {what}: need {need}, got {got}"))
    }

    /// Transient transport failures that deserve a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::Network(_) | ScanError::RateLimited(_) | ScanError::Reqwest(_)
        )
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
