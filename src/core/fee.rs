//! Fee Estimation
//!
//! Converts an estimated transaction size into an absolute fee:
//! - Fixed fee rate (smallest units per byte)
//! - Result clamped into the configured `[min_fee, max_fee]` bounds
//! - Legacy P2PKH size model for candidate transactions

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Fixed transaction overhead (version, locktime, counts)
pub const TX_OVERHEAD_BYTES: usize = 10;

/// Size of one signed P2PKH input
pub const INPUT_BYTES: usize = 148;

/// Size of one P2PKH output
pub const OUTPUT_BYTES: usize = 34;

/// Default fee rate (units/byte)
pub const DEFAULT_FEE_RATE: u64 = 10;

/// Default minimum absolute fee
pub const DEFAULT_MIN_FEE: u64 = 1_000;

/// Default maximum absolute fee
pub const DEFAULT_MAX_FEE: u64 = 50_000;

// =============================================================================
// Errors
// =============================================================================

/// Fee estimation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeeError {
    #[error("Transaction size must be positive")]
    ZeroSize,
    #[error("Fee rate must be positive")]
    ZeroRate,
    #[error("Invalid fee bounds: min {min} > max {max}")]
    InvalidBounds { min: u64, max: u64 },
}

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in smallest units per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn from_per_byte(rate: u64) -> Self {
        Self(rate)
    }

    /// Unclamped fee for a given size
    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        self.0.saturating_mul(size_bytes as u64)
    }

    pub fn as_per_byte(&self) -> u64 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(DEFAULT_FEE_RATE)
    }
}

/// Estimated serialized size of a transaction with the given input and
/// output counts
pub fn estimate_tx_size(inputs: usize, outputs: usize) -> usize {
    TX_OVERHEAD_BYTES + inputs * INPUT_BYTES + outputs * OUTPUT_BYTES
}

// =============================================================================
// Fee Estimator
// =============================================================================

/// Clamped size-based fee estimator
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimator {
    rate: FeeRate,
    min_fee: u64,
    max_fee: u64,
}

impl FeeEstimator {
    /// Create an estimator with a default rate and fee bounds
    pub fn new(rate: FeeRate, min_fee: u64, max_fee: u64) -> Result<Self, FeeError> {
        if min_fee > max_fee {
            return Err(FeeError::InvalidBounds {
                min: min_fee,
                max: max_fee,
            });
        }
        if rate.0 == 0 {
            return Err(FeeError::ZeroRate);
        }
        Ok(Self {
            rate,
            min_fee,
            max_fee,
        })
    }

    /// `size * rate`, clamped into `[min_fee, max_fee]`
    pub fn estimate(&self, size_bytes: usize, rate: FeeRate) -> Result<u64, FeeError> {
        if size_bytes == 0 {
            return Err(FeeError::ZeroSize);
        }
        if rate.0 == 0 {
            return Err(FeeError::ZeroRate);
        }
        Ok(rate
            .fee_for_size(size_bytes)
            .clamp(self.min_fee, self.max_fee))
    }

    /// Estimate using the configured rate
    pub fn estimate_default(&self, size_bytes: usize) -> Result<u64, FeeError> {
        self.estimate(size_bytes, self.rate)
    }

    /// Fee for a candidate transaction with the given shape
    pub fn estimate_for(&self, inputs: usize, outputs: usize) -> Result<u64, FeeError> {
        self.estimate_default(estimate_tx_size(inputs, outputs))
    }

    pub fn rate(&self) -> FeeRate {
        self.rate
    }

    pub fn min_fee(&self) -> u64 {
        self.min_fee
    }

    pub fn max_fee(&self) -> u64 {
        self.max_fee
    }
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self {
            rate: FeeRate::default(),
            min_fee: DEFAULT_MIN_FEE,
            max_fee: DEFAULT_MAX_FEE,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
