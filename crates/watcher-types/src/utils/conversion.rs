//! Conversions between raw chain values and watcher types.

use crate::MAX_TOKEN_DECIMALS;
use alloy_primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised when a raw on-chain amount cannot be represented exactly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountConversionError {
	#[error("Raw amount {0} exceeds the exact decimal range")]
	Overflow(U256),
	#[error("Unsupported decimal precision {0}")]
	Precision(u8),
}

/// Converts a raw smallest-unit amount into whole token units.
///
/// Computes `raw / 10^decimals` exactly; no floating point is involved. The
/// result is normalized, so `1500000` with 6 decimals becomes `1.5`.
pub fn raw_to_decimal(raw: U256, decimals: u8) -> Result<Decimal, AmountConversionError> {
	if decimals > MAX_TOKEN_DECIMALS {
		return Err(AmountConversionError::Precision(decimals));
	}
	let value = u128::try_from(raw)
		.ok()
		.and_then(|v| i128::try_from(v).ok())
		.ok_or(AmountConversionError::Overflow(raw))?;

	Decimal::try_from_i128_with_scale(value, u32::from(decimals))
		.map(|d| d.normalize())
		.map_err(|_| AmountConversionError::Overflow(raw))
}

/// Left-pads an address into the 32-byte form used for indexed event topics.
pub fn address_topic(address: Address) -> B256 {
	address.into_word()
}
