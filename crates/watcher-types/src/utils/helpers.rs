//! Helper utilities for common operations.

use crate::TokenIdentity;
use alloy_primitives::Address;

/// Helper function to get current timestamp, returns 0 if system time is before UNIX epoch.
pub fn current_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Builds the `ethereum:` payment request link shown to a payer.
///
/// Token payments carry the contract as a `token` parameter so that wallets
/// pre-select the right asset.
pub fn payment_uri(receiving_address: &Address, token: &TokenIdentity) -> String {
	match token.contract() {
		Some(contract) => format!("ethereum:{}?token={}", receiving_address, contract),
		None => format!("ethereum:{}", receiving_address),
	}
}
