//! String formatting utilities for logs and balances.

use alloy_primitives::U256;

/// Truncates a hex string for log output.
///
/// Keeps the first 10 characters so that a `0x`-prefixed hash still shows
/// eight hex digits.
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 10 {
		id.to_string()
	} else {
		format!("{}..", &id[..10])
	}
}

/// Adds "0x" prefix to a hex string if it doesn't already have one.
pub fn with_0x_prefix(hex_str: &str) -> String {
	if hex_str.to_lowercase().starts_with("0x") {
		hex_str.to_string()
	} else {
		format!("0x{}", hex_str)
	}
}

/// Removes "0x" or "0X" prefix from a hex string if present.
pub fn without_0x_prefix(hex_str: &str) -> &str {
	hex_str
		.strip_prefix("0x")
		.or_else(|| hex_str.strip_prefix("0X"))
		.unwrap_or(hex_str)
}

/// Formats a raw smallest-unit amount with the token's decimal places.
///
/// Works on the full 256-bit range, unlike exact decimal conversion, which
/// makes it suitable for balances of arbitrary size. Trailing zeros in the
/// fractional part are dropped: `1500000` with 6 decimals renders as `1.5`.
pub fn format_token_amount(amount: U256, decimals: u8) -> String {
	let digits = amount.to_string();
	if decimals == 0 {
		return digits;
	}

	let places = decimals as usize;
	let (integer_part, fraction_part) = if digits.len() <= places {
		("0".to_string(), format!("{:0>width$}", digits, width = places))
	} else {
		let split = digits.len() - places;
		(digits[..split].to_string(), digits[split..].to_string())
	};

	let fraction = fraction_part.trim_end_matches('0');
	if fraction.is_empty() {
		integer_part
	} else {
		format!("{}.{}", integer_part, fraction)
	}
}
