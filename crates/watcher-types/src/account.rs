//! Merchant account types.
//!
//! An account is the monitoring configuration of one merchant: where payments
//! arrive, which tokens are accepted and how deep a transfer must be buried
//! before it counts as final.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Decimal exponent of the native currency on Ethereum-style chains (wei per ether).
pub const NATIVE_DECIMALS: u8 = 18;

/// Symbol used when rendering native currency amounts.
pub const NATIVE_SYMBOL: &str = "ETH";

/// Largest decimal precision an exact amount can carry.
pub const MAX_TOKEN_DECIMALS: u8 = 28;

/// Identity of a token a merchant accepts.
///
/// Either the chain's native currency or an ERC-20-style contract. Two identities
/// are equal when they name the same contract, regardless of address casing in
/// the source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenIdentity {
	/// The chain's base currency.
	Native,
	/// A contract-issued token emitting standard Transfer events.
	Erc20 {
		/// Address of the token contract.
		contract: Address,
		/// Decimal precision declared by the contract.
		decimals: u8,
		/// Display symbol (e.g. "USDT").
		symbol: String,
	},
}

impl TokenIdentity {
	/// Creates an ERC-20 token identity.
	pub fn erc20(contract: Address, decimals: u8, symbol: impl Into<String>) -> Self {
		Self::Erc20 {
			contract,
			decimals,
			symbol: symbol.into(),
		}
	}

	/// Returns the decimal precision used to normalize raw amounts.
	pub fn decimals(&self) -> u8 {
		match self {
			Self::Native => NATIVE_DECIMALS,
			Self::Erc20 { decimals, .. } => *decimals,
		}
	}

	/// Returns the display symbol.
	pub fn symbol(&self) -> &str {
		match self {
			Self::Native => NATIVE_SYMBOL,
			Self::Erc20 { symbol, .. } => symbol,
		}
	}

	/// Returns the contract address for ERC-20 tokens.
	pub fn contract(&self) -> Option<Address> {
		match self {
			Self::Native => None,
			Self::Erc20 { contract, .. } => Some(*contract),
		}
	}

	pub fn is_native(&self) -> bool {
		matches!(self, Self::Native)
	}
}

impl fmt::Display for TokenIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Native => write!(f, "{}", NATIVE_SYMBOL),
			Self::Erc20 {
				contract, symbol, ..
			} => write!(f, "{} ({})", symbol, contract),
		}
	}
}

/// A merchant's monitoring configuration.
///
/// The receiving address is kept as the raw configured string so that a
/// missing or malformed value surfaces as a per-account configuration error at
/// scan time instead of preventing every other account from loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
	/// Identifier of the merchant (store) owning this configuration.
	pub id: String,
	/// Address payments are sent to.
	pub receiving_address: String,
	/// Tokens accepted by this merchant.
	pub tokens: Vec<TokenIdentity>,
	/// Blocks that must be mined on top of a transfer before it is final.
	pub confirmation_depth: u64,
	/// Time between the end of one scan cycle and the start of the next.
	pub scan_interval: Duration,
	/// Highest block covered by the last successful scan, if any.
	pub last_scanned_block: Option<u64>,
}

impl Account {
	/// Parses the configured receiving address.
	///
	/// Returns a description of the problem when the address is missing or
	/// cannot be parsed as a 20-byte chain address.
	pub fn parse_receiving_address(&self) -> Result<Address, String> {
		let raw = self.receiving_address.trim();
		if raw.is_empty() {
			return Err(format!("No receiving address configured for account {}", self.id));
		}
		raw.parse::<Address>().map_err(|e| {
			format!(
				"Invalid receiving address '{}' for account {}: {}",
				raw, self.id, e
			)
		})
	}

	/// Checks the accepted token list for unusable entries.
	pub fn check_tokens(&self) -> Result<(), String> {
		if self.tokens.is_empty() {
			return Err(format!("Account {} accepts no tokens", self.id));
		}
		for token in &self.tokens {
			if let TokenIdentity::Erc20 {
				contract,
				decimals,
				symbol,
			} = token
			{
				if contract.is_zero() {
					return Err(format!(
						"Token {} for account {} has no contract address",
						symbol, self.id
					));
				}
				if *decimals > MAX_TOKEN_DECIMALS {
					return Err(format!(
						"Token {} for account {} declares {} decimals (max {})",
						symbol, self.id, decimals, MAX_TOKEN_DECIMALS
					));
				}
			}
		}
		Ok(())
	}
}
