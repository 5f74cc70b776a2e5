//! Observed transfers and the matches built from them.

use crate::{TokenIdentity, TransactionHash};
use alloy_primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An on-chain movement of value into a receiving address.
///
/// Amounts are already normalized by the token's decimals, so `1.5` means one
/// and a half tokens rather than 1.5 smallest units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
	pub tx_hash: TransactionHash,
	/// Position of the Transfer event in its block; `None` for native transfers.
	pub log_index: Option<u64>,
	pub from: Address,
	pub to: Address,
	pub amount: Decimal,
	pub block_number: u64,
	pub token: TokenIdentity,
	/// Block timestamp, attached for native transfers when available.
	pub timestamp: Option<u64>,
}

impl Transfer {
	/// Unique reference of this transfer.
	///
	/// A single transaction can carry several token transfers, so the log index
	/// is part of the identity.
	pub fn reference(&self) -> TransferRef {
		TransferRef {
			tx_hash: self.tx_hash.clone(),
			log_index: self.log_index,
		}
	}
}

/// Identity of a transfer used for deduplication and idempotent settlement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferRef {
	pub tx_hash: TransactionHash,
	pub log_index: Option<u64>,
}

impl fmt::Display for TransferRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.log_index {
			Some(index) => write!(f, "{}:{}", self.tx_hash, index),
			None => write!(f, "{}", self.tx_hash),
		}
	}
}

/// Decision pairing a transfer with an invoice payment method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
	/// Account whose receiving address got the transfer.
	pub account_id: String,
	pub invoice_id: String,
	pub payment_method_id: String,
	pub transfer: Transfer,
	/// Amount credited to the payment method (the transfer amount).
	pub amount: Decimal,
	/// Confirmations observed when the match was decided.
	pub confirmations: u64,
}

/// Result of handing a match to the settlement sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
	/// The match was recorded against the invoice.
	Applied,
	/// The transfer had already been settled; nothing changed.
	AlreadySettled,
	/// The sink declined the match.
	Rejected { reason: String },
}
