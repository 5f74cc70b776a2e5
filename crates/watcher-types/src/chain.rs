//! Chain-level data returned by chain client implementations.
//!
//! These types are a narrow, transport-independent view of what the watcher
//! needs from a block: value transfers, raw event logs and receipts.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionHash(pub Vec<u8>);

impl TransactionHash {
	/// Renders the hash as a `0x`-prefixed lowercase hex string.
	pub fn to_hex(&self) -> String {
		format!("0x{}", hex::encode(&self.0))
	}
}

impl fmt::Display for TransactionHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl From<B256> for TransactionHash {
	fn from(hash: B256) -> Self {
		Self(hash.to_vec())
	}
}

/// A transaction as seen inside a fetched block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
	pub hash: TransactionHash,
	pub from: Address,
	/// `None` for contract creations.
	pub to: Option<Address>,
	/// Native value in the smallest unit (wei).
	pub value: U256,
}

/// A block together with its full transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
	pub number: u64,
	/// Unix timestamp in seconds, when the client reports one.
	pub timestamp: Option<u64>,
	pub transactions: Vec<ChainTransaction>,
}

/// An undecoded event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
	/// Contract that emitted the log.
	pub address: Address,
	pub topics: Vec<B256>,
	pub data: Vec<u8>,
	/// Missing for logs of pending blocks.
	pub transaction_hash: Option<TransactionHash>,
	pub block_number: Option<u64>,
	pub log_index: Option<u64>,
}

/// Receipt of a mined (or pending) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
	pub hash: TransactionHash,
	/// Inclusion height; `None` while the transaction is still pending.
	pub block_number: Option<u64>,
	pub success: bool,
}
