//! Chain client module for the payment watcher.
//!
//! The watcher only reads chain state. This module defines the narrow set of
//! queries it needs (latest height, full blocks, Transfer event logs, receipts
//! and balances) behind [`ChainInterface`], together with an Alloy-backed
//! JSON-RPC implementation and an in-memory mock for tests and dry runs.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use watcher_types::{
	format_token_amount, Block, ConfigSchema, ImplementationRegistry, RawLog, Receipt,
	TokenIdentity, TransactionHash,
};

pub mod erc20;

pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
	pub mod mock;
}

/// Errors that can occur while querying the chain.
#[derive(Debug, Error)]
pub enum ChainError {
	/// Transport or node-side failure.
	#[error("Network error: {0}")]
	Network(String),
	/// The node did not answer within the configured timeout.
	#[error("Request timed out: {0}")]
	Timeout(String),
	/// The node answered with data that could not be interpreted.
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Read-only chain queries used by the scanner and the confirmation gate.
///
/// Implementations must be safe for concurrent use; the engine shares one
/// client across all account scans.
#[async_trait]
pub trait ChainInterface: Send + Sync {
	/// Returns the configuration schema for this implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Height of the latest block.
	async fn latest_height(&self) -> Result<u64, ChainError>;

	/// Fetches a block with its full transaction list.
	///
	/// Returns `Ok(None)` when the node does not know the block.
	async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, ChainError>;

	/// ERC-20 `Transfer` logs emitted by `contract` whose indexed recipient is
	/// `recipient`, for blocks in `[from_block, to_block]`.
	async fn transfer_event_logs(
		&self,
		contract: Address,
		recipient: Address,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ChainError>;

	/// Receipt lookup; `Ok(None)` while the transaction is unknown or pending.
	async fn transaction_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<Receipt>, ChainError>;

	/// Balance of `address` in the smallest unit of `token`.
	async fn balance(&self, address: Address, token: &TokenIdentity) -> Result<U256, ChainError>;
}

/// Type alias for chain factory functions.
pub type ChainFactory = fn(&toml::Value) -> Result<Box<dyn ChainInterface>, ChainError>;

/// Registry trait for chain implementations.
pub trait ChainRegistry: ImplementationRegistry<Factory = ChainFactory> {}

/// Returns `(name, factory)` pairs for every built-in chain implementation.
pub fn get_all_implementations() -> Vec<(&'static str, ChainFactory)> {
	use implementations::{evm::alloy, mock};

	vec![
		(alloy::Registry::NAME, alloy::Registry::factory()),
		(mock::Registry::NAME, mock::Registry::factory()),
	]
}

/// Shared handle to the configured chain client.
#[derive(Clone)]
pub struct ChainService {
	client: Arc<dyn ChainInterface>,
}

impl ChainService {
	pub fn new(client: Arc<dyn ChainInterface>) -> Self {
		Self { client }
	}

	/// Underlying client, for the scanner and the confirmation gate.
	pub fn client(&self) -> &dyn ChainInterface {
		self.client.as_ref()
	}

	pub async fn latest_height(&self) -> Result<u64, ChainError> {
		self.client.latest_height().await
	}

	/// Balance of `address` rendered in whole token units.
	pub async fn formatted_balance(
		&self,
		address: Address,
		token: &TokenIdentity,
	) -> Result<String, ChainError> {
		let raw = self.client.balance(address, token).await?;
		Ok(format_token_amount(raw, token.decimals()))
	}
}
