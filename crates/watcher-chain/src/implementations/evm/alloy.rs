//! JSON-RPC chain client built on Alloy.
//!
//! Talks to a single EVM node over HTTP. Every request is bounded by the
//! configured timeout so that a hung endpoint fails the current scan cycle
//! instead of stalling the account forever.

use crate::erc20::{balanceOfCall, Transfer};
use crate::{ChainError, ChainFactory, ChainInterface, ChainRegistry};
use alloy_consensus::Transaction as _;
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types::{BlockNumberOrTag, BlockTransactionsKind, Filter, TransactionRequest};
use alloy_sol_types::{SolCall, SolEvent};
use alloy_transport_http::Http;
use async_trait::async_trait;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::time::timeout;
use watcher_types::{
	utils::address_topic, Block, ChainTransaction, ConfigSchema, Field, FieldType,
	ImplementationRegistry, RawLog, Receipt, Schema, TokenIdentity, TransactionHash,
	ValidationError,
};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Alloy-based EVM chain client.
pub struct AlloyChain {
	provider: RootProvider<Http<reqwest::Client>>,
	request_timeout: Duration,
}

impl AlloyChain {
	pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self, ChainError> {
		let url = rpc_url
			.parse()
			.map_err(|e| ChainError::Configuration(format!("Invalid RPC URL: {}", e)))?;

		Ok(Self {
			provider: RootProvider::new_http(url),
			request_timeout,
		})
	}

	/// Runs one RPC request under the configured timeout.
	async fn request<T, E, F>(&self, what: &str, fut: F) -> Result<T, ChainError>
	where
		E: std::fmt::Display,
		F: IntoFuture<Output = Result<T, E>>,
	{
		match timeout(self.request_timeout, fut).await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(e)) => Err(ChainError::Network(format!("Failed to {}: {}", what, e))),
			Err(_) => Err(ChainError::Timeout(format!(
				"{} did not complete within {}s",
				what,
				self.request_timeout.as_secs()
			))),
		}
	}
}

/// Configuration schema for the Alloy chain client.
pub struct AlloyChainSchema;

impl ConfigSchema for AlloyChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("rpc_url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
						Ok(())
					},
					_ => Err("rpc_url must be an http:// or https:// URL".to_string()),
				}
			})],
			vec![Field::new(
				"request_timeout_seconds",
				FieldType::Integer {
					min: Some(1),
					max: Some(600),
				},
			)],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl ChainInterface for AlloyChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyChainSchema)
	}

	async fn latest_height(&self) -> Result<u64, ChainError> {
		self.request("get block number", self.provider.get_block_number())
			.await
	}

	async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, ChainError> {
		let block = self
			.request(
				&format!("get block {}", height),
				self.provider.get_block_by_number(
					BlockNumberOrTag::Number(height),
					BlockTransactionsKind::Full,
				),
			)
			.await?;

		let Some(block) = block else {
			return Ok(None);
		};

		let transactions = block
			.transactions
			.txns()
			.map(|tx| ChainTransaction {
				hash: TransactionHash::from(*tx.inner.tx_hash()),
				from: tx.from,
				to: tx.to(),
				value: tx.value(),
			})
			.collect();

		Ok(Some(Block {
			number: height,
			timestamp: Some(block.header.timestamp),
			transactions,
		}))
	}

	async fn transfer_event_logs(
		&self,
		contract: Address,
		recipient: Address,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ChainError> {
		let filter = Filter::new()
			.address(contract)
			.event_signature(Transfer::SIGNATURE_HASH)
			.topic2(address_topic(recipient))
			.from_block(from_block)
			.to_block(to_block);

		let logs = self
			.request(
				&format!("get Transfer logs for {} in [{}, {}]", contract, from_block, to_block),
				self.provider.get_logs(&filter),
			)
			.await?;

		Ok(logs
			.into_iter()
			.map(|log| RawLog {
				address: log.address(),
				topics: log.topics().to_vec(),
				data: log.data().data.to_vec(),
				transaction_hash: log.transaction_hash.map(TransactionHash::from),
				block_number: log.block_number,
				log_index: log.log_index,
			})
			.collect())
	}

	async fn transaction_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<Receipt>, ChainError> {
		if hash.0.len() != 32 {
			return Err(ChainError::InvalidResponse(format!(
				"Transaction hash {} is not 32 bytes",
				hash
			)));
		}
		let tx_hash = B256::from_slice(&hash.0);

		let receipt = self
			.request(
				"get transaction receipt",
				self.provider.get_transaction_receipt(tx_hash),
			)
			.await?;

		Ok(receipt.map(|receipt| Receipt {
			hash: TransactionHash::from(receipt.transaction_hash),
			block_number: receipt.block_number,
			success: receipt.status(),
		}))
	}

	async fn balance(&self, address: Address, token: &TokenIdentity) -> Result<U256, ChainError> {
		match token.contract() {
			None => {
				self.request("get balance", self.provider.get_balance(address))
					.await
			},
			Some(contract) => {
				let call_data = balanceOfCall { owner: address }.abi_encode();
				let request = TransactionRequest::default()
					.to(contract)
					.input(call_data.into());

				let output = self
					.request("call balanceOf", self.provider.call(&request))
					.await?;

				balanceOfCall::abi_decode_returns(&output, true)
					.map(|ret| ret.balance)
					.map_err(|e| {
						ChainError::InvalidResponse(format!(
							"Invalid balanceOf response from {}: {}",
							contract, e
						))
					})
			},
		}
	}
}

/// Creates an Alloy chain client from configuration.
///
/// Configuration parameters:
/// - `rpc_url` (required): HTTP(S) JSON-RPC endpoint
/// - `request_timeout_seconds`: per-request timeout (default: 30)
pub fn create_chain(config: &toml::Value) -> Result<Box<dyn ChainInterface>, ChainError> {
	AlloyChainSchema
		.validate(config)
		.map_err(|e| ChainError::Configuration(format!("Invalid configuration: {}", e)))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ChainError::Configuration("rpc_url is required".to_string()))?;

	let request_timeout = config
		.get("request_timeout_seconds")
		.and_then(|v| v.as_integer())
		.map(|secs| secs as u64)
		.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

	tracing::debug!(rpc_url = %rpc_url, timeout_secs = request_timeout, "Creating Alloy chain client");

	Ok(Box::new(AlloyChain::new(
		rpc_url,
		Duration::from_secs(request_timeout),
	)?))
}

/// Registry for the Alloy chain implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "evm_alloy";
	type Factory = ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl ChainRegistry for Registry {}
