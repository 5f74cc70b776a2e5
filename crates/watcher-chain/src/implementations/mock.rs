//! In-memory chain for tests and dry runs.
//!
//! Blocks, logs, receipts and balances are seeded by the caller. Every query is
//! counted, and individual query kinds can be made to fail, which is how the
//! engine's failure isolation and "no chain calls" behaviour are exercised.

use crate::{ChainError, ChainFactory, ChainInterface, ChainRegistry};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use watcher_types::{
	utils::address_topic, Block, ConfigSchema, Field, FieldType, ImplementationRegistry, RawLog,
	Receipt, Schema, TokenIdentity, TransactionHash, ValidationError,
};

/// Snapshot of how many queries of each kind were made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCalls {
	pub latest_height: u64,
	pub blocks: u64,
	pub logs: u64,
	pub receipts: u64,
	pub balances: u64,
}

impl ChainCalls {
	pub fn total(&self) -> u64 {
		self.latest_height + self.blocks + self.logs + self.receipts + self.balances
	}
}

#[derive(Default)]
struct Counters {
	latest_height: AtomicU64,
	blocks: AtomicU64,
	logs: AtomicU64,
	receipts: AtomicU64,
	balances: AtomicU64,
}

#[derive(Default)]
struct Failures {
	latest_height: bool,
	logs: bool,
	receipts: bool,
	blocks: HashSet<u64>,
}

#[derive(Default)]
struct State {
	latest: u64,
	blocks: HashMap<u64, Block>,
	logs: Vec<RawLog>,
	receipts: HashMap<TransactionHash, Receipt>,
	balances: HashMap<(Address, TokenIdentity), U256>,
	failures: Failures,
}

/// Mock chain implementation.
///
/// Blocks that were never seeded are reported as empty blocks, so a native
/// scan over an unseeded range succeeds with no transfers.
pub struct MockChain {
	state: RwLock<State>,
	counters: Counters,
}

impl MockChain {
	pub fn new(latest: u64) -> Self {
		Self {
			state: RwLock::new(State {
				latest,
				..State::default()
			}),
			counters: Counters::default(),
		}
	}

	pub async fn set_latest(&self, height: u64) {
		self.state.write().await.latest = height;
	}

	/// Seeds a block, replacing any previous block at the same height.
	pub async fn add_block(&self, block: Block) {
		self.state.write().await.blocks.insert(block.number, block);
	}

	pub async fn add_log(&self, log: RawLog) {
		self.state.write().await.logs.push(log);
	}

	/// Records a receipt with the given inclusion height (`None` = pending).
	pub async fn set_receipt(&self, hash: TransactionHash, block_number: Option<u64>) {
		let receipt = Receipt {
			hash: hash.clone(),
			block_number,
			success: true,
		};
		self.state.write().await.receipts.insert(hash, receipt);
	}

	pub async fn set_balance(&self, address: Address, token: &TokenIdentity, amount: U256) {
		self.state
			.write()
			.await
			.balances
			.insert((address, token.clone()), amount);
	}

	/// Makes the fetch of one block height fail.
	pub async fn fail_block(&self, height: u64) {
		self.state.write().await.failures.blocks.insert(height);
	}

	pub async fn fail_latest_height(&self, fail: bool) {
		self.state.write().await.failures.latest_height = fail;
	}

	pub async fn fail_logs(&self, fail: bool) {
		self.state.write().await.failures.logs = fail;
	}

	pub async fn fail_receipts(&self, fail: bool) {
		self.state.write().await.failures.receipts = fail;
	}

	/// Clears every injected failure.
	pub async fn heal(&self) {
		self.state.write().await.failures = Failures::default();
	}

	pub fn calls(&self) -> ChainCalls {
		ChainCalls {
			latest_height: self.counters.latest_height.load(Ordering::SeqCst),
			blocks: self.counters.blocks.load(Ordering::SeqCst),
			logs: self.counters.logs.load(Ordering::SeqCst),
			receipts: self.counters.receipts.load(Ordering::SeqCst),
			balances: self.counters.balances.load(Ordering::SeqCst),
		}
	}
}

#[async_trait]
impl ChainInterface for MockChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MockChainSchema)
	}

	async fn latest_height(&self) -> Result<u64, ChainError> {
		self.counters.latest_height.fetch_add(1, Ordering::SeqCst);
		let state = self.state.read().await;
		if state.failures.latest_height {
			return Err(ChainError::Network("injected latest height failure".into()));
		}
		Ok(state.latest)
	}

	async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, ChainError> {
		self.counters.blocks.fetch_add(1, Ordering::SeqCst);
		let state = self.state.read().await;
		if state.failures.blocks.contains(&height) {
			return Err(ChainError::Network(format!(
				"injected failure fetching block {}",
				height
			)));
		}
		if height > state.latest {
			return Ok(None);
		}
		Ok(Some(state.blocks.get(&height).cloned().unwrap_or(Block {
			number: height,
			timestamp: None,
			transactions: Vec::new(),
		})))
	}

	async fn transfer_event_logs(
		&self,
		contract: Address,
		recipient: Address,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ChainError> {
		self.counters.logs.fetch_add(1, Ordering::SeqCst);
		let state = self.state.read().await;
		if state.failures.logs {
			return Err(ChainError::Network("injected log query failure".into()));
		}

		let recipient_topic = address_topic(recipient);
		Ok(state
			.logs
			.iter()
			.filter(|log| log.address == contract)
			.filter(|log| log.topics.get(2) == Some(&recipient_topic))
			.filter(|log| {
				log.block_number
					.is_some_and(|block| block >= from_block && block <= to_block)
			})
			.cloned()
			.collect())
	}

	async fn transaction_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<Receipt>, ChainError> {
		self.counters.receipts.fetch_add(1, Ordering::SeqCst);
		let state = self.state.read().await;
		if state.failures.receipts {
			return Err(ChainError::Network("injected receipt failure".into()));
		}
		Ok(state.receipts.get(hash).cloned())
	}

	async fn balance(&self, address: Address, token: &TokenIdentity) -> Result<U256, ChainError> {
		self.counters.balances.fetch_add(1, Ordering::SeqCst);
		let state = self.state.read().await;
		Ok(state
			.balances
			.get(&(address, token.clone()))
			.copied()
			.unwrap_or(U256::ZERO))
	}
}

/// Configuration schema for the mock chain.
pub struct MockChainSchema;

impl ConfigSchema for MockChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new(
				"latest_block",
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			)],
		);
		schema.validate(config)
	}
}

/// Creates a mock chain from configuration.
///
/// Configuration parameters:
/// - `latest_block`: height reported as latest (default: 0)
pub fn create_chain(config: &toml::Value) -> Result<Box<dyn ChainInterface>, ChainError> {
	MockChainSchema
		.validate(config)
		.map_err(|e| ChainError::Configuration(format!("Invalid configuration: {}", e)))?;

	let latest = config
		.get("latest_block")
		.and_then(|v| v.as_integer())
		.unwrap_or(0) as u64;

	Ok(Box::new(MockChain::new(latest)))
}

/// Registry for the mock chain implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "mock";
	type Factory = ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl ChainRegistry for Registry {}
