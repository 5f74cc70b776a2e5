//! Configuration builder for tests and local development.

use crate::{AccountConfig, ChainConfig, Config, StorageConfig, WatcherConfig};
use std::collections::HashMap;
use watcher_types::TokenIdentity;

/// Builder for creating `Config` instances with a fluent API.
///
/// Defaults use the `mock` chain and `memory` storage implementations with
/// empty settings, so a built config can be fed straight into the engine
/// builder in tests.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	watcher_id: String,
	lookback_blocks: u64,
	max_concurrent_scans: usize,
	max_catchup_blocks: u64,
	account_refresh_seconds: u64,
	chain_primary: String,
	storage_primary: String,
	accounts: Vec<AccountConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		Self {
			watcher_id: "test-watcher".to_string(),
			lookback_blocks: 1000,
			max_concurrent_scans: 4,
			max_catchup_blocks: 10_000,
			account_refresh_seconds: 60,
			chain_primary: "mock".to_string(),
			storage_primary: "memory".to_string(),
			accounts: Vec::new(),
		}
	}

	pub fn watcher_id(mut self, id: impl Into<String>) -> Self {
		self.watcher_id = id.into();
		self
	}

	pub fn lookback_blocks(mut self, blocks: u64) -> Self {
		self.lookback_blocks = blocks;
		self
	}

	pub fn max_concurrent_scans(mut self, scans: usize) -> Self {
		self.max_concurrent_scans = scans;
		self
	}

	pub fn max_catchup_blocks(mut self, blocks: u64) -> Self {
		self.max_catchup_blocks = blocks;
		self
	}

	pub fn account_refresh_seconds(mut self, seconds: u64) -> Self {
		self.account_refresh_seconds = seconds;
		self
	}

	pub fn chain_primary(mut self, primary: impl Into<String>) -> Self {
		self.chain_primary = primary.into();
		self
	}

	pub fn storage_primary(mut self, primary: impl Into<String>) -> Self {
		self.storage_primary = primary.into();
		self
	}

	/// Adds an account with a one-second scan interval.
	pub fn account(
		mut self,
		id: impl Into<String>,
		receiving_address: impl Into<String>,
		confirmation_depth: u64,
		tokens: Vec<TokenIdentity>,
	) -> Self {
		self.accounts.push(AccountConfig {
			id: id.into(),
			receiving_address: receiving_address.into(),
			confirmation_depth,
			scan_interval_seconds: 1,
			tokens,
		});
		self
	}

	pub fn build(self) -> Config {
		let empty = || toml::Value::Table(toml::Table::new());
		Config {
			watcher: WatcherConfig {
				id: self.watcher_id,
				lookback_blocks: self.lookback_blocks,
				max_concurrent_scans: self.max_concurrent_scans,
				account_refresh_seconds: self.account_refresh_seconds,
				max_catchup_blocks: self.max_catchup_blocks,
			},
			chain: ChainConfig {
				implementations: HashMap::from([(self.chain_primary.clone(), empty())]),
				primary: self.chain_primary,
			},
			storage: StorageConfig {
				implementations: HashMap::from([(self.storage_primary.clone(), empty())]),
				primary: self.storage_primary,
				cleanup_interval_seconds: 60,
			},
			accounts: self.accounts,
		}
	}
}
