//! Watcher configuration.
//!
//! A configuration is TOML with four sections: `watcher` (engine knobs),
//! `chain` and `storage` (implementation selection, each entry handed to the
//! matching factory untouched) and `[[accounts]]`. `${VAR}` and
//! `${VAR:-default}` are substituted before parsing.
//!
//! Files may be split with `include = ["chain.toml", "stores/a.toml"]`.

#[cfg(any(test, feature = "testing"))]
pub mod builders;
mod loader;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use watcher_types::{Account, TokenIdentity};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Configuration error: {0}")]
	Parse(String),
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message, drop the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the payment watcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Engine-wide settings.
	pub watcher: WatcherConfig,
	/// Chain client selection and settings.
	pub chain: ChainConfig,
	/// Storage backend for cursors, invoices and settlements.
	pub storage: StorageConfig,
	/// Monitored merchant accounts.
	#[serde(default)]
	pub accounts: Vec<AccountConfig>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
	/// Identifier of this watcher instance, used in logs.
	pub id: String,
	/// Trailing blocks rescanned on every cycle.
	#[serde(default = "default_lookback_blocks")]
	pub lookback_blocks: u64,
	/// Upper bound on accounts scanned at the same time.
	#[serde(default = "default_max_concurrent_scans")]
	pub max_concurrent_scans: usize,
	/// How often the account list is reloaded from its source.
	#[serde(default = "default_account_refresh_seconds")]
	pub account_refresh_seconds: u64,
	/// Widest window a cursor may extend behind the latest block after an outage.
	#[serde(default = "default_max_catchup_blocks")]
	pub max_catchup_blocks: u64,
}

fn default_lookback_blocks() -> u64 {
	1000
}

fn default_max_concurrent_scans() -> usize {
	8
}

fn default_account_refresh_seconds() -> u64 {
	60
}

fn default_max_catchup_blocks() -> u64 {
	10_000
}

/// Chain client selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
	/// Which implementation to use.
	pub primary: String,
	/// Map of chain implementation names to their raw TOML configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	pub cleanup_interval_seconds: u64,
}

/// One monitored merchant account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
	pub id: String,
	/// Checked when the account is scanned, not at load time, so one broken
	/// account never blocks the others.
	#[serde(default)]
	pub receiving_address: String,
	/// Blocks mined on top of a transfer before it counts.
	#[serde(default = "default_confirmation_depth")]
	pub confirmation_depth: u64,
	#[serde(default = "default_scan_interval_seconds")]
	pub scan_interval_seconds: u64,
	#[serde(default)]
	pub tokens: Vec<TokenIdentity>,
}

fn default_confirmation_depth() -> u64 {
	12
}

fn default_scan_interval_seconds() -> u64 {
	15
}

impl AccountConfig {
	/// Builds the runtime account view with no scan cursor.
	pub fn to_account(&self) -> Account {
		Account {
			id: self.id.clone(),
			receiving_address: self.receiving_address.clone(),
			tokens: self.tokens.clone(),
			confirmation_depth: self.confirmation_depth,
			scan_interval: Duration::from_secs(self.scan_interval_seconds),
			last_scanned_block: None,
		}
	}
}

/// Substitutes `${NAME}` and `${NAME:-fallback}` from the process environment.
///
/// An unset variable without a fallback is an error. Inputs over 1MB are
/// rejected.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};

		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads `path` and its includes. Includes resolve against the directory
	/// of `path`.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let entry = Path::new(path);
		let file_name = entry
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		let dir = entry.parent().unwrap_or_else(|| Path::new("."));
		loader::ConfigLoader::new(dir).load_config(file_name).await
	}

	/// Runtime view of every configured account.
	pub fn accounts(&self) -> Vec<Account> {
		self.accounts.iter().map(AccountConfig::to_account).collect()
	}

	/// Checks engine knobs, implementation selection and account ids.
	///
	/// Receiving addresses and token contracts are checked when an account is
	/// scanned, so a broken account is skipped and retried on every interval.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.watcher.id.is_empty() {
			return Err(ConfigError::Validation("Watcher ID cannot be empty".into()));
		}
		if self.watcher.lookback_blocks == 0 {
			return Err(ConfigError::Validation(
				"lookback_blocks must be greater than 0".into(),
			));
		}
		if self.watcher.max_concurrent_scans == 0 {
			return Err(ConfigError::Validation(
				"max_concurrent_scans must be at least 1".into(),
			));
		}
		if self.watcher.account_refresh_seconds == 0 {
			return Err(ConfigError::Validation(
				"account_refresh_seconds must be greater than 0".into(),
			));
		}
		if self.watcher.max_catchup_blocks < self.watcher.lookback_blocks {
			return Err(ConfigError::Validation(format!(
				"max_catchup_blocks ({}) cannot be smaller than lookback_blocks ({})",
				self.watcher.max_catchup_blocks, self.watcher.lookback_blocks
			)));
		}

		// Validate chain config
		if self.chain.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Chain primary implementation cannot be empty".into(),
			));
		}
		if !self.chain.implementations.contains_key(&self.chain.primary) {
			return Err(ConfigError::Validation(format!(
				"Primary chain implementation '{}' not found in implementations",
				self.chain.primary
			)));
		}

		// Validate storage config
		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.storage.cleanup_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		self.validate_accounts()
	}

	fn validate_accounts(&self) -> Result<(), ConfigError> {
		let mut seen = HashSet::new();
		for account in &self.accounts {
			if account.id.is_empty() {
				return Err(ConfigError::Validation("Account ID cannot be empty".into()));
			}
			if !seen.insert(account.id.as_str()) {
				return Err(ConfigError::Validation(format!(
					"Duplicate account ID '{}'",
					account.id
				)));
			}
			if account.scan_interval_seconds == 0 {
				return Err(ConfigError::Validation(format!(
					"Account '{}' scan_interval_seconds must be greater than 0",
					account.id
				)));
			}
			// Transfers must stay inside the window long enough to mature
			if self.watcher.lookback_blocks <= account.confirmation_depth {
				return Err(ConfigError::Validation(format!(
					"Account '{}' confirmation_depth ({}) must be smaller than lookback_blocks ({})",
					account.id, account.confirmation_depth, self.watcher.lookback_blocks
				)));
			}
		}
		Ok(())
	}
}

/// Parses TOML, resolves environment variables and validates the result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
