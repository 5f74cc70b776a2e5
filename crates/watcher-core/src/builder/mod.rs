//! Builder pattern for constructing watcher engines.
//!
//! Resolves the configured chain client and storage backend through factory
//! maps, then wires the storage-backed account source, invoice source and
//! settlement sink unless replacements were supplied.

use crate::engine::{event_bus::EventBus, WatcherEngine};
use crate::sources::{
	AccountSource, ConfigAccountSource, InvoiceSource, SettlementSink, StorageInvoiceSource,
	StorageSettlementSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use watcher_chain::{ChainError, ChainInterface, ChainService};
use watcher_config::Config;
use watcher_storage::{StorageError, StorageInterface, StorageService};

const EVENT_BUS_CAPACITY: usize = 1000;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions by implementation name.
pub struct WatcherFactories<SF, CF> {
	pub storage_factories: HashMap<String, SF>,
	pub chain_factories: HashMap<String, CF>,
}

/// Builder for constructing a [`WatcherEngine`] with pluggable implementations.
pub struct WatcherBuilder {
	config: Config,
	accounts: Option<Arc<dyn AccountSource>>,
	invoices: Option<Arc<dyn InvoiceSource>>,
	settlement: Option<Arc<dyn SettlementSink>>,
}

impl WatcherBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			accounts: None,
			invoices: None,
			settlement: None,
		}
	}

	pub fn with_account_source(mut self, source: Arc<dyn AccountSource>) -> Self {
		self.accounts = Some(source);
		self
	}

	pub fn with_invoice_source(mut self, source: Arc<dyn InvoiceSource>) -> Self {
		self.invoices = Some(source);
		self
	}

	pub fn with_settlement_sink(mut self, sink: Arc<dyn SettlementSink>) -> Self {
		self.settlement = Some(sink);
		self
	}

	/// Builds the engine from the primary chain and storage implementations.
	pub async fn build<SF, CF>(
		self,
		factories: WatcherFactories<SF, CF>,
	) -> Result<WatcherEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		CF: Fn(&toml::Value) -> Result<Box<dyn ChainInterface>, ChainError>,
	{
		let storage_name = &self.config.storage.primary;
		let storage_config = self
			.config
			.storage
			.implementations
			.get(storage_name)
			.ok_or_else(|| {
				BuilderError::Config(format!(
					"Primary storage '{}' has no configuration",
					storage_name
				))
			})?;
		let storage_factory = factories.storage_factories.get(storage_name).ok_or_else(|| {
			BuilderError::MissingComponent(format!("storage implementation '{}'", storage_name))
		})?;
		let storage_backend = storage_factory(storage_config).map_err(|e| {
			tracing::error!(
				component = "storage",
				implementation = %storage_name,
				error = %e,
				"Failed to create storage implementation"
			);
			BuilderError::Config(format!(
				"Failed to create storage implementation '{}': {}",
				storage_name, e
			))
		})?;
		tracing::info!(component = "storage", implementation = %storage_name, "Loaded");
		let storage = Arc::new(StorageService::new(storage_backend));

		let chain_name = &self.config.chain.primary;
		let chain_config = self
			.config
			.chain
			.implementations
			.get(chain_name)
			.ok_or_else(|| {
				BuilderError::Config(format!("Primary chain '{}' has no configuration", chain_name))
			})?;
		let chain_factory = factories.chain_factories.get(chain_name).ok_or_else(|| {
			BuilderError::MissingComponent(format!("chain implementation '{}'", chain_name))
		})?;
		let chain_client = chain_factory(chain_config).map_err(|e| {
			tracing::error!(
				component = "chain",
				implementation = %chain_name,
				error = %e,
				"Failed to create chain implementation"
			);
			BuilderError::Config(format!(
				"Failed to create chain implementation '{}': {}",
				chain_name, e
			))
		})?;
		tracing::info!(component = "chain", implementation = %chain_name, "Loaded");
		let chain = ChainService::new(Arc::from(chain_client));

		let accounts: Arc<dyn AccountSource> = match self.accounts {
			Some(source) => source,
			None => Arc::new(ConfigAccountSource::new(
				self.config.accounts(),
				storage.clone(),
			)),
		};
		let invoices: Arc<dyn InvoiceSource> = match self.invoices {
			Some(source) => source,
			None => Arc::new(StorageInvoiceSource::new(storage.clone())),
		};
		let settlement: Arc<dyn SettlementSink> = match self.settlement {
			Some(sink) => sink,
			None => Arc::new(StorageSettlementSink::new(storage.clone())),
		};

		Ok(WatcherEngine::new(
			self.config,
			chain,
			storage,
			accounts,
			invoices,
			settlement,
			EventBus::new(EVENT_BUS_CAPACITY),
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use watcher_chain::ChainFactory;
	use watcher_config::builders::ConfigBuilder;
	use watcher_storage::StorageFactory;
	use watcher_types::TokenIdentity;

	fn factories() -> WatcherFactories<StorageFactory, ChainFactory> {
		WatcherFactories {
			storage_factories: watcher_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			chain_factories: watcher_chain::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		}
	}

	#[tokio::test]
	async fn test_build_with_mock_chain_and_memory_storage() {
		let config = ConfigBuilder::new()
			.account(
				"store-1",
				"0x0101010101010101010101010101010101010101",
				12,
				vec![TokenIdentity::Native],
			)
			.build();

		let engine = WatcherBuilder::new(config)
			.build(factories())
			.await
			.unwrap();

		assert_eq!(engine.config().watcher.id, "test-watcher");
		assert_eq!(engine.chain().latest_height().await.unwrap(), 0);
		let outcomes = engine.scan_all_once().await.unwrap();
		assert_eq!(outcomes.len(), 1);
	}

	#[tokio::test]
	async fn test_unknown_implementation_is_missing_component() {
		let config = ConfigBuilder::new().chain_primary("solana").build();
		let result = WatcherBuilder::new(config).build(factories()).await;
		assert!(matches!(result, Err(BuilderError::MissingComponent(_))));
	}

	#[tokio::test]
	async fn test_factory_failure_is_config_error() {
		// evm_alloy requires an rpc_url.
		let config = ConfigBuilder::new().chain_primary("evm_alloy").build();
		let result = WatcherBuilder::new(config).build(factories()).await;
		assert!(matches!(result, Err(BuilderError::Config(_))));
	}
}
