//! Main entry point for the payment watcher service.
//!
//! Loads the configuration, builds the watcher engine from the configured
//! chain client and storage backend, and scans every account on its own
//! schedule until interrupted.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use watcher_config::Config;
use watcher_core::{CycleOutcome, WatcherBuilder, WatcherEngine, WatcherFactories};

use watcher_chain::implementations::evm::alloy::create_chain as create_alloy_chain;
use watcher_chain::implementations::mock::create_chain as create_mock_chain;
use watcher_storage::implementations::file::create_storage as create_file_storage;
use watcher_storage::implementations::memory::create_storage as create_memory_storage;

/// Command-line arguments for the payment watcher.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "WATCHER_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	/// Scan every account once and exit
	#[arg(long)]
	once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started payment watcher");

	let config_path = args
		.config
		.to_str()
		.ok_or("Configuration path is not valid UTF-8")?;
	let config = Config::from_file(config_path).await?;
	tracing::info!(
		accounts = config.accounts.len(),
		"Loaded configuration [{}]",
		config.watcher.id
	);

	let watcher = build_watcher(config).await?;

	if args.once {
		for (account_id, outcome) in watcher.scan_all_once().await? {
			match outcome {
				CycleOutcome::Failed(error) => {
					tracing::error!(account_id = %account_id, "Scan failed: {}", error)
				},
				outcome => tracing::info!(account_id = %account_id, ?outcome, "Scan finished"),
			}
		}
		return Ok(());
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => tracing::info!("Received Ctrl+C, finishing running scans"),
			Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
		}
		let _ = shutdown_tx.send(true);
	});

	watcher.run(shutdown_rx).await?;

	tracing::info!("Stopped payment watcher");
	Ok(())
}

/// Macro to create a factory HashMap with the appropriate type aliases
macro_rules! create_factory_map {
    ($interface:path, $error:path, $( $name:literal => $factory:expr ),* $(,)?) => {{
        let mut factories = std::collections::HashMap::new();
        $(
            factories.insert(
                $name.to_string(),
                $factory as fn(&toml::Value) -> Result<Box<dyn $interface>, $error>
            );
        )*
        factories
    }};
}

/// Builds the watcher engine with every built-in implementation registered.
async fn build_watcher(config: Config) -> Result<WatcherEngine, Box<dyn std::error::Error>> {
	let storage_factories = create_factory_map!(
		watcher_storage::StorageInterface,
		watcher_storage::StorageError,
		"file" => create_file_storage,
		"memory" => create_memory_storage,
	);

	let chain_factories = create_factory_map!(
		watcher_chain::ChainInterface,
		watcher_chain::ChainError,
		"evm_alloy" => create_alloy_chain,
		"mock" => create_mock_chain,
	);

	let factories = WatcherFactories {
		storage_factories,
		chain_factories,
	};

	Ok(WatcherBuilder::new(config).build(factories).await?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;
	use watcher_config::builders::ConfigBuilder;

	#[test]
	fn test_args_parse() {
		let args = Args::parse_from(["payment-watcher", "--config", "custom.toml", "--once"]);

		assert_eq!(args.config, PathBuf::from("custom.toml"));
		assert_eq!(args.log_level, "info");
		assert!(args.once);
	}

	#[test]
	fn test_create_factory_map_multiple_entries() {
		let factories = create_factory_map!(
			watcher_storage::StorageInterface,
			watcher_storage::StorageError,
			"memory" => create_memory_storage,
			"file" => create_file_storage,
		);

		assert_eq!(factories.len(), 2);
		assert!(factories.contains_key("memory"));
		assert!(factories.contains_key("file"));
	}

	#[tokio::test]
	async fn test_build_watcher_with_minimal_config() {
		let config = ConfigBuilder::new().watcher_id("test-service").build();

		let watcher = build_watcher(config).await.unwrap();

		assert_eq!(watcher.config().watcher.id, "test-service");
	}

	#[tokio::test]
	async fn test_build_watcher_from_file() {
		let temp_dir = tempdir().unwrap();
		let storage_dir = temp_dir.path().join("storage");
		let config_path = temp_dir.path().join("watcher.toml");

		let config_content = format!(
			r#"
[watcher]
id = "file-watcher"
lookback_blocks = 200

[chain]
primary = "mock"
[chain.implementations.mock]
latest_block = 1000

[storage]
primary = "file"
cleanup_interval_seconds = 60
[storage.implementations.file]
storage_path = "{}"

[[accounts]]
id = "store-1"
receiving_address = "0x0101010101010101010101010101010101010101"
[[accounts.tokens]]
type = "native"
"#,
			storage_dir.display()
		);
		std::fs::write(&config_path, config_content).unwrap();

		let config = Config::from_file(config_path.to_str().unwrap())
			.await
			.unwrap();
		let watcher = build_watcher(config).await.unwrap();

		assert_eq!(watcher.chain().latest_height().await.unwrap(), 1000);
		let outcomes = watcher.scan_all_once().await.unwrap();
		assert_eq!(
			outcomes,
			vec![("store-1".to_string(), CycleOutcome::Skipped)]
		);
	}
}
