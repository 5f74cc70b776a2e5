//! Lifecycle management for the watcher engine.
//!
//! Startup logs what is being watched, including each account's current
//! balance and checkout payment link. Nothing here is fatal: an unreachable
//! node or a misconfigured account is reported and left to the scan cycles.

use super::WatcherEngine;
use watcher_types::payment_uri;

impl WatcherEngine {
	/// Logs the chain tip and every watched account with its balances.
	pub async fn initialize(&self) {
		tracing::info!(watcher_id = %self.config.watcher.id, "Initializing payment watcher");

		match self.chain.latest_height().await {
			Ok(height) => tracing::info!(latest_block = height, "Connected to chain"),
			Err(e) => tracing::warn!("Chain not reachable at startup: {}", e),
		}

		let accounts = match self.accounts.accounts().await {
			Ok(accounts) => accounts,
			Err(e) => {
				tracing::warn!("Failed to load accounts at startup: {}", e);
				return;
			},
		};

		for account in &accounts {
			let address = match account.parse_receiving_address() {
				Ok(address) => address,
				Err(e) => {
					tracing::warn!(account_id = %account.id, "{}", e);
					continue;
				},
			};
			for token in &account.tokens {
				match self.chain.formatted_balance(address, token).await {
					Ok(balance) => tracing::info!(
						account_id = %account.id,
						token = %token,
						balance = %balance,
						payment_uri = %payment_uri(&address, token),
						"Account balance"
					),
					Err(e) => tracing::warn!(
						account_id = %account.id,
						token = %token,
						"Failed to read balance: {}",
						e
					),
				}
			}
		}
	}

	/// Performs cleanup operations.
	pub async fn shutdown(&self) {
		tracing::info!(watcher_id = %self.config.watcher.id, "Shutting down payment watcher");
	}
}
