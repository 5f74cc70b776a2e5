//! Confirmation gate.
//!
//! Counts how many blocks have been mined on top of a transaction. A
//! transaction the node does not know yet, or one still pending, has zero
//! confirmations. A failed lookup is reported as an error and never as zero,
//! so the caller can tell "not confirmed" apart from "unknown, retry later".

use thiserror::Error;
use watcher_chain::{ChainError, ChainInterface};
use watcher_types::{truncate_id, TransactionHash};

/// Errors raised while counting confirmations.
#[derive(Debug, Error)]
pub enum ConfirmationCheckFailure {
	#[error("Failed to fetch receipt for {tx_hash}: {source}")]
	Receipt {
		tx_hash: String,
		#[source]
		source: ChainError,
	},
	#[error("Failed to fetch latest height: {0}")]
	LatestHeight(#[source] ChainError),
}

/// Number of blocks mined on top of the block that included `tx_hash`.
///
/// A transaction included in the latest block has 0 confirmations. Reverted
/// transactions also report 0; they moved no value and must never satisfy a
/// confirmation threshold.
pub async fn confirmations(
	chain: &dyn ChainInterface,
	tx_hash: &TransactionHash,
) -> Result<u64, ConfirmationCheckFailure> {
	let receipt = chain
		.transaction_receipt(tx_hash)
		.await
		.map_err(|source| ConfirmationCheckFailure::Receipt {
			tx_hash: tx_hash.to_hex(),
			source,
		})?;

	let Some(receipt) = receipt else {
		return Ok(0);
	};
	let Some(included_at) = receipt.block_number else {
		return Ok(0);
	};
	if !receipt.success {
		tracing::debug!(
			tx_hash = %truncate_id(&tx_hash.to_hex()),
			"Transaction reverted"
		);
		return Ok(0);
	}

	let latest = chain
		.latest_height()
		.await
		.map_err(ConfirmationCheckFailure::LatestHeight)?;

	Ok(latest.saturating_sub(included_at))
}
