//! Transfer scanner for the payment watcher.
//!
//! Turns a block range into the list of incoming transfers for one receiving
//! address and one token. Native currency is found by walking every block in
//! the range and inspecting its transactions; ERC-20 tokens are found with a
//! single ranged query of the contract's `Transfer` event log, filtered on the
//! indexed recipient.
//!
//! A scan either returns every transfer in the range or fails as a whole when
//! a chain query fails. A transfer whose amount does not fit the exact decimal
//! range is logged and left out; it cannot pay any invoice.

use alloy_primitives::{Address, Log as PrimLog, LogData, U256};
use alloy_sol_types::SolEvent;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use watcher_chain::{erc20::Transfer as TransferEvent, ChainError, ChainInterface};
use watcher_types::{
	raw_to_decimal, truncate_id, RawLog, TokenIdentity, TransactionHash, Transfer,
	NATIVE_DECIMALS,
};

/// Number of block fetches kept in flight during a native scan.
const NATIVE_FETCH_CONCURRENCY: usize = 8;

/// Errors that abort a scan.
#[derive(Debug, Error)]
pub enum ScanFailure {
	/// Fetching a single block failed.
	#[error("Failed to fetch block {block}: {source}")]
	Block {
		block: u64,
		#[source]
		source: ChainError,
	},
	/// The node does not know a block inside the requested range.
	#[error("Block {0} is not available")]
	MissingBlock(u64),
	/// The ranged event log query failed.
	#[error("Failed to query Transfer logs of {contract} in [{from_block}, {to_block}]: {source}")]
	Logs {
		contract: Address,
		from_block: u64,
		to_block: u64,
		#[source]
		source: ChainError,
	},
	/// A log returned by the node is not a well-formed Transfer event.
	#[error("Malformed Transfer log in block {block:?}: {reason}")]
	Decode { block: Option<u64>, reason: String },
	/// A log lacks the transaction hash or block number needed to track it.
	#[error("Transfer log is missing {0}")]
	MissingLogMetadata(&'static str),
}

/// Scans `[from_block, to_block]` for transfers of `token` into `receiving_address`.
///
/// An empty range (`from_block > to_block`) returns no transfers and makes no
/// chain calls. Every returned transfer has `to == receiving_address`.
pub async fn scan(
	chain: &dyn ChainInterface,
	token: &TokenIdentity,
	receiving_address: Address,
	from_block: u64,
	to_block: u64,
) -> Result<Vec<Transfer>, ScanFailure> {
	if from_block > to_block {
		return Ok(Vec::new());
	}

	let transfers = match token {
		TokenIdentity::Native => {
			scan_native(chain, receiving_address, from_block, to_block).await?
		},
		TokenIdentity::Erc20 { contract, .. } => {
			scan_erc20(chain, token, *contract, receiving_address, from_block, to_block).await?
		},
	};

	tracing::debug!(
		token = %token,
		from_block,
		to_block,
		found = transfers.len(),
		"Scanned range"
	);
	Ok(transfers)
}

async fn scan_native(
	chain: &dyn ChainInterface,
	receiving_address: Address,
	from_block: u64,
	to_block: u64,
) -> Result<Vec<Transfer>, ScanFailure> {
	let mut blocks = stream::iter(from_block..=to_block)
		.map(|height| async move {
			chain
				.block_with_transactions(height)
				.await
				.map_err(|source| ScanFailure::Block {
					block: height,
					source,
				})?
				.ok_or(ScanFailure::MissingBlock(height))
		})
		.buffered(NATIVE_FETCH_CONCURRENCY);

	let mut transfers = Vec::new();
	while let Some(block) = blocks.next().await {
		let block = block?;
		for tx in &block.transactions {
			if tx.to != Some(receiving_address) || tx.value.is_zero() {
				continue;
			}
			let Some(amount) = exact_amount(tx.value, NATIVE_DECIMALS, &tx.hash, block.number)
			else {
				continue;
			};
			transfers.push(Transfer {
				tx_hash: tx.hash.clone(),
				log_index: None,
				from: tx.from,
				to: receiving_address,
				amount,
				block_number: block.number,
				token: TokenIdentity::Native,
				timestamp: block.timestamp,
			});
		}
	}
	Ok(transfers)
}

async fn scan_erc20(
	chain: &dyn ChainInterface,
	token: &TokenIdentity,
	contract: Address,
	receiving_address: Address,
	from_block: u64,
	to_block: u64,
) -> Result<Vec<Transfer>, ScanFailure> {
	let logs = chain
		.transfer_event_logs(contract, receiving_address, from_block, to_block)
		.await
		.map_err(|source| ScanFailure::Logs {
			contract,
			from_block,
			to_block,
			source,
		})?;

	let mut transfers = Vec::with_capacity(logs.len());
	for log in &logs {
		let (from, to, value) = decode_transfer(log)?;
		if to != receiving_address {
			tracing::warn!(
				contract = %contract,
				recipient = %to,
				"Ignoring Transfer log for a different recipient"
			);
			continue;
		}
		// Zero-value transfers are commonly used for address poisoning.
		if value.is_zero() {
			continue;
		}

		let tx_hash = log
			.transaction_hash
			.clone()
			.ok_or(ScanFailure::MissingLogMetadata("transaction hash"))?;
		let block_number = log
			.block_number
			.ok_or(ScanFailure::MissingLogMetadata("block number"))?;
		let Some(amount) = exact_amount(value, token.decimals(), &tx_hash, block_number) else {
			continue;
		};

		transfers.push(Transfer {
			tx_hash,
			log_index: log.log_index,
			from,
			to,
			amount,
			block_number,
			token: token.clone(),
			timestamp: None,
		});
	}
	Ok(transfers)
}

/// Whole-unit amount, or `None` (with a warning) when it is out of range.
fn exact_amount(
	raw: U256,
	decimals: u8,
	tx_hash: &TransactionHash,
	block: u64,
) -> Option<Decimal> {
	match raw_to_decimal(raw, decimals) {
		Ok(amount) => Some(amount),
		Err(e) => {
			tracing::warn!(
				tx_hash = %truncate_id(&tx_hash.to_hex()),
				block,
				error = %e,
				"Skipping transfer with unrepresentable amount"
			);
			None
		},
	}
}

fn decode_transfer(log: &RawLog) -> Result<(Address, Address, U256), ScanFailure> {
	let prim_log = PrimLog {
		address: log.address,
		data: LogData::new_unchecked(log.topics.clone(), log.data.clone().into()),
	};

	let event = TransferEvent::decode_log(&prim_log, true).map_err(|e| ScanFailure::Decode {
		block: log.block_number,
		reason: e.to_string(),
	})?;

	Ok((event.from, event.to, event.value))
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::B256;
	use std::str::FromStr;
	use watcher_chain::implementations::mock::MockChain;
	use watcher_types::{utils::address_topic, Block, ChainTransaction, TransactionHash};

	const ME: Address = Address::new([0x01; 20]);
	const PAYER: Address = Address::new([0x02; 20]);
	const USDT: Address = Address::new([0x11; 20]);

	fn usdt() -> TokenIdentity {
		TokenIdentity::erc20(USDT, 6, "USDT")
	}

	fn hash(n: u8) -> TransactionHash {
		TransactionHash(vec![n; 32])
	}

	fn transfer_log(to: Address, raw: u64, block: u64, tx: u8) -> RawLog {
		RawLog {
			address: USDT,
			topics: vec![
				TransferEvent::SIGNATURE_HASH,
				address_topic(PAYER),
				address_topic(to),
			],
			data: U256::from(raw).to_be_bytes::<32>().to_vec(),
			transaction_hash: Some(hash(tx)),
			block_number: Some(block),
			log_index: Some(3),
		}
	}

	fn native_tx(to: Option<Address>, wei: u128, tx: u8) -> ChainTransaction {
		ChainTransaction {
			hash: hash(tx),
			from: PAYER,
			to,
			value: U256::from(wei),
		}
	}

	#[tokio::test]
	async fn test_empty_range_makes_no_calls() {
		let chain = MockChain::new(100);

		let native = scan(&chain, &TokenIdentity::Native, ME, 10, 9).await.unwrap();
		let erc20 = scan(&chain, &usdt(), ME, 50, 20).await.unwrap();

		assert!(native.is_empty());
		assert!(erc20.is_empty());
		assert_eq!(chain.calls().total(), 0);
	}

	#[tokio::test]
	async fn test_native_scan_filters_recipient_and_value() {
		let chain = MockChain::new(20);
		chain
			.add_block(Block {
				number: 12,
				timestamp: Some(1_700_000_000),
				transactions: vec![
					native_tx(Some(ME), 1_500_000_000_000_000_000, 1),
					native_tx(Some(PAYER), 1_000_000_000_000_000_000, 2),
					native_tx(Some(ME), 0, 3),
					native_tx(None, 5, 4),
				],
			})
			.await;

		let transfers = scan(&chain, &TokenIdentity::Native, ME, 10, 14).await.unwrap();

		assert_eq!(transfers.len(), 1);
		let transfer = &transfers[0];
		assert_eq!(transfer.to, ME);
		assert_eq!(transfer.amount, Decimal::from_str("1.5").unwrap());
		assert_eq!(transfer.block_number, 12);
		assert_eq!(transfer.timestamp, Some(1_700_000_000));
		assert_eq!(transfer.log_index, None);
		assert_eq!(chain.calls().blocks, 5);
	}

	#[tokio::test]
	async fn test_native_scan_fails_on_any_block() {
		let chain = MockChain::new(20);
		chain
			.add_block(Block {
				number: 10,
				timestamp: None,
				transactions: vec![native_tx(Some(ME), 1, 1)],
			})
			.await;
		chain.fail_block(13).await;

		let err = scan(&chain, &TokenIdentity::Native, ME, 10, 15)
			.await
			.unwrap_err();
		assert!(matches!(err, ScanFailure::Block { block: 13, .. }));

		let err = scan(&chain, &TokenIdentity::Native, ME, 18, 25)
			.await
			.unwrap_err();
		assert!(matches!(err, ScanFailure::MissingBlock(21)));
	}

	#[tokio::test]
	async fn test_erc20_scan_uses_one_query() {
		let chain = MockChain::new(100);
		chain.add_log(transfer_log(ME, 99_500_000, 40, 1)).await;
		chain.add_log(transfer_log(ME, 0, 41, 2)).await;
		chain.add_log(transfer_log(PAYER, 5_000_000, 42, 3)).await;
		chain.add_log(transfer_log(ME, 1, 95, 4)).await;

		let transfers = scan(&chain, &usdt(), ME, 30, 90).await.unwrap();

		assert_eq!(transfers.len(), 1);
		assert_eq!(transfers[0].amount, Decimal::from_str("99.5").unwrap());
		assert_eq!(transfers[0].tx_hash, hash(1));
		assert_eq!(transfers[0].log_index, Some(3));
		assert_eq!(transfers[0].token, usdt());
		assert!(transfers.iter().all(|t| t.to == ME));
		assert_eq!(chain.calls().logs, 1);
		assert_eq!(chain.calls().blocks, 0);
	}

	#[tokio::test]
	async fn test_erc20_scan_exact_amounts() {
		let chain = MockChain::new(100);
		let dai = TokenIdentity::erc20(USDT, 18, "DAI");
		let mut log = transfer_log(ME, 0, 40, 1);
		log.data = U256::from(123_456_789_012_345_678_901u128)
			.to_be_bytes::<32>()
			.to_vec();
		chain.add_log(log).await;

		let transfers = scan(&chain, &dai, ME, 0, 100).await.unwrap();
		assert_eq!(
			transfers[0].amount,
			Decimal::from_str("123.456789012345678901").unwrap()
		);
	}

	#[tokio::test]
	async fn test_erc20_failures() {
		let chain = MockChain::new(100);
		chain.fail_logs(true).await;
		let err = scan(&chain, &usdt(), ME, 0, 100).await.unwrap_err();
		assert!(matches!(
			err,
			ScanFailure::Logs {
				from_block: 0,
				to_block: 100,
				..
			}
		));

		chain.heal().await;
		let mut malformed = transfer_log(ME, 10, 50, 1);
		malformed.topics[0] = B256::repeat_byte(0xee);
		chain.add_log(malformed).await;
		let err = scan(&chain, &usdt(), ME, 0, 100).await.unwrap_err();
		assert!(matches!(err, ScanFailure::Decode { block: Some(50), .. }));
	}

	#[tokio::test]
	async fn test_oversized_amount_is_skipped() {
		let chain = MockChain::new(100);
		let dai = TokenIdentity::erc20(USDT, 18, "DAI");
		// 1e11 tokens at 18 decimals is beyond the exact decimal range.
		let mut huge = transfer_log(ME, 0, 41, 1);
		huge.data = (U256::from(10u64).pow(U256::from(29u64)))
			.to_be_bytes::<32>()
			.to_vec();
		chain.add_log(huge).await;
		let mut one = transfer_log(ME, 0, 42, 2);
		one.data = U256::from(10u64).pow(U256::from(18u64)).to_be_bytes::<32>().to_vec();
		chain.add_log(one).await;

		let transfers = scan(&chain, &dai, ME, 0, 100).await.unwrap();

		assert_eq!(transfers.len(), 1);
		assert_eq!(transfers[0].tx_hash, hash(2));
		assert_eq!(transfers[0].amount, Decimal::ONE);
	}

	#[tokio::test]
	async fn test_oversized_native_amount_is_skipped() {
		let chain = MockChain::new(20);
		let mut whale = native_tx(Some(ME), 0, 1);
		whale.value = U256::MAX;
		chain
			.add_block(Block {
				number: 10,
				timestamp: None,
				transactions: vec![whale, native_tx(Some(ME), 2_000_000_000_000_000_000, 2)],
			})
			.await;

		let transfers = scan(&chain, &TokenIdentity::Native, ME, 10, 10).await.unwrap();

		assert_eq!(transfers.len(), 1);
		assert_eq!(transfers[0].amount, Decimal::from(2));
	}
}
