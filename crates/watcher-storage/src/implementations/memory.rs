//! In-memory storage backend.
//!
//! Nothing survives a restart, so scan cursors start over and the watcher falls
//! back to its lookback window. Entries may carry a TTL, enforced on read and
//! by `cleanup_expired`.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use watcher_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};

struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|at| now >= at)
	}
}

/// In-memory storage implementation.
pub struct MemoryStorage {
	store: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		match store.get(key) {
			Some(entry) if !entry.is_expired(Instant::now()) => Ok(entry.value.clone()),
			_ => Err(StorageError::NotFound),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let expires_at = ttl
			.filter(|ttl| !ttl.is_zero())
			.map(|ttl| Instant::now() + ttl);
		let mut store = self.store.write().await;
		store.insert(key.to_string(), Entry { value, expires_at });
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let store = self.store.read().await;
		Ok(store
			.get(key)
			.is_some_and(|entry| !entry.is_expired(Instant::now())))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let now = Instant::now();
		let mut store = self.store.write().await;
		let before = store.len();
		store.retain(|_, entry| !entry.is_expired(now));
		Ok(before - store.len())
	}
}

/// Configuration schema for MemoryStorage; no settings.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let key = "scan_cursors:store-1";
		let value = b"1200".to_vec();
		storage.set_bytes(key, value.clone(), None).await.unwrap();

		assert_eq!(storage.get_bytes(key).await.unwrap(), value);
		assert!(storage.exists(key).await.unwrap());

		storage.delete(key).await.unwrap();
		assert!(!storage.exists(key).await.unwrap());
		assert!(matches!(
			storage.get_bytes(key).await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_overwrite() {
		let storage = MemoryStorage::new();
		let key = "invoices:store-1";

		storage.set_bytes(key, b"v1".to_vec(), None).await.unwrap();
		storage.set_bytes(key, b"v2".to_vec(), None).await.unwrap();
		assert_eq!(storage.get_bytes(key).await.unwrap(), b"v2".to_vec());
	}

	#[tokio::test]
	async fn test_ttl_expiry_and_cleanup() {
		let storage = MemoryStorage::new();

		storage
			.set_bytes("settlements:a", b"x".to_vec(), Some(Duration::from_millis(10)))
			.await
			.unwrap();
		storage
			.set_bytes("settlements:b", b"y".to_vec(), None)
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(30)).await;

		assert!(!storage.exists("settlements:a").await.unwrap());
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
		assert!(storage.exists("settlements:b").await.unwrap());
	}

	#[test]
	fn test_factory_rejects_non_table() {
		assert!(create_storage(&toml::Value::String("memory".into())).is_err());
	}
}
