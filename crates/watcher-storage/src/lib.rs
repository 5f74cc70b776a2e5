//! Storage module for the payment watcher.
//!
//! Persists the small amount of state the watcher owns or hosts on behalf of
//! its reference collaborators: per-account scan cursors, open invoices and
//! settlement records. Backends are pluggable; values are stored as JSON under
//! `namespace:id` keys.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use watcher_types::{ConfigSchema, ImplementationRegistry, StorageKey};

pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level byte store implemented by every backend.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes; `None` lets the backend apply its configured TTL.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries and returns how many were dropped.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Returns `(name, factory)` pairs for every built-in backend.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Typed access to a storage backend.
///
/// Values are addressed by a [`StorageKey`] namespace plus an id and are
/// serialized as JSON.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: StorageKey, id: &str) -> String {
		format!("{}:{}", namespace.as_str(), id)
	}

	/// Stores a value, overwriting any previous one.
	pub async fn store<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, None).await
	}

	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.set_bytes(&Self::key(namespace, id), bytes, ttl)
			.await
	}

	/// Retrieves a value; a missing key is [`StorageError::NotFound`].
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: StorageKey,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&Self::key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Retrieves a value, mapping a missing key to `None`.
	pub async fn retrieve_optional<T: DeserializeOwned>(
		&self,
		namespace: StorageKey,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.retrieve(namespace, id).await {
			Ok(value) => Ok(Some(value)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub async fn remove(&self, namespace: StorageKey, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&Self::key(namespace, id)).await
	}

	pub async fn exists(&self, namespace: StorageKey, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&Self::key(namespace, id)).await
	}

	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Cursor {
		height: u64,
	}

	#[tokio::test]
	async fn test_typed_roundtrip_and_missing() {
		let storage = StorageService::new(Box::new(MemoryStorage::new()));

		storage
			.store(StorageKey::ScanCursors, "store-1", &Cursor { height: 42 })
			.await
			.unwrap();

		let cursor: Cursor = storage
			.retrieve(StorageKey::ScanCursors, "store-1")
			.await
			.unwrap();
		assert_eq!(cursor, Cursor { height: 42 });

		let missing: Option<Cursor> = storage
			.retrieve_optional(StorageKey::ScanCursors, "store-2")
			.await
			.unwrap();
		assert!(missing.is_none());

		// Namespaces do not collide
		assert!(!storage
			.exists(StorageKey::Invoices, "store-1")
			.await
			.unwrap());
	}

	#[tokio::test]
	async fn test_wrong_shape_is_serialization_error() {
		let storage = StorageService::new(Box::new(MemoryStorage::new()));
		storage
			.store(StorageKey::Invoices, "store-1", &"not a cursor")
			.await
			.unwrap();

		let result: Result<Cursor, _> = storage.retrieve(StorageKey::Invoices, "store-1").await;
		assert!(matches!(result, Err(StorageError::Serialization(_))));
	}

	#[test]
	fn test_all_implementations_registered() {
		let names: Vec<_> = get_all_implementations()
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		assert_eq!(names, vec!["file", "memory"]);
	}
}
