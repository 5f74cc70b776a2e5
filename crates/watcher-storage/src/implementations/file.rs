//! File-based storage backend.
//!
//! Each key is one file under `storage_path`. Files start with a fixed-size
//! header carrying an optional expiry so that settlement records can age out
//! while scan cursors and invoices stay until overwritten.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use watcher_types::{
	current_timestamp, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, StorageKey,
	ValidationError,
};

#[allow(clippy::doc_nested_refdefs)]
/// Fixed-size file header.
///
/// Binary layout (32 bytes total):
/// - [0-3]: Magic bytes "PWST"
/// - [4-5]: Version (u16, little-endian)
/// - [6-13]: Expiration timestamp (u64, little-endian, Unix seconds, 0 = never)
/// - [14-31]: Reserved
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileHeader {
	version: u16,
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"PWST";
	const VERSION: u16 = 1;
	const SIZE: usize = 32;

	fn new(ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0
		} else {
			current_timestamp().saturating_add(ttl.as_secs().max(1))
		};
		Self {
			version: Self::VERSION,
			expires_at,
		}
	}

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Unrecognized file format".into()));
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut expires_bytes = [0u8; 8];
		expires_bytes.copy_from_slice(&bytes[6..14]);

		Ok(Self {
			version,
			expires_at: u64::from_le_bytes(expires_bytes),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at != 0 && current_timestamp() >= self.expires_at
	}
}

/// Default TTL per namespace, from `ttl_<namespace>` settings.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	fn from_config(config: &toml::Value) -> Self {
		let ttls = StorageKey::all()
			.filter_map(|key| {
				config
					.get(format!("ttl_{}", key.as_str()))
					.and_then(|v| v.as_integer())
					.map(|secs| (key, Duration::from_secs(secs.max(0) as u64)))
			})
			.collect();
		Self { ttls }
	}

	fn for_key(&self, key: &str) -> Duration {
		key.split(':')
			.next()
			.and_then(|namespace| namespace.parse::<StorageKey>().ok())
			.and_then(|namespace| self.ttls.get(&namespace).copied())
			.unwrap_or(Duration::ZERO)
	}
}

/// File-based storage implementation.
pub struct FileStorage {
	base_path: PathBuf,
	ttl_config: TtlConfig,
}

impl FileStorage {
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
		}
	}

	/// Maps a key to a filesystem-safe path.
	fn file_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace(['/', '\\', ':'], "_");
		self.base_path.join(format!("{}.bin", safe_key))
	}

	async fn cleanup_expired_files(&self) -> Result<usize, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut removed = 0;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}

			let data = match fs::read(&path).await {
				Ok(data) => data,
				Err(e) => {
					tracing::debug!("Skipping file {:?}: could not be read: {}", path, e);
					continue;
				},
			};

			match FileHeader::deserialize(&data) {
				Ok(header) if header.is_expired() => match fs::remove_file(&path).await {
					Ok(()) => removed += 1,
					Err(e) => tracing::warn!("Failed to remove expired file {:?}: {}", path, e),
				},
				Ok(_) => {},
				Err(e) => tracing::debug!("Skipping file {:?}: {}", path, e),
			}
		}
		Ok(removed)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let data = match fs::read(self.file_path(key)).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(StorageError::NotFound)
			},
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			return Err(StorageError::NotFound);
		}
		Ok(data[FileHeader::SIZE..].to_vec())
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.file_path(key);

		fs::create_dir_all(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let header = FileHeader::new(ttl.unwrap_or_else(|| self.ttl_config.for_key(key)));

		let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
		file_data.extend_from_slice(&header.serialize());
		file_data.extend_from_slice(&value);

		// Write to a sibling temp file and rename so readers never see a torn value
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.file_path(key)).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		match self.get_bytes(key).await {
			Ok(_) => Ok(true),
			Err(StorageError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.cleanup_expired_files().await
	}
}

/// Configuration schema for FileStorage.
///
/// Accepts `storage_path` and one `ttl_<namespace>` integer per [`StorageKey`].
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let mut optional_fields = vec![Field::new("storage_path", FieldType::String)];
		for storage_key in StorageKey::all() {
			optional_fields.push(Field::new(
				format!("ttl_{}", storage_key.as_str()),
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			));
		}

		Schema::new(vec![], optional_fields).validate(config)
	}
}

/// Creates a file storage backend.
///
/// Configuration parameters:
/// - `storage_path`: base directory (default: "./data/storage")
/// - `ttl_scan_cursors`, `ttl_invoices`, `ttl_settlements`: TTL in seconds (default: 0, never)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(
		PathBuf::from(storage_path),
		TtlConfig::from_config(config),
	)))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
