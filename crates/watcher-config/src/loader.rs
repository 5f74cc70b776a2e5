//! Multi-file configuration.
//!
//! A file may name other files under `include`, either as one string or as an
//! array. Included files may include further files; paths are relative to the
//! directory given to [`ConfigLoader::new`]. A top-level section may appear in
//! one file only, except `accounts`, whose entries are appended in include
//! order so that each merchant can live in its own file.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const INCLUDE_KEY: &str = "include";
const ACCOUNTS_KEY: &str = "accounts";

pub struct ConfigLoader {
	root: PathBuf,
	visited: HashSet<PathBuf>,
	/// File that first defined each top-level section.
	origins: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub fn new(root: impl AsRef<Path>) -> Self {
		Self {
			root: root.as_ref().to_path_buf(),
			visited: HashSet::new(),
			origins: HashMap::new(),
		}
	}

	/// Reads `entry` and everything it includes into one validated [`Config`].
	pub async fn load_config(&mut self, entry: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let mut merged = toml::Table::new();
		let mut pending = vec![self.locate(entry.as_ref())?];

		// Depth-first over the include graph, preserving declaration order.
		while let Some(path) = pending.pop() {
			let mut document = self.read_document(&path).await?;
			let includes = take_includes(&mut document, &path)?;
			self.merge(&mut merged, document, &path)?;

			for include in includes.iter().rev() {
				pending.push(self.locate(include)?);
			}
		}

		let rendered = toml::to_string(&toml::Value::Table(merged))
			.map_err(|e| ConfigError::Parse(format!("Cannot render merged configuration: {}", e)))?;
		rendered.parse()
	}

	async fn read_document(&mut self, path: &Path) -> Result<toml::Table, ConfigError> {
		let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				e.kind(),
				format!("Cannot resolve {}: {}", path.display(), e),
			))
		})?;
		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Include cycle: {} is already loaded",
				canonical.display()
			)));
		}

		let raw = tokio::fs::read_to_string(&canonical).await?;
		Ok(toml::from_str(&resolve_env_vars(&raw)?)?)
	}

	fn merge(
		&mut self,
		merged: &mut toml::Table,
		document: toml::Table,
		path: &Path,
	) -> Result<(), ConfigError> {
		for (section, value) in document {
			if section == ACCOUNTS_KEY {
				append_accounts(merged, value, path)?;
				continue;
			}
			if let Some(first) = self.origins.get(&section) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' in {} (already defined in {})",
					section,
					path.display(),
					first.display()
				)));
			}
			self.origins.insert(section.clone(), path.to_path_buf());
			merged.insert(section, value);
		}
		Ok(())
	}

	fn locate(&self, path: &Path) -> Result<PathBuf, ConfigError> {
		let candidate = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.root.join(path)
		};
		if candidate.is_file() {
			Ok(candidate)
		} else {
			Err(ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}", candidate.display()),
			)))
		}
	}
}

fn take_includes(document: &mut toml::Table, path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
	let invalid = || {
		ConfigError::Validation(format!(
			"'{}' in {} must be a path or a list of paths",
			INCLUDE_KEY,
			path.display()
		))
	};

	match document.remove(INCLUDE_KEY) {
		None => Ok(Vec::new()),
		Some(toml::Value::String(single)) => Ok(vec![PathBuf::from(single)]),
		Some(toml::Value::Array(items)) => items
			.into_iter()
			.map(|item| match item {
				toml::Value::String(p) => Ok(PathBuf::from(p)),
				_ => Err(invalid()),
			})
			.collect(),
		Some(_) => Err(invalid()),
	}
}

fn append_accounts(
	merged: &mut toml::Table,
	value: toml::Value,
	path: &Path,
) -> Result<(), ConfigError> {
	let toml::Value::Array(entries) = value else {
		return Err(ConfigError::Validation(format!(
			"'{}' in {} must be an array of tables",
			ACCOUNTS_KEY,
			path.display()
		)));
	};

	match merged
		.entry(ACCOUNTS_KEY)
		.or_insert_with(|| toml::Value::Array(Vec::new()))
	{
		toml::Value::Array(existing) => {
			existing.extend(entries);
			Ok(())
		},
		_ => Err(ConfigError::Validation(format!(
			"'{}' must be an array of tables",
			ACCOUNTS_KEY
		))),
	}
}
