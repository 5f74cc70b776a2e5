//! Schema validation for implementation-specific configuration.
//!
//! Chain clients and storage backends receive their settings as raw TOML tables.
//! Each implementation describes the table it expects with a [`Schema`] so that a
//! bad RPC URL or a negative timeout is reported when the watcher starts rather
//! than on the first scan cycle.

use alloy_primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

impl ValidationError {
	/// Prefixes the offending field name with its parent table.
	fn nested_in(self, parent: &str) -> Self {
		match self {
			Self::MissingField(f) => Self::MissingField(format!("{}.{}", parent, f)),
			Self::InvalidValue { field, message } => Self::InvalidValue {
				field: format!("{}.{}", parent, field),
				message,
			},
			Self::TypeMismatch {
				field,
				expected,
				actual,
			} => Self::TypeMismatch {
				field: format!("{}.{}", parent, field),
				expected,
				actual,
			},
			other => other,
		}
	}
}

/// Type of a configuration field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with optional inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	/// A 20-byte hex chain address, checksummed or not.
	Address,
	Array(Box<FieldType>),
	Table(Schema),
}

/// Custom check run after the type check passed.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field in a [`Schema`].
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom validator returning an error message on failure.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		validate_field_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of a TOML table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Validates a TOML table against this schema.
	///
	/// Required fields must be present; optional fields are only checked when
	/// present. Nested tables are validated recursively and report their errors
	/// with dotted field paths (`retry.max_attempts`).
	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| type_mismatch("root", "table", config))?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn type_mismatch(field: &str, expected: &str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn validate_field_type(
	field_name: &str,
	value: &toml::Value,
	expected_type: &FieldType,
) -> Result<(), ValidationError> {
	match expected_type {
		FieldType::String => {
			if !value.is_str() {
				return Err(type_mismatch(field_name, "string", value));
			}
		},
		FieldType::Integer { min, max } => {
			let int_val = value
				.as_integer()
				.ok_or_else(|| type_mismatch(field_name, "integer", value))?;

			if let Some(min_val) = min {
				if int_val < *min_val {
					return Err(ValidationError::InvalidValue {
						field: field_name.to_string(),
						message: format!("Value {} is less than minimum {}", int_val, min_val),
					});
				}
			}
			if let Some(max_val) = max {
				if int_val > *max_val {
					return Err(ValidationError::InvalidValue {
						field: field_name.to_string(),
						message: format!("Value {} is greater than maximum {}", int_val, max_val),
					});
				}
			}
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(type_mismatch(field_name, "boolean", value));
			}
		},
		FieldType::Address => {
			let raw = value
				.as_str()
				.ok_or_else(|| type_mismatch(field_name, "address string", value))?;
			raw.parse::<Address>()
				.map_err(|e| ValidationError::InvalidValue {
					field: field_name.to_string(),
					message: format!("'{}' is not a valid address: {}", raw, e),
				})?;
		},
		FieldType::Array(inner_type) => {
			let array = value
				.as_array()
				.ok_or_else(|| type_mismatch(field_name, "array", value))?;
			for (i, item) in array.iter().enumerate() {
				validate_field_type(&format!("{}[{}]", field_name, i), item, inner_type)?;
			}
		},
		FieldType::Table(schema) => {
			schema
				.validate(value)
				.map_err(|e| e.nested_in(field_name))?;
		},
	}

	Ok(())
}

/// Implemented by every pluggable implementation to validate its own TOML table.
#[async_trait]
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}
