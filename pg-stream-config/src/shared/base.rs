use thiserror::Error;

/// Errors returned by the `validate` methods of the configuration types.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("`stream.tables` must list at least one table")]
    EmptyTables,
    #[error("`stream.tables` contains an empty table name")]
    EmptyTableName,
    #[error("`stream.snapshot_memory_safety_factor` must be in (0, 1], got {0}")]
    InvalidMemorySafetyFactor(f64),
    #[error(
        "`stream.slot_name` `{0}` is invalid: only lowercase letters, digits and underscores are allowed"
    )]
    InvalidSlotName(String),
    #[error("`stream.slot_name` `{name}` exceeds {max} bytes once prefixed")]
    SlotNameTooLong { name: String, max: usize },
    #[error("`retry.{0}` is invalid: {1}")]
    InvalidRetry(&'static str, &'static str),
}
