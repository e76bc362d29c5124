use serde::{Deserialize, Deserializer};

use crate::shared::ValidationError;

/// Default fraction of available memory a snapshot batch may use.
pub const DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR: f64 = 0.5;

/// Prefix prepended to the configured slot name to form the server-side slot.
pub const SLOT_NAME_PREFIX: &str = "rs_";

/// Maximum length of a Postgres replication slot name in bytes.
pub const MAX_SLOT_NAME_LENGTH: usize = 63;

/// What to replicate and how.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Schema holding [`StreamConfig::tables`].
    pub schema: String,
    /// Tables to replicate, unqualified.
    pub tables: Vec<String>,
    /// Emits the existing rows of every table before live changes when the slot is created.
    #[serde(default)]
    pub stream_snapshot: bool,
    /// Fraction in (0, 1] of available memory that a snapshot batch may take.
    #[serde(default = "default_snapshot_memory_safety_factor")]
    pub snapshot_memory_safety_factor: f64,
    /// Slot name without the `rs_` prefix. Generated when absent.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub slot_name: Option<String>,
}

fn default_snapshot_memory_safety_factor() -> f64 {
    DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|name| !name.trim().is_empty()))
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema.trim().is_empty() {
            return Err(ValidationError::EmptyField("stream.schema"));
        }

        if self.tables.is_empty() {
            return Err(ValidationError::EmptyTables);
        }
        if self.tables.iter().any(|table| table.trim().is_empty()) {
            return Err(ValidationError::EmptyTableName);
        }

        let factor = self.snapshot_memory_safety_factor;
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(ValidationError::InvalidMemorySafetyFactor(factor));
        }

        if let Some(slot_name) = &self.slot_name {
            validate_slot_name(slot_name)?;
        }

        Ok(())
    }
}

/// Checks that `name` forms a legal slot identifier once prefixed with [`SLOT_NAME_PREFIX`].
///
/// The only definition of a legal slot name; server-side naming relies on it too.
pub fn validate_slot_name(name: &str) -> Result<(), ValidationError> {
    let legal = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !legal {
        return Err(ValidationError::InvalidSlotName(name.to_owned()));
    }

    if SLOT_NAME_PREFIX.len() + name.len() > MAX_SLOT_NAME_LENGTH {
        return Err(ValidationError::SlotNameTooLong {
            name: name.to_owned(),
            max: MAX_SLOT_NAME_LENGTH,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_config() -> StreamConfig {
        serde_json::from_str(r#"{"schema": "public", "tables": ["orders"]}"#).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = stream_config();

        assert!(!config.stream_snapshot);
        assert_eq!(
            config.snapshot_memory_safety_factor,
            DEFAULT_SNAPSHOT_MEMORY_SAFETY_FACTOR
        );
        assert!(config.slot_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_slot_name_is_treated_as_absent() {
        let config: StreamConfig = serde_json::from_str(
            r#"{"schema": "public", "tables": ["orders"], "slot_name": ""}"#,
        )
        .unwrap();

        assert!(config.slot_name.is_none());
    }

    #[test]
    fn safety_factor_must_be_within_bounds() {
        for factor in [0.0, -0.5, 1.5, f64::NAN] {
            let mut config = stream_config();
            config.snapshot_memory_safety_factor = factor;

            assert!(matches!(
                config.validate(),
                Err(ValidationError::InvalidMemorySafetyFactor(_))
            ));
        }

        let mut config = stream_config();
        config.snapshot_memory_safety_factor = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tables_must_be_listed() {
        let mut config = stream_config();
        config.tables.clear();
        assert_eq!(config.validate(), Err(ValidationError::EmptyTables));

        config.tables.push(String::new());
        assert_eq!(config.validate(), Err(ValidationError::EmptyTableName));
    }

    #[test]
    fn slot_names_are_checked() {
        let mut config = stream_config();

        config.slot_name = Some("Orders-Slot".to_owned());
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidSlotName("Orders-Slot".to_owned()))
        );

        config.slot_name = Some("a".repeat(MAX_SLOT_NAME_LENGTH));
        assert!(matches!(
            config.validate(),
            Err(ValidationError::SlotNameTooLong { .. })
        ));

        config.slot_name = Some("orders_slot".to_owned());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn slot_name_rules_reject_empty_and_accept_longest_legal_name() {
        assert_eq!(
            validate_slot_name(""),
            Err(ValidationError::InvalidSlotName(String::new()))
        );

        let longest = "a".repeat(MAX_SLOT_NAME_LENGTH - SLOT_NAME_PREFIX.len());
        assert!(validate_slot_name(&longest).is_ok());
    }
}
