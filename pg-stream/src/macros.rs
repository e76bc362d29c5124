//! Shorthands for failing with a [`crate::error::CdcError`].
//!
//! Call sites pass an [`crate::error::ErrorKind`], a static description and, optionally, a detail
//! and the underlying error:
//!
//! ```ignore
//! bail!(ErrorKind::SourceConnectionFailed, "Replication stream ended unexpectedly");
//! cdc_error!(ErrorKind::CheckpointWriteFailed, "Could not store checkpoint", key, source: err)
//! ```

/// Builds a [`crate::error::CdcError`].
///
/// The detail is anything implementing [`ToString`], usually the slot, key or LSN involved. The
/// error records the location of the macro call.
#[macro_export]
macro_rules! cdc_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::CdcError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::CdcError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::CdcError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::CdcError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Returns `Err(cdc_error!(..))` from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return ::core::result::Result::Err($crate::cdc_error!($($arg)+))
    };
}
