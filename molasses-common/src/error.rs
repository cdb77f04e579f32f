//! Foundational error types shared across the molasses crates.

use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the daemon configuration.
///
/// Any of these at startup is fatal: the daemon refuses to start rather
/// than serve with partial configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("unable to read configuration: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be parsed.
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Errors raised while decoding a record from one of the internal pipes.
///
/// A decoding error never tears down the pipe; the reader discards the
/// offending record and resynchronises at the next `%` delimiter.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A required field was absent from the record.
    #[error("record is missing required field {0}")]
    MissingField(&'static str),

    /// A field line could not be parsed.
    #[error("malformed record field: {0}")]
    Malformed(String),

    /// The record's type tag is not one this daemon speaks.
    #[error("unknown record type {0:?}")]
    UnknownType(String),
}
