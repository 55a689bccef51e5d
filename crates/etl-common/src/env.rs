//! Typed environment variable lookups.
//!
//! A missing variable falls back to the supplied default; a variable that is
//! present but unparsable is an error rather than being silently ignored.

use std::str::FromStr;

use crate::error::{EtlError, Result};

/// Read `key` and parse it, or return `default` when unset.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Read `key` and parse it if present.
pub fn parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

/// Read a string variable with a default.
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| EtlError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_default_when_unset() {
        let value: u64 = parse_or("ETL_COMMON_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_value_trims_and_rejects() {
        assert_eq!(parse_value::<u32>("K", " 7 ").unwrap(), 7);
        let err = parse_value::<u32>("K", "seven").unwrap_err();
        assert!(matches!(err, EtlError::InvalidEnv { .. }));
    }
}
