//! Environment variable helpers
//!
//! Values are parsed strictly: a variable that is set but unparsable is an
//! error, never a silent fallback to the default. Empty values count as unset.

use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};

/// Read a variable, treating empty strings as unset
pub fn var_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a required variable
pub fn var_required(key: &str) -> ConfigResult<String> {
    var_opt(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

/// Parse a variable, returning `default` when it is unset
pub fn var_or<T>(key: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// Parse an optional variable
pub fn var_parsed<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var_opt(key)
        .map(|raw| {
            raw.parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string()))
        })
        .transpose()
}

/// Split a comma-separated variable into trimmed, non-empty items
pub fn var_list(key: &str) -> Vec<String> {
    var_opt(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
