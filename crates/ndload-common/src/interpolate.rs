//! Environment variable interpolation for connection strings
//!
//! Supports `${VAR}` and `${VAR:-default}`. Text without placeholders is
//! returned unchanged.

use crate::error::{NdloadError, Result};
use regex::{Captures, Regex};
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("valid placeholder regex")
    })
}

/// Substitute placeholders using the process environment
pub fn interpolate_env(input: &str) -> Result<String> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Substitute placeholders using the given lookup
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Option<String> = None;

    let output = placeholder().replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            },
        }
    });

    match missing {
        Some(name) => Err(NdloadError::MissingVariable(name)),
        None => Ok(output.into_owned()),
    }
}
