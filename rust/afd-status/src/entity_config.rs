//! Reading the colon-separated entity configuration files (HOST_CONFIG,
//! MON_CONFIG, DIR_CONFIG).
//!
//! One entity per line, fields separated by `:`, `#` starts a comment line,
//! blank lines are ignored.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{Op, Result, StatusError};
use crate::record::MAX_ALIAS_LENGTH;

/// Parse every entity line of `text`.
///
/// `parse` turns the split fields of one line into a config value and
/// reports a reason on failure; `key` extracts the alias used to reject
/// duplicates.
pub(crate) fn parse_entities<C>(
    file: &Path,
    text: &str,
    parse: impl Fn(&[&str]) -> Result<C, String>,
    key: impl Fn(&C) -> &str,
) -> Result<Vec<C>> {
    let mut entities = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(':').map(str::trim).collect();
        let invalid = |reason: String| StatusError::InvalidConfig {
            file: file.to_path_buf(),
            line: idx + 1,
            reason,
        };

        let entity = parse(&fields).map_err(invalid)?;
        let alias = key(&entity);
        check_alias(alias).map_err(invalid)?;
        if !seen.insert(alias.to_owned()) {
            return Err(invalid(format!("duplicate alias `{alias}`")));
        }
        entities.push(entity);
    }

    Ok(entities)
}

/// Read and parse an entity configuration file.
pub(crate) fn load_entities<C>(
    path: &Path,
    parse: impl Fn(&[&str]) -> Result<C, String>,
    key: impl Fn(&C) -> &str,
) -> Result<Vec<C>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StatusError::io(Op::ReadConfig, path, e))?;
    parse_entities(path, &text, parse, key)
}

pub(crate) fn check_alias(alias: &str) -> Result<(), String> {
    if alias.is_empty() {
        return Err("empty alias".into());
    }
    if alias.len() >= MAX_ALIAS_LENGTH {
        return Err(format!(
            "alias `{alias}` is longer than {} bytes",
            MAX_ALIAS_LENGTH - 1
        ));
    }
    if alias.bytes().any(|b| b == 0 || b.is_ascii_whitespace()) {
        return Err(format!("alias `{alias}` contains whitespace or NUL"));
    }
    Ok(())
}

/// Parse field `idx` as a number, or use `default` when the field is absent
/// or empty.
pub(crate) fn field_or<T: std::str::FromStr>(
    fields: &[&str],
    idx: usize,
    name: &str,
    default: T,
) -> Result<T, String> {
    match fields.get(idx) {
        None | Some(&"") => Ok(default),
        Some(v) => v.parse().map_err(|_| format!("invalid {name} `{v}`")),
    }
}
