//! Input validation for task submission: tags, dimensions, and
//! command/environment size bounds. Malformed input is rejected with
//! `InvalidArgument` rather than sanitized — the core has no HTML
//! surface, so there's nothing to escape, only to reject.

use crate::constants::{
    MAX_DIMENSION_KEYS, MAX_DIMENSION_VALUES, MAX_TAGS, MAX_TAG_LENGTH,
};
use crate::error::SwarmError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

const MAX_COMMAND_LENGTH: usize = 256;
const MAX_COMMAND_ARGS: usize = 128;
const MAX_ENV_ENTRIES: usize = 64;
const MAX_KV_LENGTH: usize = 4096;

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_.\-]+:[a-zA-Z0-9_.\-]+$").unwrap())
}

fn dimension_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_.\-]{1,64}$").unwrap())
}

pub fn validate_tags(tags: &[String]) -> Result<(), SwarmError> {
    if tags.len() > MAX_TAGS {
        return Err(SwarmError::InvalidArgument(format!(
            "at most {MAX_TAGS} tags allowed, got {}",
            tags.len()
        )));
    }
    for tag in tags {
        if tag.len() > MAX_TAG_LENGTH {
            return Err(SwarmError::InvalidArgument(format!(
                "tag exceeds {MAX_TAG_LENGTH} characters: {tag}"
            )));
        }
        if !tag_regex().is_match(tag) {
            return Err(SwarmError::InvalidArgument(format!(
                "tag must match `key:value`: {tag}"
            )));
        }
    }
    Ok(())
}

pub fn validate_dimensions(
    dimensions: &BTreeMap<String, BTreeSet<String>>,
) -> Result<(), SwarmError> {
    if dimensions.len() > MAX_DIMENSION_KEYS {
        return Err(SwarmError::InvalidArgument(format!(
            "at most {MAX_DIMENSION_KEYS} dimension keys allowed"
        )));
    }
    if !dimensions.contains_key("pool") {
        return Err(SwarmError::InvalidArgument(
            "dimensions must include a `pool` key".to_string(),
        ));
    }
    for (key, values) in dimensions {
        if !dimension_key_regex().is_match(key) {
            return Err(SwarmError::InvalidArgument(format!(
                "invalid dimension key: {key}"
            )));
        }
        if values.is_empty() {
            return Err(SwarmError::InvalidArgument(format!(
                "dimension {key} has no values"
            )));
        }
        if values.len() > MAX_DIMENSION_VALUES {
            return Err(SwarmError::InvalidArgument(format!(
                "dimension {key} exceeds {MAX_DIMENSION_VALUES} values"
            )));
        }
        if key == "pool" && values.len() != 1 {
            return Err(SwarmError::InvalidArgument(
                "pool dimension must have exactly one value".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn validate_command(command: &[String]) -> Result<(), SwarmError> {
    if command.is_empty() {
        return Err(SwarmError::InvalidArgument(
            "command must not be empty".to_string(),
        ));
    }
    if command.len() > MAX_COMMAND_ARGS {
        return Err(SwarmError::InvalidArgument(format!(
            "command exceeds {MAX_COMMAND_ARGS} arguments"
        )));
    }
    if command.iter().any(|arg| arg.len() > MAX_COMMAND_LENGTH) {
        return Err(SwarmError::InvalidArgument(format!(
            "command argument exceeds {MAX_COMMAND_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn validate_env(env: &BTreeMap<String, String>) -> Result<(), SwarmError> {
    if env.len() > MAX_ENV_ENTRIES {
        return Err(SwarmError::InvalidArgument(format!(
            "environment exceeds {MAX_ENV_ENTRIES} entries"
        )));
    }
    for (k, v) in env {
        if k.len() > MAX_KV_LENGTH || v.len() > MAX_KV_LENGTH {
            return Err(SwarmError::InvalidArgument(
                "environment entry exceeds maximum length".to_string(),
            ));
        }
    }
    Ok(())
}
