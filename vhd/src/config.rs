// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use remain::sorted;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("Invalid value {1:?} for {0}")]
    InvalidValue(String, String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_BITMAP_CACHE_SIZE: usize = 64;

pub fn default_bitmap_cache_size() -> usize {
    DEFAULT_BITMAP_CACHE_SIZE
}

/// What to do with a write hitting a block that has no storage yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Allocate the block for any write.
    #[default]
    Always,
    /// Only allocate for writes covering the whole block. Partial writes are
    /// refused so the caller can merge them into a full block first.
    FullBlockOnly,
}

impl FromStr for AllocationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(AllocationMode::Always),
            "full_block" | "full_block_only" => Ok(AllocationMode::FullBlockOnly),
            _ => Err(ConfigError::InvalidValue(
                "allocation".to_owned(),
                s.to_owned(),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_bitmap_cache_size")]
    pub bitmap_cache_size: usize,
    #[serde(default)]
    pub allocation: AllocationMode,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            readonly: false,
            bitmap_cache_size: DEFAULT_BITMAP_CACHE_SIZE,
            allocation: AllocationMode::default(),
        }
    }
}

fn parse_toggle(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "" | "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue(key.to_owned(), value.to_owned())),
    }
}

impl ImageConfig {
    pub const SYNTAX: &'static str = "Image parameters \
         \"readonly=on|off,bitmap_cache_size=<number_of_blocks>,\
         allocation=always|full_block\"";

    pub fn parse(options: &str) -> Result<Self> {
        let mut config = ImageConfig::default();

        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (option, ""),
            };
            if key.is_empty() {
                return Err(ConfigError::InvalidSyntax(options.to_owned()));
            }

            match key {
                "readonly" => config.readonly = parse_toggle(key, value)?,
                "bitmap_cache_size" => {
                    config.bitmap_cache_size = value
                        .parse::<usize>()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| {
                            ConfigError::InvalidValue(key.to_owned(), value.to_owned())
                        })?;
                }
                "allocation" => config.allocation = value.parse()?,
                _ => return Err(ConfigError::UnknownOption(key.to_owned())),
            }
        }

        Ok(config)
    }
}

/// Parses a byte size with an optional K, M, G or T binary suffix.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidValue("size".to_owned(), s.to_owned());
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'K' | 'k')) => (&s[..i], 10),
        Some((i, 'M' | 'm')) => (&s[..i], 20),
        Some((i, 'G' | 'g')) => (&s[..i], 30),
        Some((i, 'T' | 't')) => (&s[..i], 40),
        Some(_) => (s, 0),
        None => return Err(invalid()),
    };
    let value = digits.parse::<u64>().map_err(|_| invalid())?;
    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_config() {
        assert_eq!(ImageConfig::parse("").unwrap(), ImageConfig::default());
        let config = ImageConfig::parse("readonly=on,bitmap_cache_size=8,allocation=full_block")
            .unwrap();
        assert!(config.readonly);
        assert_eq!(config.bitmap_cache_size, 8);
        assert_eq!(config.allocation, AllocationMode::FullBlockOnly);

        assert!(ImageConfig::parse("readonly").unwrap().readonly);
        assert!(!ImageConfig::parse("readonly=off").unwrap().readonly);
    }

    #[test]
    fn parse_image_config_errors() {
        assert_eq!(
            ImageConfig::parse("direct=on"),
            Err(ConfigError::UnknownOption("direct".to_owned()))
        );
        assert!(matches!(
            ImageConfig::parse("readonly=maybe"),
            Err(ConfigError::InvalidValue(_, _))
        ));
        assert!(matches!(
            ImageConfig::parse("bitmap_cache_size=0"),
            Err(ConfigError::InvalidValue(_, _))
        ));
        assert!(matches!(
            ImageConfig::parse("=on"),
            Err(ConfigError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: ImageConfig = serde_json::from_str(r#"{"readonly": true}"#).unwrap();
        assert!(config.readonly);
        assert_eq!(config.bitmap_cache_size, DEFAULT_BITMAP_CACHE_SIZE);
        assert_eq!(config.allocation, AllocationMode::Always);

        let config: ImageConfig =
            serde_json::from_str(r#"{"allocation": "full_block_only"}"#).unwrap();
        assert_eq!(config.allocation, AllocationMode::FullBlockOnly);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("2t").unwrap(), 2 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("99999999999999T").is_err());
    }
}
