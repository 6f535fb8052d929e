//! Serialization token registry.
//!
//! Persisted intermediate taps may encode type names compactly as numeric
//! tokens. The mapping is supplied explicitly at startup, either as a list
//! of registrations in [`FlowConfig`](super::FlowConfig) or through the
//! `pipeflow.serialization.tokens` property (`"token=type,..."`), and is
//! read-only once built.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tokens below this value are reserved for built-in types.
pub const RESERVED_TOKEN_LIMIT: u32 = 128;

/// Property key holding additional registrations.
pub const TOKENS_PROPERTY: &str = "pipeflow.serialization.tokens";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRegistration {
    pub token: u32,
    pub type_name: String,
}

impl TokenRegistration {
    pub fn new(token: u32, type_name: impl Into<String>) -> Self {
        Self {
            token,
            type_name: type_name.into(),
        }
    }
}

/// Immutable two-way mapping between tokens and type names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializationTokens {
    by_token: BTreeMap<u32, String>,
    by_name: BTreeMap<String, u32>,
}

impl SerializationTokens {
    /// Build from explicit registrations plus an optional property string.
    pub fn build(registrations: &[TokenRegistration], property: Option<&str>) -> Result<Self, ConfigError> {
        let mut tokens = Self::default();
        let parsed = match property {
            Some(value) => Self::parse_property(value)?,
            None => Vec::new(),
        };
        for registration in registrations.iter().chain(&parsed) {
            tokens.register(registration)?;
        }
        Ok(tokens)
    }

    /// Parse `"token=type,token=type"`. Blank entries are skipped.
    pub fn parse_property(value: &str) -> Result<Vec<TokenRegistration>, ConfigError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (token, type_name) = entry
                    .split_once('=')
                    .ok_or_else(|| ConfigError::InvalidToken(format!("expected token=type, found '{}'", entry)))?;
                let token = token
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| ConfigError::InvalidToken(format!("bad token in '{}': {}", entry, e)))?;
                let type_name = type_name.trim();
                if type_name.is_empty() {
                    return Err(ConfigError::InvalidToken(format!("missing type name in '{}'", entry)));
                }
                Ok(TokenRegistration::new(token, type_name))
            })
            .collect()
    }

    fn register(&mut self, registration: &TokenRegistration) -> Result<(), ConfigError> {
        let TokenRegistration { token, type_name } = registration;
        if *token < RESERVED_TOKEN_LIMIT {
            return Err(ConfigError::InvalidToken(format!(
                "token {} for {} is reserved, use {} or above",
                token, type_name, RESERVED_TOKEN_LIMIT
            )));
        }
        if let Some(existing) = self.by_token.get(token) {
            return Err(ConfigError::InvalidToken(format!(
                "token {} registered for both {} and {}",
                token, existing, type_name
            )));
        }
        if let Some(existing) = self.by_name.get(type_name) {
            return Err(ConfigError::InvalidToken(format!(
                "type {} registered under both {} and {}",
                type_name, existing, token
            )));
        }
        self.by_token.insert(*token, type_name.clone());
        self.by_name.insert(type_name.clone(), *token);
        Ok(())
    }

    pub fn type_for(&self, token: u32) -> Option<&str> {
        self.by_token.get(&token).map(String::as_str)
    }

    pub fn token_for(&self, type_name: &str) -> Option<u32> {
        self.by_name.get(type_name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.by_token.iter().map(|(t, n)| (*t, n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_list_and_property() {
        let tokens = SerializationTokens::build(
            &[TokenRegistration::new(200, "demo.Point")],
            Some("201 = demo.Line, ,202=demo.Shape"),
        )
        .unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens.type_for(201), Some("demo.Line"));
        assert_eq!(tokens.token_for("demo.Shape"), Some(202));
        assert_eq!(tokens.iter().next(), Some((200, "demo.Point")));
    }

    #[test]
    fn test_reserved_token_rejected() {
        let err = SerializationTokens::build(&[TokenRegistration::new(5, "x")], None).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(SerializationTokens::build(&[], Some("130=a,130=b")).is_err());
        assert!(SerializationTokens::build(&[], Some("130=a,131=a")).is_err());
    }

    #[test]
    fn test_malformed_property() {
        assert!(SerializationTokens::parse_property("abc").is_err());
        assert!(SerializationTokens::parse_property("x=y").is_err());
        assert!(SerializationTokens::parse_property("140=").is_err());
        assert!(SerializationTokens::parse_property("").unwrap().is_empty());
    }
}
