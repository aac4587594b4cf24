//! Instrumentation option strings.
//!
//! Option strings are comma-separated `name=value` lists attached to a task
//! (`procdump=1,bp0=4198400,auto=1`). They are kept as an ordered list of
//! typed tokens so each rewrite rule can be applied and tested on its own.

use crate::models::TaskId;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// A single `name=value` option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionToken {
    pub name: String,
    pub value: String,
}

impl OptionToken {
    /// Create a token from its parts.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse one `name=value` segment.
    ///
    /// Returns `None` for segments without `=` or with an empty name.
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, value) = raw.trim().split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }
}

impl fmt::Display for OptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// An ordered list of option tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionString {
    tokens: Vec<OptionToken>,
}

impl OptionString {
    /// Parse a comma-separated option string. Malformed segments are skipped.
    pub fn parse(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .filter(|segment| !segment.trim().is_empty())
            .filter_map(|segment| {
                let token = OptionToken::parse(segment);
                if token.is_none() {
                    debug!("Skipping malformed option token: {:?}", segment);
                }
                token
            })
            .collect();

        Self { tokens }
    }

    pub fn tokens(&self) -> &[OptionToken] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Value of the first token with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t.name == name)
    }

    /// Whether an identical token is already present.
    pub fn contains(&self, token: &OptionToken) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// Whether `name=value` is present.
    pub fn has_flag(&self, name: &str, value: &str) -> bool {
        self.tokens.iter().any(|t| t.name == name && t.value == value)
    }

    pub fn push(&mut self, token: OptionToken) {
        self.tokens.push(token);
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = OptionToken>) {
        self.tokens.extend(tokens);
    }

    /// Flip the first `name=1` to `name=0`. Returns true if a token changed.
    pub fn disable(&mut self, name: &str) -> bool {
        match self
            .tokens
            .iter_mut()
            .find(|t| t.name == name && t.value == "1")
        {
            Some(token) => {
                token.value = "0".to_string();
                true
            }
            None => false,
        }
    }

    /// Switch off process dumps, payload extraction and combo mode.
    ///
    /// Breakpoint-driven extraction must not run alongside them.
    pub fn disable_crude_extraction(&mut self) {
        for name in ["procdump", "extraction", "combo"] {
            self.disable(name);
        }
    }

    /// Append `name=value` unless some token with `name` already exists.
    pub fn ensure(&mut self, name: &str, value: &str) {
        if !self.contains_key(name) {
            self.push(OptionToken::new(name, value));
        }
    }

    /// Root task id carried by multi-generation chains.
    pub fn main_task_id(&self) -> Option<TaskId> {
        self.get("main_task_id")
            .and_then(|v| v.trim().parse::<TaskId>().ok())
    }
}

impl fmt::Display for OptionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", token)?;
        }
        Ok(())
    }
}

impl From<&str> for OptionString {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl Serialize for OptionString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Options arrive either as the raw string or as an already-split map.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawOptions {
    Text(String),
    Map(serde_json::Map<String, Value>),
    Null(()),
}

impl<'de> Deserialize<'de> for OptionString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOptions::deserialize(deserializer)
            .map_err(|_| de::Error::custom("options must be a string, a map, or null"))?;

        Ok(match raw {
            RawOptions::Text(text) => Self::parse(&text),
            RawOptions::Map(map) => Self {
                tokens: map
                    .into_iter()
                    .map(|(name, value)| {
                        let value = match value {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        OptionToken::new(name, value)
                    })
                    .collect(),
            },
            RawOptions::Null(()) => Self::default(),
        })
    }
}
