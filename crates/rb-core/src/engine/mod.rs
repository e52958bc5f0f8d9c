//! Declarative rule engine integration
//!
//! - `RuleEngine`: the host's dynamic rule API
//! - `adapter`: installs and removes the controller's single blocking rule
//! - `local`: in-process engine backed by the `regex` crate

mod adapter;
mod local;

use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Rule;

pub use adapter::RuleAdapter;
pub use local::LocalEngine;

/// Error type for rule engine calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Rule engine rejected the pattern: {0}")]
    PatternRejected(String),
    #[error("Rule update rejected: {0}")]
    Rejected(String),
    #[error("Rule engine unavailable: {0}")]
    Unavailable(String),
}

/// A single atomic change to the dynamic rule set.
///
/// Removals are applied before additions, and either the whole update takes
/// effect or none of it does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_rule_ids: Vec<u32>,
}

/// Why the engine cannot use a regex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnsupportedRegexReason {
    SyntaxError,
    MemoryLimitExceeded,
}

/// Answer to [`RuleEngine::is_regex_supported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexSupport {
    pub is_supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnsupportedRegexReason>,
}

impl RegexSupport {
    pub fn supported() -> Self {
        Self { is_supported: true, reason: None }
    }

    pub fn unsupported(reason: UnsupportedRegexReason) -> Self {
        Self { is_supported: false, reason: Some(reason) }
    }
}

/// The host's declarative request-filtering engine.
#[async_trait(?Send)]
pub trait RuleEngine {
    /// Apply `update` atomically.
    async fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<(), EngineError>;

    /// Ask whether the engine's regex dialect accepts `pattern`.
    async fn is_regex_supported(&self, pattern: &str) -> Result<RegexSupport, EngineError>;

    /// Currently installed dynamic rules.
    async fn dynamic_rules(&self) -> Result<Vec<Rule>, EngineError>;
}

#[async_trait(?Send)]
impl<T: RuleEngine + ?Sized> RuleEngine for Arc<T> {
    async fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<(), EngineError> {
        (**self).update_dynamic_rules(update).await
    }

    async fn is_regex_supported(&self, pattern: &str) -> Result<RegexSupport, EngineError> {
        (**self).is_regex_supported(pattern).await
    }

    async fn dynamic_rules(&self) -> Result<Vec<Rule>, EngineError> {
        (**self).dynamic_rules().await
    }
}

#[async_trait(?Send)]
impl<T: RuleEngine + ?Sized> RuleEngine for Rc<T> {
    async fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<(), EngineError> {
        (**self).update_dynamic_rules(update).await
    }

    async fn is_regex_supported(&self, pattern: &str) -> Result<RegexSupport, EngineError> {
        (**self).is_regex_supported(pattern).await
    }

    async fn dynamic_rules(&self) -> Result<Vec<Rule>, EngineError> {
        (**self).dynamic_rules().await
    }
}
