//! In-process rule engine
//!
//! Mirrors the behaviour of a browser's dynamic rule set closely enough to
//! run the controller outside a browser: RE2-style regex dialect (no
//! lookaround, no backreferences), case-insensitive URL matching, atomic
//! updates and match notifications on a channel.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use regex::{Regex, RegexBuilder};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{EngineError, RegexSupport, RuleEngine, RuleUpdate, UnsupportedRegexReason};
use crate::types::{ResourceMask, ResourceType, Rule, RuleAction, RuleMatch};

/// Compiled program size allowed per regex rule.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Maximum number of regex rules in the dynamic rule set.
pub const MAX_REGEX_RULES: usize = 1000;

struct CompiledRule {
    rule: Rule,
    regex: Regex,
    types: ResourceMask,
}

#[derive(Default)]
struct Inner {
    /// Sorted by descending priority, insertion order within a priority.
    rules: Vec<CompiledRule>,
    reject_updates: u32,
}

/// Result of evaluating a request against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub blocked: bool,
    pub rule_id: Option<u32>,
}

/// Rule engine evaluated in-process.
pub struct LocalEngine {
    inner: Mutex<Inner>,
    matches: UnboundedSender<RuleMatch>,
}

impl LocalEngine {
    /// Create an engine and the receiving end of its match notifications.
    pub fn new() -> (Self, UnboundedReceiver<RuleMatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Mutex::new(Inner::default()),
            matches: tx,
        };
        (engine, rx)
    }

    /// Make the next `count` rule updates fail with [`EngineError::Rejected`].
    pub fn reject_next_updates(&self, count: u32) {
        self.lock().reject_updates = count;
    }

    /// Evaluate a request and publish a match notification if a rule hits.
    pub fn evaluate(&self, url: &str, request_type: ResourceType) -> RequestOutcome {
        let mask = request_type.mask();
        let inner = self.lock();

        let Some(hit) = inner
            .rules
            .iter()
            .find(|compiled| compiled.types.intersects(mask) && compiled.regex.is_match(url))
        else {
            return RequestOutcome { blocked: false, rule_id: None };
        };

        let event = RuleMatch {
            rule_id: hit.rule.id,
            url: url.to_string(),
            request_type,
        };
        if self.matches.send(event).is_err() {
            debug!("No match subscriber; dropping notification for rule {}", hit.rule.id);
        }

        RequestOutcome {
            blocked: hit.rule.action.kind == RuleAction::Block,
            rule_id: Some(hit.rule.id),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

fn compile_rule(rule: Rule) -> Result<CompiledRule, EngineError> {
    let case_sensitive = rule.condition.is_url_filter_case_sensitive.unwrap_or(false);
    let regex = RegexBuilder::new(&rule.condition.regex_filter)
        .case_insensitive(!case_sensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| {
            EngineError::PatternRejected(format!(
                "rule {} has an unsupported regexFilter: {}",
                rule.id, e
            ))
        })?;
    let types = rule.type_mask();
    Ok(CompiledRule { rule, regex, types })
}

#[async_trait(?Send)]
impl RuleEngine for LocalEngine {
    async fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<(), EngineError> {
        let mut inner = self.lock();

        if inner.reject_updates > 0 {
            inner.reject_updates -= 1;
            return Err(EngineError::Rejected("update refused by engine".to_string()));
        }

        let mut rules: Vec<Rule> = inner
            .rules
            .iter()
            .filter(|compiled| !update.remove_rule_ids.contains(&compiled.rule.id))
            .map(|compiled| compiled.rule.clone())
            .collect();

        for rule in update.add_rules {
            if rules.iter().any(|existing| existing.id == rule.id) {
                return Err(EngineError::Rejected(format!(
                    "Rule with id {} does not have a unique ID",
                    rule.id
                )));
            }
            rules.push(rule);
        }

        if rules.len() > MAX_REGEX_RULES {
            return Err(EngineError::Rejected(format!(
                "Dynamic rule count exceeds the limit of {MAX_REGEX_RULES}"
            )));
        }

        let mut compiled = rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        debug!("Dynamic rule set now has {} rule(s)", compiled.len());
        inner.rules = compiled;
        Ok(())
    }

    async fn is_regex_supported(&self, pattern: &str) -> Result<RegexSupport, EngineError> {
        Ok(match compile(pattern) {
            Ok(_) => RegexSupport::supported(),
            Err(regex::Error::CompiledTooBig(_)) => {
                RegexSupport::unsupported(UnsupportedRegexReason::MemoryLimitExceeded)
            }
            Err(_) => RegexSupport::unsupported(UnsupportedRegexReason::SyntaxError),
        })
    }

    async fn dynamic_rules(&self) -> Result<Vec<Rule>, EngineError> {
        Ok(self.lock().rules.iter().map(|compiled| compiled.rule.clone()).collect())
    }
}
