use log::{debug, info, warn};

use super::{EngineError, RuleEngine, RuleUpdate, UnsupportedRegexReason};
use crate::types::{Rule, RULE_ID};
use crate::validator::Pattern;

/// Installs and removes the controller's single blocking rule.
pub struct RuleAdapter<E> {
    engine: E,
}

impl<E: RuleEngine> RuleAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Install the blocking rule for `pattern`, replacing any previous one.
    pub async fn install(&self, pattern: &Pattern) -> Result<(), EngineError> {
        match self.engine.is_regex_supported(pattern.as_str()).await {
            Ok(support) if !support.is_supported => {
                let reason = match support.reason {
                    Some(UnsupportedRegexReason::MemoryLimitExceeded) => "memory limit exceeded",
                    Some(UnsupportedRegexReason::SyntaxError) | None => "syntax not supported",
                };
                return Err(EngineError::PatternRejected(reason.to_string()));
            }
            Ok(_) => {}
            Err(e) => warn!("Regex support check failed, installing anyway: {e}"),
        }

        let rule = Rule::blocking(pattern.as_str());
        debug!("Installing rule: {rule:?}");

        self.engine
            .update_dynamic_rules(RuleUpdate {
                add_rules: vec![rule],
                remove_rule_ids: vec![RULE_ID],
            })
            .await?;

        info!("Blocking requests matching {}", pattern.as_str());
        Ok(())
    }

    /// Remove the blocking rule. Removing an absent rule is not an error.
    pub async fn remove(&self) -> Result<(), EngineError> {
        self.engine
            .update_dynamic_rules(RuleUpdate {
                add_rules: Vec::new(),
                remove_rule_ids: vec![RULE_ID],
            })
            .await?;

        info!("Blocking rule {RULE_ID} removed");
        Ok(())
    }

    /// The blocking rule as the engine currently holds it.
    pub async fn installed_rule(&self) -> Result<Option<Rule>, EngineError> {
        let rules = self.engine.dynamic_rules().await?;
        Ok(rules.into_iter().find(|rule| rule.id == RULE_ID))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::validator::check;

    #[tokio::test]
    async fn test_install_replaces_previous_rule() {
        let (engine, _matches) = LocalEngine::new();
        let adapter = RuleAdapter::new(engine);

        adapter.install(&check("first").unwrap()).await.unwrap();
        adapter.install(&check("second").unwrap()).await.unwrap();

        let rules = adapter.engine().dynamic_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].condition.regex_filter, "second");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (engine, _matches) = LocalEngine::new();
        let adapter = RuleAdapter::new(engine);

        adapter.remove().await.unwrap();
        adapter.install(&check("ads").unwrap()).await.unwrap();
        adapter.remove().await.unwrap();
        adapter.remove().await.unwrap();

        assert_eq!(adapter.installed_rule().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_rejects_unsupported_regex() {
        let (engine, _matches) = LocalEngine::new();
        let adapter = RuleAdapter::new(engine);

        let pattern = check(r"api(?=\.example)").unwrap();
        let err = adapter.install(&pattern).await.unwrap_err();
        assert!(matches!(err, EngineError::PatternRejected(_)));
        assert_eq!(adapter.installed_rule().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_failure_keeps_prior_rule() {
        let (engine, _matches) = LocalEngine::new();
        let adapter = RuleAdapter::new(engine);

        adapter.install(&check("first").unwrap()).await.unwrap();
        adapter.engine().reject_next_updates(1);

        let err = adapter.install(&check("second").unwrap()).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let rule = adapter.installed_rule().await.unwrap().unwrap();
        assert_eq!(rule.condition.regex_filter, "first");
    }
}
