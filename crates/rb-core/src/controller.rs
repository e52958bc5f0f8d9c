//! State controller
//!
//! Owns the blocking state and sequences every transition as
//! validate → engine → store. Engine and validation failures abort the
//! transition; store failures are logged and swallowed so the controller
//! keeps working with degraded storage.
//!
//! Each mutating command holds the state lock for its whole duration, so a
//! concurrent reader never observes an engine change without the matching
//! in-memory change. The blocked counter lives outside that lock: it is
//! bumped immediately and written back under its own lock.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::engine::{EngineError, RuleAdapter, RuleEngine};
use crate::store::{entry, Store, KEY_BLOCKED_COUNT, KEY_ENABLED, KEY_PATTERN};
use crate::types::{BlockingState, DEFAULT_PATTERN};
use crate::validator::{self, Pattern, ValidationError};

/// Controller behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Load, save and report the blocked request counter.
    pub track_stats: bool,
    /// Persist the enabled flag and re-enable the rule on startup.
    pub restore_enabled: bool,
    /// Pattern used until one is saved.
    pub default_pattern: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            track_stats: true,
            restore_enabled: true,
            default_pattern: DEFAULT_PATTERN.to_string(),
        }
    }
}

impl ControllerConfig {
    fn storage_keys(&self) -> Vec<&'static str> {
        let mut keys = vec![KEY_PATTERN];
        if self.restore_enabled {
            keys.push(KEY_ENABLED);
        }
        if self.track_stats {
            keys.push(KEY_BLOCKED_COUNT);
        }
        keys
    }
}

/// Error type for rejected commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Invalid regex: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct ControlState {
    enabled: bool,
    pattern: String,
    started: bool,
}

/// Background controller for the blocking rule.
pub struct Controller<E, S> {
    config: ControllerConfig,
    adapter: RuleAdapter<E>,
    store: S,
    state: Mutex<ControlState>,
    blocked: AtomicU64,
    /// Last counter value known to be saved; also serializes counter writes.
    persisted_count: Mutex<Option<u64>>,
}

impl<E: RuleEngine, S: Store> Controller<E, S> {
    pub fn new(engine: E, store: S, config: ControllerConfig) -> Self {
        let state = ControlState {
            enabled: false,
            pattern: config.default_pattern.clone(),
            started: false,
        };
        Self {
            config,
            adapter: RuleAdapter::new(engine),
            store,
            state: Mutex::new(state),
            blocked: AtomicU64::new(0),
            persisted_count: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &RuleAdapter<E> {
        &self.adapter
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rehydrate state from the store and reconcile the engine.
    ///
    /// The engine's copy of the rule is never trusted across restarts: a
    /// previously enabled rule is reinstalled through the full enable path,
    /// otherwise any leftover rule is removed. Only the first call has any
    /// effect.
    pub async fn startup(&self) {
        let mut state = self.state.lock().await;
        if state.started {
            warn!("Startup already ran; ignoring");
            return;
        }
        state.started = true;

        let stored = match self.store.load(&self.config.storage_keys()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to load saved state, using defaults: {e}");
                Map::new()
            }
        };

        match stored.get(KEY_PATTERN) {
            Some(Value::String(saved)) => match validator::check(saved) {
                Ok(_) => {
                    info!("Loaded saved pattern: {saved}");
                    state.pattern = saved.clone();
                }
                Err(e) => warn!("Ignoring saved pattern {saved:?}: {e}"),
            },
            Some(other) => warn!("Ignoring saved pattern of unexpected type: {other}"),
            None => info!("No saved pattern, using default: {}", state.pattern),
        }

        if self.config.track_stats {
            match stored.get(KEY_BLOCKED_COUNT).map(Value::as_u64) {
                Some(Some(count)) => {
                    // Matches observed before startup are kept on top.
                    let total = self.blocked.fetch_add(count, Ordering::SeqCst) + count;
                    *self.persisted_count.lock().await = Some(count);
                    info!("Loaded blocked count: {total}");
                }
                Some(None) => warn!("Ignoring saved blocked count of unexpected type"),
                None => {}
            }
        }

        let restore = self.config.restore_enabled
            && match stored.get(KEY_ENABLED) {
                Some(Value::Bool(enabled)) => *enabled,
                Some(other) => {
                    warn!("Ignoring saved enabled flag of unexpected type: {other}");
                    false
                }
                None => false,
            };

        if restore {
            info!("Re-enabling rule from previous session");
            if let Err(e) = self.enable_locked(&mut state).await {
                error!("Failed to restore rule on startup: {e}");
                state.enabled = false;
                self.persist(entry(KEY_ENABLED, false)).await;
            }
        } else if let Err(e) = self.adapter.remove().await {
            warn!("Failed to clear leftover rule on startup: {e}");
        }
    }

    /// Install the rule for the current pattern and mark blocking enabled.
    pub async fn enable(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.enable_locked(&mut state).await
    }

    /// Remove the rule and mark blocking disabled.
    ///
    /// If the engine refuses the removal the rule may still be active, so the
    /// state keeps reporting enabled and the error is returned.
    pub async fn disable(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if let Err(e) = self.adapter.remove().await {
            error!("Failed to disable rule: {e}");
            return Err(e.into());
        }

        state.enabled = false;
        info!("No longer blocking requests");
        if self.config.restore_enabled {
            self.persist(entry(KEY_ENABLED, false)).await;
        }
        Ok(())
    }

    /// Replace the pattern, reinstalling the rule if blocking is enabled.
    ///
    /// The new pattern is kept and saved even if the engine then refuses it.
    /// In that case the old rule is taken down and blocking is disabled, so
    /// the engine never keeps enforcing a pattern the state no longer holds.
    pub async fn set_pattern(&self, pattern: &str) -> Result<(), ControllerError> {
        let checked = validator::check(pattern).map_err(|e| {
            error!("Invalid regex provided: {e}");
            e
        })?;
        log_warnings(&checked);

        let mut state = self.state.lock().await;
        info!("Updating pattern: {} -> {}", state.pattern, checked.as_str());
        state.pattern = checked.as_str().to_string();
        self.persist(entry(KEY_PATTERN, checked.as_str())).await;

        if !state.enabled {
            return Ok(());
        }

        info!("Refreshing rule with new pattern");
        if let Err(e) = self.adapter.install(&checked).await {
            error!("Failed to apply new pattern: {e}");
            match self.adapter.remove().await {
                Ok(()) => {
                    warn!("Blocking disabled until a pattern is accepted");
                    state.enabled = false;
                    if self.config.restore_enabled {
                        self.persist(entry(KEY_ENABLED, false)).await;
                    }
                }
                Err(remove_err) => error!("Failed to remove outdated rule: {remove_err}"),
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Current state. Waits for any in-flight command to finish.
    pub async fn status(&self) -> BlockingState {
        let state = self.state.lock().await;
        BlockingState {
            enabled: state.enabled,
            pattern: state.pattern.clone(),
            blocked_count: self.blocked_count(),
        }
    }

    /// Current blocked count, never waiting on other commands.
    pub fn blocked_count(&self) -> u64 {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Count one blocked request and return the new total.
    pub async fn increment_blocked(&self) -> u64 {
        let count = self.blocked.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.track_stats {
            self.persist_count().await;
        }
        count
    }

    /// Reset the blocked count to zero.
    pub async fn clear_stats(&self) -> u64 {
        self.blocked.store(0, Ordering::SeqCst);
        info!("Blocked count cleared");
        if self.config.track_stats {
            self.persist_count().await;
        }
        0
    }

    async fn enable_locked(&self, state: &mut ControlState) -> Result<(), ControllerError> {
        info!("Enabling rule with pattern: {}", state.pattern);

        let pattern = validator::check(&state.pattern).map_err(|e| {
            error!("Invalid regex pattern: {e}");
            e
        })?;
        log_warnings(&pattern);

        if let Err(e) = self.adapter.install(&pattern).await {
            error!("Failed to enable rule: {e}");
            return Err(e.into());
        }

        state.enabled = true;
        if self.config.restore_enabled {
            self.persist(entry(KEY_ENABLED, true)).await;
        }
        Ok(())
    }

    /// Write the latest counter value unless it is already saved.
    async fn persist_count(&self) {
        let mut persisted = self.persisted_count.lock().await;
        let latest = self.blocked.load(Ordering::SeqCst);
        if *persisted == Some(latest) {
            return;
        }
        match self.store.save(entry(KEY_BLOCKED_COUNT, latest)).await {
            Ok(()) => *persisted = Some(latest),
            Err(e) => warn!("Failed to save blocked count: {e}"),
        }
    }

    async fn persist(&self, entries: Map<String, Value>) {
        if let Err(e) = self.store.save(entries).await {
            warn!("Failed to save state: {e}");
        }
    }
}

fn log_warnings(pattern: &Pattern) {
    for warning in pattern.warnings() {
        warn!("{warning}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::LocalEngine;
    use crate::store::MemoryStore;

    type TestController = Controller<Arc<LocalEngine>, Arc<MemoryStore>>;

    fn controller_with(config: ControllerConfig, store: MemoryStore) -> (TestController, Arc<LocalEngine>, Arc<MemoryStore>) {
        let (engine, _matches) = LocalEngine::new();
        let engine = Arc::new(engine);
        let store = Arc::new(store);
        let controller = Controller::new(engine.clone(), store.clone(), config);
        (controller, engine, store)
    }

    fn controller() -> (TestController, Arc<LocalEngine>, Arc<MemoryStore>) {
        controller_with(ControllerConfig::default(), MemoryStore::new())
    }

    #[tokio::test]
    async fn test_enable_from_defaults() {
        let (controller, engine, store) = controller();
        controller.startup().await;

        controller.enable().await.unwrap();

        let status = controller.status().await;
        assert!(status.enabled);
        assert_eq!(status.pattern, DEFAULT_PATTERN);
        assert_eq!(store.get(KEY_ENABLED), Some(Value::from(true)));

        let rules = engine.dynamic_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].condition.regex_filter, DEFAULT_PATTERN);
    }

    #[tokio::test]
    async fn test_enable_failure_keeps_prior_state() {
        let (controller, engine, store) = controller();
        engine.reject_next_updates(1);

        let err = controller.enable().await.unwrap_err();
        assert!(matches!(err, ControllerError::Engine(EngineError::Rejected(_))));
        assert!(!controller.status().await.enabled);
        assert_eq!(store.get(KEY_ENABLED), None);
    }

    #[tokio::test]
    async fn test_enable_succeeds_when_store_fails() {
        let (controller, _engine, store) = controller();
        store.fail_saves(true);

        controller.enable().await.unwrap();
        assert!(controller.status().await.enabled);
    }

    #[tokio::test]
    async fn test_disable_removes_rule() {
        let (controller, engine, store) = controller();
        controller.enable().await.unwrap();
        controller.disable().await.unwrap();

        assert!(!controller.status().await.enabled);
        assert!(engine.dynamic_rules().await.unwrap().is_empty());
        assert_eq!(store.get(KEY_ENABLED), Some(Value::from(false)));
    }

    #[tokio::test]
    async fn test_disable_failure_keeps_enabled() {
        let (controller, engine, _store) = controller();
        controller.enable().await.unwrap();
        engine.reject_next_updates(1);

        assert!(controller.disable().await.is_err());
        assert!(controller.status().await.enabled);
        assert_eq!(engine.dynamic_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_invalid_pattern_leaves_state() {
        let (controller, _engine, store) = controller();
        let err = controller.set_pattern("[").await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(ValidationError::Syntax(_))));
        assert!(err.to_string().starts_with("Invalid regex: "));

        let status = controller.status().await;
        assert_eq!(status.pattern, DEFAULT_PATTERN);
        assert!(!status.enabled);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_set_pattern_while_enabled_reinstalls() {
        let (controller, engine, store) = controller();
        controller.enable().await.unwrap();
        controller.set_pattern(r"tracker\.js").await.unwrap();

        let status = controller.status().await;
        assert!(status.enabled);
        assert_eq!(status.pattern, r"tracker\.js");
        assert_eq!(store.get(KEY_PATTERN), Some(Value::from(r"tracker\.js")));

        let rule = controller.adapter().installed_rule().await.unwrap().unwrap();
        assert_eq!(rule.condition.regex_filter, r"tracker\.js");
        assert_eq!(engine.dynamic_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_pattern_engine_rejection_keeps_pattern() {
        let (controller, engine, store) = controller();
        controller.enable().await.unwrap();

        // Valid in the general dialect, refused by the engine.
        let err = controller.set_pattern(r"api(?=\.example)").await.unwrap_err();
        assert!(matches!(err, ControllerError::Engine(EngineError::PatternRejected(_))));

        let status = controller.status().await;
        assert_eq!(status.pattern, r"api(?=\.example)");
        assert!(!status.enabled);
        assert!(engine.dynamic_rules().await.unwrap().is_empty());
        assert_eq!(store.get(KEY_PATTERN), Some(Value::from(r"api(?=\.example)")));
    }

    #[tokio::test]
    async fn test_counter_increment_and_clear() {
        let (controller, _engine, store) = controller();
        controller.startup().await;

        for _ in 0..5 {
            controller.increment_blocked().await;
        }
        assert_eq!(controller.blocked_count(), 5);
        assert_eq!(store.get(KEY_BLOCKED_COUNT), Some(Value::from(5u64)));

        assert_eq!(controller.clear_stats().await, 0);
        assert_eq!(store.get(KEY_BLOCKED_COUNT), Some(Value::from(0u64)));
        assert_eq!(controller.increment_blocked().await, 1);
    }

    #[tokio::test]
    async fn test_counter_survives_store_failure() {
        let (controller, _engine, store) = controller();
        store.fail_saves(true);

        controller.increment_blocked().await;
        controller.increment_blocked().await;
        assert_eq!(controller.blocked_count(), 2);

        store.fail_saves(false);
        controller.increment_blocked().await;
        assert_eq!(store.get(KEY_BLOCKED_COUNT), Some(Value::from(3u64)));
    }

    #[tokio::test]
    async fn test_startup_restores_enabled_rule() {
        let mut saved = entry(KEY_PATTERN, "ads");
        saved.insert(KEY_ENABLED.to_string(), Value::from(true));
        saved.insert(KEY_BLOCKED_COUNT.to_string(), Value::from(7));
        let (controller, engine, _store) = controller_with(ControllerConfig::default(), MemoryStore::with_values(saved));

        controller.startup().await;

        let status = controller.status().await;
        assert!(status.enabled);
        assert_eq!(status.pattern, "ads");
        assert_eq!(status.blocked_count, 7);
        let rules = engine.dynamic_rules().await.unwrap();
        assert_eq!(rules[0].condition.regex_filter, "ads");
    }

    #[tokio::test]
    async fn test_startup_restore_failure_disables() {
        let mut saved = entry(KEY_PATTERN, "ads");
        saved.insert(KEY_ENABLED.to_string(), Value::from(true));
        let (controller, engine, store) = controller_with(ControllerConfig::default(), MemoryStore::with_values(saved));
        engine.reject_next_updates(1);

        controller.startup().await;

        assert!(!controller.status().await.enabled);
        assert_eq!(store.get(KEY_ENABLED), Some(Value::from(false)));
    }

    #[tokio::test]
    async fn test_startup_load_failure_uses_defaults() {
        let store = MemoryStore::with_values(entry(KEY_PATTERN, "ads"));
        store.fail_loads(true);
        let (controller, _engine, _store) = controller_with(ControllerConfig::default(), store);

        controller.startup().await;

        let status = controller.status().await;
        assert_eq!(status, BlockingState::default());
    }

    #[tokio::test]
    async fn test_startup_ignores_bad_saved_values() {
        let mut saved = entry(KEY_PATTERN, 5);
        saved.insert(KEY_ENABLED.to_string(), Value::from("yes"));
        saved.insert(KEY_BLOCKED_COUNT.to_string(), Value::from(-3));
        let (controller, _engine, _store) = controller_with(ControllerConfig::default(), MemoryStore::with_values(saved));

        controller.startup().await;

        assert_eq!(controller.status().await, BlockingState::default());
    }

    #[tokio::test]
    async fn test_stats_variant_never_restores_enabled() {
        let mut saved = entry(KEY_PATTERN, "ads");
        saved.insert(KEY_ENABLED.to_string(), Value::from(true));
        let config = ControllerConfig {
            restore_enabled: false,
            ..ControllerConfig::default()
        };
        let (controller, engine, store) = controller_with(config, MemoryStore::with_values(saved));

        controller.startup().await;
        assert!(!controller.status().await.enabled);
        assert!(engine.dynamic_rules().await.unwrap().is_empty());

        controller.enable().await.unwrap();
        // The enabled flag is not written back in this variant.
        assert_eq!(store.get(KEY_ENABLED), Some(Value::from(true)));
        controller.disable().await.unwrap();
        assert_eq!(store.get(KEY_ENABLED), Some(Value::from(true)));
    }

    #[tokio::test]
    async fn test_untracked_stats_are_not_saved() {
        let config = ControllerConfig {
            track_stats: false,
            ..ControllerConfig::default()
        };
        let (controller, _engine, store) = controller_with(config, MemoryStore::new());

        controller.increment_blocked().await;
        assert_eq!(controller.blocked_count(), 1);
        assert_eq!(store.get(KEY_BLOCKED_COUNT), None);
    }
}
