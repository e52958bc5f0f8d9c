use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use rb_core::engine::RuleEngine;
use rb_core::store::{Store, StoreError, KEY_BLOCKED_COUNT, KEY_ENABLED, KEY_PATTERN};
use rb_core::{
    dispatch, validate, Command, Controller, ControllerConfig, LocalEngine, MatchObserver,
    MemoryStore, ResourceType, Response, DEFAULT_PATTERN,
};
use serde_json::{Map, Value};

#[test]
fn test_validation_properties() {
    assert!(!validate("").valid);
    assert!(!validate("   ").valid);
    assert!(!validate(&"x".repeat(2001)).valid);

    let result = validate(r"^https://[^/]*\.doubleclick\.net/");
    assert!(result.valid);
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn test_enable_block_and_count() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (engine, matches) = LocalEngine::new();
            let engine = Arc::new(engine);
            let controller = Rc::new(Controller::new(
                engine.clone(),
                MemoryStore::new(),
                ControllerConfig::default(),
            ));
            controller.startup().await;

            let observer = tokio::task::spawn_local(MatchObserver::new(controller.clone(), matches).run());

            let response = dispatch(&controller, Command::Enable).await;
            assert_eq!(response, Response::Toggled { success: true, enabled: true });

            for path in ["users", "orders", "carts"] {
                let outcome = engine.evaluate(
                    &format!("https://api.example.com/v1/{path}"),
                    ResourceType::XmlHttpRequest,
                );
                assert!(outcome.blocked);
            }
            assert!(!engine.evaluate("https://example.org/", ResourceType::Script).blocked);

            // The observer runs as a separate task; give it a chance to catch up.
            for _ in 0..100 {
                if controller.blocked_count() == 3 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            observer.abort();

            let response = dispatch(&controller, Command::GetStats).await;
            assert_eq!(response, Response::Stats { blocked_count: 3 });
        })
        .await;
}

#[tokio::test]
async fn test_restart_reconciles_engine() {
    let store = Arc::new(MemoryStore::new());

    {
        let (engine, _matches) = LocalEngine::new();
        let controller = Controller::new(engine, store.clone(), ControllerConfig::default());
        controller.startup().await;
        controller.set_pattern("tracker").await.unwrap();
        controller.enable().await.unwrap();
        controller.increment_blocked().await;
        controller.increment_blocked().await;
    }

    assert_eq!(store.get(KEY_PATTERN), Some(Value::from("tracker")));
    assert_eq!(store.get(KEY_ENABLED), Some(Value::from(true)));
    assert_eq!(store.get(KEY_BLOCKED_COUNT), Some(Value::from(2u64)));

    // A fresh engine holds no rules; startup must reinstall.
    let (engine, _matches) = LocalEngine::new();
    let controller = Controller::new(engine, store.clone(), ControllerConfig::default());
    controller.startup().await;

    let status = controller.status().await;
    assert!(status.enabled);
    assert_eq!(status.pattern, "tracker");
    assert_eq!(status.blocked_count, 2);

    let rules = controller.adapter().engine().dynamic_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].condition.regex_filter, "tracker");
}

#[tokio::test]
async fn test_invalid_pattern_scenario() {
    let (engine, _matches) = LocalEngine::new();
    let controller = Controller::new(engine, MemoryStore::new(), ControllerConfig::default());
    controller.startup().await;

    let response = dispatch(&controller, Command::SetPattern { pattern: "[".to_string() }).await;
    assert!(!response.is_success());

    let response = dispatch(&controller, Command::Status).await;
    assert_eq!(
        response,
        Response::Status {
            enabled: false,
            pattern: DEFAULT_PATTERN.to_string(),
            blocked_count: Some(0),
        }
    );
}

#[tokio::test]
async fn test_clear_then_increment() {
    let (engine, _matches) = LocalEngine::new();
    let controller = Controller::new(engine, MemoryStore::new(), ControllerConfig::default());

    for _ in 0..10 {
        controller.increment_blocked().await;
    }
    let response = dispatch(&controller, Command::ClearStats).await;
    assert_eq!(response, Response::Cleared { success: true, blocked_count: 0 });

    controller.increment_blocked().await;
    assert_eq!(
        dispatch(&controller, Command::GetStats).await,
        Response::Stats { blocked_count: 1 }
    );
}

/// Store whose every call suspends once, so other tasks run mid-command.
struct YieldingStore {
    inner: MemoryStore,
}

#[async_trait(?Send)]
impl Store for YieldingStore {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.load(keys).await
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.save(entries).await
    }
}

#[tokio::test]
async fn test_commands_interleaving_at_store_writes() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (engine, _matches) = LocalEngine::new();
            let store = Rc::new(YieldingStore { inner: MemoryStore::new() });
            let controller = Rc::new(Controller::new(
                engine,
                store.clone(),
                ControllerConfig::default(),
            ));
            controller.startup().await;

            let mut tasks = Vec::new();

            let c = controller.clone();
            tasks.push(tokio::task::spawn_local(async move {
                c.enable().await.unwrap();
            }));

            let c = controller.clone();
            tasks.push(tokio::task::spawn_local(async move {
                c.set_pattern("ads").await.unwrap();
            }));

            // Queued behind both commands, so it sees them fully applied.
            let c = controller.clone();
            tasks.push(tokio::task::spawn_local(async move {
                let state = c.status().await;
                assert!(state.enabled);
                assert_eq!(state.pattern, "ads");
            }));

            for _ in 0..50 {
                let c = controller.clone();
                tasks.push(tokio::task::spawn_local(async move {
                    c.increment_blocked().await;
                }));
            }

            for task in tasks {
                task.await.unwrap();
            }

            let state = controller.status().await;
            assert!(state.enabled);
            assert_eq!(state.pattern, "ads");
            assert_eq!(state.blocked_count, 50);

            let rule = controller.adapter().installed_rule().await.unwrap().unwrap();
            assert_eq!(rule.condition.regex_filter, "ads");

            assert_eq!(store.inner.get(KEY_PATTERN), Some(Value::from("ads")));
            assert_eq!(store.inner.get(KEY_ENABLED), Some(Value::Bool(true)));
            assert_eq!(store.inner.get(KEY_BLOCKED_COUNT), Some(Value::from(50)));
        })
        .await;
}
