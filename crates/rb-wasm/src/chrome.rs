//! Bindings to the extension APIs backing the controller.
//!
//! Values cross the boundary as JSON: Rust types are serialized with
//! `serde_json` and parsed with `JSON.parse`, and the reverse on the way in.

use async_trait::async_trait;
use js_sys::{Array, Function, Promise};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use rb_core::engine::{EngineError, RegexSupport, RuleEngine, RuleUpdate};
use rb_core::store::{Store, StoreError};
use rb_core::{ResourceType, Rule, RuleMatch};

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(catch, js_namespace = ["chrome", "declarativeNetRequest"], js_name = updateDynamicRules)]
    fn update_dynamic_rules(options: &JsValue) -> Result<Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "declarativeNetRequest"], js_name = isRegexSupported)]
    fn is_regex_supported(options: &JsValue) -> Result<Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "declarativeNetRequest"], js_name = getDynamicRules)]
    fn get_dynamic_rules() -> Result<Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "storage", "local"], js_name = get)]
    fn storage_get(keys: &JsValue) -> Result<Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "storage", "local"], js_name = set)]
    fn storage_set(items: &JsValue) -> Result<Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "runtime", "onMessage"], js_name = addListener)]
    pub fn add_message_listener(listener: &Function) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "declarativeNetRequest", "onRuleMatchedDebug"], js_name = addListener)]
    pub fn add_rule_matched_listener(listener: &Function) -> Result<(), JsValue>;
}

/// Ruleset id of rules added through `updateDynamicRules`.
const DYNAMIC_RULESET_ID: &str = "_dynamic";

// =============================================================================
// JSON bridging
// =============================================================================

pub fn to_js<T: Serialize>(value: &T) -> Result<JsValue, String> {
    let text = serde_json::to_string(value).map_err(|e| e.to_string())?;
    js_sys::JSON::parse(&text).map_err(js_error)
}

pub fn from_js<T: DeserializeOwned>(value: &JsValue) -> Result<T, String> {
    if value.is_undefined() {
        return serde_json::from_value(Value::Null).map_err(|e| e.to_string());
    }
    let text: String = js_sys::JSON::stringify(value).map_err(js_error)?.into();
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

/// Best-effort message of a thrown JS value.
pub fn js_error(value: JsValue) -> String {
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        return String::from(error.message());
    }
    value.as_string().unwrap_or_else(|| format!("{value:?}"))
}

async fn call(promise: Result<Promise, JsValue>) -> Result<JsValue, String> {
    let promise = promise.map_err(js_error)?;
    JsFuture::from(promise).await.map_err(js_error)
}

// =============================================================================
// declarativeNetRequest
// =============================================================================

/// `chrome.declarativeNetRequest` as a [`RuleEngine`].
pub struct ChromeRuleEngine;

#[async_trait(?Send)]
impl RuleEngine for ChromeRuleEngine {
    async fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<(), EngineError> {
        let options = to_js(&update).map_err(EngineError::Unavailable)?;
        call(update_dynamic_rules(&options)).await.map_err(|message| {
            if message.contains("regexFilter") {
                EngineError::PatternRejected(message)
            } else {
                EngineError::Rejected(message)
            }
        })?;
        Ok(())
    }

    async fn is_regex_supported(&self, pattern: &str) -> Result<RegexSupport, EngineError> {
        let options = to_js(&json!({ "regex": pattern, "isCaseSensitive": false }))
            .map_err(EngineError::Unavailable)?;
        let result = call(is_regex_supported(&options))
            .await
            .map_err(EngineError::Unavailable)?;
        from_js(&result).map_err(EngineError::Unavailable)
    }

    async fn dynamic_rules(&self) -> Result<Vec<Rule>, EngineError> {
        let result = call(get_dynamic_rules()).await.map_err(EngineError::Unavailable)?;
        from_js(&result).map_err(EngineError::Unavailable)
    }
}

// =============================================================================
// storage.local
// =============================================================================

/// `chrome.storage.local` as a [`Store`].
pub struct ChromeLocalStorage;

#[async_trait(?Send)]
impl Store for ChromeLocalStorage {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        let key_array: Array = keys.iter().map(|key| JsValue::from_str(key)).collect();
        let result = call(storage_get(&key_array.into()))
            .await
            .map_err(StoreError::Unavailable)?;
        stored_entries(&result)
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        let items = to_js(&entries).map_err(StoreError::Unavailable)?;
        call(storage_set(&items)).await.map_err(StoreError::Unavailable)?;
        Ok(())
    }
}

/// Entries from a `storage.local.get` result. An absent result means nothing
/// is stored.
pub fn stored_entries(result: &JsValue) -> Result<Map<String, Value>, StoreError> {
    if result.is_undefined() || result.is_null() {
        return Ok(Map::new());
    }
    from_js(result).map_err(StoreError::Corrupt)
}

// =============================================================================
// onRuleMatchedDebug
// =============================================================================

#[derive(Deserialize)]
struct MatchedRuleInfo {
    request: MatchedRequest,
    rule: MatchedRule,
}

#[derive(Deserialize)]
struct MatchedRequest {
    url: String,
    #[serde(rename = "type")]
    request_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchedRule {
    rule_id: u32,
    ruleset_id: String,
}

/// Convert an `onRuleMatchedDebug` payload, keeping dynamic rules only.
pub fn rule_match_from_js(info: &JsValue) -> Result<Option<RuleMatch>, String> {
    let info: MatchedRuleInfo = from_js(info)?;
    if info.rule.ruleset_id != DYNAMIC_RULESET_ID {
        return Ok(None);
    }
    Ok(Some(RuleMatch {
        rule_id: info.rule.rule_id,
        url: info.request.url,
        request_type: info
            .request
            .request_type
            .parse()
            .unwrap_or(ResourceType::Other),
    }))
}
