//! WebAssembly background for RegexBlock
//!
//! Wires the controller to `chrome.declarativeNetRequest`,
//! `chrome.storage.local` and `chrome.runtime.onMessage`.

mod chrome;
mod logger;

use std::cell::OnceCell;
use std::rc::Rc;

use js_sys::Function;
use log::{debug, info, warn, LevelFilter};
use tokio::sync::mpsc::{self, UnboundedSender};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;

use rb_core::{dispatch_json, Controller, ControllerConfig, MatchObserver, RuleMatch};

use crate::chrome::{ChromeLocalStorage, ChromeRuleEngine};

type Background = Controller<ChromeRuleEngine, ChromeLocalStorage>;

thread_local! {
    static BACKGROUND: OnceCell<Rc<Background>> = const { OnceCell::new() };
}

/// Entry point of the service worker. Listeners are registered before the
/// first await so events that woke the worker are not missed.
#[wasm_bindgen(start)]
pub fn start() -> Result<(), JsValue> {
    logger::init(LevelFilter::Info);

    let controller = Rc::new(Controller::new(
        ChromeRuleEngine,
        ChromeLocalStorage,
        ControllerConfig::default(),
    ));
    let installed = BACKGROUND.with(|cell| cell.set(controller.clone()).is_ok());
    if !installed {
        return Err(JsValue::from_str("Background already started"));
    }

    register_message_listener(controller.clone())?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = register_match_listener(tx) {
        // Without the debug feed the counter simply never advances.
        warn!("Rule match feed unavailable: {}", chrome::js_error(e));
    }

    let startup = controller.clone();
    spawn_local(async move {
        startup.startup().await;
        info!("Background ready");
    });

    let observer = MatchObserver::new(controller, rx);
    spawn_local(async move {
        let handled = observer.run().await;
        debug!("Match observer stopped after {handled} events");
    });

    Ok(())
}

/// Validate a pattern for the options page without sending a message.
#[wasm_bindgen]
pub fn validate_pattern(pattern: &str) -> Result<JsValue, JsValue> {
    let result = rb_core::validate(pattern);
    chrome::to_js(&result).map_err(|e| JsValue::from_str(&e))
}

#[wasm_bindgen]
pub fn is_started() -> bool {
    BACKGROUND.with(|cell| cell.get().is_some())
}

/// In-memory blocked counter, or zero before `start`.
#[wasm_bindgen]
pub fn blocked_count() -> f64 {
    BACKGROUND.with(|cell| cell.get().map_or(0.0, |c| c.blocked_count() as f64))
}

fn register_message_listener(controller: Rc<Background>) -> Result<(), JsValue> {
    let listener = Closure::<dyn FnMut(JsValue, JsValue, Function) -> bool>::new(
        move |message: JsValue, _sender: JsValue, send_response: Function| {
            let controller = controller.clone();
            spawn_local(async move {
                let text = js_sys::JSON::stringify(&message)
                    .map(String::from)
                    .unwrap_or_default();
                let response = dispatch_json(&controller, &text).await;
                match chrome::to_js(&response) {
                    Ok(reply) => {
                        if let Err(e) = send_response.call1(&JsValue::NULL, &reply) {
                            warn!("Failed to send response: {}", chrome::js_error(e));
                        }
                    }
                    Err(e) => warn!("Failed to encode response: {e}"),
                }
            });
            // Keep the channel open for the asynchronous reply.
            true
        },
    );

    chrome::add_message_listener(listener.as_ref().unchecked_ref())?;
    listener.forget();
    Ok(())
}

fn register_match_listener(events: UnboundedSender<RuleMatch>) -> Result<(), JsValue> {
    let listener = Closure::<dyn FnMut(JsValue)>::new(move |info: JsValue| {
        match chrome::rule_match_from_js(&info) {
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    debug!("Match observer gone, dropping event");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Unreadable rule match payload: {e}"),
        }
    });

    chrome::add_rule_matched_listener(listener.as_ref().unchecked_ref())?;
    listener.forget();
    Ok(())
}
