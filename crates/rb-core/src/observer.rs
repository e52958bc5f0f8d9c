//! Match observer
//!
//! Consumes the engine's rule-match notifications and counts the ones that
//! belong to the controller's rule.

use std::rc::Rc;

use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::controller::Controller;
use crate::engine::RuleEngine;
use crate::store::Store;
use crate::types::{RuleMatch, RULE_ID};

/// Feeds rule matches into the controller's blocked counter.
pub struct MatchObserver<E, S> {
    controller: Rc<Controller<E, S>>,
    events: UnboundedReceiver<RuleMatch>,
}

impl<E: RuleEngine, S: Store> MatchObserver<E, S> {
    pub fn new(controller: Rc<Controller<E, S>>, events: UnboundedReceiver<RuleMatch>) -> Self {
        Self { controller, events }
    }

    /// Whether `event` was produced by the controller's rule.
    pub fn is_own_match(event: &RuleMatch) -> bool {
        event.rule_id == RULE_ID
    }

    /// Count `event` if it belongs to the controller's rule.
    pub async fn handle(&self, event: &RuleMatch) -> bool {
        if !Self::is_own_match(event) {
            debug!("Ignoring match for foreign rule {}", event.rule_id);
            return false;
        }
        let count = self.controller.increment_blocked().await;
        debug!("Blocked {} ({}), total {}", event.url, event.request_type, count);
        true
    }

    /// Count every queued event without waiting for new ones.
    pub async fn drain(&mut self) -> u64 {
        let mut counted = 0;
        while let Ok(event) = self.events.try_recv() {
            if self.handle(&event).await {
                counted += 1;
            }
        }
        counted
    }

    /// Count events until the engine closes its notification channel.
    pub async fn run(mut self) -> u64 {
        let mut counted = 0;
        while let Some(event) = self.events.recv().await {
            if self.handle(&event).await {
                counted += 1;
            }
        }
        info!("Match notifications closed after {counted} blocked request(s)");
        counted
    }
}
