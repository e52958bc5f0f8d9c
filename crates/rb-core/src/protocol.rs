//! Command protocol between the UI and the controller
//!
//! Messages are JSON objects tagged by `type`. Every command resolves to a
//! [`Response`], including malformed ones, so a waiting UI is never left
//! without an answer.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::controller::Controller;
use crate::engine::RuleEngine;
use crate::store::Store;

/// A request from the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Enable,
    Disable,
    #[serde(alias = "setRegex")]
    SetPattern {
        #[serde(alias = "regex")]
        pattern: String,
    },
    Status,
    GetStats,
    ClearStats,
}

/// A reply to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(untagged)]
pub enum Response {
    Failure {
        success: bool,
        error: String,
    },
    Toggled {
        success: bool,
        enabled: bool,
    },
    PatternSet {
        success: bool,
        pattern: String,
    },
    Cleared {
        success: bool,
        #[serde(rename = "blockedCount")]
        #[cfg_attr(feature = "typescript", ts(type = "number"))]
        blocked_count: u64,
    },
    Status {
        enabled: bool,
        pattern: String,
        #[serde(rename = "blockedCount", default, skip_serializing_if = "Option::is_none")]
        #[cfg_attr(feature = "typescript", ts(type = "number | undefined"))]
        blocked_count: Option<u64>,
    },
    Stats {
        #[serde(rename = "blockedCount")]
        #[cfg_attr(feature = "typescript", ts(type = "number"))]
        blocked_count: u64,
    },
}

impl Response {
    pub fn failure(error: impl ToString) -> Self {
        Self::Failure { success: false, error: error.to_string() }
    }

    /// Whether the command this answers succeeded.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure { .. })
    }
}

/// Run `command` against `controller`.
pub async fn dispatch<E: RuleEngine, S: Store>(
    controller: &Controller<E, S>,
    command: Command,
) -> Response {
    debug!("Command received: {command:?}");

    let response = match command {
        Command::Enable => match controller.enable().await {
            Ok(()) => Response::Toggled { success: true, enabled: true },
            Err(e) => Response::failure(e),
        },
        Command::Disable => match controller.disable().await {
            Ok(()) => Response::Toggled { success: true, enabled: false },
            Err(e) => Response::failure(e),
        },
        Command::SetPattern { pattern } => match controller.set_pattern(&pattern).await {
            Ok(()) => Response::PatternSet { success: true, pattern },
            Err(e) => Response::failure(e),
        },
        Command::Status => {
            let state = controller.status().await;
            Response::Status {
                enabled: state.enabled,
                pattern: state.pattern,
                blocked_count: controller.config().track_stats.then_some(state.blocked_count),
            }
        }
        Command::GetStats => Response::Stats {
            blocked_count: controller.blocked_count(),
        },
        Command::ClearStats => Response::Cleared {
            success: true,
            blocked_count: controller.clear_stats().await,
        },
    };

    debug!("Responding with: {response:?}");
    response
}

/// Parse a JSON message and run it. Malformed messages get a failure response.
pub async fn dispatch_json<E: RuleEngine, S: Store>(
    controller: &Controller<E, S>,
    message: &str,
) -> Response {
    match serde_json::from_str::<Command>(message) {
        Ok(command) => dispatch(controller, command).await,
        Err(e) => Response::failure(format!("Malformed command: {e}")),
    }
}
