//! Core type definitions for RegexBlock
//!
//! The rule types serialize to the exact shape the browser's
//! `declarativeNetRequest` API expects, so the same value can be handed to
//! the host engine or logged as-is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Id of the single dynamic rule owned by the controller.
pub const RULE_ID: u32 = 1;

/// Priority of the blocking rule.
pub const RULE_PRIORITY: u32 = 1;

/// Pattern used until the user saves one.
pub const DEFAULT_PATTERN: &str = r".*api\.example\.com.*";

/// Resource types the blocking rule applies to.
pub const BLOCKED_RESOURCE_TYPES: [ResourceType; 2] =
    [ResourceType::XmlHttpRequest, ResourceType::Script];

// =============================================================================
// Rule Actions
// =============================================================================

/// Action to take for a matched rule.
///
/// Only the actions the controller installs or the local engine evaluates
/// are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum RuleAction {
    Block,
    /// Lets the request through, shadowing lower priority rules
    Allow,
}

// =============================================================================
// Resource Masks
// =============================================================================

bitflags::bitflags! {
    /// Set of resource types a rule condition covers, one bit per
    /// [`ResourceType`] in declaration order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceMask: u16 {
        const MAIN_FRAME = 1 << ResourceType::MainFrame as u16;
        const SUB_FRAME = 1 << ResourceType::SubFrame as u16;
        const STYLESHEET = 1 << ResourceType::Stylesheet as u16;
        const SCRIPT = 1 << ResourceType::Script as u16;
        const IMAGE = 1 << ResourceType::Image as u16;
        const FONT = 1 << ResourceType::Font as u16;
        const OBJECT = 1 << ResourceType::Object as u16;
        const XMLHTTPREQUEST = 1 << ResourceType::XmlHttpRequest as u16;
        const PING = 1 << ResourceType::Ping as u16;
        const CSP_REPORT = 1 << ResourceType::CspReport as u16;
        const MEDIA = 1 << ResourceType::Media as u16;
        const WEBSOCKET = 1 << ResourceType::WebSocket as u16;
        const OTHER = 1 << ResourceType::Other as u16;
    }
}

/// Browser resource type as named by the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[repr(u16)]
pub enum ResourceType {
    #[serde(rename = "main_frame")]
    MainFrame,
    #[serde(rename = "sub_frame")]
    SubFrame,
    #[serde(rename = "stylesheet")]
    Stylesheet,
    #[serde(rename = "script")]
    Script,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "font")]
    Font,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "xmlhttprequest")]
    XmlHttpRequest,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "csp_report")]
    CspReport,
    #[serde(rename = "media")]
    Media,
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "other")]
    Other,
}

impl ResourceType {
    /// Name used by the browser API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MainFrame => "main_frame",
            Self::SubFrame => "sub_frame",
            Self::Stylesheet => "stylesheet",
            Self::Script => "script",
            Self::Image => "image",
            Self::Font => "font",
            Self::Object => "object",
            Self::XmlHttpRequest => "xmlhttprequest",
            Self::Ping => "ping",
            Self::CspReport => "csp_report",
            Self::Media => "media",
            Self::WebSocket => "websocket",
            Self::Other => "other",
        }
    }

    /// Bit of this type in a [`ResourceMask`].
    pub fn mask(self) -> ResourceMask {
        ResourceMask::from_bits_retain(1 << self as u16)
    }
}

impl FromStr for ResourceType {
    type Err = String;

    /// Parse from a browser request type string, accepting common aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_frame" | "document" => Ok(Self::MainFrame),
            "sub_frame" | "subdocument" => Ok(Self::SubFrame),
            "stylesheet" | "css" => Ok(Self::Stylesheet),
            "script" | "js" => Ok(Self::Script),
            "image" | "img" => Ok(Self::Image),
            "font" => Ok(Self::Font),
            "object" => Ok(Self::Object),
            "xmlhttprequest" | "xhr" | "fetch" => Ok(Self::XmlHttpRequest),
            "ping" | "beacon" => Ok(Self::Ping),
            "csp_report" => Ok(Self::CspReport),
            "media" => Ok(Self::Media),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown resource type: {s}")),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Action part of a declarative rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
pub struct RuleActionSpec {
    #[serde(rename = "type")]
    pub kind: RuleAction,
}

/// Condition part of a declarative rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub regex_filter: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_url_filter_case_sensitive: Option<bool>,
}

/// A declarative network rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
pub struct Rule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleActionSpec,
    pub condition: RuleCondition,
}

impl Rule {
    /// The controller's blocking rule for `pattern`.
    pub fn blocking(pattern: &str) -> Self {
        Self {
            id: RULE_ID,
            priority: RULE_PRIORITY,
            action: RuleActionSpec { kind: RuleAction::Block },
            condition: RuleCondition {
                regex_filter: pattern.to_string(),
                resource_types: BLOCKED_RESOURCE_TYPES.to_vec(),
                is_url_filter_case_sensitive: None,
            },
        }
    }

    /// Combined mask of the resource types this rule applies to.
    ///
    /// An empty list means every type except the main frame.
    pub fn type_mask(&self) -> ResourceMask {
        if self.condition.resource_types.is_empty() {
            return ResourceMask::all() - ResourceMask::MAIN_FRAME;
        }
        self.condition
            .resource_types
            .iter()
            .fold(ResourceMask::empty(), |mask, ty| mask | ty.mask())
    }
}

// =============================================================================
// Controller State
// =============================================================================

/// Snapshot of the controller's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingState {
    pub enabled: bool,
    pub pattern: String,
    pub blocked_count: u64,
}

impl Default for BlockingState {
    fn default() -> Self {
        Self {
            enabled: false,
            pattern: DEFAULT_PATTERN.to_string(),
            blocked_count: 0,
        }
    }
}

// =============================================================================
// Match Notifications
// =============================================================================

/// A rule match reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub rule_id: u32,
    pub url: String,
    pub request_type: ResourceType,
}
