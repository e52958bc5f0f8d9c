//! RegexBlock Core Library
//!
//! This crate provides the background controller for the RegexBlock request
//! blocker. The controller owns a single regex blocking rule, keeps it in sync
//! with the host's declarative rule engine, persists its state and counts
//! blocked requests.
//!
//! # Architecture
//!
//! The host (a browser extension runtime, or the native CLI) supplies two
//! collaborators through traits: a [`RuleEngine`] that accepts dynamic rule
//! updates and emits match notifications, and a [`Store`] that persists a
//! handful of keys. Everything else is host-independent.
//!
//! # Modules
//!
//! - `types`: Rule, resource type and state definitions
//! - `validator`: Pattern validation and unsupported-feature warnings
//! - `engine`: Rule engine trait, rule adapter and in-process engine
//! - `store`: Persistence trait and in-memory store
//! - `controller`: State controller sequencing validation, rules and storage
//! - `observer`: Match observer feeding the blocked counter
//! - `protocol`: Command/response protocol spoken with the UI

pub mod types;
pub mod validator;
pub mod engine;
pub mod store;
pub mod controller;
pub mod observer;
pub mod protocol;

// Re-export commonly used types
pub use types::{BlockingState, ResourceType, Rule, RuleMatch, DEFAULT_PATTERN, RULE_ID};
pub use validator::{validate, Pattern, ValidationError, ValidationResult};
pub use engine::{EngineError, LocalEngine, RuleAdapter, RuleEngine};
pub use store::{MemoryStore, Store, StoreError};
pub use controller::{Controller, ControllerConfig, ControllerError};
pub use observer::MatchObserver;
pub use protocol::{dispatch, dispatch_json, Command, Response};
