//! HCI Core - gate/pipe protocol engine for an NFC controller's host
//! interface.
//!
//! This crate implements:
//! - Resource registry (applications, gates, pipes) with validation
//! - Session bootstrap and post-power-cycle restore state machines
//! - The one-outstanding-command transaction discipline
//! - Message dispatch and static gate servers (admin, link, loopback,
//!   identity, connectivity)
//! - Persistent storage abstraction and the configuration blob codec
//! - An async service wrapper binding the engine to a transport link
//!
//! The engine itself is synchronous and single-threaded: stimuli go in
//! as [`events::EngineEvent`], side effects come out as
//! [`events::Action`].

#![forbid(unsafe_code)]

// Core state machines
pub mod engine;
mod session;
mod transaction;

// Services
mod dispatch;
pub mod service;

// Infrastructure
pub mod registry;
pub mod store;

// Supporting modules
pub mod errors;
pub mod events;
pub mod harness;
pub mod types;

pub use engine::{EngineState, HciConfig, HciEngine};
pub use events::{Action, ApiRequest, EngineEvent, HciEvent};
pub use registry::Registry;
pub use service::{HciService, ServiceError, ServiceNotice};
pub use store::{InMemoryNvStore, NvStore};
pub use types::{AppHandle, HciStatus};
