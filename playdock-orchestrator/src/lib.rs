//! Lifecycle orchestration core for on-demand game-streaming instances.

pub mod command_listener;
pub mod commands;
pub mod engine;
pub mod error;
pub mod provider_manager;
pub mod provisioning;
pub mod registry;
pub mod retry;
pub mod service;
pub mod session;
pub mod settings;
pub mod status;
pub mod workflows;

pub use error::{ErrorCategory, LifecycleError, Result};
pub use service::LifecycleService;
pub use settings::{Settings, Timings};
