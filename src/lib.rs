//! Intercom: a distributed message bus for autonomous coding agents.
//!
//! Re-exports the workspace crates so integration tests (and embedders)
//! can reach the whole routing plane through one dependency.

pub use intercom_auth as auth;
pub use intercom_console as console;
pub use intercom_daemon as daemon;
pub use intercom_hub as hub;
pub use intercom_policy as policy;
pub use intercom_registry as registry;
pub use intercom_types as types;
