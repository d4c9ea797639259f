//! Core types shared across all Intercom crates.
//!
//! Defines agent addresses, messages, machines, sessions, missions,
//! configuration, and error types used by the hub, daemon, and CLI.

pub mod config;
pub mod error;
pub mod ids;
pub mod machine;
pub mod message;
pub mod mission;
pub mod session;
pub mod wire;

pub use config::{AgentLauncherConfig, DiscoveryConfig, IntercomConfig, Mode, TelegramConfig};
pub use error::IntercomError;
pub use ids::{new_mission_id, new_session_id, new_thread_id, AgentAddr};
pub use machine::{MachineRecord, MachineStatus, ProjectRecord, ONLINE_WINDOW_SECS};
pub use message::{Message, MessageType};
pub use mission::{FeedbackItem, FeedbackKind, Mission, MissionMessage, MissionStatus};
pub use session::{InboxEntry, SessionInfo, SessionStatus};
pub use wire::{
    DeliverRequest, DeliverResponse, DiscoverResponse, FeedbackSubmission, HeartbeatBody,
    JoinRequest, JoinResponse, MissionSnapshot, MissionStartRequest, MissionStartResponse,
    MissionStopResponse, ProjectManifest, RegisterManifest, RouteResponse, SessionPresence,
    SessionRegisterRequest,
};
