//! In-memory mission store and thread map.
//!
//! Missions live for the hub's lifetime; a restart loses them and the next
//! message simply opens a new mission. Threads map a `t-<6hex>` id to its
//! two participants and owning mission so a `reply` without an explicit
//! recipient resolves correctly.

use std::collections::HashMap;

use intercom_types::{Mission, MissionStatus, MessageType};

/// A chat thread between two agents.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub participant_a: String,
    pub participant_b: String,
    pub mission_id: String,
}

/// Owner of all mission and thread state on the hub.
#[derive(Default)]
pub struct MissionStore {
    missions: HashMap<String, Mission>,
    threads: HashMap<String, ThreadInfo>,
}

impl MissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a mission, creating it if this is its first message.
    pub fn get_or_create(
        &mut self,
        mission_id: &str,
        from_agent: &str,
        to_agent: &str,
        kind: MessageType,
    ) -> &mut Mission {
        self.missions
            .entry(mission_id.to_string())
            .or_insert_with(|| Mission::new(mission_id, from_agent, to_agent, kind))
    }

    pub fn get(&self, mission_id: &str) -> Option<&Mission> {
        self.missions.get(mission_id)
    }

    pub fn get_mut(&mut self, mission_id: &str) -> Option<&mut Mission> {
        self.missions.get_mut(mission_id)
    }

    pub fn set_status(&mut self, mission_id: &str, status: MissionStatus) {
        if let Some(mission) = self.missions.get_mut(mission_id) {
            mission.status = status;
        }
    }

    /// Bind a thread to its participants and mission. First binding wins;
    /// later chats on the same thread keep the original mission.
    pub fn bind_thread(&mut self, thread_id: &str, a: &str, b: &str, mission_id: &str) {
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadInfo {
                participant_a: a.to_string(),
                participant_b: b.to_string(),
                mission_id: mission_id.to_string(),
            });
    }

    pub fn thread(&self, thread_id: &str) -> Option<&ThreadInfo> {
        self.threads.get(thread_id)
    }

    /// For a reply on `thread_id` sent by `from_agent`, the other
    /// participant. `None` when the thread is unknown or the sender is not
    /// part of it.
    pub fn resolve_reply_target(&self, thread_id: &str, from_agent: &str) -> Option<String> {
        let thread = self.threads.get(thread_id)?;
        if thread.participant_a == from_agent {
            Some(thread.participant_b.clone())
        } else if thread.participant_b == from_agent {
            Some(thread.participant_a.clone())
        } else {
            None
        }
    }

    pub fn mission_count(&self) -> usize {
        self.missions.len()
    }
}
