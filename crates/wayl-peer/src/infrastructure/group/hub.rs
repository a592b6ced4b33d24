//! In-process group overlay.
//!
//! A [`LocalHub`] is a shared membership table; every [`HubNode`] created from
//! it is a member once started.  Events are delivered through unbounded
//! channels, so the hub behaves like a perfectly reliable network with zero
//! latency.  Tests use it to drive the group exchange deterministically, and
//! [`LocalHub::drop_member`] simulates a peer that vanishes without saying
//! goodbye.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{GroupError, GroupEvent, GroupEventKind, GroupNode};

struct Member {
    name: String,
    headers: HashMap<String, String>,
    groups: HashSet<String>,
    events: mpsc::UnboundedSender<GroupEvent>,
}

/// Shared membership table for [`HubNode`]s.
#[derive(Clone, Default)]
pub struct LocalHub {
    members: Arc<Mutex<HashMap<Uuid, Member>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a node attached to this hub.
    pub fn node(&self, name: &str) -> HubNode {
        HubNode {
            hub: self.clone(),
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            headers: HashMap::new(),
            groups: HashSet::new(),
            events: None,
        }
    }

    /// Number of started members.
    pub fn member_count(&self) -> usize {
        self.lock().len()
    }

    /// Removes `peer` as if it had crashed; everyone else sees EXIT.
    pub fn drop_member(&self, peer: Uuid) -> bool {
        let mut members = self.lock();
        let Some(gone) = members.remove(&peer) else {
            return false;
        };
        broadcast_exit(&members, peer, &gone.name);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Member>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn broadcast_exit(members: &HashMap<Uuid, Member>, peer: Uuid, name: &str) {
    for member in members.values() {
        let _ = member.events.send(GroupEvent {
            peer,
            name: name.to_string(),
            kind: GroupEventKind::Exit,
        });
    }
}

/// A member of a [`LocalHub`].
pub struct HubNode {
    hub: LocalHub,
    uuid: Uuid,
    name: String,
    headers: HashMap<String, String>,
    groups: HashSet<String>,
    events: Option<mpsc::UnboundedReceiver<GroupEvent>>,
}

#[async_trait]
impl GroupNode for HubNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    fn join(&mut self, group: &str) {
        self.groups.insert(group.to_string());
        if let Some(member) = self.hub.lock().get_mut(&self.uuid) {
            member.groups.insert(group.to_string());
        }
    }

    async fn start(&mut self) -> Result<(), GroupError> {
        if self.events.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut members = self.hub.lock();
        for (uuid, member) in members.iter() {
            // Both sides learn about each other.
            let _ = member.events.send(GroupEvent {
                peer: self.uuid,
                name: self.name.clone(),
                kind: GroupEventKind::Enter {
                    headers: self.headers.clone(),
                },
            });
            let _ = tx.send(GroupEvent {
                peer: *uuid,
                name: member.name.clone(),
                kind: GroupEventKind::Enter {
                    headers: member.headers.clone(),
                },
            });
        }
        members.insert(
            self.uuid,
            Member {
                name: self.name.clone(),
                headers: self.headers.clone(),
                groups: self.groups.clone(),
                events: tx,
            },
        );
        drop(members);
        self.events = Some(rx);
        debug!("hub node {} ({}) started", self.name, self.uuid);
        Ok(())
    }

    async fn recv(&mut self) -> Option<GroupEvent> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn shout(&self, group: &str, payload: &[u8]) -> Result<(), GroupError> {
        if self.events.is_none() {
            return Err(GroupError::NotStarted);
        }
        let members = self.hub.lock();
        for (uuid, member) in members.iter() {
            if *uuid == self.uuid || !member.groups.contains(group) {
                continue;
            }
            let _ = member.events.send(GroupEvent {
                peer: self.uuid,
                name: self.name.clone(),
                kind: GroupEventKind::Shout {
                    group: group.to_string(),
                    payload: payload.to_vec(),
                },
            });
        }
        Ok(())
    }

    async fn whisper(&self, peer: Uuid, payload: &[u8]) -> Result<(), GroupError> {
        if self.events.is_none() {
            return Err(GroupError::NotStarted);
        }
        let members = self.hub.lock();
        let member = members.get(&peer).ok_or(GroupError::UnknownPeer(peer))?;
        let _ = member.events.send(GroupEvent {
            peer: self.uuid,
            name: self.name.clone(),
            kind: GroupEventKind::Whisper {
                payload: payload.to_vec(),
            },
        });
        Ok(())
    }

    async fn leave(&mut self, group: &str) -> Result<(), GroupError> {
        self.groups.remove(group);
        if let Some(member) = self.hub.lock().get_mut(&self.uuid) {
            member.groups.remove(group);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if self.events.take().is_some() {
            self.hub.drop_member(self.uuid);
            debug!("hub node {} ({}) stopped", self.name, self.uuid);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
