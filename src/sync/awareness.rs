//! Ephemeral presence: cursors, selections and who is online.
//!
//! Awareness never touches the document and is never persisted. The local
//! state is re-sent every heartbeat; a peer that stays silent for the
//! configured timeout is dropped by [`Awareness::remove_stale`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::protocol::WireMessage;
use crate::crdt::ClientId;

/// Cursor position in a text replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub replica: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub replica: String,
    pub anchor: usize,
    pub head: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

/// What a client shares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessFields {
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub user: Option<UserInfo>,
}

impl AwarenessFields {
    pub fn with_user(mut self, name: impl Into<String>, color: impl Into<String>) -> Self {
        self.user = Some(UserInfo {
            name: name.into(),
            color: color.into(),
        });
        self
    }

    pub fn with_cursor(mut self, replica: impl Into<String>, index: usize) -> Self {
        self.cursor = Some(CursorPosition {
            replica: replica.into(),
            index,
        });
        self
    }

    pub fn with_selection(mut self, replica: impl Into<String>, anchor: usize, head: usize) -> Self {
        self.selection = Some(Selection {
            replica: replica.into(),
            anchor,
            head,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwarenessState {
    pub client_id: ClientId,
    pub fields: AwarenessFields,
    /// Sender timestamp in milliseconds since epoch
    pub updated_at: i64,
    /// Runtime-only receive instant (not serialized)
    #[serde(skip)]
    seen: Option<Instant>,
}

impl AwarenessState {
    fn last_seen(&self) -> Option<Instant> {
        self.seen
    }
}

/// Change notifications for awareness subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    Added(ClientId),
    Updated(ClientId),
    Removed(ClientId),
}

#[derive(Debug)]
pub struct Awareness {
    local_client: ClientId,
    timeout: Duration,
    states: HashMap<ClientId, AwarenessState>,
    events: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    pub fn new(local_client: impl Into<ClientId>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local_client: local_client.into(),
            timeout,
            states: HashMap::new(),
            events,
        }
    }

    pub fn local_client(&self) -> &str {
        &self.local_client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AwarenessEvent) {
        let _ = self.events.send(event);
    }

    /// Replace the local state; returns the update to broadcast
    pub fn set_local_state(&mut self, fields: AwarenessFields) -> WireMessage {
        let now = chrono::Utc::now().timestamp_millis();
        let client_id = self.local_client.clone();
        let timestamp = self
            .states
            .get(&client_id)
            .map_or(now, |prev| now.max(prev.updated_at));

        let existed = self
            .states
            .insert(
                client_id.clone(),
                AwarenessState {
                    client_id: client_id.clone(),
                    fields: fields.clone(),
                    updated_at: timestamp,
                    seen: Some(Instant::now()),
                },
            )
            .is_some();
        self.emit(if existed {
            AwarenessEvent::Updated(client_id.clone())
        } else {
            AwarenessEvent::Added(client_id.clone())
        });

        WireMessage::AwarenessUpdate {
            client_id,
            fields: Some(fields),
            timestamp,
        }
    }

    /// Forget the local state; returns the removal to broadcast
    pub fn clear_local_state(&mut self) -> WireMessage {
        if self.states.remove(&self.local_client).is_some() {
            self.emit(AwarenessEvent::Removed(self.local_client.clone()));
        }
        WireMessage::AwarenessUpdate {
            client_id: self.local_client.clone(),
            fields: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The local state for heartbeat retransmission, if one was set
    pub fn local_update(&self) -> Option<WireMessage> {
        self.states
            .get(&self.local_client)
            .map(|state| WireMessage::AwarenessUpdate {
                client_id: state.client_id.clone(),
                fields: Some(state.fields.clone()),
                timestamp: state.updated_at,
            })
    }

    /// Every known state as wire updates, used to bring a new peer up to date
    pub fn snapshot_messages(&self) -> Vec<WireMessage> {
        self.states
            .values()
            .map(|state| WireMessage::AwarenessUpdate {
                client_id: state.client_id.clone(),
                fields: Some(state.fields.clone()),
                timestamp: state.updated_at,
            })
            .collect()
    }

    /// Apply a peer's update. Returns whether anything changed.
    pub fn apply_update(
        &mut self,
        client_id: &str,
        fields: Option<AwarenessFields>,
        timestamp: i64,
    ) -> bool {
        self.apply_update_at(client_id, fields, timestamp, Instant::now())
    }

    pub(crate) fn apply_update_at(
        &mut self,
        client_id: &str,
        fields: Option<AwarenessFields>,
        timestamp: i64,
        now: Instant,
    ) -> bool {
        if client_id == self.local_client {
            return false;
        }
        let Some(fields) = fields else {
            return self.remove(client_id);
        };

        match self.states.get_mut(client_id) {
            Some(existing) => {
                if timestamp < existing.updated_at {
                    return false;
                }
                existing.seen = Some(now);
                existing.updated_at = timestamp;
                if existing.fields == fields {
                    return false;
                }
                existing.fields = fields;
                self.emit(AwarenessEvent::Updated(client_id.to_string()));
                true
            }
            None => {
                self.states.insert(
                    client_id.to_string(),
                    AwarenessState {
                        client_id: client_id.to_string(),
                        fields,
                        updated_at: timestamp,
                        seen: Some(now),
                    },
                );
                self.emit(AwarenessEvent::Added(client_id.to_string()));
                true
            }
        }
    }

    pub fn remove(&mut self, client_id: &str) -> bool {
        let removed = self.states.remove(client_id).is_some();
        if removed {
            self.emit(AwarenessEvent::Removed(client_id.to_string()));
        }
        removed
    }

    pub fn get_states(&self) -> HashMap<ClientId, AwarenessState> {
        self.states.clone()
    }

    pub fn get_state(&self, client_id: &str) -> Option<&AwarenessState> {
        self.states.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop peers that have been silent longer than the timeout
    pub fn remove_stale(&mut self) -> Vec<ClientId> {
        self.remove_stale_at(Instant::now())
    }

    pub(crate) fn remove_stale_at(&mut self, now: Instant) -> Vec<ClientId> {
        let timeout = self.timeout;
        let stale: Vec<ClientId> = self
            .states
            .values()
            .filter(|state| state.client_id != self.local_client)
            .filter(|state| {
                state
                    .last_seen()
                    .map_or(true, |seen| now.saturating_duration_since(seen) > timeout)
            })
            .map(|state| state.client_id.clone())
            .collect();

        for client_id in &stale {
            self.remove(client_id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(index: usize) -> AwarenessFields {
        AwarenessFields::default()
            .with_user("Bob", "#22c55e")
            .with_cursor("main.rs", index)
    }

    #[test]
    fn test_set_local_state_produces_update() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        let msg = awareness.set_local_state(AwarenessFields::default().with_cursor("doc", 3));

        match msg {
            WireMessage::AwarenessUpdate {
                client_id, fields, ..
            } => {
                assert_eq!(client_id, "alice");
                assert_eq!(fields.unwrap().cursor.unwrap().index, 3);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(awareness.local_update().is_some());
        assert_eq!(awareness.len(), 1);
    }

    #[test]
    fn test_peer_expires_without_leave() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        awareness.set_local_state(AwarenessFields::default());
        let start = Instant::now();
        assert!(awareness.apply_update_at("bob", Some(fields(1)), 100, start));

        assert!(awareness
            .remove_stale_at(start + Duration::from_secs(10))
            .is_empty());
        assert_eq!(
            awareness.remove_stale_at(start + Duration::from_secs(16)),
            vec!["bob".to_string()]
        );
        assert!(awareness.get_state("bob").is_none());
        // the local state never expires
        assert!(awareness.get_state("alice").is_some());
    }

    #[test]
    fn test_heartbeat_refreshes_expiry() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        let start = Instant::now();
        awareness.apply_update_at("bob", Some(fields(1)), 100, start);
        // same state retransmitted is not a change, but keeps bob alive
        assert!(!awareness.apply_update_at(
            "bob",
            Some(fields(1)),
            100,
            start + Duration::from_secs(10)
        ));
        assert!(awareness
            .remove_stale_at(start + Duration::from_secs(20))
            .is_empty());
    }

    #[test]
    fn test_older_update_is_superseded() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        awareness.apply_update("bob", Some(fields(5)), 200);
        assert!(!awareness.apply_update("bob", Some(fields(1)), 100));
        let cursor = awareness.get_state("bob").unwrap().fields.cursor.clone();
        assert_eq!(cursor.unwrap().index, 5);
    }

    #[test]
    fn test_events_and_explicit_removal() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        let mut events = awareness.subscribe();

        awareness.apply_update("bob", Some(fields(1)), 1);
        awareness.apply_update("bob", Some(fields(2)), 2);
        awareness.apply_update("bob", None, 3);

        assert_eq!(events.try_recv().unwrap(), AwarenessEvent::Added("bob".into()));
        assert_eq!(events.try_recv().unwrap(), AwarenessEvent::Updated("bob".into()));
        assert_eq!(events.try_recv().unwrap(), AwarenessEvent::Removed("bob".into()));
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut awareness = Awareness::new("alice", Duration::from_secs(15));
        assert!(!awareness.apply_update("alice", Some(fields(1)), 1));
        assert!(awareness.is_empty());
    }
}
