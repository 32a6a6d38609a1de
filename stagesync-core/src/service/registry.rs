//! In-memory directory of connected clients.
//!
//! All "who is connected" state lives here behind a narrow transactional
//! contract: `register`, `resume`, `update_tags`, `mark_state`, `touch`,
//! `lookup`, `evict`, `sweep`. Connection tasks never mutate entries
//! directly. The registry does not log; state transitions are emitted on a
//! broadcast channel for whoever wants to observe them.

use std::collections::HashSet;

use dashmap::DashMap;
use stagesync_proto::{ClientId, TargetSelector};
use tokio::sync::broadcast;

use crate::models::{ClientIdentity, ConnectionState};
use crate::{Error, Result};

/// Timeout budgets driving the Active -> Degraded -> Disconnected -> evicted
/// ladder. Each threshold is measured against `last_seen_ms` and must be
/// strictly increasing.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// No heartbeat answered for this long: Active -> Degraded.
    pub degraded_after_ms: i64,
    /// Still silent: Degraded -> Disconnected.
    pub disconnected_after_ms: i64,
    /// Grace period for resumption; after this the entry is evicted and
    /// the ID freed for reuse by a new handshake.
    pub evicted_after_ms: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            degraded_after_ms: 5_000,
            disconnected_after_ms: 15_000,
            evicted_after_ms: 60_000,
        }
    }
}

/// Observable registry transitions.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        id: ClientId,
    },
    Resumed {
        id: ClientId,
    },
    StateChanged {
        id: ClientId,
        from: ConnectionState,
        to: ConnectionState,
    },
    TagsUpdated {
        id: ClientId,
    },
    Evicted {
        id: ClientId,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientIdentity>,
    events: broadcast::Sender<RegistryEvent>,
    config: RegistryConfig,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clients: DashMap::new(),
            events,
            config,
        }
    }

    /// Subscribe to registry transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a freshly handshaken client.
    ///
    /// Fails with `IdentityConflict` if an active (non-Disconnected) entry
    /// with the same ID already exists: a reconnect must either wait out the
    /// prior entry or present a resumption token via [`resume`].
    ///
    /// [`resume`]: ClientRegistry::resume
    pub fn register(&self, identity: ClientIdentity) -> Result<()> {
        let id = identity.id.clone();
        match self.clients.entry(id.clone()) {
            dashmap::Entry::Occupied(mut occupied) => {
                if occupied.get().state != ConnectionState::Disconnected {
                    return Err(Error::IdentityConflict(id));
                }
                occupied.insert(identity);
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(identity);
            }
        }
        let _ = self.events.send(RegistryEvent::Registered { id });
        Ok(())
    }

    /// Atomically reclaim an existing entry with a resumption token.
    ///
    /// Succeeds in any pre-eviction state, replacing the prior connection's
    /// claim; tags and capabilities carry over. Returns the resumed identity.
    pub fn resume(&self, id: &ClientId, token: &str, now_ms: i64) -> Result<ClientIdentity> {
        let mut entry = self
            .clients
            .get_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;

        if entry.resume_token != token {
            return Err(Error::InvalidResumeToken(id.clone()));
        }

        let from = entry.state;
        entry.state = ConnectionState::Active;
        entry.last_seen_ms = now_ms;
        let identity = entry.clone();
        drop(entry);

        if from != ConnectionState::Active {
            let _ = self.events.send(RegistryEvent::StateChanged {
                id: id.clone(),
                from,
                to: ConnectionState::Active,
            });
        }
        let _ = self.events.send(RegistryEvent::Resumed { id: id.clone() });
        Ok(identity)
    }

    pub fn update_tags(&self, id: &ClientId, tags: HashSet<String>) -> Result<()> {
        let mut entry = self
            .clients
            .get_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;
        entry.tags = tags;
        drop(entry);
        let _ = self.events.send(RegistryEvent::TagsUpdated { id: id.clone() });
        Ok(())
    }

    /// Request a state transition. No-op when the state is unchanged.
    pub fn mark_state(&self, id: &ClientId, state: ConnectionState) -> Result<()> {
        let mut entry = self
            .clients
            .get_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;
        let from = entry.state;
        if from == state {
            return Ok(());
        }
        entry.state = state;
        drop(entry);
        let _ = self.events.send(RegistryEvent::StateChanged {
            id: id.clone(),
            from,
            to: state,
        });
        Ok(())
    }

    /// Record liveness (heartbeat or probe answered). A Degraded client
    /// that answers again is promoted back to Active.
    pub fn touch(&self, id: &ClientId, now_ms: i64) -> Result<()> {
        let mut entry = self
            .clients
            .get_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;
        entry.last_seen_ms = now_ms;
        let from = entry.state;
        if from == ConnectionState::Degraded {
            entry.state = ConnectionState::Active;
            drop(entry);
            let _ = self.events.send(RegistryEvent::StateChanged {
                id: id.clone(),
                from,
                to: ConnectionState::Active,
            });
        }
        Ok(())
    }

    /// Resolve a target selector to reachable client IDs (Active or
    /// Degraded). Capability filtering is the scheduler's concern.
    #[must_use]
    pub fn lookup(&self, selector: &TargetSelector) -> Vec<ClientId> {
        match selector {
            TargetSelector::All => self
                .clients
                .iter()
                .filter(|entry| entry.state.is_reachable())
                .map(|entry| entry.id.clone())
                .collect(),
            TargetSelector::ByTag { tag } => self
                .clients
                .iter()
                .filter(|entry| entry.state.is_reachable() && entry.has_tag(tag))
                .map(|entry| entry.id.clone())
                .collect(),
            TargetSelector::ByIdSet { ids } => ids
                .iter()
                .filter(|id| {
                    self.clients
                        .get(*id)
                        .is_some_and(|entry| entry.state.is_reachable())
                })
                .cloned()
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &ClientId) -> Option<ClientIdentity> {
        self.clients.get(id).map(|entry| entry.clone())
    }

    /// Remove an entry outright, freeing the ID for reuse.
    pub fn evict(&self, id: &ClientId) {
        if self.clients.remove(id).is_some() {
            let _ = self.events.send(RegistryEvent::Evicted { id: id.clone() });
        }
    }

    /// Walk the timeout ladder for every entry. Returns the IDs evicted in
    /// this pass so the caller can release co-owned state (clock estimates,
    /// outbound queues).
    pub fn sweep(&self, now_ms: i64) -> Vec<ClientId> {
        let mut to_degrade = Vec::new();
        let mut to_disconnect = Vec::new();
        let mut to_evict = Vec::new();

        for entry in &self.clients {
            let silent_for = now_ms - entry.last_seen_ms;
            match entry.state {
                ConnectionState::Active | ConnectionState::Connecting
                    if silent_for > self.config.degraded_after_ms =>
                {
                    to_degrade.push(entry.id.clone());
                }
                ConnectionState::Degraded
                    if silent_for > self.config.disconnected_after_ms =>
                {
                    to_disconnect.push(entry.id.clone());
                }
                ConnectionState::Disconnected
                    if silent_for > self.config.evicted_after_ms =>
                {
                    to_evict.push(entry.id.clone());
                }
                _ => {}
            }
        }

        for id in &to_degrade {
            let _ = self.mark_state(id, ConnectionState::Degraded);
        }
        for id in &to_disconnect {
            let _ = self.mark_state(id, ConnectionState::Disconnected);
        }
        for id in &to_evict {
            self.evict(id);
        }

        to_evict
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagesync_proto::Capability;

    fn identity(tags: &[&str], caps: &[Capability]) -> ClientIdentity {
        ClientIdentity::new(
            tags.iter().map(ToString::to_string).collect(),
            caps.to_vec(),
            0,
        )
    }

    #[test]
    fn test_register_and_lookup_all() {
        let registry = ClientRegistry::default();
        let a = identity(&["zone-left"], &[Capability::Color]);
        let b = identity(&["zone-right"], &[Capability::Color]);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        let mut found = registry.lookup(&TargetSelector::All);
        found.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_duplicate_identity_rejected_while_active() {
        let registry = ClientRegistry::default();
        let a = identity(&[], &[Capability::Color]);
        registry.register(a.clone()).unwrap();

        let result = registry.register(a.clone());
        assert!(matches!(result, Err(Error::IdentityConflict(_))));

        // Once the prior entry is Disconnected the ID is reusable.
        registry
            .mark_state(&a.id, ConnectionState::Disconnected)
            .unwrap();
        assert!(registry.register(a).is_ok());
    }

    #[test]
    fn test_resume_preserves_tags_and_capabilities() {
        let registry = ClientRegistry::default();
        let original = identity(&["lighting", "zone-center"], &[Capability::Color]);
        registry.register(original.clone()).unwrap();
        registry
            .mark_state(&original.id, ConnectionState::Disconnected)
            .unwrap();

        let resumed = registry
            .resume(&original.id, &original.resume_token, 500)
            .unwrap();
        assert_eq!(resumed.id, original.id);
        assert_eq!(resumed.tags, original.tags);
        assert_eq!(resumed.capabilities, original.capabilities);
        assert_eq!(resumed.state, ConnectionState::Active);
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_resume_with_bad_token_rejected() {
        let registry = ClientRegistry::default();
        let original = identity(&[], &[Capability::Text]);
        registry.register(original.clone()).unwrap();

        let result = registry.resume(&original.id, "wrong-token", 500);
        assert!(matches!(result, Err(Error::InvalidResumeToken(_))));
    }

    #[test]
    fn test_lookup_by_tag_excludes_disconnected() {
        let registry = ClientRegistry::default();
        let tagged = identity(&["zone-center"], &[Capability::Color]);
        let other = identity(&["zone-left"], &[Capability::Color]);
        let gone = identity(&["zone-center"], &[Capability::Color]);
        registry.register(tagged.clone()).unwrap();
        registry.register(other).unwrap();
        registry.register(gone.clone()).unwrap();
        registry
            .mark_state(&gone.id, ConnectionState::Disconnected)
            .unwrap();

        let found = registry.lookup(&TargetSelector::ByTag {
            tag: "zone-center".to_string(),
        });
        assert_eq!(found, vec![tagged.id]);
    }

    #[test]
    fn test_lookup_by_id_set_intersects_state_filter() {
        let registry = ClientRegistry::default();
        let a = identity(&[], &[Capability::Sound]);
        let b = identity(&[], &[Capability::Sound]);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry
            .mark_state(&b.id, ConnectionState::Disconnected)
            .unwrap();

        let found = registry.lookup(&TargetSelector::ByIdSet {
            ids: vec![a.id.clone(), b.id, ClientId::from("nonexistent00")],
        });
        assert_eq!(found, vec![a.id]);
    }

    #[test]
    fn test_update_tags_moves_client_between_zones() {
        let registry = ClientRegistry::default();
        let mut events = registry.subscribe();
        let a = identity(&["zone-left"], &[Capability::Color]);
        registry.register(a.clone()).unwrap();

        registry
            .update_tags(&a.id, ["zone-center".to_string()].into())
            .unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::Registered { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::TagsUpdated { .. }
        ));

        // The client answers under its new tag only.
        assert!(registry
            .lookup(&TargetSelector::ByTag {
                tag: "zone-left".to_string(),
            })
            .is_empty());
        assert_eq!(
            registry.lookup(&TargetSelector::ByTag {
                tag: "zone-center".to_string(),
            }),
            vec![a.id.clone()]
        );

        let unknown = ClientId::from("nonexistent00");
        assert!(matches!(
            registry.update_tags(&unknown, HashSet::new()),
            Err(Error::UnknownClient(_))
        ));
    }

    #[test]
    fn test_touch_promotes_degraded_back_to_active() {
        let registry = ClientRegistry::default();
        let a = identity(&[], &[Capability::Color]);
        registry.register(a.clone()).unwrap();
        registry
            .mark_state(&a.id, ConnectionState::Degraded)
            .unwrap();

        registry.touch(&a.id, 1_000).unwrap();
        assert_eq!(registry.get(&a.id).unwrap().state, ConnectionState::Active);
    }

    #[test]
    fn test_sweep_walks_the_timeout_ladder() {
        let config = RegistryConfig {
            degraded_after_ms: 100,
            disconnected_after_ms: 200,
            evicted_after_ms: 300,
        };
        let registry = ClientRegistry::new(config);
        let a = identity(&[], &[Capability::Color]);
        let id = a.id.clone();
        registry.register(a).unwrap();

        assert!(registry.sweep(50).is_empty());
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Active);

        registry.sweep(150);
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Degraded);

        registry.sweep(250);
        assert_eq!(
            registry.get(&id).unwrap().state,
            ConnectionState::Disconnected
        );

        let evicted = registry.sweep(350);
        assert_eq!(evicted, vec![id.clone()]);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_state_changes_emit_events() {
        let registry = ClientRegistry::default();
        let mut events = registry.subscribe();
        let a = identity(&[], &[Capability::Color]);
        registry.register(a.clone()).unwrap();
        registry
            .mark_state(&a.id, ConnectionState::Degraded)
            .unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::Registered { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::StateChanged {
                from: ConnectionState::Active,
                to: ConnectionState::Degraded,
                ..
            }
        ));
    }
}
