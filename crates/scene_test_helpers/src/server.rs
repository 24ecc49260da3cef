//! Scripted server-of-record
//!
//! [`FakeServer`] answers the client the way a cooperative server would:
//! creates and deletes are confirmed and lock requests are granted, each
//! only when enabled.

use scene_config::Config;
use scene_sync::{
    ChannelLink, ClientId, HostStore, LocalOp, NodeId, PropertyTranslator, RemoteOp, ServerEndpoint, SyncEngine,
};
use std::collections::HashMap;

pub struct FakeServer {
    endpoint: ServerEndpoint,
    next_id: NodeId,
    assigned: HashMap<u64, NodeId>,
    pub confirm_creates: bool,
    pub confirm_deletes: bool,
    pub grant_locks: bool,
    /// Every op received so far
    pub received: Vec<LocalOp>,
}

impl FakeServer {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            next_id: 100,
            assigned: HashMap::new(),
            confirm_creates: true,
            confirm_deletes: true,
            grant_locks: true,
            received: Vec::new(),
        }
    }

    /// A server that never answers on its own
    pub fn silent(endpoint: ServerEndpoint) -> Self {
        Self {
            confirm_creates: false,
            confirm_deletes: false,
            grant_locks: false,
            ..Self::new(endpoint)
        }
    }

    /// Deliver an op to the client
    pub fn push(&self, op: RemoteOp) {
        self.endpoint.push(op).expect("client link dropped");
    }

    /// Id assigned to a client-created node
    pub fn id_for(&self, local_key: u64) -> Option<NodeId> {
        self.assigned.get(&local_key).copied()
    }

    /// Receive everything sent since the last pump and queue the scripted replies
    pub fn pump(&mut self) -> Vec<LocalOp> {
        let batch = self.endpoint.drain();
        for op in &batch {
            match op {
                LocalOp::Create { local_key, .. } if self.confirm_creates => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.assigned.insert(*local_key, id);
                    self.push(RemoteOp::ConfirmCreate {
                        local_key: *local_key,
                        id,
                    });
                }
                LocalOp::Delete { id } if self.confirm_deletes => {
                    self.push(RemoteOp::ConfirmDelete { id: *id });
                }
                LocalOp::Lock { id, .. } if self.grant_locks => {
                    self.push(RemoteOp::DirectLockChange { id: *id, held: true });
                }
                _ => {}
            }
        }
        self.received.extend(batch.iter().cloned());
        batch
    }

    /// Tick and pump until neither side has anything left to say
    pub fn settle(&mut self, engine: &mut SyncEngine, hosts: &mut dyn HostStore) -> Vec<LocalOp> {
        let mut sent = Vec::new();
        for _ in 0..8 {
            let report = engine.tick(hosts).expect("tick failed");
            let batch = self.pump();
            if report.remote_ops == 0 && batch.is_empty() {
                break;
            }
            sent.extend(batch);
        }
        sent
    }
}

/// Default configuration for client 1
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.client_id = ClientId(1);
    config.session.client_name = "Test Client".to_string();
    config
}

/// Engine with translators for every test object type
pub fn engine_with_config(config: Config) -> (SyncEngine, FakeServer) {
    let (link, endpoint) = ChannelLink::pair(config.session.client_id);
    let mut engine = SyncEngine::new(config, Box::new(link)).expect("invalid test config");
    for tag in ["Transform", "Crate", "Light"] {
        engine
            .register(Box::new(PropertyTranslator::new(tag)))
            .expect("duplicate translator");
    }
    (engine, FakeServer::new(endpoint))
}

pub fn test_engine() -> (SyncEngine, FakeServer) {
    engine_with_config(test_config())
}
