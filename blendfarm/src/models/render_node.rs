/*
    Developer blog:
    - RenderNode used to be a plain name + SocketAddr pair. Now it is the handle the whole farm shares:
    the manager owns it, a running task only borrows an Arc for as long as the job lasts.
    - Connection and sync state sit behind a std RwLock. Nothing awaits while holding it, and the
    scheduler needs a cheap synchronous read of `is_session_synced`.
    - One render call and one sync call at a time per node. The tokio mutexes below enforce that, even
    when two tasks (old one cancelling, new one starting) touch the same node.
*/
use super::{
    computer_spec::ComputerSpec,
    error::FarmError,
    message::{ChunkRequest, SyncPayload},
};
use crate::domains::node_client::NodeClient;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    ConnectionChanged {
        node: String,
        state: ConnectionState,
    },
    SyncChanged {
        node: String,
        session: Uuid,
        synced: bool,
    },
}

#[derive(Debug, Default)]
struct NodeState {
    connection: ConnectionState,
    synced: HashMap<Uuid, bool>,
    /// Pixels per second, as estimated by the performance policy.
    performance: Option<f64>,
    spec: Option<ComputerSpec>,
}

pub struct RenderNode {
    pub name: String,
    pub address: String,
    client: Arc<dyn NodeClient>,
    state: RwLock<NodeState>,
    render_lock: Mutex<()>,
    sync_lock: Mutex<()>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for RenderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderNode")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("connection", &self.connection())
            .finish()
    }
}

impl RenderNode {
    pub fn new(name: impl Into<String>, address: impl Into<String>, client: Arc<dyn NodeClient>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            name: name.into(),
            address: address.into(),
            client,
            state: RwLock::new(NodeState::default()),
            render_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            events,
        }
    }

    // a panic while holding the lock leaves plain data behind, still fine to read.
    fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.read().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection() == ConnectionState::Connected
    }

    pub fn spec(&self) -> Option<ComputerSpec> {
        self.read().spec.clone()
    }

    fn set_connection(&self, state: ConnectionState) {
        let changed = {
            let mut guard = self.write();
            let changed = guard.connection != state;
            guard.connection = state;
            changed
        };
        if changed {
            // no subscriber is fine.
            let _ = self.events.send(NodeEvent::ConnectionChanged {
                node: self.name.clone(),
                state,
            });
        }
    }

    /// Handshake with the node. Does not retry; a failure leaves the node in `Failed`.
    pub async fn connect(&self) -> Result<(), FarmError> {
        if self.is_connected() {
            return Ok(());
        }

        self.set_connection(ConnectionState::Connecting);
        match self.client.connect().await {
            Ok(spec) => {
                tracing::info!("Connected to node {} at {} ({:?})", self.name, self.address, spec.os);
                self.write().spec = Some(spec);
                self.set_connection(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Fail to connect to node {}: {e}", self.name);
                self.set_connection(ConnectionState::Failed);
                match e {
                    FarmError::Connection { .. } => Err(e),
                    other => Err(FarmError::connection(&self.name, other)),
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("Node {} did not disconnect cleanly: {e}", self.name);
        }
        self.clear_synced();
        self.set_connection(ConnectionState::Disconnected);
    }

    /// Called when a call to the node failed at the transport level.
    pub fn mark_failed(&self) {
        self.clear_synced();
        self.set_connection(ConnectionState::Failed);
    }

    pub fn is_session_synced(&self, session: &Uuid) -> bool {
        self.read().synced.get(session).copied().unwrap_or(false)
    }

    pub fn mark_synced(&self, session: Uuid, synced: bool) {
        let previous = self.write().synced.insert(session, synced);
        if previous != Some(synced) {
            let _ = self.events.send(NodeEvent::SyncChanged {
                node: self.name.clone(),
                session,
                synced,
            });
        }
    }

    fn clear_synced(&self) {
        let sessions: Vec<Uuid> = self.read().synced.keys().copied().collect();
        for session in sessions {
            self.mark_synced(session, false);
        }
    }

    pub fn performance(&self) -> Option<f64> {
        self.read().performance
    }

    pub fn set_performance(&self, value: f64) {
        self.write().performance = Some(value);
    }

    pub async fn sync(&self, payload: SyncPayload) -> Result<(), FarmError> {
        let _guard = self.sync_lock.lock().await;
        self.client.sync(payload).await
    }

    pub async fn render_chunk(&self, request: ChunkRequest) -> Result<Vec<u8>, FarmError> {
        let _guard = self.render_lock.lock().await;
        self.client.render_chunk(request).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<(), FarmError> {
        self.client.cancel(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockNodeClient;

    #[tokio::test]
    async fn connect_moves_to_connected() {
        let node = RenderNode::new("alpha", "127.0.0.1:15000", Arc::new(MockNodeClient::default()));
        let mut events = node.subscribe();

        node.connect().await.unwrap();
        assert!(node.is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::ConnectionChanged {
                node: "alpha".to_owned(),
                state: ConnectionState::Connecting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::ConnectionChanged {
                node: "alpha".to_owned(),
                state: ConnectionState::Connected
            }
        );
    }

    #[tokio::test]
    async fn failed_connect_is_not_retried() {
        let client = Arc::new(MockNodeClient::default().fail_connect());
        let node = RenderNode::new("beta", "10.0.0.2:15000", client.clone());

        let err = node.connect().await.unwrap_err();
        assert!(matches!(err, FarmError::Connection { .. }));
        assert_eq!(node.connection(), ConnectionState::Failed);
        assert_eq!(client.calls().connect, 1);
    }

    #[tokio::test]
    async fn sync_state_is_per_session() {
        let node = RenderNode::new("gamma", "10.0.0.3:15000", Arc::new(MockNodeClient::default()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        node.mark_synced(a, true);
        assert!(node.is_session_synced(&a));
        assert!(!node.is_session_synced(&b));

        node.disconnect().await;
        assert!(!node.is_session_synced(&a));
        assert_eq!(node.connection(), ConnectionState::Disconnected);
    }
}
