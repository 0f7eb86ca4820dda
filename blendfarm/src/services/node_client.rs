/*
    Developer blog:
    - Each call opens its own connection. A node is typically rendering one chunk and syncing nothing,
    so keeping a pool around buys us very little and a dropped connection never poisons later calls.
    - Errors the node answers with keep their meaning: a failed sync is a sync error, a failed render
    is a backend error. Anything that goes wrong on the socket itself is a connection error.
*/
use super::wire;
use crate::{
    domains::node_client::{NodeClient, NodeConnector},
    models::{
        computer_spec::ComputerSpec,
        error::FarmError,
        message::{ChunkRequest, NodeRequest, NodeResponse, SyncPayload},
    },
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpNodeClient {
    name: String,
    address: String,
    connect_timeout: Duration,
}

impl TcpNodeClient {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn transport(&self, err: FarmError) -> FarmError {
        match err {
            FarmError::Io(e) => FarmError::connection(&self.name, e),
            other => other,
        }
    }

    fn unexpected(&self, response: NodeResponse) -> FarmError {
        FarmError::Protocol(format!("node `{}` answered with {response:?}", self.name))
    }

    async fn call(&self, request: NodeRequest) -> Result<NodeResponse, FarmError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| FarmError::connection(&self.name, format!("timed out connecting to {}", self.address)))?
            .map_err(|e| FarmError::connection(&self.name, e))?;
        stream.set_nodelay(true).map_err(|e| FarmError::connection(&self.name, e))?;

        let mut conn = wire::framed(stream);
        wire::send(&mut conn, &request).await.map_err(|e| self.transport(e))?;
        wire::recv(&mut conn)
            .await
            .map_err(|e| self.transport(e))?
            .ok_or_else(|| FarmError::connection(&self.name, "connection closed before the answer"))
    }
}

#[async_trait::async_trait]
impl NodeClient for TcpNodeClient {
    async fn connect(&self) -> Result<ComputerSpec, FarmError> {
        match self.call(NodeRequest::Hello).await? {
            NodeResponse::Hello(spec) => Ok(spec),
            NodeResponse::Error(e) => Err(FarmError::connection(&self.name, e)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn disconnect(&self) -> Result<(), FarmError> {
        // nothing is kept open between calls
        Ok(())
    }

    async fn sync(&self, payload: SyncPayload) -> Result<(), FarmError> {
        match self.call(NodeRequest::Sync(payload)).await? {
            NodeResponse::Synced => Ok(()),
            NodeResponse::Error(e) => Err(FarmError::sync(&self.name, e)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn render_chunk(&self, request: ChunkRequest) -> Result<Vec<u8>, FarmError> {
        match self.call(NodeRequest::RenderChunk(request)).await? {
            NodeResponse::Chunk(data) => Ok(data),
            NodeResponse::Cancelled => Err(FarmError::Cancelled),
            NodeResponse::Error(e) => Err(FarmError::backend(&self.name, e)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), FarmError> {
        match self.call(NodeRequest::Cancel { job_id }).await? {
            NodeResponse::Cancelled => Ok(()),
            NodeResponse::Error(e) => Err(FarmError::backend(&self.name, e)),
            other => Err(self.unexpected(other)),
        }
    }
}

/// Connects nodes over TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl NodeConnector for TcpConnector {
    fn client_for(&self, name: &str, address: &str) -> Arc<dyn NodeClient> {
        Arc::new(TcpNodeClient::new(name, address))
    }
}
