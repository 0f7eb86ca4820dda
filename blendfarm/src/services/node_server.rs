/*
    Developer blog:
    - This is what `blendfarm client` runs. It used to be a message-io node with its own udp discovery,
    but all a node ever needs is to say hello, receive a file, render a region and stop rendering.
    - Files are stored per session so two hosts (or two projects) can share a node without stepping on
    each other's scene.blend.
    - A cancel can arrive before the render it is meant for (both are in flight on separate connections).
    The token is created on first sight of the job id, so the late render sees it already cancelled.
*/
use super::{file_sync::decompress, wire};
use crate::{
    domains::chunk_renderer::ChunkRenderer,
    models::{
        computer_spec::ComputerSpec,
        error::FarmError,
        message::{ChunkRequest, NodeRequest, NodeResponse, SyncPayload, SyncSource},
        server_setting::ServerSetting,
    },
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SyncedFile {
    version: String,
    path: PathBuf,
}

pub struct NodeServer {
    settings: ServerSetting,
    spec: ComputerSpec,
    renderer: Arc<dyn ChunkRenderer>,
    files: RwLock<HashMap<Uuid, SyncedFile>>,
    jobs: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl NodeServer {
    pub fn new(settings: ServerSetting, spec: ComputerSpec, renderer: Arc<dyn ChunkRenderer>) -> Self {
        Self {
            settings,
            spec,
            renderer,
            files: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ServerSetting {
        &self.settings
    }

    /// Version of the session's file this node holds.
    pub fn file_version(&self, session: &Uuid) -> Option<String> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .map(|f| f.version.clone())
    }

    /// Accept hosts until `shutdown`. Every connection is served on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), FarmError> {
        tracing::info!("Render node listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => break,
            };
            tracing::debug!("Connection from {peer}");
            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, shutdown).await {
                    tracing::warn!("Connection with {peer} ended: {e}");
                }
            });
        }
        tracing::info!("Render node stopped");
        Ok(())
    }

    async fn handle(&self, stream: TcpStream, shutdown: CancellationToken) -> Result<(), FarmError> {
        stream.set_nodelay(true)?;
        let mut conn = wire::framed(stream);
        while let Some(request) = wire::recv::<NodeRequest>(&mut conn).await? {
            let response = tokio::select! {
                response = self.respond(request) => response,
                _ = shutdown.cancelled() => return Ok(()),
            };
            wire::send(&mut conn, &response).await?;
        }
        Ok(())
    }

    pub async fn respond(&self, request: NodeRequest) -> NodeResponse {
        match request {
            NodeRequest::Hello => NodeResponse::Hello(self.spec.clone()),
            NodeRequest::Sync(payload) => match self.store(payload).await {
                Ok(()) => NodeResponse::Synced,
                Err(e) => {
                    tracing::error!("Sync failed: {e}");
                    NodeResponse::Error(e.to_string())
                }
            },
            NodeRequest::RenderChunk(request) => self.render(request).await,
            NodeRequest::Cancel { job_id } => {
                tracing::info!("Cancelling job {job_id}");
                self.job_token(job_id).cancel();
                NodeResponse::Cancelled
            }
        }
    }

    fn job_token(&self, job_id: Uuid) -> CancellationToken {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id)
            .or_default()
            .clone()
    }

    async fn store(&self, payload: SyncPayload) -> Result<(), FarmError> {
        let path = match payload.source {
            SyncSource::Bytes { data, compressed } => {
                // only the name, a host must not pick where on our disk this lands
                let file_name = Path::new(&payload.file_name)
                    .file_name()
                    .ok_or_else(|| FarmError::InvalidState(format!("bad file name {:?}", payload.file_name)))?;
                let dir = self.settings.blend_dir.join(payload.session_id.to_string());
                tokio::fs::create_dir_all(&dir).await?;

                let data = if compressed {
                    tokio::task::spawn_blocking(move || decompress(&data))
                        .await
                        .map_err(|e| FarmError::Io(std::io::Error::other(e)))??
                } else {
                    data
                };
                let path = dir.join(file_name);
                tokio::fs::write(&path, &data).await?;
                tracing::info!("Stored {} bytes at {path:?}", data.len());
                path
            }
            SyncSource::NetworkPath(path) => {
                let path = PathBuf::from(path);
                if !tokio::fs::try_exists(&path).await? {
                    return Err(FarmError::InvalidState(format!("network path {path:?} is not reachable")));
                }
                tracing::info!("Using network file {path:?}");
                path
            }
        };

        self.files.write().unwrap_or_else(PoisonError::into_inner).insert(
            payload.session_id,
            SyncedFile {
                version: payload.file_version,
                path,
            },
        );
        Ok(())
    }

    async fn render(&self, request: ChunkRequest) -> NodeResponse {
        let file = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.session_id)
            .cloned()
            .filter(|f| f.version == request.file_version);
        let Some(file) = file else {
            return NodeResponse::Error(format!(
                "not synced: session {} version {}",
                request.session_id, request.file_version
            ));
        };

        let token = self.job_token(request.job_id);
        if token.is_cancelled() {
            return NodeResponse::Cancelled;
        }

        tracing::debug!("Rendering frame {} region {:?}", request.frame, request.region);
        let output = self.settings.render_dir.join(request.job_id.to_string());
        tokio::select! {
            result = self.renderer.render(&file.path, &request, &output) => match result {
                Ok(data) => NodeResponse::Chunk(data),
                Err(e) => {
                    tracing::error!("Render of frame {} failed: {e}", request.frame);
                    NodeResponse::Error(e.to_string())
                }
            },
            _ = token.cancelled() => NodeResponse::Cancelled,
        }
    }
}
