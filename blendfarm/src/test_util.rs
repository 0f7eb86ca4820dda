//! In-memory render nodes for tests.
use crate::{
    domains::node_client::{NodeClient, NodeConnector},
    models::{
        computer_spec::{ComputerSpec, NodeOs},
        error::FarmError,
        message::{ChunkRequest, SyncPayload},
        render_node::RenderNode,
    },
};
use image::{ImageFormat, Rgba, RgbaImage};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub connect: usize,
    pub disconnect: usize,
    pub sync: usize,
    pub synced: Vec<SyncPayload>,
    pub render: usize,
    pub rendered: Vec<ChunkRequest>,
    pub cancel: usize,
    /// Render calls that ran to the end, whatever they returned.
    pub returned: usize,
}

/// Node that paints every chunk in a flat color.
pub struct MockNodeClient {
    os: NodeOs,
    color: [u8; 4],
    fail_connect: bool,
    fail_sync: bool,
    delay: Duration,
    /// Backend failures to return before rendering works again.
    fail_renders: AtomicUsize,
    /// After this many finished chunks every call fails like a dropped connection.
    disconnect_after: Option<usize>,
    /// Each render waits for a permit when set.
    gate: Option<Arc<Semaphore>>,
    /// How long a gated render takes to notice its job was cancelled.
    cancel_delay: Duration,
    jobs: Mutex<HashMap<Uuid, CancellationToken>>,
    rendered_ok: AtomicUsize,
    calls: Mutex<Calls>,
}

impl Default for MockNodeClient {
    fn default() -> Self {
        Self {
            os: NodeOs::Linux,
            color: [255, 0, 0, 255],
            fail_connect: false,
            fail_sync: false,
            delay: Duration::ZERO,
            fail_renders: AtomicUsize::new(0),
            disconnect_after: None,
            gate: None,
            cancel_delay: Duration::ZERO,
            jobs: Mutex::new(HashMap::new()),
            rendered_ok: AtomicUsize::new(0),
            calls: Mutex::new(Calls::default()),
        }
    }
}

impl MockNodeClient {
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn fail_sync(mut self) -> Self {
        self.fail_sync = true;
        self
    }

    pub fn with_os(mut self, os: NodeOs) -> Self {
        self.os = os;
        self
    }

    pub fn with_color(mut self, color: [u8; 4]) -> Self {
        self.color = color;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_renders(self, count: usize) -> Self {
        self.fail_renders.store(count, Ordering::SeqCst);
        self
    }

    pub fn disconnect_after(mut self, chunks: usize) -> Self {
        self.disconnect_after = Some(chunks);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn slow_to_cancel(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }

    fn job_token(&self, job_id: Uuid) -> CancellationToken {
        self.jobs.lock().unwrap().entry(job_id).or_default().clone()
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    async fn paint(&self, request: ChunkRequest) -> Result<Vec<u8>, FarmError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.render += 1;
            calls.rendered.push(request.clone());
        }
        if self.dropped() {
            return Err(FarmError::connection("mock", "connection reset"));
        }
        if let Some(gate) = &self.gate {
            let token = self.job_token(request.job_id);
            tokio::select! {
                permit = gate.acquire() => permit.unwrap().forget(),
                _ = token.cancelled() => {
                    tokio::time::sleep(self.cancel_delay).await;
                    return Err(FarmError::Cancelled);
                }
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .fail_renders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FarmError::backend("mock", "blender crashed"));
        }

        self.rendered_ok.fetch_add(1, Ordering::SeqCst);
        Ok(solid_png(request.region.width, request.region.height, self.color))
    }

    fn dropped(&self) -> bool {
        self.disconnect_after
            .is_some_and(|limit| self.rendered_ok.load(Ordering::SeqCst) >= limit)
    }
}

pub fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

#[async_trait::async_trait]
impl NodeClient for MockNodeClient {
    async fn connect(&self) -> Result<ComputerSpec, FarmError> {
        self.calls.lock().unwrap().connect += 1;
        if self.fail_connect {
            return Err(FarmError::connection("mock", "connection refused"));
        }
        Ok(ComputerSpec {
            os: self.os,
            ..Default::default()
        })
    }

    async fn disconnect(&self) -> Result<(), FarmError> {
        self.calls.lock().unwrap().disconnect += 1;
        Ok(())
    }

    async fn sync(&self, payload: SyncPayload) -> Result<(), FarmError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.sync += 1;
            calls.synced.push(payload);
        }
        if self.fail_sync {
            return Err(FarmError::sync("mock", "disk full"));
        }
        Ok(())
    }

    async fn render_chunk(&self, request: ChunkRequest) -> Result<Vec<u8>, FarmError> {
        let result = self.paint(request).await;
        self.calls.lock().unwrap().returned += 1;
        result
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), FarmError> {
        self.calls.lock().unwrap().cancel += 1;
        self.job_token(job_id).cancel();
        Ok(())
    }
}

/// Hands out prepared mock clients by node name, a plain working one for unknown names.
#[derive(Default)]
pub struct MockConnector {
    clients: Mutex<HashMap<String, Arc<MockNodeClient>>>,
}

impl MockConnector {
    pub fn with(self, name: &str, client: MockNodeClient) -> Self {
        self.clients.lock().unwrap().insert(name.to_owned(), Arc::new(client));
        self
    }

    pub fn client(&self, name: &str) -> Arc<MockNodeClient> {
        self.clients
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MockNodeClient::default()))
            .clone()
    }
}

impl NodeConnector for MockConnector {
    fn client_for(&self, name: &str, _address: &str) -> Arc<dyn NodeClient> {
        self.client(name)
    }
}

pub async fn connected_node(name: &str, client: MockNodeClient) -> (Arc<RenderNode>, Arc<MockNodeClient>) {
    let client = Arc::new(client);
    let node = Arc::new(RenderNode::new(name, format!("{name}:15000"), client.clone()));
    node.connect().await.unwrap();
    (node, client)
}
