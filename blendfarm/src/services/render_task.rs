/*
    Developer blog:
    - Image and animation used to be two task types with a lot of copy paste between them. An image is
    an animation of one frame that keeps its result instead of handing it off, so there is one task with
    a `TaskKind` telling it where the finished frame goes.
    - Cancel is cooperative. Workers look at the token before taking the next chunk. Nodes with a chunk in
    flight are told to stop and the call is still awaited (up to CANCEL_TIMEOUT), so a node is never left
    rendering for nobody. Anything that comes back after the cancel is thrown away.
    - Nodes that drop out mid render stay out for the rest of the task. The manager can reconnect them
    and the next task picks them up again.
*/
use super::{
    file_sync::FileSynchronizer,
    progress::{ProgressNotifier, Subscription},
    scheduler::{node_shares, ChunkScheduler},
};
use crate::{
    domains::performance_policy::PerformancePolicy,
    models::{
        chunk::{Chunk, Region},
        error::FarmError,
        message::ChunkRequest,
        project_file::ProjectFile,
        render_node::RenderNode,
        render_setting::RenderManagerSettings,
    },
};
use blender::models::format::Format;
use futures::future::join_all;
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use std::{
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

pub type ImageCallback = Arc<dyn Fn(&RgbaImage) + Send + Sync>;
pub type FrameCallback = Arc<dyn Fn(FrameResult) + Send + Sync>;

/// One finished animation frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame: i32,
    /// Encoded in `format`.
    pub data: Vec<u8>,
    pub format: Format,
    /// Task progress once this frame is done.
    pub progress: f64,
}

/// What happens with a finished frame.
#[derive(Clone)]
pub enum TaskKind {
    /// Single frame. `on_update` sees the image fill in chunk by chunk.
    Image { on_update: Option<ImageCallback> },
    /// Frames `start..=end`, handed to `on_frame` in order.
    Animation {
        start: i32,
        end: i32,
        on_frame: FrameCallback,
    },
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Image { on_update } => f
                .debug_struct("Image")
                .field("on_update", &on_update.is_some())
                .finish(),
            TaskKind::Animation { start, end, .. } => f
                .debug_struct("Animation")
                .field("start", start)
                .field("end", end)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Created,
    Syncing,
    Dispatching,
    Rendering,
    Completed,
    Cancelled,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Failed(_))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decode a chunk coming back from a node. Off by one sizes from the renderer's border rounding get
/// scaled to the region.
pub fn decode_chunk(bytes: &[u8], region: Region) -> Result<RgbaImage, FarmError> {
    let tile = image::load_from_memory(bytes)?.to_rgba8();
    if tile.dimensions() == (region.width, region.height) {
        return Ok(tile);
    }
    tracing::debug!(
        "Chunk came back {:?}, expected {}x{}",
        tile.dimensions(),
        region.width,
        region.height
    );
    Ok(imageops::resize(&tile, region.width, region.height, imageops::FilterType::Triangle))
}

/// Encode in the requested format. Formats the image crate cannot write from RGBA fall back to PNG;
/// the returned format is the one actually used.
pub fn encode_image(image: &RgbaImage, format: Format) -> Result<(Vec<u8>, Format), FarmError> {
    let (target, used) = match format {
        Format::PNG => (ImageFormat::Png, Format::PNG),
        Format::JPEG => (ImageFormat::Jpeg, Format::JPEG),
        Format::BMP => (ImageFormat::Bmp, Format::BMP),
        Format::TIFF => (ImageFormat::Tiff, Format::TIFF),
        Format::TGA | Format::RAWTGA => (ImageFormat::Tga, format),
        _ => (ImageFormat::Png, Format::PNG),
    };

    let mut buf = Cursor::new(Vec::new());
    if target == ImageFormat::Jpeg {
        // jpeg has no alpha
        DynamicImage::ImageRgba8(image.clone())
            .to_rgb8()
            .write_to(&mut buf, target)?;
    } else {
        image.write_to(&mut buf, target)?;
    }
    Ok((buf.into_inner(), used))
}

/// Write the image to `path` in `format`. Failing here does not touch the task that made the image.
pub async fn save_image(image: &RgbaImage, path: &Path, format: Format) -> Result<(), FarmError> {
    let (data, _) = encode_image(image, format)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// One render job: a single image or a whole frame range, bound to one version of the project file.
pub struct RenderTask {
    id: Uuid,
    project: ProjectFile,
    file_version: String,
    settings: RenderManagerSettings,
    kind: TaskKind,
    nodes: Vec<Arc<RenderNode>>,
    synchronizer: FileSynchronizer,
    policy: Arc<dyn PerformancePolicy>,
    state: watch::Sender<TaskState>,
    progress: ProgressNotifier,
    started: AtomicBool,
    consumed: AtomicBool,
    token: CancellationToken,
    image: Mutex<Option<RgbaImage>>,
}

impl std::fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTask")
            .field("id", &self.id)
            .field("session", &self.project.session_id)
            .field("file_version", &self.file_version)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

impl RenderTask {
    pub fn new(
        project: ProjectFile,
        file_version: String,
        settings: RenderManagerSettings,
        kind: TaskKind,
        nodes: Vec<Arc<RenderNode>>,
        policy: Arc<dyn PerformancePolicy>,
    ) -> Result<Self, FarmError> {
        settings.validate()?;
        if let TaskKind::Animation { start, end, .. } = &kind {
            if end < start {
                return Err(FarmError::InvalidState(format!(
                    "frame range {start}..{end} ends before it starts"
                )));
            }
        }

        let (state, _) = watch::channel(TaskState::Created);
        Ok(Self {
            id: Uuid::new_v4(),
            project,
            file_version,
            settings,
            kind,
            nodes,
            synchronizer: FileSynchronizer,
            policy,
            state,
            progress: ProgressNotifier::default(),
            started: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
            token: CancellationToken::new(),
            image: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.project.session_id
    }

    pub fn file_version(&self) -> &str {
        &self.file_version
    }

    pub fn settings(&self) -> &RenderManagerSettings {
        &self.settings
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    pub fn state_changes(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> f64 {
        self.progress.value()
    }

    pub fn subscribe(&self, observer: impl Fn(f64) + Send + Sync + 'static) -> Subscription {
        self.progress.subscribe(observer)
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    /// The assembled image of a completed image task.
    pub fn final_image(&self) -> Option<RgbaImage> {
        lock(&self.image).clone()
    }

    fn frames(&self) -> Vec<i32> {
        match &self.kind {
            TaskKind::Image { .. } => vec![self.settings.frame],
            TaskKind::Animation { start, end, .. } => (*start..=*end).collect(),
        }
    }

    fn transition(&self, next: TaskState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            tracing::debug!("Task {} {:?} -> {:?}", self.id, state, next);
            *state = next;
            true
        });
    }

    fn finish(&self, terminal: TaskState) {
        self.progress.close();
        self.transition(terminal);
    }

    fn check_cancelled(&self) -> Result<(), FarmError> {
        if self.token.is_cancelled() {
            return Err(FarmError::Cancelled);
        }
        Ok(())
    }

    /// Run the task to a terminal state. Only the first call does anything; later calls get
    /// `InvalidState`.
    pub async fn render(&self) -> Result<(), FarmError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FarmError::InvalidState(format!("task {} was already started", self.id)));
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(FarmError::InvalidState(format!("task {} is already {:?}", self.id, state)));
        }

        // node cancels go out as soon as the token fires, the workers are still waiting on their calls then.
        let done = CancellationToken::new();
        let (result, ()) = tokio::join!(
            async {
                let result = self.run().await;
                done.cancel();
                result
            },
            async {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        if self.is_consumed() {
                            self.notify_nodes_cancelled().await;
                        }
                    }
                    _ = done.cancelled() => {}
                }
            },
        );
        match result {
            Ok(()) => {
                self.progress.set(1.0);
                self.finish(TaskState::Completed);
                tracing::info!("Task {} completed", self.id);
                Ok(())
            }
            Err(FarmError::Cancelled) => {
                self.finish(TaskState::Cancelled);
                tracing::info!("Task {} cancelled at {:.1}%", self.id, self.progress() * 100.0);
                Err(FarmError::Cancelled)
            }
            Err(e) => {
                tracing::error!("Task {} failed: {e}", self.id);
                self.finish(TaskState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop the task and wait until it reached a terminal state. Progress is kept as it was.
    pub async fn cancel(&self) {
        let mut changes = self.state.subscribe();
        if changes.borrow().is_terminal() {
            return;
        }

        self.token.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.finish(TaskState::Cancelled);
            return;
        }
        loop {
            if changes.borrow_and_update().is_terminal() {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    async fn notify_nodes_cancelled(&self) {
        join_all(self.nodes.iter().filter(|n| n.is_connected()).map(|node| async move {
            match tokio::time::timeout(CANCEL_TIMEOUT, node.cancel(self.id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Node {} did not take the cancel: {e}", node.name),
                Err(_) => tracing::debug!("Node {} did not answer the cancel", node.name),
            }
        }))
        .await;
    }

    async fn run(&self) -> Result<(), FarmError> {
        self.check_cancelled()?;
        self.transition(TaskState::Syncing);

        let connected: Vec<Arc<RenderNode>> = self.nodes.iter().filter(|n| n.is_connected()).cloned().collect();
        if connected.is_empty() {
            return Err(FarmError::InvalidState("no connected nodes to render with".to_owned()));
        }

        let sync = self.synchronizer.sync(&self.project, &self.file_version, &connected);
        tokio::pin!(sync);
        let reports = tokio::select! {
            reports = &mut sync => reports,
            _ = self.token.cancelled() => {
                if tokio::time::timeout(CANCEL_TIMEOUT, sync).await.is_err() {
                    tracing::warn!("Task {} gave up waiting for the sync after cancel", self.id);
                }
                return Err(FarmError::Cancelled);
            }
        };
        let mut active: Vec<Arc<RenderNode>> = connected
            .iter()
            .filter(|n| n.is_session_synced(&self.project.session_id))
            .cloned()
            .collect();
        if active.is_empty() {
            let reason = reports
                .iter()
                .filter_map(|r| r.result.as_ref().err().map(|e| e.to_string()))
                .collect::<Vec<_>>()
                .join("; ");
            let names = reports.iter().map(|r| r.node.as_str()).collect::<Vec<_>>().join(", ");
            return Err(FarmError::sync(names, reason));
        }

        self.check_cancelled()?;
        self.consumed.store(true, Ordering::SeqCst);
        self.transition(TaskState::Dispatching);

        let frames = self.frames();
        let count = frames.len();
        for (index, frame) in frames.into_iter().enumerate() {
            self.check_cancelled()?;
            let image = self.render_frame(frame, index, count, &mut active).await?;
            let progress = (index + 1) as f64 / count as f64;

            match &self.kind {
                TaskKind::Image { .. } => {
                    *lock(&self.image) = Some(image);
                }
                TaskKind::Animation { on_frame, .. } => {
                    let (data, format) = encode_image(&image, self.settings.render_format)?;
                    // frame boundary, a cancel that raced the last chunk wins.
                    self.check_cancelled()?;
                    self.progress.set(progress);
                    on_frame(FrameResult {
                        frame,
                        data,
                        format,
                        progress: self.progress(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn render_frame(
        &self,
        frame: i32,
        index: usize,
        count: usize,
        active: &mut Vec<Arc<RenderNode>>,
    ) -> Result<RgbaImage, FarmError> {
        let shares = node_shares(active, self.settings.use_auto_performance);
        let scheduler = Mutex::new(ChunkScheduler::plan(frame, &self.settings, &shares)?);
        let canvas = Mutex::new(RgbaImage::new(self.settings.output_width, self.settings.output_height));
        let (wake, _) = watch::channel(0u64);
        let frame_ctx = FrameContext {
            frame,
            index,
            count,
            scheduler: &scheduler,
            canvas: &canvas,
            wake: &wake,
        };

        self.transition(TaskState::Rendering);
        tracing::debug!("Task {} frame {frame}: {} chunks on {} nodes", self.id, lock(&scheduler).chunks().len(), active.len());

        let lost: Vec<String> = join_all(active.iter().map(|node| self.worker(node, &frame_ctx)))
            .await
            .into_iter()
            .flatten()
            .collect();
        active.retain(|n| !lost.contains(&n.name));

        self.check_cancelled()?;
        let scheduler = lock(&scheduler);
        if let Some(reason) = scheduler.failure() {
            return Err(FarmError::FrameFailed {
                frame,
                reason: reason.to_owned(),
            });
        }
        if !scheduler.is_complete() {
            return Err(FarmError::FrameFailed {
                frame,
                reason: "no node left that can take the remaining chunks".to_owned(),
            });
        }
        drop(scheduler);

        Ok(canvas.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Pull chunks for one node until the frame settles. Returns the node's name if it dropped out.
    async fn worker(&self, node: &Arc<RenderNode>, ctx: &FrameContext<'_>) -> Option<String> {
        let mut wake = ctx.wake.subscribe();
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            if !node.is_connected() {
                return Some(self.drop_node(node, ctx, "node disconnected"));
            }

            wake.borrow_and_update();
            let next = {
                let mut scheduler = lock(ctx.scheduler);
                if scheduler.is_settled() {
                    return None;
                }
                scheduler.next_for(&node.name).ok_or(scheduler.has_in_flight())
            };

            let chunk = match next {
                Ok(chunk) => chunk,
                // someone else may still hand work back
                Err(true) => {
                    tokio::select! {
                        _ = wake.changed() => {}
                        _ = self.token.cancelled() => return None,
                    }
                    continue;
                }
                Err(false) => return None,
            };

            let request = ChunkRequest {
                job_id: self.id,
                session_id: self.project.session_id,
                file_version: self.file_version.clone(),
                frame: ctx.frame,
                region: chunk.region,
                settings: self.settings.clone(),
            };
            let started = Instant::now();
            let call = node.render_chunk(request);
            tokio::pin!(call);
            let result = tokio::select! {
                result = &mut call => result,
                _ = self.token.cancelled() => {
                    // the node has been told to stop, whatever it answers is dropped
                    if tokio::time::timeout(CANCEL_TIMEOUT, call).await.is_err() {
                        tracing::warn!("Node {} kept chunk {} past the cancel", node.name, chunk.id);
                    }
                    return None;
                }
            };
            if self.token.is_cancelled() {
                return None;
            }
            if !node.is_connected() {
                return Some(self.drop_node(node, ctx, "node disconnected"));
            }

            match result.and_then(|bytes| decode_chunk(&bytes, chunk.region)) {
                Ok(tile) => {
                    self.chunk_done(node, &chunk, &tile, started.elapsed(), ctx);
                }
                Err(e) if e.is_connection() => {
                    node.mark_failed();
                    return Some(self.drop_node(node, ctx, &e.to_string()));
                }
                Err(e) => {
                    tracing::warn!("Chunk {} of frame {} failed on {}: {e}", chunk.id, ctx.frame, node.name);
                    lock(ctx.scheduler).fail_chunk(chunk.id, &node.name, &e.to_string());
                    ctx.wake.send_modify(|v| *v += 1);
                }
            }
        }
    }

    fn drop_node(&self, node: &RenderNode, ctx: &FrameContext<'_>, reason: &str) -> String {
        let moved = lock(ctx.scheduler).remove_node(&node.name);
        tracing::warn!("Node {} left task {} ({reason}), {moved} chunks reassigned", node.name, self.id);
        ctx.wake.send_modify(|v| *v += 1);
        node.name.clone()
    }

    fn chunk_done(&self, node: &RenderNode, chunk: &Chunk, tile: &RgbaImage, elapsed: Duration, ctx: &FrameContext<'_>) {
        let frame_progress = {
            let mut scheduler = lock(ctx.scheduler);
            if !scheduler.complete(chunk.id) {
                return;
            }
            scheduler.progress()
        };

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let sample = chunk.region.area() as f64 / secs;
            node.set_performance(self.policy.update(node.performance(), sample));
        }

        {
            let mut canvas = lock(ctx.canvas);
            imageops::replace(&mut *canvas, tile, chunk.region.x as i64, chunk.region.y as i64);
            if let TaskKind::Image { on_update: Some(on_update) } = &self.kind {
                on_update(&canvas);
            }
        }

        // animation frames report their boundary once the frame callback runs
        let is_last_chunk = frame_progress >= 1.0;
        if !(is_last_chunk && matches!(self.kind, TaskKind::Animation { .. })) {
            self.progress.set((ctx.index as f64 + frame_progress) / ctx.count as f64);
        }
        ctx.wake.send_modify(|v| *v += 1);
    }
}

struct FrameContext<'a> {
    frame: i32,
    index: usize,
    count: usize,
    scheduler: &'a Mutex<ChunkScheduler>,
    canvas: &'a Mutex<RgbaImage>,
    wake: &'a watch::Sender<u64>,
}
