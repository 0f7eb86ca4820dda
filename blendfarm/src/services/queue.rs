/*
    Developer blog:
    - The queue used to poll every half second for the next item. It now sleeps until something changes:
    an item added, the queue enabled, or a task finishing.
    - Queue items only go through the manager's public task api. Whatever the window can do, the queue
    can do, and nothing more.
    - Turning the queue off while it still has work is refused. Cancel or remove the items first.
    - Animation frames are written by an async writer next to the render, the frame callback only hands
    them over. An item shows as completed once its files are on disk, not when the last chunk lands.
*/
use super::{
    blend_farm_manager::BlendFarmManager,
    render_task::{save_image, FrameCallback, FrameResult, RenderTask, TaskKind, TaskState},
};
use crate::{
    domains::queue_operator::QueueOperator,
    models::{
        error::{FarmError, QueueError},
        render_setting::RenderManagerSettings,
    },
};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch, Notify,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueStatus {
    Queued,
    Rendering(f64),
    Cancelled,
    Completed,
}

impl QueueStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Rendering(_))
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Queued => write!(f, "Queued"),
            QueueStatus::Rendering(progress) => write!(f, "Rendering {:.2}%", progress * 100.0),
            QueueStatus::Cancelled => write!(f, "Cancelled"),
            QueueStatus::Completed => write!(f, "Completed"),
        }
    }
}

/// One pending render. More than one frame makes it an animation starting at `settings.frame`.
pub struct QueueItem {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Image file for single frames, folder for animations.
    pub output: Option<PathBuf>,
    pub frame_count: u32,
    /// File name of animation frames, `#` is replaced by the frame number.
    pub frame_format: String,
    settings: Mutex<RenderManagerSettings>,
    task: Mutex<Option<Arc<RenderTask>>>,
    cancelled: AtomicBool,
    restart: AtomicBool,
    /// Output written, set after the task completed.
    saved: AtomicBool,
    error: Mutex<Option<String>>,
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("frame_count", &self.frame_count)
            .field("status", &self.status())
            .finish()
    }
}

impl QueueItem {
    pub fn new(session_id: Uuid, settings: RenderManagerSettings, output: Option<PathBuf>, frame_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            output,
            frame_count: frame_count.max(1),
            frame_format: format!("#.{}", settings.render_format.extension()),
            settings: Mutex::new(settings),
            task: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            saved: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> RenderManagerSettings {
        lock(&self.settings).clone()
    }

    pub fn task(&self) -> Option<Arc<RenderTask>> {
        lock(&self.task).clone()
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    fn set_error(&self, message: String) {
        *lock(&self.error) = Some(message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_animation(&self) -> bool {
        self.frame_count > 1
    }

    pub fn status(&self) -> QueueStatus {
        if self.is_cancelled() {
            return QueueStatus::Cancelled;
        }
        let Some(task) = self.task() else {
            return QueueStatus::Queued;
        };
        match task.state() {
            TaskState::Completed if self.saved.load(Ordering::SeqCst) => QueueStatus::Completed,
            TaskState::Completed => QueueStatus::Rendering(1.0),
            TaskState::Cancelled | TaskState::Failed(_) if self.restart.load(Ordering::SeqCst) => QueueStatus::Queued,
            TaskState::Cancelled | TaskState::Failed(_) => QueueStatus::Cancelled,
            _ if task.progress() > 0.0 => QueueStatus::Rendering(task.progress()),
            _ => QueueStatus::Queued,
        }
    }

    /// What a queue list shows: the status, or the error that cancelled the item.
    pub fn status_text(&self) -> String {
        match (self.status(), self.error()) {
            (QueueStatus::Cancelled, Some(error)) => error,
            (status, _) => status.to_string(),
        }
    }

    pub fn with_frame_format(mut self, frame_format: impl Into<String>) -> Self {
        self.frame_format = frame_format.into();
        self
    }

    fn validate(&self) -> Result<(), FarmError> {
        self.settings().validate()?;
        if self.is_animation() {
            if self.output.is_none() {
                return Err(FarmError::InvalidState("an animation needs an output folder".to_owned()));
            }
            if !self.frame_format.contains('#') {
                return Err(FarmError::InvalidState(format!(
                    "frame format {:?} has no # for the frame number",
                    self.frame_format
                )));
            }
        }
        Ok(())
    }

    fn frame_path(&self, frame: i32) -> Option<PathBuf> {
        self.output
            .as_ref()
            .map(|dir| dir.join(self.frame_format.replace('#', &frame.to_string())))
    }
}

/// Runs queue items one after the other through the manager.
pub struct RenderQueue {
    manager: Arc<BlendFarmManager>,
    operator: Arc<dyn QueueOperator>,
    items: Mutex<Vec<Arc<QueueItem>>>,
    enabled: watch::Sender<bool>,
    changed: Notify,
}

impl RenderQueue {
    pub fn new(manager: Arc<BlendFarmManager>, operator: Arc<dyn QueueOperator>) -> Self {
        let (enabled, _) = watch::channel(false);
        Self {
            manager,
            operator,
            items: Mutex::new(Vec::new()),
            enabled,
            changed: Notify::new(),
        }
    }

    pub fn enqueue(
        &self,
        session_id: Uuid,
        settings: RenderManagerSettings,
        output: Option<PathBuf>,
        frame_count: u32,
    ) -> Result<Arc<QueueItem>, QueueError> {
        self.push(QueueItem::new(session_id, settings, output, frame_count))
    }

    pub fn push(&self, item: QueueItem) -> Result<Arc<QueueItem>, QueueError> {
        item.validate()?;
        let item = Arc::new(item);
        lock(&self.items).push(item.clone());
        tracing::info!("Queued {} ({} frames)", item.id, item.frame_count);
        self.changed.notify_one();
        Ok(item)
    }

    pub fn items(&self) -> Vec<Arc<QueueItem>> {
        lock(&self.items).clone()
    }

    pub fn item(&self, id: Uuid) -> Result<Arc<QueueItem>, QueueError> {
        lock(&self.items)
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(QueueError::ItemNotFound(id))
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.items).iter().filter(|i| i.status().is_active()).count()
    }

    /// Turning the queue off is refused while items are waiting or rendering.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), QueueError> {
        if !enabled {
            let active = self.active_count();
            if active > 0 {
                return Err(QueueError::NotEmpty(active));
            }
        }
        self.enabled.send_replace(enabled);
        Ok(())
    }

    fn halt(&self) {
        tracing::warn!("Queue halted");
        self.enabled.send_replace(false);
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), QueueError> {
        let item = self.item(id)?;
        item.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = item.task() {
            task.cancel().await;
        }
        self.changed.notify_one();
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        self.cancel(id).await?;
        lock(&self.items).retain(|i| i.id != id);
        Ok(())
    }

    /// Replace the settings. A render in progress is cancelled and the item starts over with them.
    pub async fn update_settings(&self, id: Uuid, settings: RenderManagerSettings) -> Result<(), QueueError> {
        settings.validate()?;
        let item = self.item(id)?;
        *lock(&item.settings) = settings;

        if let Some(task) = item.task().filter(|t| !t.state().is_terminal()) {
            item.restart.store(true, Ordering::SeqCst);
            task.cancel().await;
        }
        self.changed.notify_one();
        Ok(())
    }

    fn next_item(&self) -> Option<Arc<QueueItem>> {
        lock(&self.items)
            .iter()
            .find(|item| {
                item.status() == QueueStatus::Queued
                    && item.task().is_none()
                    && !self.manager.is_rendering(item.session_id)
            })
            .cloned()
    }

    /// Task of another caller that keeps a queued item from starting.
    fn blocking_task(&self) -> Option<Arc<RenderTask>> {
        lock(&self.items)
            .iter()
            .filter(|item| item.status() == QueueStatus::Queued && item.task().is_none())
            .find_map(|item| {
                self.manager
                    .current_task(item.session_id)
                    .filter(|task| !task.state().is_terminal())
            })
    }

    async fn finished(task: Option<Arc<RenderTask>>) {
        let Some(task) = task else {
            return std::future::pending().await;
        };
        let mut changes = task.state_changes();
        while !changes.borrow_and_update().is_terminal() {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Process items until `shutdown`. Waits while the queue is disabled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut enabled = self.enabled.subscribe();
        loop {
            while !*enabled.borrow_and_update() {
                tokio::select! {
                    changed = enabled.changed() => if changed.is_err() { return },
                    _ = shutdown.cancelled() => return,
                }
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(item) = self.next_item() else {
                let blocker = self.blocking_task();
                tokio::select! {
                    _ = notified => {}
                    _ = enabled.changed() => {}
                    _ = Self::finished(blocker) => {}
                    _ = shutdown.cancelled() => return,
                }
                continue;
            };

            match self.execute(&item).await {
                Ok(()) => {}
                Err(FarmError::Cancelled) if item.restart.swap(false, Ordering::SeqCst) => {
                    tracing::info!("Restarting {} with new settings", item.id);
                    *lock(&item.task) = None;
                }
                Err(FarmError::Cancelled) if item.is_cancelled() => {}
                Err(e) => {
                    tracing::error!("Queue item {} failed: {e}", item.id);
                    item.cancelled.store(true, Ordering::SeqCst);
                    item.set_error(e.to_string());
                    if !self.operator.continue_after_error(&item, &e).await {
                        self.halt();
                    }
                }
            }
        }
    }

    async fn execute(&self, item: &Arc<QueueItem>) -> Result<(), FarmError> {
        let settings = item.settings();
        item.saved.store(false, Ordering::SeqCst);
        let (frames, mut finished_frames) = mpsc::unbounded_channel();
        let task = if item.is_animation() {
            let start = settings.frame;
            let end = start + item.frame_count as i32 - 1;
            self.manager
                .get_animation_task(item.session_id, start, end, settings.clone(), Self::frame_saver(frames))
                .await?
        } else {
            self.manager.get_image_task(item.session_id, settings.clone(), None).await?
        };
        *lock(&item.task) = Some(task.clone());

        // cancelled or edited while the task was being set up
        if item.is_cancelled() || item.restart.load(Ordering::SeqCst) {
            task.cancel().await;
            return Err(FarmError::Cancelled);
        }

        let rendered = CancellationToken::new();
        let (result, ()) = tokio::join!(
            async {
                let result = Self::start_render(&task).await;
                rendered.cancel();
                result
            },
            Self::write_frames(item, &mut finished_frames, &rendered),
        );
        result?;

        if let (TaskKind::Image { .. }, Some(path)) = (task.kind(), &item.output) {
            if let Some(image) = task.final_image() {
                // a failed save is reported, the render itself still counts as done
                if let Err(e) = save_image(&image, path, settings.render_format).await {
                    tracing::error!("Unable to save {path:?}: {e}");
                    item.set_error(e.to_string());
                }
            }
        }
        item.saved.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Render `task`. A cancel that lands between setup and the first render call reads as a cancel.
    async fn start_render(task: &RenderTask) -> Result<(), FarmError> {
        match task.render().await {
            Err(FarmError::InvalidState(_)) if task.state() == TaskState::Cancelled => Err(FarmError::Cancelled),
            result => result,
        }
    }

    fn frame_saver(frames: UnboundedSender<FrameResult>) -> FrameCallback {
        Arc::new(move |result: FrameResult| {
            if let Err(e) = frames.send(result) {
                tracing::debug!("Frame {} done after its item went away", e.0.frame);
            }
        })
    }

    /// Write frames as they come in until `rendered`, then whatever is still waiting.
    async fn write_frames(item: &QueueItem, frames: &mut UnboundedReceiver<FrameResult>, rendered: &CancellationToken) {
        loop {
            let frame = tokio::select! {
                biased;
                Some(frame) = frames.recv() => frame,
                _ = rendered.cancelled() => return,
            };
            Self::save_frame(item, frame).await;
        }
    }

    async fn save_frame(item: &QueueItem, result: FrameResult) {
        let Some(path) = item.frame_path(result.frame) else {
            tracing::debug!("Frame {} done, no output folder set", result.frame);
            return;
        };
        let written: std::io::Result<()> = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&path, &result.data).await
        }
        .await;
        match written {
            Ok(()) => tracing::debug!("Frame {} saved to {path:?}", result.frame),
            Err(e) => {
                tracing::error!("Unable to save frame {} to {path:?}: {e}", result.frame);
                item.set_error(e.to_string());
            }
        }
    }
}

/// Stops the queue on the first failure.
pub struct HaltOnError;

#[async_trait::async_trait]
impl QueueOperator for HaltOnError {
    async fn continue_after_error(&self, _item: &QueueItem, _error: &FarmError) -> bool {
        false
    }
}

/// Logs the failure and moves on.
pub struct ContinueOnError;

#[async_trait::async_trait]
impl QueueOperator for ContinueOnError {
    async fn continue_after_error(&self, item: &QueueItem, error: &FarmError) -> bool {
        tracing::warn!("Skipping {} after: {error}", item.id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::project_file::ProjectOptions,
        test_util::{MockConnector, MockNodeClient},
    };
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: Arc<BlendFarmManager>,
        session: Uuid,
    }

    async fn fixture(connector: MockConnector) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.blend");
        std::fs::write(&path, b"BLENDER-v400 scene").unwrap();
        let manager = Arc::new(BlendFarmManager::new(Arc::new(connector)));
        manager.add_node("a", "a:15000").unwrap();
        manager.connect_all().await;
        let session = manager.open_project(&path, ProjectOptions::default()).await;
        Fixture { dir, manager, session }
    }

    fn settings() -> RenderManagerSettings {
        RenderManagerSettings {
            output_width: 32,
            output_height: 32,
            chunk_width: 0.5,
            chunk_height: 0.5,
            ..Default::default()
        }
    }

    fn start(queue: &Arc<RenderQueue>) -> CancellationToken {
        let shutdown = CancellationToken::new();
        tokio::spawn(queue.clone().run(shutdown.clone()));
        shutdown
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    /// Remembers every failure it was asked about.
    #[derive(Default)]
    struct RecordingOperator {
        seen: Mutex<Vec<String>>,
        answer: bool,
    }

    #[async_trait::async_trait]
    impl QueueOperator for RecordingOperator {
        async fn continue_after_error(&self, _item: &QueueItem, error: &FarmError) -> bool {
            self.seen.lock().unwrap().push(error.to_string());
            self.answer
        }
    }

    #[tokio::test]
    async fn items_render_in_order_and_save() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let first_out = fx.dir.path().join("out/first.png");
        let first = queue.enqueue(fx.session, settings(), Some(first_out.clone()), 1).unwrap();
        let second = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        assert_eq!(first.status_text(), "Queued");

        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);
        wait_until(|| second.status() == QueueStatus::Completed).await;
        shutdown.cancel();

        assert_eq!(first.status(), QueueStatus::Completed);
        let saved = image::open(&first_out).unwrap();
        assert_eq!((saved.width(), saved.height()), (32, 32));
    }

    #[tokio::test]
    async fn disabled_queue_waits() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let item = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        let shutdown = start(&queue);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(item.task().is_none());

        queue.set_enabled(true).unwrap();
        wait_until(|| item.status() == QueueStatus::Completed).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn waits_for_a_task_started_elsewhere() {
        let gate = Arc::new(Semaphore::new(0));
        let fx = fixture(MockConnector::default().with("a", MockNodeClient::default().gated(gate.clone()))).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));

        let busy = fx.manager.get_image_task(fx.session, settings(), None).await.unwrap();
        let runner = busy.clone();
        tokio::spawn(async move { runner.render().await });

        let item = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(item.task().is_none());

        gate.add_permits(100);
        wait_until(|| item.status() == QueueStatus::Completed).await;
        assert_eq!(busy.state(), TaskState::Completed);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn disable_is_refused_until_items_are_done() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let a = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        let b = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();

        assert!(matches!(queue.set_enabled(false), Err(QueueError::NotEmpty(2))));
        queue.cancel(a.id).await.unwrap();
        queue.remove(b.id).await.unwrap();

        queue.set_enabled(false).unwrap();
        assert!(!queue.is_enabled());
        assert_eq!(a.status_text(), "Cancelled");
        assert_eq!(queue.items().len(), 1);
    }

    #[tokio::test]
    async fn failure_asks_operator_and_halts() {
        let fx = fixture(MockConnector::default()).await;
        let operator = Arc::new(RecordingOperator::default());
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), operator.clone()));
        let missing = fx.manager.open_project(fx.dir.path().join("missing.blend"), ProjectOptions::default()).await;

        let broken = queue.enqueue(missing, settings(), None, 1).unwrap();
        let after = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| !queue.is_enabled()).await;
        shutdown.cancel();

        assert_eq!(broken.status(), QueueStatus::Cancelled);
        assert_eq!(Some(broken.status_text()), broken.error());
        assert_eq!(operator.seen.lock().unwrap().len(), 1);
        assert_eq!(after.status(), QueueStatus::Queued);
    }

    #[tokio::test]
    async fn failure_can_be_skipped() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(ContinueOnError)));
        let missing = fx.manager.open_project(fx.dir.path().join("missing.blend"), ProjectOptions::default()).await;

        let broken = queue.enqueue(missing, settings(), None, 1).unwrap();
        let after = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| after.status() == QueueStatus::Completed).await;
        shutdown.cancel();
        assert_eq!(broken.status(), QueueStatus::Cancelled);
    }

    #[tokio::test]
    async fn animation_needs_a_folder_and_a_frame_marker() {
        let fx = fixture(MockConnector::default()).await;
        let queue = RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError));

        assert!(queue.enqueue(fx.session, settings(), None, 10).is_err());
        let unnumbered = QueueItem::new(fx.session, settings(), Some(fx.dir.path().into()), 10).with_frame_format("out.png");
        assert!(queue.push(unnumbered).is_err());
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn animation_frames_are_written_by_format() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let out = fx.dir.path().join("frames");
        let mut s = settings();
        s.frame = 4;
        let item = queue.enqueue(fx.session, s, Some(out.clone()), 3).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| item.status() == QueueStatus::Completed).await;
        shutdown.cancel();
        for frame in 4..=6 {
            assert!(out.join(format!("{frame}.png")).exists());
        }
    }

    #[tokio::test]
    async fn unwritable_frame_is_recorded_on_the_item() {
        let fx = fixture(MockConnector::default()).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        // a file where the frame folder should be
        let out = fx.dir.path().join("frames");
        std::fs::write(&out, b"not a folder").unwrap();
        let item = queue.enqueue(fx.session, settings(), Some(out), 2).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| item.status() == QueueStatus::Completed).await;
        shutdown.cancel();
        assert!(item.error().is_some());
        assert_eq!(item.status_text(), "Completed");
    }

    #[tokio::test]
    async fn cancel_before_the_first_render_is_not_a_failure() {
        let fx = fixture(MockConnector::default()).await;
        let task = fx.manager.get_image_task(fx.session, settings(), None).await.unwrap();
        task.cancel().await;

        assert!(matches!(RenderQueue::start_render(&task).await, Err(FarmError::Cancelled)));
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn status_shows_render_progress() {
        let gate = Arc::new(Semaphore::new(2));
        let fx = fixture(MockConnector::default().with("a", MockNodeClient::default().gated(gate.clone()))).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let item = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| item.status() == QueueStatus::Rendering(0.5)).await;
        assert_eq!(item.status_text(), "Rendering 50.00%");

        gate.add_permits(2);
        wait_until(|| item.status() == QueueStatus::Completed).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn new_settings_restart_the_item() {
        let gate = Arc::new(Semaphore::new(1));
        let fx = fixture(MockConnector::default().with("a", MockNodeClient::default().gated(gate.clone()))).await;
        let queue = Arc::new(RenderQueue::new(fx.manager.clone(), Arc::new(HaltOnError)));
        let item = queue.enqueue(fx.session, settings(), None, 1).unwrap();
        queue.set_enabled(true).unwrap();
        let shutdown = start(&queue);

        wait_until(|| matches!(item.status(), QueueStatus::Rendering(_))).await;
        let first = item.task().unwrap();

        let mut bigger = settings();
        bigger.output_width = 64;
        queue.update_settings(item.id, bigger).await.unwrap();
        gate.add_permits(100);

        wait_until(|| item.status() == QueueStatus::Completed).await;
        shutdown.cancel();
        let second = item.task().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.settings().output_width, 64);
        assert_eq!(first.state(), TaskState::Cancelled);
    }
}
