/*
    Developer blog:
    - Live render used to be a timer that checked the file every second. It now reacts to the manager's
    FileChanged event, which the project watcher raises on save.
    - A render that has not finished a single chunk yet is left alone. Saving twice in a row should not
    throw away a render twice before it produced anything.
*/
use super::{
    blend_farm_manager::{BlendFarmManager, FarmEvent},
    render_task::RenderTask,
};
use crate::models::error::FarmError;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Re-renders a project whenever its file changes on disk.
pub struct LiveRender {
    manager: Arc<BlendFarmManager>,
    session: Uuid,
    events: broadcast::Receiver<FarmEvent>,
}

impl LiveRender {
    pub fn new(manager: Arc<BlendFarmManager>, session: Uuid) -> Self {
        let events = manager.subscribe();
        Self {
            manager,
            session,
            events,
        }
    }

    /// Handle file changes one at a time until `shutdown`.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = shutdown.cancelled() => return,
            };
            match event {
                Ok(FarmEvent::FileChanged(session)) if session == self.session => {}
                // missed events may have been a change, check once for all of them
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Live render skipped {skipped} events"),
                Ok(_) => continue,
                Err(RecvError::Closed) => return,
            }
            if let Err(e) = self.on_file_changed().await {
                tracing::error!("Live render of session {} failed: {e}", self.session);
            }
        }
    }

    /// Restart the current render against the new file. Returns the new task, or `None` when
    /// there was nothing worth restarting.
    pub async fn on_file_changed(&self) -> Result<Option<Arc<RenderTask>>, FarmError> {
        let Some(task) = self.manager.current_task(self.session) else {
            tracing::debug!("File changed, no render to restart");
            return Ok(None);
        };
        if task.state().is_terminal() {
            tracing::debug!("File changed, last render {} is already {:?}", task.id(), task.state());
            return Ok(None);
        }
        if task.progress() <= 0.0 {
            tracing::debug!("File changed, render {} has no progress yet", task.id());
            return Ok(None);
        }

        tracing::info!("File changed, restarting render {} at {:.1}%", task.id(), task.progress() * 100.0);
        task.cancel().await;

        self.manager.update_file_version(self.session).await?;
        for report in self.manager.sync(self.session).await? {
            if let Err(e) = report.result {
                tracing::warn!("Live render could not sync {}: {e}", report.node);
            }
        }

        let next = self.manager.recreate_task(&task).await?;
        let runner = next.clone();
        tokio::spawn(async move {
            match runner.render().await {
                Ok(()) | Err(FarmError::Cancelled) => {}
                Err(e) => tracing::error!("Live render {} failed: {e}", runner.id()),
            }
        });
        Ok(Some(next))
    }
}
