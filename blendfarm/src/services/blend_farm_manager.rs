/*
    Developer blog:
    - The manager used to be a global with public lists that the UI iterated and mutated as it pleased.
    Now it is the single owner of the node list, the open projects and the current task of each project.
    Nobody gets the backing collections, only snapshots.
    - One task per project at a time. Creating a new one while the previous has not reached a terminal
    state is refused, the caller has to cancel first.
    - File watching: editors save through a temp file and rename, so we watch the folder and filter on
    the file name instead of watching the file itself.
*/
use super::{
    file_sync::{FileSynchronizer, SyncReport},
    render_task::{FrameCallback, ImageCallback, RenderTask, TaskKind},
    scheduler::ExponentialAverage,
};
use crate::{
    domains::{node_client::NodeConnector, performance_policy::PerformancePolicy},
    models::{
        error::FarmError,
        project_file::{ProjectFile, ProjectOptions},
        render_node::RenderNode,
        render_setting::RenderManagerSettings,
    },
};
use futures::future::join_all;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum FarmEvent {
    NodeAdded(String),
    NodeRemoved(String),
    /// The blend file of this session changed on disk.
    FileChanged(Uuid),
    TaskCreated { session: Uuid, task: Uuid },
}

/// Keeps a project's file watched until dropped.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
}

pub struct BlendFarmManager {
    connector: Arc<dyn NodeConnector>,
    policy: Arc<dyn PerformancePolicy>,
    synchronizer: FileSynchronizer,
    nodes: RwLock<Vec<Arc<RenderNode>>>,
    projects: Mutex<HashMap<Uuid, ProjectFile>>,
    tasks: RwLock<HashMap<Uuid, Arc<RenderTask>>>,
    events: broadcast::Sender<FarmEvent>,
}

impl BlendFarmManager {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self::with_policy(connector, Arc::new(ExponentialAverage::default()))
    }

    pub fn with_policy(connector: Arc<dyn NodeConnector>, policy: Arc<dyn PerformancePolicy>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connector,
            policy,
            synchronizer: FileSynchronizer,
            nodes: RwLock::new(Vec::new()),
            projects: Mutex::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FarmEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /* Nodes */

    pub fn add_node(&self, name: &str, address: &str) -> Result<Arc<RenderNode>, FarmError> {
        let node = {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            if nodes.iter().any(|n| n.name == name) {
                return Err(FarmError::NodeExists(name.to_owned()));
            }
            let client = self.connector.client_for(name, address);
            let node = Arc::new(RenderNode::new(name, address, client));
            nodes.push(node.clone());
            node
        };
        tracing::info!("Added node {name} at {address}");
        self.emit(FarmEvent::NodeAdded(name.to_owned()));
        Ok(node)
    }

    /// Remove and disconnect a node. A task using it loses the node and moves its chunks elsewhere.
    pub async fn remove_node(&self, name: &str) -> Result<(), FarmError> {
        let node = {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let index = nodes
                .iter()
                .position(|n| n.name == name)
                .ok_or_else(|| FarmError::NodeNotFound(name.to_owned()))?;
            nodes.remove(index)
        };
        node.disconnect().await;
        tracing::info!("Removed node {name}");
        self.emit(FarmEvent::NodeRemoved(name.to_owned()));
        Ok(())
    }

    pub fn nodes(&self) -> Vec<Arc<RenderNode>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn node(&self, name: &str) -> Option<Arc<RenderNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.name == name)
            .cloned()
    }

    /// Connect every node in parallel. Failures are reported per node, nothing is retried.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), FarmError>)> {
        let nodes = self.nodes();
        join_all(nodes.iter().map(|node| async move { (node.name.clone(), node.connect().await) })).await
    }

    /// Connect everything, then bring the project's file to every node that answered.
    pub async fn connect_and_prepare_all(&self, session: Uuid) -> Result<Vec<SyncReport>, FarmError> {
        for (name, result) in self.connect_all().await {
            if let Err(e) = result {
                tracing::warn!("Node {name} is not available: {e}");
            }
        }
        self.update_file_version(session).await?;
        self.sync(session).await
    }

    /* Projects */

    pub async fn open_project(&self, blend_file: impl AsRef<Path>, options: ProjectOptions) -> Uuid {
        let project = ProjectFile::new(blend_file, options);
        let session = project.session_id;
        tracing::info!("Opened {:?} as session {session}", project.blend_file);
        self.projects.lock().await.insert(session, project);
        session
    }

    /// Close the project. A running task is cancelled first.
    pub async fn close_project(&self, session: Uuid) -> Result<(), FarmError> {
        let task = self.tasks.write().unwrap_or_else(PoisonError::into_inner).remove(&session);
        if let Some(task) = task {
            task.cancel().await;
        }
        self.projects
            .lock()
            .await
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))
    }

    pub async fn project(&self, session: Uuid) -> Option<ProjectFile> {
        self.projects.lock().await.get(&session).cloned()
    }

    pub async fn set_project_options(&self, session: Uuid, options: ProjectOptions) -> Result<(), FarmError> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(&session)
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))?;
        project.options = options;
        // the version scheme depends on the options
        project.file_version = None;
        Ok(())
    }

    /// Recompute the file version. Nodes lose their synced flag for the session when it changed.
    pub async fn update_file_version(&self, session: Uuid) -> Result<String, FarmError> {
        let nodes = self.nodes();
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(&session)
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))?;
        let (version, _) = self.synchronizer.update_file_version(project, &nodes).await?;
        Ok(version)
    }

    /// Sync the current file version to every connected node.
    pub async fn sync(&self, session: Uuid) -> Result<Vec<SyncReport>, FarmError> {
        let project = self
            .project(session)
            .await
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))?;
        let version = match &project.file_version {
            Some(version) => version.clone(),
            None => self.update_file_version(session).await?,
        };
        let connected: Vec<Arc<RenderNode>> = self.nodes().into_iter().filter(|n| n.is_connected()).collect();
        Ok(self.synchronizer.sync(&project, &version, &connected).await)
    }

    /* Tasks */

    fn ensure_idle(&self, session: Uuid) -> Result<(), FarmError> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(&session) {
            Some(task) if !task.state().is_terminal() => Err(FarmError::InvalidState(format!(
                "session {session} already has a running task {}",
                task.id()
            ))),
            _ => Ok(()),
        }
    }

    async fn create_task(
        &self,
        session: Uuid,
        settings: RenderManagerSettings,
        kind: TaskKind,
    ) -> Result<Arc<RenderTask>, FarmError> {
        self.ensure_idle(session)?;
        settings.validate()?;

        // bind the task to the file as it is right now
        let version = self.update_file_version(session).await?;
        let project = self
            .project(session)
            .await
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))?;
        let task = Arc::new(RenderTask::new(
            project,
            version,
            settings,
            kind,
            self.nodes(),
            self.policy.clone(),
        )?);

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = tasks.get(&session) {
            if !current.state().is_terminal() {
                return Err(FarmError::InvalidState(format!(
                    "session {session} already has a running task {}",
                    current.id()
                )));
            }
        }
        tasks.insert(session, task.clone());
        drop(tasks);
        tracing::debug!("Session {session} has new task {}", task.id());
        self.emit(FarmEvent::TaskCreated {
            session,
            task: task.id(),
        });
        Ok(task)
    }

    pub async fn get_image_task(
        &self,
        session: Uuid,
        settings: RenderManagerSettings,
        on_update: Option<ImageCallback>,
    ) -> Result<Arc<RenderTask>, FarmError> {
        self.create_task(session, settings, TaskKind::Image { on_update }).await
    }

    /// Task over frames `start..=end`. `on_frame` gets every frame once, in order.
    pub async fn get_animation_task(
        &self,
        session: Uuid,
        start: i32,
        end: i32,
        settings: RenderManagerSettings,
        on_frame: FrameCallback,
    ) -> Result<Arc<RenderTask>, FarmError> {
        let settings = RenderManagerSettings {
            frame: start,
            frame_end: Some(end),
            ..settings
        };
        self.create_task(session, settings, TaskKind::Animation { start, end, on_frame })
            .await
    }

    /// Same settings and callbacks as `previous`, bound to the file as it is now.
    pub async fn recreate_task(&self, previous: &RenderTask) -> Result<Arc<RenderTask>, FarmError> {
        self.create_task(previous.session_id(), previous.settings().clone(), previous.kind().clone())
            .await
    }

    pub fn current_task(&self, session: Uuid) -> Option<Arc<RenderTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
    }

    /// True while the session's task has not reached a terminal state.
    pub fn is_rendering(&self, session: Uuid) -> bool {
        self.current_task(session)
            .is_some_and(|task| !task.state().is_terminal())
    }

    /// Forget the last task of the session. Refused while it is still running.
    pub fn clear_last_task(&self, session: Uuid) -> Result<Option<Arc<RenderTask>>, FarmError> {
        self.ensure_idle(session)?;
        Ok(self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session))
    }

    /* File changes */

    pub fn notify_file_changed(&self, session: Uuid) {
        tracing::debug!("File of session {session} changed");
        self.emit(FarmEvent::FileChanged(session));
    }

    /// Watch the project's blend file and raise `FileChanged` whenever it is written.
    pub async fn watch_project(&self, session: Uuid) -> Result<ProjectWatcher, FarmError> {
        let project = self
            .project(session)
            .await
            .ok_or_else(|| FarmError::InvalidState(format!("no open project for session {session}")))?;
        let file_name = project.blend_file.file_name().map(|n| n.to_os_string());
        let folder = project
            .blend_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let events = self.events.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = events.send(FarmEvent::FileChanged(session));
                    }
                }
                Err(e) => tracing::error!("File watcher error for session {session}: {e}"),
            },
            Config::default(),
        )
        .map_err(|e| FarmError::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&folder, RecursiveMode::NonRecursive)
            .map_err(|e| FarmError::Io(std::io::Error::other(e)))?;

        tracing::info!("Watching {folder:?} for changes of session {session}");
        Ok(ProjectWatcher { _watcher: watcher })
    }
}
