/*
    Developer blog:
    - The command line used to be the only way to run a node without the GUI. It still is, but it can
    now also drive a render from a terminal: give it the nodes, the file and where to save.
    - `--local` spins up a node inside this process on a loopback port, so a single machine can render
    without a separate `blendfarm client` running.
    - Ctrl-C cancels the render through the task, it never just drops it. Dropping a running render would
    leave the nodes busy with chunks nobody waits for.
*/
use super::{
    blend_farm_manager::{BlendFarmManager, FarmEvent},
    blender_renderer::BlenderRenderer,
    live_render::LiveRender,
    node_client::TcpConnector,
    node_server::NodeServer,
    render_task::{save_image, FrameResult, RenderTask, TaskKind, TaskState},
};
use crate::models::{
    computer_spec::ComputerSpec, error::FarmError, project_file::ProjectOptions,
    render_setting::RenderManagerSettings, server_setting::ServerSetting,
};
use blender::Blender;
use local_ip_address::local_ip;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn local_node(settings: ServerSetting) -> Result<Arc<NodeServer>, FarmError> {
    settings.ensure_dirs()?;
    let blender = Blender::locate(settings.blender.as_deref())
        .await
        .map_err(|e| FarmError::backend("local", e))?;
    tracing::info!("Rendering with Blender {} at {:?}", blender.version, blender.executable);
    let spec = ComputerSpec {
        blender: Some(blender.version.clone()),
        ..Default::default()
    };
    Ok(Arc::new(NodeServer::new(settings, spec, Arc::new(BlenderRenderer::new(blender)))))
}

/// Runs this machine as a render node.
pub struct CliApp {
    settings: ServerSetting,
}

impl CliApp {
    pub fn new(settings: ServerSetting) -> Self {
        Self { settings }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), FarmError> {
        let port = self.settings.port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let ip = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        tracing::info!("Add this node on the host as {ip}:{port}");

        let server = local_node(self.settings).await?;
        server.serve(listener, shutdown).await
    }
}

/// One render driven from the command line.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub file: PathBuf,
    /// `(name, host:port)` of every remote node.
    pub nodes: Vec<(String, String)>,
    pub local: bool,
    /// Image file, or the folder frames are written to when `end` is set.
    pub output: PathBuf,
    pub end: Option<i32>,
    pub settings: RenderManagerSettings,
    pub options: ProjectOptions,
    /// Keep running and re-render whenever the file is saved.
    pub live: bool,
}

impl RenderJob {
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), FarmError> {
        let manager = Arc::new(BlendFarmManager::new(Arc::new(TcpConnector)));

        if self.local {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let address = listener.local_addr()?.to_string();
            let server = local_node(ServerSetting::load()).await?;
            tokio::spawn(server.serve(listener, shutdown.clone()));
            manager.add_node("local", &address)?;
        }
        for (name, address) in &self.nodes {
            manager.add_node(name, address)?;
        }
        if manager.nodes().is_empty() {
            return Err(FarmError::InvalidState("no nodes to render with, pass --node or --local".to_owned()));
        }

        let session = manager.open_project(&self.file, self.options.clone()).await;
        for report in manager.connect_and_prepare_all(session).await? {
            match report.result {
                Ok(()) => tracing::info!("Node {} is ready", report.node),
                Err(e) => tracing::warn!("Node {} will sit this one out: {e}", report.node),
            }
        }

        let task = self.create_task(&manager, session).await?;
        if self.live {
            return self.run_live(manager, session, task, shutdown).await;
        }

        let _progress = task.subscribe(|p| tracing::info!("Progress {:.1}%", p * 100.0));
        let canceller = tokio::spawn({
            let task = task.clone();
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                task.cancel().await;
            }
        });
        let result = task.render().await;
        canceller.abort();
        result?;

        if let Some(image) = task.final_image() {
            save_image(&image, &self.output, self.settings.render_format).await?;
            tracing::info!("Saved {:?}", self.output);
        }
        Ok(())
    }

    async fn create_task(&self, manager: &BlendFarmManager, session: Uuid) -> Result<Arc<RenderTask>, FarmError> {
        let Some(end) = self.end else {
            return manager.get_image_task(session, self.settings.clone(), None).await;
        };

        let dir = self.output.clone();
        let on_frame = Arc::new(move |result: FrameResult| {
            let path = dir.join(format!("{}.{}", result.frame, result.format.extension()));
            match std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&path, &result.data)) {
                Ok(()) => tracing::info!("Frame {} saved to {path:?} ({:.1}%)", result.frame, result.progress * 100.0),
                Err(e) => tracing::error!("Unable to save frame {}: {e}", result.frame),
            }
        });
        manager
            .get_animation_task(session, self.settings.frame, end, self.settings.clone(), on_frame)
            .await
    }

    async fn run_live(
        &self,
        manager: Arc<BlendFarmManager>,
        session: Uuid,
        task: Arc<RenderTask>,
        shutdown: CancellationToken,
    ) -> Result<(), FarmError> {
        let _watcher = manager.watch_project(session).await?;
        let mut events = manager.subscribe();
        tokio::spawn(LiveRender::new(manager.clone(), session).run(shutdown.clone()));

        self.save_when_done(task.clone());
        tokio::spawn(async move { task.render().await });
        tracing::info!("Live render on, save {:?} to render again", self.file);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(FarmEvent::TaskCreated { session: s, .. }) if s == session => {
                        if let Some(task) = manager.current_task(session) {
                            self.save_when_done(task);
                        }
                    }
                    Err(RecvError::Closed) => break,
                    _ => {}
                },
                _ = shutdown.cancelled() => break,
            }
        }

        if let Some(task) = manager.current_task(session) {
            task.cancel().await;
        }
        Ok(())
    }

    /// Save the image of `task` once it completes. Animation frames are saved as they arrive.
    fn save_when_done(&self, task: Arc<RenderTask>) {
        if !matches!(task.kind(), TaskKind::Image { .. }) {
            return;
        }
        let output = self.output.clone();
        let format = self.settings.render_format;
        tokio::spawn(async move {
            let mut changes = task.state_changes();
            loop {
                let state = changes.borrow_and_update().clone();
                if state.is_terminal() {
                    if state != TaskState::Completed {
                        return;
                    }
                    break;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
            if let Some(image) = task.final_image() {
                match save_image(&image, &output, format).await {
                    Ok(()) => tracing::info!("Saved {output:?}"),
                    Err(e) => tracing::error!("Unable to save {output:?}: {e}"),
                }
            }
        });
    }
}
