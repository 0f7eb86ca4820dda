/*
Developer blog:
- Dropped the Tauri shell and the sqlite stores. What is left is the farm itself: nodes, file sync,
    chunk scheduling and the render task, with the queue and live render built on the same task api.
    A GUI can sit on top of `BlendFarmManager` without the farm knowing about it.
- Went back to clap for the command line. Two subcommands: `client` runs this machine as a render node,
    `render` drives a render from the terminal.
- Traits live in `domains`, the implementations in `services`, plain data in `models`. Tests swap the
    TCP node client for an in-memory one through `NodeConnector`.
*/
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use models::{
    error::FarmError,
    project_file::{NetworkPaths, ProjectOptions},
    render_setting::{RenderManagerSettings, RenderStrategy, TaskOrder},
    server_setting::ServerSetting,
};
use blender::models::{engine::Engine, format::Format};
use services::cli_app::{CliApp, RenderJob};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub mod domains;
pub mod models;
pub mod services;

#[cfg(test)]
pub mod test_util;

#[derive(Parser)]
#[command(version, about = "Network render farm for Blender")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this machine as a render node.
    Client {
        /// Port to listen on, overrides the saved server settings.
        #[arg(short, long)]
        port: Option<u16>,
        /// Blender executable, overrides the saved server settings.
        #[arg(long)]
        blender: Option<PathBuf>,
    },
    /// Render a blend file across the farm.
    Render(RenderArgs),
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Blend file to render.
    file: PathBuf,
    /// Image file to save, or the folder for animation frames.
    #[arg(short, long)]
    output: PathBuf,
    /// Remote node as name=host:port. Repeat for more nodes.
    #[arg(short, long = "node", value_parser = parse_node)]
    nodes: Vec<(String, String)>,
    /// Render on this machine as well.
    #[arg(long)]
    local: bool,
    #[arg(short, long, default_value_t = 1)]
    frame: i32,
    /// Last frame, renders an animation when set.
    #[arg(short, long)]
    end: Option<i32>,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    #[arg(long, default_value_t = 128)]
    samples: u32,
    #[arg(long, default_value = "CYCLES")]
    engine: Engine,
    /// Chunk edge in pixels. Defaults to a quarter of the output.
    #[arg(long)]
    chunk_size: Option<u32>,
    #[arg(long, default_value = "chunked")]
    strategy: RenderStrategy,
    #[arg(long, default_value = "default")]
    order: TaskOrder,
    #[arg(long, default_value = "PNG")]
    format: Format,
    /// Gzip the blend file before sending it to nodes.
    #[arg(long)]
    compress: bool,
    /// Path every node can open the blend file at, instead of sending it.
    #[arg(long)]
    network_path: Option<String>,
    /// Keep running and render again whenever the file is saved.
    #[arg(long)]
    live: bool,
}

fn parse_node(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, address)) if !name.is_empty() && address.contains(':') => {
            Ok((name.to_owned(), address.to_owned()))
        }
        _ => Err(format!("expected name=host:port, got `{value}`")),
    }
}

impl RenderArgs {
    fn into_job(self) -> RenderJob {
        let mut settings = RenderManagerSettings {
            output_width: self.width,
            output_height: self.height,
            frame: self.frame,
            samples: self.samples,
            engine: self.engine,
            strategy: self.strategy,
            order: self.order,
            render_format: self.format,
            ..Default::default()
        };
        if let Some(size) = self.chunk_size {
            settings = settings.with_chunk_size(size);
        }

        let options = ProjectOptions {
            use_networked_path: self.network_path.is_some(),
            network_paths: NetworkPaths {
                windows: self.network_path.clone(),
                linux: self.network_path.clone(),
                macos: self.network_path,
            },
            use_sync_compression: self.compress,
        };

        RenderJob {
            file: self.file,
            nodes: self.nodes,
            local: self.local,
            output: self.output,
            end: self.end,
            settings,
            options,
            live: self.live,
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        token.cancel();
    });
    shutdown
}

pub async fn run() -> Result<(), FarmError> {
    dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let shutdown = shutdown_on_ctrl_c();

    match cli.command {
        Commands::Client { port, blender } => {
            let mut settings = ServerSetting::load();
            if let Some(port) = port {
                settings.port = port;
            }
            if blender.is_some() {
                settings.blender = blender;
            }
            CliApp::new(settings).run(shutdown).await
        }
        Commands::Render(args) => args.into_job().run(shutdown).await,
    }
}
