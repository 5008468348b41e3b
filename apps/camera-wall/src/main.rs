use anyhow::Result;
use camera_wall::{
    config::Config,
    consumer::{ConsumerLoop, HeadlessWall},
    control::{CommandDispatcher, ControlServer},
    engine::GstEngine,
    gst_utils,
    stream::{FrameRouter, GridLayout, GridState, SessionRegistry},
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Control socket path (overrides the configuration)
    #[arg(long, env = "CAMERA_WALL_SOCKET")]
    socket: Option<PathBuf>,

    /// Check available GStreamer plugins and exit
    #[arg(long)]
    check_plugins: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let pinned = startup_filter(args.debug, std::env::var("RUST_LOG").ok().as_deref());
    let config_decides = pinned.is_none();
    let (filter, filter_handle) =
        reload::Layer::new(pinned.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(socket) = args.socket {
        config.control.socket_path = socket;
    }
    if config_decides {
        filter_handle.reload(EnvFilter::new(&config.app.log_level))?;
    }

    info!("Starting {} v{}", config.app.name, env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    if args.check_plugins {
        let capabilities = gst_utils::discover_plugins()?;
        gst_utils::print_plugin_info(&capabilities);
        return Ok(());
    }

    gst_utils::initialize()?;
    let engine = GstEngine::new()?;
    info!("GStreamer initialized successfully");

    let layout = GridLayout::from(&config.grid);
    let (router, events) = FrameRouter::new();
    let registry = Arc::new(SessionRegistry::new(
        engine,
        router.clone(),
        layout,
        &config.stream_defaults,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = {
        let mut consumer_loop = ConsumerLoop::new(events, router, GridState::new(layout));
        let shutdown = wait_for(shutdown_rx.clone());
        tokio::spawn(async move {
            let mut wall = HeadlessWall::new();
            consumer_loop.run_until(&mut wall, shutdown).await;
        })
    };

    for stream in &config.streams {
        if let Err(e) = registry.add_stream(&stream.id, &stream.url).await {
            error!("Failed to add stream {}: {}", stream.id, e);
        }
    }
    info!("{} stream(s) configured at startup", config.streams.len());

    let server = if config.control.enabled {
        let server = ControlServer::bind(
            &config.control.socket_path,
            CommandDispatcher::new(registry.clone()),
        )?;
        let shutdown = wait_for(shutdown_rx.clone());
        Some(tokio::spawn(server.run_until(shutdown)))
    } else {
        info!("Control socket disabled");
        None
    };

    wait_for_signal().await?;
    info!("Shutting down {}", config.app.name);

    registry.shutdown().await;
    let _ = shutdown_tx.send(true);

    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => error!("Control server error: {}", e),
            Err(e) => error!("Control server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    if let Err(e) = consumer.await {
        warn!("Consumer task failed: {}", e);
    }

    Ok(())
}

/// Filter fixed before the configuration is read: `--debug`, then a valid
/// `RUST_LOG`. `None` leaves the level to the configuration file.
fn startup_filter(debug: bool, rust_log: Option<&str>) -> Option<EnvFilter> {
    if debug {
        return Some(EnvFilter::new("debug"));
    }
    rust_log.and_then(|directives| EnvFilter::try_new(directives).ok())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
