use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use wiggle_cam::CameraBackendKind;
use wiggle_config::AppConfig;
use wiggle_io::IoBackendKind;
use wiggle_node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CameraArg {
    Virtual,
    Picam,
}

impl From<CameraArg> for CameraBackendKind {
    fn from(arg: CameraArg) -> Self {
        match arg {
            CameraArg::Virtual => CameraBackendKind::Virtual,
            CameraArg::Picam => CameraBackendKind::Picam,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TriggerArg {
    Virtual,
    Gpio,
}

impl From<TriggerArg> for IoBackendKind {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Virtual => IoBackendKind::Virtual,
            TriggerArg::Gpio => IoBackendKind::Gpio,
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "synchronized capture node")]
struct Cli {
    /// Camera backend to use
    #[arg(long, value_enum, default_value = "virtual")]
    camera: CameraArg,

    /// Clock/trigger io backend to use
    #[arg(long, value_enum, default_value = "virtual")]
    trigger: TriggerArg,

    /// Device id of this node (selects the sensor on multi-camera hosts)
    #[arg(long, default_value_t = 0)]
    device_id: usize,
}

fn init_logging(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    // clap exits with code 2 on argument errors
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("loading configuration")?;
    init_logging(&config.logging.level);
    config.backend_picam.device_index = cli.device_id;

    info!(
        "starting node (device {}, camera {:?}, trigger {:?})",
        cli.device_id, cli.camera, cli.trigger
    );

    let io = wiggle_io::create_io_backend(cli.trigger.into(), &config)
        .context("creating io backend")?;
    let camera = wiggle_cam::create_camera_backend(cli.camera.into(), &config)
        .context("creating camera backend")?;

    let node = Arc::new(Node::new(config.clone(), io, camera)?);
    node.start().context("starting node services")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wiggle-http")
        .build()?;

    let router = node.router();
    let listen = config.http.listen;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding {listen}"))?;
        info!("control surface at http://{listen}/");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
            })
            .await
            .context("http server")
    })?;

    node.stop();
    info!("node stopped");
    Ok(())
}
