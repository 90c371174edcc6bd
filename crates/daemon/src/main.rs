use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use collab_upload_core::config::{DEFAULT_PORT, config_path_from_env};
use collab_upload_core::run_log::{RunLogKind, init_logging, resolve_log_dir, start_run_log};
use collab_upload_core::{load_coordinator_settings, spawn_coordinator};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "collabuploadd")]
#[command(about = "Collaborative upload coordinator", long_about = None)]
struct Args {
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Coordinator settings (toml). Falls back to COLLAB_UPLOAD_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    run_log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    let run_id = format!("run_{}", Uuid::new_v4());
    let _run_log = match resolve_log_dir(args.run_log_dir.as_deref()) {
        Some(dir) => Some(start_run_log(RunLogKind::Coordinator, &run_id, &dir)?),
        None => None,
    };

    let config_path = args.config.or_else(config_path_from_env);
    let settings = load_coordinator_settings(config_path.as_deref())?;
    let config = settings.into_config(SocketAddr::new(args.bind, args.port));

    tracing::info!(
        event = "run.start",
        kind = "coordinator",
        run_id = %run_id,
        config = ?config_path,
        "run.start"
    );

    let handle = spawn_coordinator(config).await?;
    eprintln!("coordinator listening on {}", handle.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "run.finish", kind = "coordinator", run_id = %run_id, "run.finish");
    handle.shutdown().await;
    Ok(())
}
