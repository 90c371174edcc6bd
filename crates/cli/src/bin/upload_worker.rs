use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use collab_upload_core::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_SERVER_URL};
use collab_upload_core::{
    HttpEndpointConfig, HttpUploadEndpoint, RetryPolicy, WorkerConfig, run_worker,
};
use collab_upload_core::run_log::RunLogKind;
use collabupload::{CliError, CliEvents, emit_error, init_run_log, map_core_err};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "upload-worker")]
#[command(
    about = "Serve uploads for a collaborative upload coordinator",
    long_about = None
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Origin upload URL files are POSTed to.
    #[arg(long)]
    endpoint: String,

    /// Extra request header, `Name: value`. May be repeated.
    #[arg(long = "header", value_name = "K:V")]
    headers: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Base retry delay in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    retry_delay: u64,

    /// Pause requested when a 429 carries no wait hint, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    default_retry_after: u64,

    #[arg(long)]
    run_log_dir: Option<PathBuf>,

    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _run_log = init_run_log(RunLogKind::Worker, &run_id, cli.run_log_dir.as_deref())?;

    let headers = cli
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>, _>>()?;
    let endpoint = HttpUploadEndpoint::new(HttpEndpointConfig {
        url: cli.endpoint,
        headers,
    })
    .map_err(map_core_err)?;

    let config = WorkerConfig {
        server_url: cli.server,
        retry: RetryPolicy::new(cli.max_retries, cli.retry_delay),
        default_retry_after: Duration::from_millis(cli.default_retry_after),
        ..WorkerConfig::default()
    };

    tracing::info!(
        event = "run.start",
        kind = "worker",
        run_id = %run_id,
        server = %config.server_url,
        "run.start"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let events = CliEvents { events: cli.events };
    run_worker(config, Arc::new(endpoint), &events, cancel)
        .await
        .map_err(map_core_err)?;

    tracing::info!(event = "run.finish", kind = "worker", run_id = %run_id, "run.finish");
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), CliError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| CliError::new("config.invalid", format!("header must be K:V: {raw}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::new(
            "config.invalid",
            format!("header name is empty: {raw}"),
        ));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_split_on_first_colon() {
        assert_eq!(
            parse_header("Cookie: _t=abc:def").unwrap(),
            ("Cookie".to_string(), "_t=abc:def".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }
}
