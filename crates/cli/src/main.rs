use std::path::PathBuf;

use clap::Parser;
use collab_upload_core::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_SERVER_URL};
use collab_upload_core::{
    DEFAULT_THUMBNAIL_SIZE, RetryPolicy, UploadFolderConfig, UploadReport, run_upload_folder,
};
use collab_upload_core::run_log::RunLogKind;
use collabupload::{CliError, CliEvents, emit_error, init_run_log, map_core_err};

#[derive(Parser)]
#[command(name = "upload-folder")]
#[command(
    about = "Upload every image in a folder through a collaborative upload coordinator",
    long_about = None
)]
struct Cli {
    folder: PathBuf,

    group_name: String,

    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    server: String,

    #[arg(long, default_value_t = DEFAULT_THUMBNAIL_SIZE)]
    thumbnail: u32,

    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Failure log path (default: <output stem>-failed.log).
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    resume_log: Option<PathBuf>,

    #[arg(long)]
    resume: bool,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Base retry delay in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    retry_delay: u64,

    #[arg(long)]
    run_log_dir: Option<PathBuf>,

    #[arg(long)]
    json: bool,

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
    let _run_log = init_run_log(RunLogKind::Master, &run_id, cli.run_log_dir.as_deref())?;

    let mut config = UploadFolderConfig::new(cli.folder, cli.group_name);
    if let Some(output_file) = cli.output_file {
        config = config.with_output_file(output_file);
    }
    if let Some(log_file) = cli.log_file {
        config.failure_log = log_file;
    }
    if let Some(resume_log) = cli.resume_log {
        config.resume_log = resume_log;
    }
    config.server_url = cli.server;
    config.thumbnail_size = cli.thumbnail;
    config.resume = cli.resume;
    config.retry = RetryPolicy::new(cli.max_retries, cli.retry_delay);

    tracing::info!(
        event = "run.start",
        kind = "master",
        run_id = %run_id,
        folder = %config.folder.display(),
        group = %config.group_name,
        server = %config.server_url,
        "run.start"
    );

    let events = CliEvents { events: cli.events };
    let report = tokio::select! {
        res = run_upload_folder(&config, &events) => res.map_err(map_core_err)?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(event = "run.interrupted", run_id = %run_id, "run.interrupted");
            return Err(CliError::new("task.cancelled", "interrupted"));
        }
    };

    let status = if report.is_success() {
        "succeeded"
    } else {
        "failed"
    };
    tracing::info!(
        event = "run.finish",
        kind = "master",
        run_id = %run_id,
        status,
        "run.finish"
    );
    print_report(&report, cli.json);

    if report.is_success() {
        Ok(())
    } else {
        Err(CliError::new(
            "upload.incomplete",
            format!(
                "{} failed, {} outstanding",
                report.failed.len(),
                report.outstanding.len()
            ),
        )
        .with_details(serde_json::json!({
            "failed": report.failed.iter().map(|f| &f.filename).collect::<Vec<_>>(),
            "outstanding": report.outstanding,
            "failureLog": report.failure_log.as_ref().map(|p| p.display().to_string()),
        })))
    }
}

fn print_report(report: &UploadReport, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "sessionId": report.session_id,
                "total": report.total,
                "skipped": report.skipped,
                "uploaded": report.uploaded,
                "failed": report.failed.len(),
                "outstanding": report.outstanding.len(),
                "outputFile": report.output_file.display().to_string(),
                "failureLog": report.failure_log.as_ref().map(|p| p.display().to_string()),
            })
        );
        return;
    }

    eprintln!(
        "Upload finished: {} total, {} new, {} skipped, {} failed, {} outstanding",
        report.total,
        report.uploaded,
        report.skipped,
        report.failed.len(),
        report.outstanding.len()
    );
    eprintln!("Output saved to: {}", report.output_file.display());
    if let Some(path) = &report.failure_log {
        eprintln!("Failed files logged to: {}", path.display());
    }
}
