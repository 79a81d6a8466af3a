use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use optiflow_common::error::Error;
use optiflow_connector::{Worker, WorkerConfig};
use optiflow_registry::TaskRegistry;
use tracing::{info, warn};

/// Queue-triggered stage worker of the optiflow pipeline.
#[derive(Parser, Debug)]
#[command(name = "optiflow-connector", version)]
struct Args {
    /// Stage of the pipeline; must be the name of this worker's queue
    #[arg(long)]
    pipeline_stage: String,

    /// Path to the config file (internal)
    #[arg(long, default_value = "/tmp/config")]
    config_file_path: String,

    /// Path to the input file, or an input folder if it ends with '/' (internal)
    #[arg(long, default_value = "/tmp/input")]
    input_file_path: String,

    /// Path to the output file (internal)
    #[arg(long, default_value = "/tmp/output")]
    output_file_path: String,

    /// Path to the command file to execute
    #[arg(long, default_value = "/tmp/run-command.sh")]
    command_file_path: PathBuf,

    /// Document API endpoint URL for the task registry
    #[arg(long)]
    dynamo_docapi_endpoint: String,

    /// Comma-delimited paths to extra artifacts (files and/or folders) to upload
    #[arg(long)]
    extra_artifacts: Option<String>,

    /// Max time (seconds) expected to be spent on archiving extra artifacts
    #[arg(long, default_value_t = 90)]
    max_archiving_time: u64,

    /// Request processing timeout (seconds) imposed by the cloud execution environment
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

fn none_if_empty(path: String) -> Option<PathBuf> {
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if std::env::var("SHOW_CPU_INFO").map_or(false, |v| !v.is_empty()) {
        log_cpu_information().await;
    }

    let port: u16 = std::env::var("PORT")
        .map_err(|_| Error::Config("PORT environment variable not set".to_string()))?
        .parse()
        .map_err(|e| Error::Config(format!("PORT is not a valid port number: {e}")))?;

    let args = Args::parse();

    let registry = Arc::new(TaskRegistry::connect(&args.dynamo_docapi_endpoint).await?);
    info!(
        endpoint = %args.dynamo_docapi_endpoint,
        "connected to the cloud task registry"
    );

    let extra_artifacts: Vec<PathBuf> = args
        .extra_artifacts
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .collect();

    let config = WorkerConfig {
        pipeline_stage: args.pipeline_stage,
        config_file_path: none_if_empty(args.config_file_path),
        input_file_path: args.input_file_path,
        output_file_path: none_if_empty(args.output_file_path),
        command_file_path: args.command_file_path,
        extra_artifacts,
        max_archiving_time: Duration::from_secs(args.max_archiving_time),
        request_timeout: Duration::from_secs(args.timeout),
    };

    Arc::new(Worker::new(registry, config)).serve(port).await
}

async fn log_cpu_information() {
    let result = tokio::process::Command::new("lscpu")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await;
    if let Err(e) = result {
        warn!("failed to call lscpu: {e}");
    }
}
