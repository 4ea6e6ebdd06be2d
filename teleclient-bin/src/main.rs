use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use teleclient_core::{
    ClientConfig, PublishStatus, SeverityLevel, StaticTokenSource, TelemetryClient,
    TelemetryOperation, TelemetryTags, TokenSource, create_telemetry_client,
    http_client::HttpClient, new_activity_id, tags::keys,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Bearer token used by publishers with `authenticate = true`.
const TOKEN_ENV: &str = "TELECLIENT_BEARER_TOKEN";

/// URI reported on the sample Request item.
const REQUEST_URI: &str = "exe:process";

#[derive(Parser)]
#[command(author, version, about = "teleclient telemetry smoke tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sample unit of work and publish its telemetry
    Demo {
        #[arg(short, long, help = "Client configuration (JSON or TOML)")]
        config: PathBuf,
        #[arg(long, default_value = "https://www.example.com/", help = "URL called as the sample HTTP dependency")]
        dependency_url: String,
        #[arg(long, default_value_t = 30, help = "Seconds to wait for the publish")]
        timeout_secs: u64,
    },
    /// Load and validate a client configuration
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { config } => {
            let cfg = ClientConfig::from_path(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            match cfg.validate() {
                Ok(()) => {
                    println!(
                        "{}: ok ({} publisher(s), {} authenticated)",
                        config.display(),
                        cfg.publishers.len(),
                        cfg.publishers.iter().filter(|p| p.authenticate).count()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{}: {e}", config.display());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Demo {
            config,
            dependency_url,
            timeout_secs,
        } => {
            let cfg = ClientConfig::from_path(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let token = std::env::var(TOKEN_ENV).ok();
            if token.is_none() && cfg.publishers.iter().any(|p| p.authenticate) {
                anyhow::bail!("{TOKEN_ENV} must be set for authenticated publishers");
            }

            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
            let tags = TelemetryTags::new()
                .with(keys::CLOUD_ROLE, "local")
                .with(keys::CLOUD_ROLE_INSTANCE, host);
            let client = create_telemetry_client(
                &cfg,
                HttpClient::from_cfg(&cfg.http)?,
                |_| {
                    Arc::new(StaticTokenSource::new(token.clone().unwrap_or_default()))
                        as Arc<dyn TokenSource>
                },
                Some(tags),
            )?;

            let request_uri = reqwest::Url::parse(REQUEST_URI)?;
            let work_ok = process_request(&client, &request_uri, &dependency_url).await;

            let cancel = CancellationToken::new();
            let timer = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                    cancel.cancel();
                })
            };
            let result = client.publish(&cancel).await;
            timer.abort();
            tracing::info!(items = result.items, "sample telemetry published");

            for outcome in &result.outcomes {
                match &outcome.status {
                    PublishStatus::Success(r) => println!(
                        "{}: sent {} item(s), accepted {}, {} request(s)",
                        outcome.publisher, r.items_sent, r.items_accepted, r.requests
                    ),
                    PublishStatus::Failed(e) => println!("{}: failed: {e}", outcome.publisher),
                    PublishStatus::Cancelled => println!("{}: cancelled", outcome.publisher),
                }
            }

            Ok(if work_ok && result.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Request scope around an in-proc dependency, tracked the way a service
/// instruments one incoming request.
async fn process_request(
    client: &TelemetryClient,
    request_uri: &reqwest::Url,
    dependency_url: &str,
) -> bool {
    // new unit of work: every item below shares this operation id
    client.set_operation(TelemetryOperation::new(new_activity_id()));

    let request_id = new_activity_id();
    let scope = client.activity_scope_begin(request_id.clone());
    let start_time = scope.start_time();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let success = process_in_proc(client, dependency_url).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let duration = client.activity_scope_end(scope);

    let request_tags = TelemetryTags::new().with(keys::OPERATION_NAME, "SampleRequest");
    client.track_request(
        start_time,
        duration,
        &request_id,
        request_uri,
        if success { "0" } else { "1" },
        success,
        None,
        Some(&request_tags),
    );
    success
}

async fn process_in_proc(client: &TelemetryClient, dependency_url: &str) -> bool {
    let id = new_activity_id();
    let scope = client.activity_scope_begin(id.clone());
    let start_time = scope.start_time();
    tokio::time::sleep(Duration::from_millis(150)).await;

    client.track_event("In Proc Started", None);
    let success = call_dependency(client, dependency_url).await;
    client.track_trace("In Proc Completed", SeverityLevel::Information, None);

    let duration = client.activity_scope_end(scope);
    client.track_dependency_in_proc(start_time, duration, &id, "Sample", success, None);
    success
}

async fn call_dependency(client: &TelemetryClient, url: &str) -> bool {
    let uri = match reqwest::Url::parse(url) {
        Ok(uri) => uri,
        Err(e) => {
            client.track_exception(&e, None);
            return false;
        }
    };
    let id = new_activity_id();
    let start_time = client.clock().wall();
    let started = Instant::now();
    let (status, success) = match reqwest::get(uri.clone()).await {
        Ok(resp) => (resp.status().as_u16(), resp.status().is_success()),
        Err(e) => {
            client.track_exception(&e, None);
            (0, false)
        }
    };
    client.track_dependency_http(
        start_time,
        started.elapsed(),
        &id,
        "GET",
        &uri,
        status,
        success,
        None,
    );
    success
}
