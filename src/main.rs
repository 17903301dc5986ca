use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrets_decryption_webhook::kms::google::{DEFAULT_KMS_ENDPOINT, DEFAULT_METADATA_ENDPOINT};
use secrets_decryption_webhook::kms::{CloudKmsClient, CloudKmsConfig, JweDecrypter};
use secrets_decryption_webhook::telemetry;
use secrets_decryption_webhook::webhook::{self, TlsConfig, WebhookConfig};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission webhook
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// GCP project holding the key ring
    #[arg(long, env = "KMS_PROJECT")]
    project: String,

    /// Location of the key ring
    #[arg(long, env = "KMS_LOCATION")]
    location: String,

    /// Key ring name
    #[arg(long, env = "KMS_RING")]
    ring: String,

    /// Crypto key name
    #[arg(long, env = "KMS_KEY")]
    key: String,

    /// Crypto key version
    #[arg(long, env = "KMS_KEY_VERSION", default_value_t = 1)]
    ver: u32,

    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = webhook::server::DEFAULT_LISTEN_ADDR)]
    listen_addr: SocketAddr,

    /// PEM certificate chain served to the API server
    #[arg(long, env = "TLS_CERT_FILE", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, env = "TLS_KEY_FILE", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// PEM CA bundle; when set, clients must present a certificate it signed
    #[arg(long, env = "TLS_CLIENT_CA_FILE", requires = "tls_cert")]
    client_ca: Option<PathBuf>,

    /// Cloud KMS REST endpoint
    #[arg(long, env = "KMS_ENDPOINT", default_value = DEFAULT_KMS_ENDPOINT)]
    kms_endpoint: String,

    /// GCE metadata server used to obtain access tokens
    #[arg(long, env = "GCE_METADATA_ENDPOINT", default_value = DEFAULT_METADATA_ENDPOINT)]
    metadata_endpoint: String,

    /// Static access token (skips the metadata server)
    #[arg(long, env = "KMS_ACCESS_TOKEN", hide_env_values = true)]
    kms_access_token: Option<String>,

    /// Timeout for a single KMS call, in seconds
    #[arg(long, env = "KMS_TIMEOUT_SECS", default_value_t = 5)]
    kms_timeout_secs: u64,

    /// Maximum concurrent decrypt calls per Secret
    #[arg(long, env = "MAX_IN_FLIGHT", default_value_t = 8)]
    max_in_flight: usize,

    /// Deadline for a whole admission review, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    request_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!(
                "{} v{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
        Commands::Run(run_args) => run_webhook(run_args).await,
    }
}

fn init_tracing(log_json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if log_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var(telemetry::OTLP_ENDPOINT_ENV).is_ok() {
        match telemetry::init_telemetry(&registry) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!(
            "OpenTelemetry tracing disabled ({} not set)",
            telemetry::OTLP_ENDPOINT_ENV
        );
    }
}

async fn run_webhook(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let kms_config = CloudKmsConfig {
        project: args.project,
        location: args.location,
        key_ring: args.ring,
        key_name: args.key,
        key_version: args.ver,
        endpoint: args.kms_endpoint,
        metadata_endpoint: args.metadata_endpoint,
        access_token: args.kms_access_token,
        timeout: Duration::from_secs(args.kms_timeout_secs),
    };
    info!(key = %kms_config.key_version_name(), "Using Cloud KMS key version");

    let kms = CloudKmsClient::new(kms_config).context("failed to create Cloud KMS client")?;
    let backend = Arc::new(JweDecrypter::new(kms));

    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path,
            key_path,
            client_ca_path: args.client_ca,
        }),
        _ => None,
    };

    let config = WebhookConfig {
        listen_addr: args.listen_addr,
        tls,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        max_in_flight: args.max_in_flight,
    };

    let result = webhook::serve(config, backend).await;
    telemetry::shutdown_telemetry();
    result.context("webhook server failed")
}
