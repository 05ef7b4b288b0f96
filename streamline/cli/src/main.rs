//! Streamline - Stream generated text to the terminal
//!
//! Opens a server-sent event stream, prints text deltas to stdout as they
//! arrive, and transparently retries with a fresh anti-forgery token when
//! the server rejects the current one.
//!
//! # Usage
//!
//! ```bash
//! # Endpoints from the config file or environment
//! streamline
//!
//! # Explicit endpoints and a JSON body
//! streamline -e https://app.example.com/summaries/stream \
//!     -t https://app.example.com/csrf-token \
//!     -d '{"document_id": 42}'
//!
//! # Body from stdin, extra header, no retries
//! echo '{}' | streamline --body-file - -H 'Cookie: session=abc' --max-attempts 0
//!
//! # Verbose logging (stderr)
//! RUST_LOG=streamline_core=debug streamline
//! ```
//!
//! # Exit Codes
//!
//! - `0`: stream completed
//! - `1`: stream failed after retries, or a setup error
//! - `130`: interrupted with Ctrl-C

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use streamline_core::{
    default_config_path, load_config_from_path, ChannelSubscriber, ConfigOverrides,
    HttpCredentialProvider, HttpStreamTransport, Method, ResilientStreamController, Settlement,
    StreamRequest, StreamlineConfig, SubscriberEvent, TokenStore,
};

/// Exit status used when interrupted
const EXIT_INTERRUPTED: u8 = 130;

/// Streamline - resilient consumer for server-sent text streams
#[derive(Parser, Debug)]
#[command(name = "streamline")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "STREAMLINE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stream endpoint URL
    #[arg(short = 'e', long, value_name = "URL")]
    endpoint: Option<String>,

    /// Anti-forgery token endpoint URL
    #[arg(short = 't', long, value_name = "URL")]
    token_endpoint: Option<String>,

    /// HTTP method (GET or POST)
    #[arg(short = 'X', long)]
    method: Option<Method>,

    /// Request body
    #[arg(short = 'd', long, conflicts_with = "body_file")]
    body: Option<String>,

    /// Read the request body from a file (`-` for stdin)
    #[arg(long, value_name = "FILE")]
    body_file: Option<PathBuf>,

    /// Extra request header, may be repeated
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Retries after the first attempt
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "STREAMLINE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            endpoint: self.endpoint.clone(),
            token_endpoint: self.token_endpoint.clone(),
            method: self.method,
            max_attempts: self.max_attempts,
            headers: self.headers.clone(),
        }
    }

    /// Request body from `--body` or `--body-file`
    fn read_body(&self) -> Result<Option<Vec<u8>>> {
        if let Some(body) = &self.body {
            return Ok(Some(body.clone().into_bytes()));
        }
        let Some(path) = &self.body_file else {
            return Ok(None);
        };
        let body = if path.as_os_str() == "-" {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read body from stdin")?;
            buf
        } else {
            std::fs::read(path).with_context(|| format!("Failed to read body file: {path:?}"))?
        };
        Ok(Some(body))
    }
}

/// Parse `Name: value` (curl style) or `Name=value`
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .or_else(|| raw.split_once('='))
        .ok_or_else(|| format!("expected NAME: VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Initialize logging to stderr so stdout carries only the streamed text
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("streamline={level},streamline_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn load(args: &Args) -> Result<StreamlineConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_controller(config: &StreamlineConfig) -> Result<ResilientStreamController> {
    let token_endpoint = config.token_endpoint_url()?;
    let transport = HttpStreamTransport::new(config.transport_config())
        .context("Failed to create HTTP client")?;
    let provider = HttpCredentialProvider::new(token_endpoint, transport.client().clone())
        .with_fallback_header(config.token_response_header.clone());
    let tokens = Arc::new(TokenStore::with_config(
        Arc::new(provider),
        config.token_store_config(),
    ));

    Ok(ResilientStreamController::with_session_config(
        Arc::new(transport),
        tokens,
        config.controller_config(),
        config.session_config(),
    ))
}

fn build_request(args: &Args, config: &StreamlineConfig) -> Result<StreamRequest> {
    let mut request = StreamRequest::new(config.endpoint_url()?).with_method(config.method);
    if let Some(body) = args.read_body()? {
        let is_json = serde_json::from_slice::<serde_json::Value>(&body).is_ok();
        if is_json && request.header("content-type").is_none() && !has_content_type(config) {
            request = request.with_header("content-type", "application/json");
        }
        request = request.with_body(body);
    }
    Ok(request)
}

fn has_content_type(config: &StreamlineConfig) -> bool {
    config
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-type"))
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load(&args)?;
    let controller = build_controller(&config)?;
    let request = build_request(&args, &config)?;

    info!(
        endpoint = %request.endpoint,
        source = %config.endpoint_source(),
        method = %request.method,
        "Starting stream"
    );

    let (subscriber, mut events) = ChannelSubscriber::channel();
    let handle = controller.start(request, Arc::new(subscriber));

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SubscriberEvent::Delta(text)) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                Some(SubscriberEvent::Retry { attempt, reason }) => {
                    warn!(attempt, %reason, "Stream interrupted, retrying");
                    writeln!(stdout)?;
                    eprintln!("[retry {attempt}: {reason}]");
                }
                Some(SubscriberEvent::Done) => {
                    writeln!(stdout)?;
                    return Ok(ExitCode::SUCCESS);
                }
                Some(SubscriberEvent::Error { message, error }) => {
                    writeln!(stdout)?;
                    debug!(error = %error, "Stream failed");
                    eprintln!("error: {message}");
                    return Ok(ExitCode::FAILURE);
                }
                None => break,
            },
            _ = &mut interrupted => {
                controller.cancel();
                writeln!(stdout)?;
                eprintln!("interrupted");
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    }

    Ok(match handle.settled().await {
        Settlement::Completed => ExitCode::SUCCESS,
        Settlement::Failed => ExitCode::FAILURE,
        Settlement::Cancelled => ExitCode::from(EXIT_INTERRUPTED),
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level)?;
    run(args).await
}
