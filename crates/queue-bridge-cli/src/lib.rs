//! # Queue Bridge CLI
//!
//! Command-line access to any queue backend supported by `queue-bridge`.
//!
//! Configuration comes from an optional file (`--config`, TOML/YAML/JSON by
//! extension) overlaid by `QUEUE_BRIDGE__*` environment variables, e.g.
//! `QUEUE_BRIDGE__TYPE=sqs QUEUE_BRIDGE__REGION=eu-west-1`.

use clap::{Parser, Subcommand};
use queue_bridge::{
    attributes_from_json, ConfigurationError, MessageQueue, MessageQueueFactory, OperationContext,
    QueueConfig, QueueError,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "QUEUE_BRIDGE";

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue Bridge CLI - one interface to SQS, Kafka and RabbitMQ
#[derive(Parser)]
#[command(name = "queue-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send, receive and inspect messages on SQS, Kafka or RabbitMQ")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Overall deadline for the command in seconds
    #[arg(short, long, default_value = "60")]
    pub timeout: u64,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Send one message
    Send {
        /// Queue URL or name, or Kafka topic
        destination: String,

        /// Message body
        body: String,

        /// String attributes as a JSON object, e.g. '{"p":"x"}'
        #[arg(short, long)]
        attributes: Option<String>,
    },

    /// Receive messages and print them as JSON lines
    Receive {
        /// Queue URL or name, or Kafka topic
        source: String,

        /// Maximum number of messages to receive
        #[arg(short, long, default_value = "10")]
        max_messages: u32,

        /// How long to wait for messages
        #[arg(short, long, default_value = "5")]
        wait_seconds: u64,

        /// Acknowledge each message after printing it
        #[arg(long, conflicts_with = "nack")]
        ack: bool,

        /// Return each message for redelivery after printing it
        #[arg(long)]
        nack: bool,
    },

    /// Print queue metadata as JSON
    Info {
        /// Queue URL or name, or Kafka topic
        name: String,
    },

    /// Load and validate the configuration without connecting
    Validate,
}

/// What to do with each received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Keep,
    Ack,
    Nack,
}

impl Settle {
    fn from_flags(ack: bool, nack: bool) -> Self {
        match (ack, nack) {
            (true, _) => Self::Ack,
            (false, true) => Self::Nack,
            (false, false) => Self::Keep,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(QueueError::Configuration(_)) => 1,
            Self::Queue(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Output(_) => 6,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid queue configuration: {0}")]
    Validation(#[from] ConfigurationError),
}

// ============================================================================
// Main CLI Functions
// ============================================================================

/// Parse arguments, set up logging and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = load_configuration(cli.config.as_deref())?;
    execute(&cli, config, &mut std::io::stdout().lock()).await
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `--log-level`. Logs go to stderr so stdout carries
/// only command output.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "queue_bridge={level},queue_bridge_cli={level}",
            level = cli.log_level
        ))
    });

    let json_layer = cli.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!cli.json_logs).then(|| {
        tracing_subscriber::fmt::layer().with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CliError::CommandFailed {
            message: format!("Failed to initialize logging: {}", e),
        })
}

/// Load the queue configuration from `path` and the process environment
pub fn load_configuration(path: Option<&Path>) -> Result<QueueConfig, ConfigError> {
    build_configuration(path, None)
}

/// Load the queue configuration, optionally from an explicit environment map
pub fn build_configuration(
    path: Option<&Path>,
    environment: Option<HashMap<String, String>>,
) -> Result<QueueConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    // QUEUE_BRIDGE__BROKERS=a:9092,b:9092 sets a list
    let env_source = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("brokers")
        .source(environment);

    let queue_config: QueueConfig = builder.add_source(env_source).build()?.try_deserialize()?;
    queue_config.validate()?;

    Ok(queue_config)
}

/// Run `cli.command` against the backend described by `config`.
///
/// The backend is closed before returning, whether or not the command
/// succeeded.
pub async fn execute(cli: &Cli, config: QueueConfig, out: &mut impl Write) -> Result<(), CliError> {
    if cli.command == Commands::Validate {
        writeln!(out, "Configuration is valid (type: {})", config.queue_type)?;
        return Ok(());
    }

    let ctx = OperationContext::background().with_timeout(Duration::from_secs(cli.timeout));
    let queue = MessageQueueFactory::create(&ctx, config).await?;

    let result = run_command(queue.as_ref(), &ctx, &cli.command, out).await;
    let closed = queue.close().await;

    match (result, closed) {
        (Err(e), Err(close_error)) => {
            warn!(error = %close_error, "Failed to close queue client");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), closed) => closed.map_err(CliError::from),
    }
}

/// Execute one command on an open queue client
pub async fn run_command(
    queue: &dyn MessageQueue,
    ctx: &OperationContext,
    command: &Commands,
    out: &mut impl Write,
) -> Result<(), CliError> {
    match command {
        Commands::Send {
            destination,
            body,
            attributes,
        } => {
            let attributes = match attributes {
                Some(raw) => {
                    let value: serde_json::Value =
                        serde_json::from_str(raw).map_err(|e| CliError::InvalidArgument {
                            arg: "attributes".to_string(),
                            message: e.to_string(),
                        })?;
                    attributes_from_json(&value).map_err(|e| CliError::InvalidArgument {
                        arg: "attributes".to_string(),
                        message: e.to_string(),
                    })?
                }
                None => Default::default(),
            };

            queue
                .send(ctx, destination, body.as_bytes(), &attributes)
                .await?;
            info!(destination = %destination, "Message sent");
            Ok(())
        }
        Commands::Receive {
            source,
            max_messages,
            wait_seconds,
            ack,
            nack,
        } => {
            let settle = Settle::from_flags(*ack, *nack);
            let messages = queue
                .receive(ctx, source, *max_messages, Duration::from_secs(*wait_seconds))
                .await?;

            for message in &messages {
                let line = serde_json::json!({
                    "id": message.id,
                    "body": String::from_utf8_lossy(&message.body),
                    "attributes": message.attributes,
                    "receipt": message.receipt,
                    "timestamp": message.timestamp.as_datetime().to_rfc3339(),
                });
                writeln!(out, "{}", serde_json::to_string(&line)?)?;

                match settle {
                    Settle::Ack => queue.ack(ctx, message).await?,
                    Settle::Nack => queue.nack(ctx, message).await?,
                    Settle::Keep => {}
                }
            }

            info!(source = %source, count = messages.len(), settle = ?settle, "Receive finished");
            Ok(())
        }
        Commands::Info { name } => {
            let info = queue.get_info(ctx, name).await?;
            writeln!(out, "{}", serde_json::to_string(&info)?)?;
            Ok(())
        }
        Commands::Validate => Ok(()),
    }
}
