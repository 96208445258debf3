use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use poller_core::config::{ConsumerConfig, StreamResource, load_tuning};
use poller_core::sink::console::ConsoleSink;
use poller_core::source::kafka::KafkaStreamClient;
use poller_core::telemetry::init_tracing;
use poller_core::{EventConsumer, PollSettings, StartPosition};
use tracing::{error, info, warn};

/// Prints every event of every partition of an event hub to stdout.
///
/// What it does at a high-level:
///     Build and validate config from flags and an optional YAML file.
///     Look up the partitions of the hub and open one receiver per partition.
///     Poll all partitions concurrently until Ctrl-C, printing
///     `Partition <id>, Event <body>` for each event.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Event hub name
    #[arg(short = 'e', long)]
    ehname: String,

    /// Namespace hosting the event hub
    #[arg(short, long)]
    namespace: String,

    /// Shared access key name
    #[arg(short, long)]
    key: String,

    /// Shared access key
    #[arg(short, long, env = "EVENTHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// YAML file with polling, retry and kafka settings
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    #[arg(long)]
    consumer_group: Option<String>,

    /// start, end or an offset
    #[arg(long)]
    start: Option<StartPosition>,

    /// Comma separated partition ids, defaults to all partitions
    #[arg(long, value_delimiter = ',')]
    partitions: Option<Vec<i32>>,

    /// Plain Kafka brokers to use instead of the namespace endpoint
    #[arg(long)]
    bootstrap_servers: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<ConsumerConfig> {
        let mut tuning = load_tuning(self.config.as_deref())?;

        if let Some(batch_size) = self.batch_size {
            tuning.polling.batch_size = batch_size;
        }
        if let Some(group) = self.consumer_group {
            tuning.polling.consumer_group = group;
        }
        if let Some(start) = self.start {
            tuning.polling.start_position = start;
        }
        if self.partitions.is_some() {
            tuning.polling.partitions = self.partitions;
        }
        if self.bootstrap_servers.is_some() {
            tuning.kafka.bootstrap_servers = self.bootstrap_servers;
        }

        let resource = StreamResource::new(self.namespace, self.ehname, self.key, self.token);
        Ok(ConsumerConfig::new(resource, tuning))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => usage_error(ErrorKind::Io, format!("{e:#}")),
    };
    if let Err(e) = config.validate() {
        usage_error(ErrorKind::ValueValidation, e.to_string());
    }

    info!(
        namespace = %config.resource.namespace,
        ehname = %config.resource.name,
        batch_size = config.polling.batch_size,
        start = ?config.polling.start_position,
        "Starting console consumer"
    );

    let client = match KafkaStreamClient::connect(&config).context("Failed to create stream client") {
        Ok(client) => client,
        Err(e) => usage_error(ErrorKind::Io, format!("{e:#}")),
    };
    let consumer = EventConsumer::new(
        Arc::new(client),
        Arc::new(ConsoleSink::stdout()),
        PollSettings::from(&config),
    );

    let cancel = consumer.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, stopping"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, stopping"),
        }
        cancel.cancel();
    });

    // Errors out of run() all happen before polling starts.
    let report = match consumer.run().await.context("Console consumer failed to start") {
        Ok(report) => report,
        Err(e) => usage_error(ErrorKind::Io, format!("{e:#}")),
    };

    info!(
        records = report.records_delivered(),
        report = %serde_json::to_string(&report)?,
        "Console consumer stopped"
    );

    if report.has_failures() {
        error!(resource = %report.resource, "One or more partitions ended with an error");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Startup failures are reported with the usage text and a non-zero exit.
fn usage_error(kind: ErrorKind, message: String) -> ! {
    error!(error = %message, "Startup failed");
    Args::command().error(kind, message).exit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "eh-console-consumer",
            "-e",
            "telemetry",
            "-n",
            "contoso",
            "-k",
            "RootManageSharedAccessKey",
            "-t",
            "secret",
            "-b",
            "25",
            "--start",
            "end",
            "--partitions",
            "0,2",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.resource.name, "telemetry");
        assert_eq!(config.polling.batch_size, 25);
        assert_eq!(config.polling.start_position, StartPosition::EndOfStream);
        assert_eq!(config.polling.partitions, Some(vec![0, 2]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_batch_fails_validation() {
        let args = Args::try_parse_from([
            "eh-console-consumer",
            "-e",
            "telemetry",
            "-n",
            "contoso",
            "-k",
            "key",
            "-t",
            "secret",
            "-b",
            "18446744073709551615",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_flag_is_rejected() {
        let err = Args::try_parse_from(["eh-console-consumer", "-e", "telemetry", "-n", "contoso"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_bad_start_position_is_rejected() {
        let result = Args::try_parse_from([
            "eh-console-consumer",
            "-e",
            "telemetry",
            "-n",
            "contoso",
            "-k",
            "key",
            "-t",
            "secret",
            "--start",
            "yesterday",
        ]);
        assert!(result.is_err());
    }
}
