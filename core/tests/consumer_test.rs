use std::sync::Arc;
use std::time::Duration;

use poller_core::config::{ConsumerConfig, StreamResource, TuningConfig};
use poller_core::errors::PollerError;
use poller_core::sink::console::ConsoleSink;
use poller_core::sink::memory::MemorySink;
use poller_core::source::memory::MemoryStreamClient;
use poller_core::{EventConsumer, PartitionId, PollSettings};

const TUNING: &str = r#"
polling:
  batch_size: 2
  shutdown_grace_ms: 500
retry:
  max_attempts: 2
  initial_delay_ms: 5
  max_delay_ms: 20
"#;

fn config() -> ConsumerConfig {
    let tuning = TuningConfig::from_yaml_str(TUNING).unwrap();
    let config = ConsumerConfig::new(
        StreamResource::new("contoso", "telemetry", "listen", "secret"),
        tuning,
    );
    config.validate().unwrap();
    config
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_console_output_for_every_partition() {
    let client = Arc::new(MemoryStreamClient::new("telemetry", 3));
    client.partition(2).push_batch(["hello"]);
    client.partition(0).push_batch(["a", "b", "c"]);

    let sink = Arc::new(ConsoleSink::new(Vec::new()));
    let consumer = Arc::new(EventConsumer::new(
        Arc::clone(&client),
        Arc::clone(&sink),
        PollSettings::from(&config()),
    ));

    let running = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move { consumer.run().await }
    });
    // A receive call after the last batch means that batch was fully printed.
    eventually(|| client.partition(0).receive_calls() >= 3 && client.partition(2).receive_calls() >= 2).await;

    consumer.shutdown();
    let report = running.await.unwrap().unwrap();
    drop(consumer);

    assert_eq!(report.records_delivered(), 4);
    assert_eq!(report.partitions[0].metrics.batches_received, 2);

    let output = Arc::try_unwrap(sink)
        .ok()
        .expect("sink still shared")
        .into_inner()
        .unwrap();
    let output = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines.contains(&"Partition 2, Event hello"));

    let partition_zero: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| line.starts_with("Partition 0,"))
        .collect();
    assert_eq!(
        partition_zero,
        vec!["Partition 0, Event a", "Partition 0, Event b", "Partition 0, Event c"]
    );
}

#[tokio::test]
async fn test_failing_partition_is_reported_while_others_continue() {
    let client = Arc::new(MemoryStreamClient::new("telemetry", 2));
    for _ in 0..3 {
        client.partition(0).push_failure("server busy");
    }
    let sink = Arc::new(MemorySink::new());
    let consumer = Arc::new(EventConsumer::new(
        Arc::clone(&client),
        Arc::clone(&sink),
        PollSettings::from(&config()),
    ));

    let running = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move { consumer.run().await }
    });

    eventually(|| client.partition(0).is_released()).await;
    client.partition(1).push_batch(["still flowing"]);
    eventually(|| sink.len() == 1).await;

    consumer.shutdown();
    let report = running.await.unwrap().unwrap();

    assert!(report.has_failures());
    let failed = &report.partitions[0];
    assert_eq!(failed.partition, PartitionId(0));
    assert!(failed.is_failure());
    assert_eq!(failed.metrics.receive_failures, 3);
    assert!(!report.partitions[1].is_failure());
    assert_eq!(sink.lines(), vec!["Partition 1, Event still flowing"]);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["partitions"][0]["outcome"]["status"], "failed");
    assert_eq!(json["partitions"][1]["outcome"]["status"], "cancelled");
}

#[tokio::test]
async fn test_unknown_resource_fails_before_any_receiver() {
    let client = Arc::new(MemoryStreamClient::new("telemetry", 2));
    client.fail_runtime_info("entity not found");
    let consumer = EventConsumer::new(
        Arc::clone(&client),
        Arc::new(MemorySink::new()),
        PollSettings::from(&config()),
    );

    let err = consumer.run().await.unwrap_err();
    assert!(matches!(err, PollerError::Source(_)));
    assert!(err.to_string().contains("entity not found"));
    assert!(client.open_receivers().is_empty());
}
