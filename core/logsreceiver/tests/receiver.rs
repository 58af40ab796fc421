use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use logsreceiver::{
    config::{DeliveryConfig, OnDeliveryError, ReceiverConfig},
    converter::ConverterConfig,
    entry::Entry,
    logs::Logs,
    operator::{Capability, Operator, StartContext, registry::OperatorBuilder, registry::OperatorRegistry},
    pipeline::BuildError,
    plugin,
    receiver::{Host, LogsConsumer, Receiver},
    static_operators,
};
use pretty_assertions::assert_eq;
use serde::Deserialize;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Input that emits `count` JSON strings, then waits for the shutdown.
struct Ticker {
    count: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TickerConfig {
    count: u64,
}

impl Operator for Ticker {
    fn start(&mut self, ctx: &mut dyn StartContext) -> anyhow::Result<()> {
        let output = ctx.output();
        let shutdown = ctx.shutdown_token();
        let count = self.count;
        ctx.spawn(Box::pin(async move {
            for i in 0..count {
                output.send(Entry::with_body(format!(r#"{{"tick": {i}}}"#))).await?;
            }
            shutdown.cancelled().await;
            Ok(())
        }));
        Ok(())
    }
}

struct FailingStart;

impl Operator for FailingStart {
    fn start(&mut self, _ctx: &mut dyn StartContext) -> anyhow::Result<()> {
        Err(anyhow!("address already in use"))
    }
}

impl OperatorBuilder for Ticker {
    type Config = TickerConfig;

    fn type_name() -> &'static str {
        "ticker"
    }

    fn capability() -> Capability {
        Capability::Input
    }

    fn build(_id: &str, config: TickerConfig) -> anyhow::Result<Box<Self>> {
        Ok(Box::new(Ticker { count: config.count }))
    }
}

#[derive(Deserialize)]
struct EmptyConfig {}

impl OperatorBuilder for FailingStart {
    type Config = EmptyConfig;

    fn type_name() -> &'static str {
        "failing_start"
    }

    fn capability() -> Capability {
        Capability::Input
    }

    fn build(_id: &str, _config: EmptyConfig) -> anyhow::Result<Box<Self>> {
        Ok(Box::new(FailingStart))
    }
}

fn registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register_all(static_operators![Ticker, FailingStart]).unwrap();
    registry
}

fn plugin_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/testdata/plugins")
}

fn config(pipeline: &str) -> ReceiverConfig {
    let mut config: ReceiverConfig = pipeline.parse().unwrap();
    config.converter = ConverterConfig {
        max_flush_count: 1,
        flush_interval: Duration::from_secs(3),
    };
    config
}

type Received = Arc<Mutex<Vec<Logs>>>;

fn collector() -> (Received, Arc<dyn LogsConsumer>) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let consumer = move |logs: Logs| {
        let received = received2.clone();
        async move {
            received.lock().unwrap().push(logs);
            anyhow::Ok(())
        }
    };
    (received, Arc::new(consumer))
}

fn nop() -> Arc<dyn LogsConsumer> {
    Arc::new(|_logs: Logs| async { anyhow::Ok(()) })
}

fn host() -> (Arc<Mutex<Vec<String>>>, Arc<dyn Host>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors2 = errors.clone();
    let host = move |e: anyhow::Error| errors2.lock().unwrap().push(format!("{e:#}"));
    (errors, Arc::new(host))
}

fn record_count(received: &Received) -> usize {
    received.lock().unwrap().iter().map(Logs::record_count).sum()
}

async fn wait_for_records(received: &Received, n: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while record_count(received) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the records should be delivered");
}

#[test]
fn create() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = registry();

    let receiver = Receiver::new(config("[[pipeline]]\ntype = \"json_parser\""), &registry, nop());
    assert!(receiver.is_ok(), "{:?}", receiver.err());

    let mut with_plugins = config("[[pipeline]]\ntype = \"hello\"");
    with_plugins.plugin_dir = Some(plugin_dir());
    let receiver = Receiver::new(with_plugins, &registry, nop());
    assert!(receiver.is_ok(), "{:?}", receiver.err());

    let mut with_parameters = config("[[pipeline]]\ntype = \"requires_parameter\"\nname = \"You\"");
    with_parameters.plugin_dir = Some(plugin_dir());
    let receiver = Receiver::new(with_parameters, &registry, nop());
    assert!(receiver.is_ok(), "{:?}", receiver.err());
}

#[test]
fn create_errors() {
    let registry = registry();

    let mut missing_dir = config("[[pipeline]]\ntype = \"whodis\"");
    missing_dir.plugin_dir = Some(plugin_dir().join("pluginsssss"));
    let err = Receiver::new(missing_dir, &registry, nop()).err().unwrap();
    assert!(
        matches!(err.downcast_ref::<plugin::LoadError>(), Some(plugin::LoadError::DirNotFound(_))),
        "{err:#}"
    );

    let mut missing_parameter = config("[[pipeline]]\ntype = \"requires_parameter\"");
    missing_parameter.plugin_dir = Some(plugin_dir());
    let err = Receiver::new(missing_parameter, &registry, nop()).err().unwrap();
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingParameter { parameter, .. }) => assert_eq!(parameter, "name"),
        _ => panic!("unexpected error: {err:#}"),
    }

    let missing_type = config("[[pipeline]]\nbadparam = \"badvalue\"");
    let err = Receiver::new(missing_type, &registry, nop()).err().unwrap();
    assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::MissingType { .. })), "{err:#}");

    let unknown_type = config("[[pipeline]]\ntype = \"nonexistent\"");
    let err = Receiver::new(unknown_type, &registry, nop()).err().unwrap();
    assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::UnknownType { .. })), "{err:#}");

    let bad_field = config("[[pipeline]]\ntype = \"ticker\"\ncount = \"many\"");
    let err = Receiver::new(bad_field, &registry, nop()).err().unwrap();
    assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::InvalidConfig { .. })), "{err:#}");

    let mut bad_converter = config("[[pipeline]]\ntype = \"json_parser\"");
    bad_converter.converter.max_flush_count = 0;
    assert!(Receiver::new(bad_converter, &registry, nop()).is_err());
}

#[tokio::test]
async fn entries_are_delivered() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = registry();
    let (received, consumer) = collector();
    let (errors, host) = host();

    let mut config = config(
        r#"
        [[pipeline]]
        type = "ticker"
        count = 10

        [[pipeline]]
        type = "parse_and_greet"
        who = "World"
        "#,
    );
    config.plugin_dir = Some(plugin_dir());
    config.converter.max_flush_count = 4;

    let mut receiver = Receiver::new(config, &registry, consumer).unwrap();
    assert!(!receiver.is_running());
    receiver.start(host.clone()).await.unwrap();
    assert!(receiver.is_running());
    assert!(receiver.start(host).await.is_err(), "the receiver cannot start twice");

    // two full batches, the last 2 entries wait for the timer or the shutdown
    wait_for_records(&received, 8).await;
    receiver.shutdown().await.unwrap();
    assert!(!receiver.is_running());
    receiver.shutdown().await.unwrap();

    let received = received.lock().unwrap();
    let sizes: Vec<usize> = received.iter().map(Logs::record_count).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let records: Vec<_> = received.iter().flat_map(|logs| logs.records()).map(|(_, r)| r).collect();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.body, serde_json::json!({"tick": i}));
        assert_eq!(
            record.attributes.get("greeting").map(String::as_str),
            Some("hello World!")
        );
    }
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn entries_can_be_injected() {
    let registry = registry();
    let (received, consumer) = collector();
    let (_, host) = host();

    let mut receiver = Receiver::new(config("[[pipeline]]\ntype = \"json_parser\""), &registry, consumer).unwrap();
    assert!(receiver.entry_sender().is_none());
    receiver.start(host).await.unwrap();

    let sender = receiver.entry_sender().unwrap();
    sender.send(Entry::with_body(r#"{"message": "hi"}"#)).await.unwrap();
    sender.send(Entry::with_body("not json")).await.unwrap();
    drop(sender);

    wait_for_records(&received, 2).await;
    receiver.shutdown().await.unwrap();

    let received = received.lock().unwrap();
    let bodies: Vec<_> = received
        .iter()
        .flat_map(|logs| logs.records())
        .map(|(_, r)| r.body.clone())
        .collect();
    // json_parser forwards unparsable entries unchanged by default
    assert_eq!(
        bodies,
        vec![serde_json::json!({"message": "hi"}), serde_json::json!("not json")]
    );
}

#[tokio::test]
async fn shutdown_flushes_remaining_entries() {
    let registry = registry();
    let (received, consumer) = collector();
    let (_, host) = host();

    let mut config = config("[[pipeline]]\ntype = \"ticker\"\ncount = 3");
    config.converter = ConverterConfig {
        max_flush_count: 100,
        flush_interval: Duration::from_secs(3600),
    };
    let mut receiver = Receiver::new(config, &registry, consumer).unwrap();
    receiver.start(host).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(record_count(&received), 0);

    receiver.shutdown().await.unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].record_count(), 3);
}

#[tokio::test]
async fn failed_start() {
    let registry = registry();
    let (_, host) = host();

    let mut receiver = Receiver::new(config("[[pipeline]]\ntype = \"failing_start\""), &registry, nop()).unwrap();
    let err = receiver.start(host.clone()).await.unwrap_err();
    assert!(format!("{err:#}").contains("address already in use"), "{err:#}");
    assert!(!receiver.is_running());
    assert!(receiver.start(host).await.is_err());
    receiver.shutdown().await.unwrap();
}

#[tokio::test]
async fn consumer_errors_do_not_stop_the_receiver() {
    let registry = registry();
    let (_, host) = host();
    let attempts = Arc::new(Mutex::new(0));
    let attempts2 = attempts.clone();
    let consumer = move |_logs: Logs| {
        let attempts = attempts2.clone();
        async move {
            *attempts.lock().unwrap() += 1;
            Err::<(), _>(anyhow!("downstream unavailable"))
        }
    };

    let mut receiver = Receiver::new(
        config("[[pipeline]]\ntype = \"ticker\"\ncount = 5"),
        &registry,
        Arc::new(consumer),
    )
    .unwrap();
    receiver.start(host).await.unwrap();
    tokio::time::timeout(TIMEOUT, async {
        while *attempts.lock().unwrap() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("every batch should be given to the consumer");
    receiver.shutdown().await.unwrap();
    assert_eq!(*attempts.lock().unwrap(), 5);
}

/// Consumer that rejects every batch and records the time of each attempt.
fn rejecting() -> (Arc<Mutex<Vec<tokio::time::Instant>>>, Arc<dyn LogsConsumer>) {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let attempts2 = attempts.clone();
    let consumer = move |_logs: Logs| {
        let attempts = attempts2.clone();
        async move {
            attempts.lock().unwrap().push(tokio::time::Instant::now());
            Err::<(), _>(anyhow!("downstream unavailable"))
        }
    };
    (attempts, Arc::new(consumer))
}

fn retry(max_retries: u32, retry_backoff: Duration) -> DeliveryConfig {
    DeliveryConfig {
        on_error: OnDeliveryError::Retry,
        max_retries,
        retry_backoff,
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_batches_are_retried_then_dropped() {
    let registry = registry();
    let (_, host) = host();
    let (attempts, consumer) = rejecting();

    let mut config = config("[[pipeline]]\ntype = \"ticker\"\ncount = 1");
    config.delivery = retry(3, Duration::from_secs(1));
    let mut receiver = Receiver::new(config, &registry, consumer).unwrap();
    receiver.start(host).await.unwrap();

    tokio::time::timeout(Duration::from_secs(60), async {
        while attempts.lock().unwrap().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the batch should be retried");
    // dropped after max_retries: no more attempts
    tokio::time::sleep(Duration::from_secs(30)).await;

    {
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        let delays: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }
    receiver.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_does_not_wait_for_retries() {
    let registry = registry();
    let (_, host) = host();
    let (attempts, consumer) = rejecting();

    let mut config = config("[[pipeline]]\ntype = \"ticker\"\ncount = 3");
    config.delivery = retry(10, Duration::from_secs(1));
    config.shutdown_timeout = Duration::from_millis(500);
    let mut receiver = Receiver::new(config, &registry, consumer).unwrap();
    receiver.start(host).await.unwrap();

    tokio::time::timeout(TIMEOUT, async {
        while attempts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the first batch should be given to the consumer");

    let start = std::time::Instant::now();
    tokio::time::timeout(TIMEOUT, receiver.shutdown())
        .await
        .expect("the shutdown should not wait for the retries")
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    // at most one attempt per batch after the shutdown began, plus the first one
    assert!(attempts.lock().unwrap().len() <= 4);
}

#[tokio::test]
async fn shutdown_abandons_a_stuck_consumer() {
    let registry = registry();
    let (_, host) = host();
    let stuck: Arc<dyn LogsConsumer> = Arc::new(|_logs: Logs| std::future::pending::<anyhow::Result<()>>());

    let mut config = config("[[pipeline]]\ntype = \"ticker\"\ncount = 2");
    config.shutdown_timeout = Duration::from_millis(200);
    let mut receiver = Receiver::new(config, &registry, stuck).unwrap();
    receiver.start(host).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = std::time::Instant::now();
    let res = tokio::time::timeout(TIMEOUT, receiver.shutdown())
        .await
        .expect("the shutdown should give up on the consumer");
    let err = res.expect_err("the remaining logs are lost");
    assert!(format!("{err:#}").contains("could not be delivered"), "{err:#}");
    assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    assert!(!receiver.is_running());
}
