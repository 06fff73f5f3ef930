//! Completion aggregator integration tests
//!
//! Two or three in-process endpoints are driven through a [`LocalRegistry`];
//! gated operations let each test decide the order in which members finish.

mod common;

use async_trait::async_trait;
use common::{gated_host, instant, wait_until, Gates, TIMEOUT};
use parking_lot::Mutex;
use rust_daq_lrc::config::{AggregatorConfig, EngineConfig, NotificationConfig};
use rust_daq_lrc::lrc::channels::LAST_RESULT;
use rust_daq_lrc::lrc::CommandResult;
use rust_daq_lrc::{
    AppResult, AttributeBus, AttributeEvent, CommandHost, CommandId, CompletionAggregator,
    Endpoint, EndpointProvider, GroupCompletion, GroupStatus, LocalRegistry, LrcError,
    NotificationSink, ResultCode, SubmitResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_test::traced_test;

struct Harness {
    gates: Gates,
    registry: Arc<LocalRegistry>,
    bus: Arc<AttributeBus>,
}

impl Harness {
    /// Endpoints named `names`, each serving a gated `Scan` command.
    fn new(names: &[&str]) -> Self {
        let gates = Gates::new();
        let bus = Arc::new(AttributeBus::from_config(&NotificationConfig::default()));
        let registry = Arc::new(LocalRegistry::new());
        for name in names {
            registry.register(gated_host(name, "Scan", &gates, bus.clone()));
        }
        Self {
            gates,
            registry,
            bus,
        }
    }

    fn aggregator(&self, endpoints: &[&str], group_timeout: Option<Duration>) -> CompletionAggregator {
        let config = AggregatorConfig {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            group_timeout,
        };
        CompletionAggregator::new(&config, self.registry.clone())
    }

    /// Release the `Scan` invoked on `endpoint` with argument `arg`.
    fn finish(&self, endpoint: &str, arg: &str) {
        self.gates.open(&format!("{endpoint}/{arg}"));
    }
}

/// A callback that forwards its completion to the returned receiver.
fn capture() -> (
    impl FnOnce(GroupCompletion) + Send + 'static,
    mpsc::UnboundedReceiver<GroupCompletion>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |completion| {
            let _ = tx.send(completion);
        },
        rx,
    )
}

async fn next_completion(rx: &mut mpsc::UnboundedReceiver<GroupCompletion>) -> GroupCompletion {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("group did not complete")
        .expect("callback dropped without firing")
}

/// Assert the callback has not fired (yet).
async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<GroupCompletion>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "group completed too early");
}

async fn join_in_order(first: &str, second: &str) {
    let harness = Harness::new(&["dish-1", "dish-2"]);
    let aggregator = harness.aggregator(&["dish-1", "dish-2"], None);
    let (callback, mut rx) = capture();

    let group_id = aggregator
        .dispatch("Scan", Some(serde_json::json!("g")), callback)
        .await
        .unwrap();
    assert!(aggregator.is_pending(&group_id));

    harness.finish(first, "g");
    assert_silent(&mut rx).await;
    assert!(aggregator.is_pending(&group_id));

    harness.finish(second, "g");
    let completion = next_completion(&mut rx).await;

    assert_eq!(completion.group_id, group_id);
    assert_eq!(completion.command_name, "Scan");
    assert_eq!(completion.status, GroupStatus::Completed);
    assert_eq!(completion.command_ids.len(), 2);
    assert_ne!(completion.command_ids[0], completion.command_ids[1]);

    assert_eq!(aggregator.pending_groups(), 0);
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_group_fires_after_both_members_in_order() {
    join_in_order("dish-1", "dish-2").await;
}

#[tokio::test]
async fn test_group_fires_after_both_members_reversed() {
    join_in_order("dish-2", "dish-1").await;
}

#[tokio::test]
async fn test_concurrent_groups_are_isolated() {
    let harness = Harness::new(&["dish-1", "dish-2"]);
    let aggregator = harness.aggregator(&["dish-1", "dish-2"], None);
    let (first_cb, mut first_rx) = capture();
    let (second_cb, mut second_rx) = capture();

    let first = aggregator
        .dispatch("Scan", Some(serde_json::json!("g1")), first_cb)
        .await
        .unwrap();
    let second = aggregator
        .dispatch("Scan", Some(serde_json::json!("g2")), second_cb)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(aggregator.pending_groups(), 2);

    // Two results for the same command name arrive, one per group.
    harness.finish("dish-1", "g1");
    harness.finish("dish-1", "g2");
    assert_silent(&mut first_rx).await;
    assert_silent(&mut second_rx).await;

    harness.finish("dish-2", "g1");
    let first_done = next_completion(&mut first_rx).await;
    assert_eq!(first_done.group_id, first);
    assert!(aggregator.is_pending(&second));
    assert_silent(&mut second_rx).await;

    harness.finish("dish-2", "g2");
    let second_done = next_completion(&mut second_rx).await;
    assert_eq!(second_done.group_id, second);

    assert!(first_done
        .command_ids
        .iter()
        .all(|id| !second_done.command_ids.contains(id)));
    assert_eq!(aggregator.pending_groups(), 0);
}

/// Aggregator over `names`, each hosting an instant `Ping`, on a bus that
/// warns after `backlog_warning` undelivered events.
fn ping_aggregator(names: &[&str], backlog_warning: usize) -> CompletionAggregator {
    let bus = Arc::new(AttributeBus::from_config(&NotificationConfig { backlog_warning }));
    let registry = Arc::new(LocalRegistry::new());
    let config = EngineConfig {
        max_queue_size: 256,
        poll_interval: Duration::from_millis(10),
    };
    for name in names {
        let host = CommandHost::new(*name, &config, bus.clone());
        host.register_command("Ping", || instant("Ping"));
        registry.register(Arc::new(host));
    }
    CompletionAggregator::new(
        &AggregatorConfig {
            endpoints: names.iter().map(|n| n.to_string()).collect(),
            group_timeout: None,
        },
        registry,
    )
}

async fn dispatch_pings(aggregator: &CompletionAggregator, groups: usize, members: usize) {
    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..groups {
        let completed = completed.clone();
        aggregator
            .dispatch("Ping", None, move |completion| {
                assert_eq!(completion.command_ids.len(), members);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
    }

    wait_until("every group", || completed.load(Ordering::SeqCst) == groups).await;
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test]
async fn test_fast_commands_all_complete() {
    let aggregator = ping_aggregator(&["fast-1", "fast-2", "fast-3"], 1024);
    dispatch_pings(&aggregator, 20, 3).await;
}

#[tokio::test]
async fn test_burst_beyond_backlog_warning_loses_no_group() {
    // Every command announces several result and queue changes, so 200
    // groups push far more events than the warning threshold through each
    // subscription.
    let aggregator = ping_aggregator(&["burst-1", "burst-2"], 16);
    dispatch_pings(&aggregator, 200, 2).await;
}

#[tokio::test]
async fn test_redispatch_after_completion_starts_fresh_group() {
    let harness = Harness::new(&["dish-1", "dish-2"]);
    let aggregator = harness.aggregator(&["dish-1", "dish-2"], None);

    let (first_cb, mut first_rx) = capture();
    let first = aggregator
        .dispatch("Scan", Some(serde_json::json!("a")), first_cb)
        .await
        .unwrap();
    harness.finish("dish-1", "a");
    harness.finish("dish-2", "a");
    let first_done = next_completion(&mut first_rx).await;
    assert_eq!(aggregator.pending_groups(), 0);

    let (second_cb, mut second_rx) = capture();
    let second = aggregator
        .dispatch("Scan", Some(serde_json::json!("b")), second_cb)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(aggregator.is_pending(&second));
    assert_silent(&mut second_rx).await;

    harness.finish("dish-2", "b");
    harness.finish("dish-1", "b");
    let second_done = next_completion(&mut second_rx).await;

    assert_eq!(second_done.group_id, second);
    assert_eq!(second_done.status, GroupStatus::Completed);
    assert!(second_done
        .command_ids
        .iter()
        .all(|id| !first_done.command_ids.contains(id)));
    assert_eq!(aggregator.pending_groups(), 0);
    assert_silent(&mut first_rx).await;
    assert_silent(&mut second_rx).await;
}

/// An endpoint that always assigns the same command id and reports its
/// result only when told to.
struct FixedIdEndpoint {
    name: String,
    id: CommandId,
    sinks: Mutex<Vec<Arc<dyn NotificationSink>>>,
}

impl FixedIdEndpoint {
    fn new(name: &str, id: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id: CommandId::from(id),
            sinks: Mutex::new(Vec::new()),
        })
    }

    fn complete(&self) {
        let result = CommandResult {
            id: self.id.clone(),
            code: ResultCode::Ok,
            message: "done".to_string(),
        };
        let value = serde_json::to_value(Some(result)).unwrap();
        for sink in self.sinks.lock().iter() {
            sink.on_notification(AttributeEvent::new(&self.name, LAST_RESULT, value.clone()));
        }
    }
}

#[async_trait]
impl Endpoint for FixedIdEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _command: &str,
        _arg: Option<serde_json::Value>,
    ) -> AppResult<SubmitResponse> {
        Ok(SubmitResponse::queued(self.id.clone()))
    }

    async fn subscribe(&self, _attribute: &str, sink: Arc<dyn NotificationSink>) -> AppResult<()> {
        self.sinks.lock().push(sink);
        Ok(())
    }
}

struct FixedProvider {
    endpoints: HashMap<String, Arc<FixedIdEndpoint>>,
}

#[async_trait]
impl EndpointProvider for FixedProvider {
    async fn connect(&self, address: &str) -> AppResult<Arc<dyn Endpoint>> {
        let endpoint: Arc<dyn Endpoint> = self
            .endpoints
            .get(address)
            .cloned()
            .ok_or_else(|| LrcError::EndpointNotFound(address.to_string()))?;
        Ok(endpoint)
    }
}

#[tokio::test]
async fn test_same_id_from_two_endpoints_completes_group() {
    let id = "1700000000.000001_Scan";
    let dish_1 = FixedIdEndpoint::new("dish-1", id);
    let dish_2 = FixedIdEndpoint::new("dish-2", id);
    let provider = Arc::new(FixedProvider {
        endpoints: HashMap::from([
            ("dish-1".to_string(), dish_1.clone()),
            ("dish-2".to_string(), dish_2.clone()),
        ]),
    });
    let aggregator = CompletionAggregator::new(
        &AggregatorConfig {
            endpoints: vec!["dish-1".into(), "dish-2".into()],
            group_timeout: None,
        },
        provider,
    );
    let (callback, mut rx) = capture();

    let group_id = aggregator.dispatch("Scan", None, callback).await.unwrap();
    assert!(aggregator.is_pending(&group_id));

    dish_1.complete();
    assert_silent(&mut rx).await;
    assert!(aggregator.is_pending(&group_id));

    dish_2.complete();
    let completion = next_completion(&mut rx).await;
    assert_eq!(completion.group_id, group_id);
    assert_eq!(completion.status, GroupStatus::Completed);
    assert_eq!(
        completion.command_ids,
        vec![CommandId::from(id), CommandId::from(id)]
    );
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test]
async fn test_failed_member_stalls_group_without_timeout() {
    let harness = Harness::new(&["dish-1"]);
    // Serves no commands, so every invocation on it fails.
    harness.registry.register(Arc::new(CommandHost::new(
        "dish-2",
        &EngineConfig::default(),
        harness.bus.clone(),
    )));
    let aggregator = harness.aggregator(&["dish-1", "dish-2"], None);
    let (callback, mut rx) = capture();

    let group_id = aggregator
        .dispatch("Scan", Some(serde_json::json!("g")), callback)
        .await
        .unwrap();
    harness.finish("dish-1", "g");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(aggregator.is_pending(&group_id));
}

#[tokio::test]
async fn test_group_timeout_reports_missing_endpoints() {
    let harness = Harness::new(&["dish-1", "dish-2"]);
    let aggregator = harness.aggregator(&["dish-1", "dish-2"], Some(Duration::from_millis(200)));
    let (callback, mut rx) = capture();

    let group_id = aggregator
        .dispatch("Scan", Some(serde_json::json!("g")), callback)
        .await
        .unwrap();
    harness.finish("dish-1", "g");

    let completion = next_completion(&mut rx).await;
    assert_eq!(completion.group_id, group_id);
    assert_eq!(
        completion.status,
        GroupStatus::TimedOut {
            pending: vec!["dish-2".to_string()]
        }
    );
    assert_eq!(completion.command_ids.len(), 2);
    assert!(!aggregator.is_pending(&group_id));

    // A late result for the expired group is ignored.
    harness.finish("dish-2", "g");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_unknown_endpoint_fails_dispatch() {
    let harness = Harness::new(&["dish-1"]);
    let aggregator = harness.aggregator(&["dish-1", "dish-9"], None);

    let err = aggregator
        .dispatch_detached("Scan", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LrcError::EndpointNotFound(name) if name == "dish-9"));
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test]
async fn test_empty_endpoint_list_is_a_configuration_error() {
    let harness = Harness::new(&[]);
    let aggregator = harness.aggregator(&[], None);
    let err = aggregator.dispatch_detached("Scan", None).await.unwrap_err();
    assert!(matches!(err, LrcError::Configuration(_)));
}

/// Counts connections made through an inner registry.
struct CountingProvider {
    inner: Arc<LocalRegistry>,
    connects: AtomicUsize,
}

#[async_trait]
impl EndpointProvider for CountingProvider {
    async fn connect(&self, address: &str) -> AppResult<Arc<dyn Endpoint>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(address).await
    }
}

#[tokio::test]
async fn test_endpoints_are_connected_once() {
    let harness = Harness::new(&["dish-1", "dish-2"]);
    let provider = Arc::new(CountingProvider {
        inner: harness.registry.clone(),
        connects: AtomicUsize::new(0),
    });
    let aggregator = CompletionAggregator::new(
        &AggregatorConfig {
            endpoints: vec!["dish-1".into(), "dish-2".into()],
            group_timeout: None,
        },
        provider.clone(),
    );

    for arg in ["a", "b", "c"] {
        aggregator
            .dispatch_detached("Scan", Some(serde_json::json!(arg)))
            .await
            .unwrap();
        harness.finish("dish-1", arg);
        harness.finish("dish-2", arg);
    }

    wait_until("groups to drain", || aggregator.pending_groups() == 0).await;
    assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[traced_test]
async fn test_group_lifecycle_is_logged() {
    let harness = Harness::new(&["dish-1"]);
    let aggregator = harness.aggregator(&["dish-1"], None);
    let (callback, mut rx) = capture();

    aggregator
        .dispatch("Scan", Some(serde_json::json!("g")), callback)
        .await
        .unwrap();
    harness.finish("dish-1", "g");
    next_completion(&mut rx).await;

    assert!(logs_contain("Group dispatched"));
    assert!(logs_contain("Group completed"));
}
