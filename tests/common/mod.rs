//! Common test utilities for long-running command integration tests
//!
//! This module provides reusable test helpers for:
//! - Gated operations whose completion the test controls
//! - Waiting on conditions with a bounded timeout
//! - Recording every result an engine publishes, in order

#![allow(dead_code)] // Utilities may not all be used by every test binary

use parking_lot::Mutex;
use rust_daq_lrc::config::EngineConfig;
use rust_daq_lrc::lrc::channels::LAST_RESULT;
use rust_daq_lrc::lrc::CommandResult;
use rust_daq_lrc::{AttributeBus, CommandHost, FnOperation, Operation, ResultCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::StreamExt;

/// Upper bound for any wait in these tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Engine configuration with a short poll interval.
pub fn engine_config(max_queue_size: usize) -> EngineConfig {
    EngineConfig {
        max_queue_size,
        poll_interval: Duration::from_millis(10),
    }
}

/// Poll `condition` every few milliseconds until it holds.
///
/// # Panics
/// Panics if the condition does not hold within [`TIMEOUT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Named gates that gated operations wait on.
#[derive(Clone, Default)]
pub struct Gates {
    gates: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl Gates {
    pub fn new() -> Self {
        Self::default()
    }

    fn receiver(&self, key: &str) -> watch::Receiver<bool> {
        self.gates
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Let every operation waiting on `key` finish.
    pub fn open(&self, key: &str) {
        self.gates
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }
}

/// An operation that finishes with `OK` once gate `key` opens. It ignores
/// abort requests.
pub fn gated(name: &str, gates: &Gates, key: &str) -> Box<dyn Operation> {
    let gates = gates.clone();
    let key = key.to_string();
    let label = name.to_string();
    Box::new(FnOperation::new(name, move |_ctx, _arg| {
        let mut open = gates.receiver(&key);
        let label = label.clone();
        async move {
            open.wait_for(|open| *open).await?;
            Ok((ResultCode::Ok, format!("{label} done")))
        }
    }))
}

/// Like [`gated`], but the gate key is `<prefix>/<arg>` so one registered
/// command can be released per invocation.
pub fn gated_by_arg(name: &str, gates: &Gates, prefix: &str) -> Box<dyn Operation> {
    let gates = gates.clone();
    let prefix = prefix.to_string();
    let label = name.to_string();
    Box::new(FnOperation::new(name, move |_ctx, arg| {
        let key = format!(
            "{}/{}",
            prefix,
            arg.as_ref().and_then(|v| v.as_str()).unwrap_or_default()
        );
        let mut open = gates.receiver(&key);
        let label = label.clone();
        async move {
            open.wait_for(|open| *open).await?;
            Ok((ResultCode::Ok, format!("{label} {key} done")))
        }
    }))
}

/// An operation that runs until the engine aborts, then reports `ABORTED`.
pub fn cooperative(name: &str) -> Box<dyn Operation> {
    let label = name.to_string();
    Box::new(FnOperation::new(name, move |ctx, _arg| {
        let label = label.clone();
        async move {
            let mut percent = 0u8;
            while !ctx.is_aborting() {
                percent = (percent + 1).min(99);
                ctx.report_progress(percent);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok((ResultCode::Aborted, format!("{label} aborted while running")))
        }
    }))
}

/// An operation that completes immediately.
pub fn instant(name: &str) -> Box<dyn Operation> {
    Box::new(FnOperation::new(name, |_ctx, _arg| async {
        Ok((ResultCode::Ok, "done".to_string()))
    }))
}

/// Create a host with one gated-by-arg command registered under `command`.
pub fn gated_host(
    name: &str,
    command: &'static str,
    gates: &Gates,
    bus: Arc<AttributeBus>,
) -> Arc<CommandHost> {
    let host = CommandHost::new(name, &engine_config(8), bus);
    let gates = gates.clone();
    let prefix = name.to_string();
    host.register_command(command, move || gated_by_arg(command, &gates, &prefix));
    Arc::new(host)
}

/// Every result published by one endpoint, in publication order.
#[derive(Clone)]
pub struct ResultLog {
    results: Arc<Mutex<Vec<CommandResult>>>,
}

impl ResultLog {
    /// Start recording results of `source` announced on `bus`.
    pub fn record(bus: &AttributeBus, source: &str) -> Self {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let mut events = bus.subscribe(source, LAST_RESULT);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Ok(Some(result)) =
                    serde_json::from_value::<Option<CommandResult>>(event.value)
                {
                    sink.lock().push(result);
                }
            }
        });
        Self { results }
    }

    pub fn snapshot(&self) -> Vec<CommandResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    /// Wait until at least `count` results have been recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<CommandResult> {
        wait_until(&format!("{count} results"), || self.len() >= count).await;
        self.snapshot()
    }
}
