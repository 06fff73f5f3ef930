//! Completion aggregation across endpoints.
//!
//! A [`CompletionAggregator`] fans one named command out to every configured
//! endpoint and joins the resulting, independently completing commands into a
//! *group*. Completions arrive as result-channel notifications, out of order
//! and interleaved across endpoints; each is matched to its group by the
//! reporting endpoint and command id, and the group's callback fires exactly
//! once when its last member reports. Ids are only unique per endpoint, so
//! the same id reported by two endpoints belongs to two different members.
//!
//! ```text
//! dispatch("Scan") --invoke--> endpoint A  --> id a1 --+
//!                  --invoke--> endpoint B  --> id b1 --+--> group g1 {a1, b1}
//!
//! notification(a1) -> g1: 1/2
//! notification(b1) -> g1: 2/2 -> remove g1 -> callback(g1)
//! ```
//!
//! A member whose invocation failed never completes. Without a configured
//! group timeout its group therefore never fires; with one, the group
//! resolves as [`GroupStatus::TimedOut`] when the deadline passes.
//!
//! A result may be announced before its `dispatch` call has recorded the id.
//! Such results are held back only while some dispatch is still waiting for
//! its invocations to answer; anything else unmatched is not ours and is
//! dropped.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::error::{AppResult, LrcError};
use crate::lrc::channels::{CommandResult, LAST_RESULT};
use crate::lrc::{CommandId, ResultCode};
use crate::notify::AttributeEvent;
use crate::transport::{Endpoint, EndpointProvider, NotificationSink};

/// Identifies the commands created by one `dispatch` call.
pub type GroupId = Uuid;

/// Completions seen before their dispatch was recorded, kept for matching.
const EARLY_COMPLETION_CAPACITY: usize = 256;

/// A member command: reporting endpoint plus the id it assigned.
type MemberKey = (String, CommandId);

/// How a group was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    /// Every member reported a result.
    Completed,
    /// The group deadline passed first; `pending` lists the endpoints that
    /// had not reported.
    TimedOut {
        /// Endpoints without a result.
        pending: Vec<String>,
    },
}

/// Passed to a group's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCompletion {
    /// The group.
    pub group_id: GroupId,
    /// Command dispatched to every endpoint.
    pub command_name: String,
    /// Ids assigned by the endpoints, in endpoint order.
    pub command_ids: Vec<CommandId>,
    /// Resolution.
    pub status: GroupStatus,
}

/// Callback fired once per group.
pub type CompletionCallback = Box<dyn FnOnce(GroupCompletion) + Send + 'static>;

#[derive(Debug)]
struct Member {
    endpoint: String,
    command_id: Option<CommandId>,
    completed: bool,
}

struct PendingGroup {
    command_name: String,
    members: Vec<Member>,
    callback: Option<CompletionCallback>,
    /// Set once every invocation has answered; until then the group cannot
    /// complete.
    sealed: bool,
    deadline: Option<JoinHandle<()>>,
}

impl PendingGroup {
    fn is_complete(&self) -> bool {
        self.sealed && self.members.iter().all(|m| m.completed)
    }

    fn command_ids(&self) -> Vec<CommandId> {
        self.members
            .iter()
            .filter_map(|m| m.command_id.clone())
            .collect()
    }
}

#[derive(Default)]
struct AggregatorState {
    groups: HashMap<GroupId, PendingGroup>,
    index: HashMap<MemberKey, GroupId>,
    early: VecDeque<MemberKey>,
    early_set: HashSet<MemberKey>,
    /// Dispatches whose invocations have not all answered yet.
    unsealed: usize,
}

type Fired = (Option<CompletionCallback>, GroupCompletion);

impl AggregatorState {
    /// Remove `group_id` and its index entries.
    fn close(&mut self, group_id: GroupId, status: GroupStatus) -> Option<Fired> {
        let mut group = self.groups.remove(&group_id)?;
        for member in &group.members {
            if let Some(id) = &member.command_id {
                self.index.remove(&(member.endpoint.clone(), id.clone()));
            }
        }
        if let Some(deadline) = group.deadline.take() {
            deadline.abort();
        }
        let completion = GroupCompletion {
            group_id,
            command_name: group.command_name.clone(),
            command_ids: group.command_ids(),
            status,
        };
        Some((group.callback.take(), completion))
    }

    fn mark_completed(&mut self, endpoint: &str, id: &CommandId) -> Option<Fired> {
        let key = (endpoint.to_string(), id.clone());
        let Some(group_id) = self.index.get(&key).copied() else {
            if self.unsealed > 0 {
                self.remember_early(key);
            }
            return None;
        };

        let group = self.groups.get_mut(&group_id)?;
        if let Some(member) = group
            .members
            .iter_mut()
            .find(|m| m.endpoint == endpoint && m.command_id.as_ref() == Some(id))
        {
            member.completed = true;
        }

        if group.is_complete() {
            self.close(group_id, GroupStatus::Completed)
        } else {
            None
        }
    }

    fn remember_early(&mut self, key: MemberKey) {
        if !self.early_set.insert(key.clone()) {
            return;
        }
        self.early.push_back(key);
        if self.early.len() > EARLY_COMPLETION_CAPACITY {
            if let Some(evicted) = self.early.pop_front() {
                self.early_set.remove(&evicted);
            }
        }
    }

    fn take_early(&mut self, key: &MemberKey) -> bool {
        if self.early_set.remove(key) {
            self.early.retain(|early| early != key);
            true
        } else {
            false
        }
    }

    fn begin_dispatch(&mut self, group_id: GroupId, group: PendingGroup) {
        self.groups.insert(group_id, group);
        self.unsealed += 1;
    }

    /// Seal `group_id`; returns whether it is already complete.
    fn seal(&mut self, group_id: GroupId) -> bool {
        self.unsealed = self.unsealed.saturating_sub(1);
        if self.unsealed == 0 {
            self.early.clear();
            self.early_set.clear();
        }
        match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.sealed = true;
                group.is_complete()
            }
            None => false,
        }
    }
}

struct AggregatorShared {
    state: Mutex<AggregatorState>,
}

impl AggregatorShared {
    fn expire(&self, group_id: GroupId) {
        let fired = {
            let mut state = self.state.lock();
            let pending = match state.groups.get(&group_id) {
                Some(group) => group
                    .members
                    .iter()
                    .filter(|m| !m.completed)
                    .map(|m| m.endpoint.clone())
                    .collect(),
                None => return,
            };
            state.close(group_id, GroupStatus::TimedOut { pending })
        };
        if let Some(fired) = fired {
            warn!(%group_id, status = ?fired.1.status, "Group timed out");
            fire(fired);
        }
    }
}

impl NotificationSink for AggregatorShared {
    fn on_notification(&self, event: AttributeEvent) {
        if event.attribute != LAST_RESULT {
            return;
        }
        let result = match serde_json::from_value::<Option<CommandResult>>(event.value) {
            Ok(Some(result)) => result,
            Ok(None) => return,
            Err(e) => {
                warn!(endpoint = %event.source, error = %e, "Unparseable result notification");
                return;
            }
        };
        debug!(endpoint = %event.source, command_id = %result.id, code = %result.code, "Result notification");

        let fired = self.state.lock().mark_completed(&event.source, &result.id);
        if let Some(fired) = fired {
            info!(group_id = %fired.1.group_id, command = %fired.1.command_name, "Group completed");
            fire(fired);
        }
    }
}

fn fire((callback, completion): Fired) {
    if let Some(callback) = callback {
        callback(completion);
    }
}

/// Client-side fan-out and join of long-running commands.
pub struct CompletionAggregator {
    addresses: Vec<String>,
    provider: Arc<dyn EndpointProvider>,
    endpoints: OnceCell<Vec<Arc<dyn Endpoint>>>,
    shared: Arc<AggregatorShared>,
    group_timeout: Option<Duration>,
}

impl std::fmt::Debug for CompletionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionAggregator")
            .field("addresses", &self.addresses)
            .field("connected", &self.endpoints.initialized())
            .field("pending_groups", &self.pending_groups())
            .field("group_timeout", &self.group_timeout)
            .finish()
    }
}

impl CompletionAggregator {
    /// Create an aggregator over `config.endpoints`, connecting through
    /// `provider` on first dispatch.
    pub fn new(config: &AggregatorConfig, provider: Arc<dyn EndpointProvider>) -> Self {
        Self {
            addresses: config.endpoints.clone(),
            provider,
            endpoints: OnceCell::new(),
            shared: Arc::new(AggregatorShared {
                state: Mutex::new(AggregatorState::default()),
            }),
            group_timeout: config.group_timeout,
        }
    }

    /// Dispatch `command` to every endpoint and call `on_complete` once all
    /// of them have reported a result.
    pub async fn dispatch<F>(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
        on_complete: F,
    ) -> AppResult<GroupId>
    where
        F: FnOnce(GroupCompletion) + Send + 'static,
    {
        self.dispatch_group(command, arg, Some(Box::new(on_complete)))
            .await
    }

    /// Dispatch `command` to every endpoint without a completion callback.
    pub async fn dispatch_detached(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
    ) -> AppResult<GroupId> {
        self.dispatch_group(command, arg, None).await
    }

    /// Number of groups still waiting for results.
    pub fn pending_groups(&self) -> usize {
        self.shared.state.lock().groups.len()
    }

    /// `true` while `group_id` is waiting for results.
    pub fn is_pending(&self, group_id: &GroupId) -> bool {
        self.shared.state.lock().groups.contains_key(group_id)
    }

    #[instrument(skip(self, arg, callback), fields(group_id = tracing::field::Empty))]
    async fn dispatch_group(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
        callback: Option<CompletionCallback>,
    ) -> AppResult<GroupId> {
        let endpoints = self.connect().await?;
        if endpoints.is_empty() {
            return Err(LrcError::Configuration(
                "aggregator has no endpoints configured".to_string(),
            ));
        }

        let group_id = Uuid::new_v4();
        tracing::Span::current().record("group_id", tracing::field::display(group_id));

        self.shared.state.lock().begin_dispatch(
            group_id,
            PendingGroup {
                command_name: command.to_string(),
                members: endpoints
                    .iter()
                    .map(|endpoint| Member {
                        endpoint: endpoint.name().to_string(),
                        command_id: None,
                        completed: false,
                    })
                    .collect(),
                callback,
                sealed: false,
                deadline: None,
            },
        );

        let responses = join_all(
            endpoints
                .iter()
                .map(|endpoint| endpoint.invoke(command, arg.clone())),
        )
        .await;

        let fired = {
            let mut state = self.shared.state.lock();
            for (position, response) in responses.into_iter().enumerate() {
                let endpoint = endpoints[position].name();
                let id = match response {
                    Ok(response) if response.code == ResultCode::Queued => response.command_id,
                    Ok(response) => {
                        warn!(%endpoint, %command, code = %response.code, message = %response.message, "Dispatch rejected");
                        None
                    }
                    Err(e) => {
                        warn!(%endpoint, %command, error = %e, "Dispatch failed");
                        None
                    }
                };
                let Some(id) = id else { continue };

                let key = (endpoint.to_string(), id.clone());
                let completed = state.take_early(&key);
                state.index.insert(key, group_id);
                if let Some(group) = state.groups.get_mut(&group_id) {
                    let member = &mut group.members[position];
                    member.command_id = Some(id);
                    member.completed = completed;
                }
            }

            if state.seal(group_id) {
                state.close(group_id, GroupStatus::Completed)
            } else {
                if let (Some(timeout), Some(group)) =
                    (self.group_timeout, state.groups.get_mut(&group_id))
                {
                    let shared = Arc::clone(&self.shared);
                    group.deadline = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        shared.expire(group_id);
                    }));
                }
                None
            }
        };

        info!(%command, endpoints = endpoints.len(), "Group dispatched");
        if let Some(fired) = fired {
            fire(fired);
        }
        Ok(group_id)
    }

    /// Connect and subscribe to every endpoint, once.
    async fn connect(&self) -> AppResult<&Vec<Arc<dyn Endpoint>>> {
        self.endpoints
            .get_or_try_init(|| async {
                let mut endpoints = Vec::with_capacity(self.addresses.len());
                for address in &self.addresses {
                    let endpoint = self.provider.connect(address).await?;
                    let sink: Arc<dyn NotificationSink> = self.shared.clone();
                    endpoint.subscribe(LAST_RESULT, sink).await?;
                    info!(%address, "Subscribed to endpoint results");
                    endpoints.push(endpoint);
                }
                Ok::<_, LrcError>(endpoints)
            })
            .await
    }
}
