//! Cluster event stream with pluggable handlers.
//!
//! The autoscaler reports scaling decisions as core `Event`s. [`EventWatcher`]
//! follows the event stream and hands every event created after it started
//! to the registered handlers, once per event; [`EventCounter`] builds on
//! that to count the events a test is waiting for.

use std::collections::{BTreeMap, HashSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::jiff::Timestamp;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::poll::{AttemptError, Cancellation, Eventually, WaitContext, WaitError};

pub const CLUSTER_AUTOSCALER_COMPONENT: &str = "cluster-autoscaler";
/// Kind of the object autoscaler events are attached to (its status ConfigMap).
pub const CLUSTER_AUTOSCALER_OBJECT_KIND: &str = "ConfigMap";
pub const SCALED_UP_GROUP: &str = "ScaledUpGroup";
pub const SCALE_DOWN_EMPTY: &str = "ScaleDownEmpty";
pub const MAX_NODES_TOTAL_REACHED: &str = "MaxNodesTotalReached";

pub type EventMatcher = Box<dyn Fn(&Event) -> bool + Send + Sync>;
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event watch did not finish its initial list: {0}")]
    NotSynced(Cancellation),

    #[error("event watch ended before the initial list completed")]
    WatchEnded,
}

struct Registration {
    enabled: Arc<AtomicBool>,
    matcher: EventMatcher,
    handler: EventHandler,
}

/// Registry of event handlers. Clones share the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Arc<Mutex<Vec<Arc<Registration>>>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock().unwrap().len();
        f.debug_struct("EventDispatcher")
            .field("handlers", &handlers)
            .finish()
    }
}

impl EventDispatcher {
    /// Register `handler` for events accepted by `matcher`.
    ///
    /// The handler starts disabled. Handlers run on the watch task.
    pub fn on_event(
        &self,
        matcher: impl Fn(&Event) -> bool + Send + Sync + 'static,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let enabled = Arc::new(AtomicBool::new(false));
        self.handlers.lock().unwrap().push(Arc::new(Registration {
            enabled: enabled.clone(),
            matcher: Box::new(matcher),
            handler: Box::new(handler),
        }));
        HandlerHandle { enabled }
    }

    /// Run every enabled handler whose matcher accepts `event`. Returns how
    /// many handlers ran.
    ///
    /// Handlers run outside the registry lock, so a handler may register
    /// others; those see the next event.
    pub fn dispatch(&self, event: &Event) -> usize {
        let handlers = self.handlers.lock().unwrap().clone();
        let mut ran = 0;
        for registration in handlers.iter() {
            if registration.enabled.load(Ordering::SeqCst) && (registration.matcher)(event) {
                (registration.handler)(event);
                ran += 1;
            }
        }
        ran
    }
}

/// Switch for a registered handler.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    enabled: Arc<AtomicBool>,
}

impl HandlerHandle {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Background watch over all Events in the cluster.
///
/// Only Events created at or after the start are dispatched, each once:
/// updates to an Event (the `count` bump of an aggregated event) and
/// relists after a watch restart do not dispatch it again. The watch task
/// is aborted by [`EventWatcher::stop`] or when the watcher is dropped.
pub struct EventWatcher {
    dispatcher: EventDispatcher,
    task: JoinHandle<()>,
}

impl EventWatcher {
    /// Start watching and wait for the initial list to complete, so that
    /// handlers registered afterwards only see new events.
    pub async fn start(client: Client, ctx: &WaitContext) -> Result<Self, EventError> {
        Self::start_at(client, ctx, Timestamp::now()).await
    }

    async fn start_at(
        client: Client,
        ctx: &WaitContext,
        since: Timestamp,
    ) -> Result<Self, EventError> {
        let dispatcher = EventDispatcher::default();
        let (synced_tx, synced_rx) = oneshot::channel();
        let task = tokio::spawn(watch_events(
            Api::all(client),
            dispatcher.clone(),
            NewEvents::new(since),
            synced_tx,
        ));
        let watcher = Self { dispatcher, task };

        tokio::select! {
            synced = synced_rx => {
                synced.map_err(|_| EventError::WatchEnded)?;
            }
            cancellation = ctx.done() => return Err(EventError::NotSynced(cancellation)),
        }
        info!("event watcher synced");
        Ok(watcher)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn on_event(
        &self,
        matcher: impl Fn(&Event) -> bool + Send + Sync + 'static,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.dispatcher.on_event(matcher, handler)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Admits each Event created at or after `since`, once.
struct NewEvents {
    since: Timestamp,
    seen: HashSet<String>,
}

impl NewEvents {
    fn new(since: Timestamp) -> Self {
        // creationTimestamp has second precision.
        let since = Timestamp::from_second(since.as_second()).unwrap_or(since);
        Self {
            since,
            seen: HashSet::new(),
        }
    }

    fn admit(&mut self, event: &Event) -> bool {
        let created = event.metadata.creation_timestamp.as_ref().map(|t| t.0);
        if !created.is_some_and(|created| created >= self.since) {
            return false;
        }
        let key = event.metadata.uid.clone().unwrap_or_else(|| {
            format!(
                "{}/{}",
                event.metadata.namespace.as_deref().unwrap_or_default(),
                event.metadata.name.as_deref().unwrap_or_default()
            )
        });
        self.seen.insert(key)
    }
}

async fn watch_events(
    api: Api<Event>,
    dispatcher: EventDispatcher,
    mut new_events: NewEvents,
    synced: oneshot::Sender<()>,
) {
    let mut synced = Some(synced);
    let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());

    while let Some(item) = stream.next().await {
        match item {
            Ok(watcher::Event::InitDone) => {
                if let Some(tx) = synced.take() {
                    let _ = tx.send(());
                }
            }
            Ok(watcher::Event::Apply(event) | watcher::Event::InitApply(event)) => {
                if !new_events.admit(&event) {
                    continue;
                }
                let ran = dispatcher.dispatch(&event);
                debug!(
                    reason = event.reason.as_deref().unwrap_or_default(),
                    handlers = ran,
                    "dispatched event"
                );
            }
            Ok(watcher::Event::Init | watcher::Event::Delete(_)) => {}
            Err(error) => warn!(%error, "event watch error, backing off"),
        }
    }
}

/// Counts matched events, starting from a given value.
#[derive(Debug, Clone)]
pub struct EventCounter {
    count: Arc<AtomicU32>,
    handle: HandlerHandle,
}

impl EventCounter {
    /// A disabled counter starting at `start`.
    pub fn new(
        dispatcher: &EventDispatcher,
        matcher: impl Fn(&Event) -> bool + Send + Sync + 'static,
        start: u32,
    ) -> Self {
        let count = Arc::new(AtomicU32::new(start));
        let counted = count.clone();
        let handle = dispatcher.on_event(matcher, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        Self { count, handle }
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.handle.enable();
    }

    pub fn disable(&self) {
        self.handle.disable();
    }
}

/// Node groups expected to scale up, with whether an event named them yet.
#[derive(Debug, Clone, Default)]
pub struct ScaledGroups {
    groups: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl ScaledGroups {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups = names.into_iter().map(|n| (n.into(), false)).collect();
        Self {
            groups: Arc::new(Mutex::new(groups)),
        }
    }

    pub fn is_scaled(&self, name: &str) -> bool {
        self.groups.lock().unwrap().get(name).copied().unwrap_or(false)
    }

    pub fn all_scaled(&self) -> bool {
        self.groups.lock().unwrap().values().all(|scaled| *scaled)
    }

    /// Mark every unscaled group named by a scale-up message.
    fn observe(&self, message: &str) {
        for (name, scaled) in self.groups.lock().unwrap().iter_mut() {
            if !*scaled
                && (message.starts_with(&format!("Scale-up: group {name} size set to"))
                    || message.starts_with(&format!("Scale-up: setting group {name} size")))
            {
                *scaled = true;
            }
        }
    }
}

fn is_autoscaler_event(event: &Event, reason: &str, message_prefix: &str) -> bool {
    event.source.as_ref().and_then(|s| s.component.as_deref())
        == Some(CLUSTER_AUTOSCALER_COMPONENT)
        && event.reason.as_deref() == Some(reason)
        && event.involved_object.kind.as_deref() == Some(CLUSTER_AUTOSCALER_OBJECT_KIND)
        && event
            .message
            .as_deref()
            .is_some_and(|m| m.starts_with(message_prefix))
}

/// Counts autoscaler scale-up events and marks the `groups` they name.
pub fn scale_up_counter(
    dispatcher: &EventDispatcher,
    start: u32,
    groups: &ScaledGroups,
) -> EventCounter {
    let groups = groups.clone();
    let counter = EventCounter::new(
        dispatcher,
        move |event| {
            if !is_autoscaler_event(event, SCALED_UP_GROUP, "Scale-up:") {
                return false;
            }
            let message = event.message.as_deref().unwrap_or_default();
            groups.observe(message);
            message.starts_with("Scale-up: setting group")
        },
        start,
    );
    counter.enable();
    counter
}

pub fn scale_down_counter(dispatcher: &EventDispatcher, start: u32) -> EventCounter {
    let counter = EventCounter::new(
        dispatcher,
        |event| is_autoscaler_event(event, SCALE_DOWN_EMPTY, "Scale-down: empty node"),
        start,
    );
    counter.enable();
    counter
}

pub fn max_nodes_total_reached_counter(dispatcher: &EventDispatcher, start: u32) -> EventCounter {
    let counter = EventCounter::new(
        dispatcher,
        |event| {
            is_autoscaler_event(
                event,
                MAX_NODES_TOTAL_REACHED,
                "Max total nodes in cluster reached",
            )
        },
        start,
    );
    counter.enable();
    counter
}

/// True when `event` has the given reason and involves the named object.
pub fn event_matches(event: &Event, kind: &str, name: &str, reason: &str) -> bool {
    event.reason.as_deref() == Some(reason)
        && event.involved_object.kind.as_deref() == Some(kind)
        && event.involved_object.name.as_deref() == Some(name)
}

/// Wait until any Event with `reason` involving `kind`/`name` exists.
/// List errors are retried.
pub async fn wait_for_event(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    kind: &str,
    name: &str,
    reason: &str,
) -> Result<(), WaitError> {
    let api: Api<Event> = Api::all(client.clone());
    Eventually::new(ctx)
        .timeout(timeouts.wait_medium)
        .poll_interval(timeouts.retry_medium)
        .describe("event")
        .until(async |_| -> Result<(), AttemptError> {
            let events = api.list(&Default::default()).await.map_err(|error| {
                AttemptError::retry(format!("error querying api for events: {error}"))
            })?;
            if events.iter().any(|e| event_matches(e, kind, name, reason)) {
                Ok(())
            } else {
                Err(AttemptError::retry(format!(
                    "no {reason} event for {kind} {name} yet"
                )))
            }
        })
        .await
}
