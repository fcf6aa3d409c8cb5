//! Reload hub: fan-out of [`ReloadEvent`]s to connected browsers.
//!
//! The hub owns event policy; the WebSocket itself lives in the HTTP layer,
//! which registers a client per upgrade and drains its queue into the
//! socket. Policies, in one place:
//!
//! * Broadcasts are debounced by [`BROADCAST_DEBOUNCE`]. Events of the same
//!   class merge; a full reload entering the window supersedes any pending
//!   CSS HMR. Coalescing never reorders surviving events.
//! * Each client has a bounded queue of [`CLIENT_QUEUE_CAP`]. When full,
//!   the oldest queued event is dropped and the newly queued one is flagged
//!   `coalesced`, so a lagging client always ends on the latest event and
//!   can tell that it missed some. Producers never block.
//! * Shutdown bypasses the debounce window: every client gets the
//!   `shutdown` frame, then the hub waits up to [`SHUTDOWN_DRAIN`] for
//!   queues to empty before closing them.

use serde_json::Value;
use serve_events::{
    EventClass, ReloadEvent, ShutdownListener, BROADCAST_DEBOUNCE, CLIENT_QUEUE_CAP,
    SHUTDOWN_DRAIN,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// One event as delivered to a client, with the envelope-level coalescing
/// flag.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: ReloadEvent,
    pub coalesced: bool,
}

impl QueuedEvent {
    pub fn to_json(&self) -> String {
        if !self.coalesced {
            return self.event.to_json();
        }
        match serde_json::to_value(&self.event) {
            Ok(Value::Object(mut map)) => {
                map.insert("coalesced".into(), Value::Bool(true));
                Value::Object(map).to_string()
            }
            _ => self.event.to_json(),
        }
    }
}

struct ClientState {
    id: u64,
    queue: Mutex<VecDeque<QueuedEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl ClientState {
    fn enqueue(&self, event: ReloadEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let mut coalesced = false;
        if queue.len() >= CLIENT_QUEUE_CAP {
            queue.pop_front();
            coalesced = true;
            trace!(target: "reload.hub", client = self.id, "queue_full_dropped_oldest");
        }
        queue.push_back(QueuedEvent { event, coalesced });
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_drained(&self) -> bool {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }
}

/// The consuming side of one client's queue, held by its socket task.
pub struct ClientHandle {
    state: Arc<ClientState>,
    hub: Arc<HubShared>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Next event for this client. Returns `None` once the client is closed
    /// and its queue fully drained.
    pub async fn next_event(&self) -> Option<QueuedEvent> {
        loop {
            {
                let mut queue = self.state.queue.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.state.close();
        self.hub.remove(self.state.id);
    }
}

struct HubShared {
    clients: Mutex<HashMap<u64, Arc<ClientState>>>,
    next_id: AtomicU64,
}

impl HubShared {
    fn remove(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if clients.remove(&id).is_some() {
            debug!(target: "reload.hub", client = id, "client_disconnected");
        }
    }

    fn all(&self) -> Vec<Arc<ClientState>> {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct ReloadHub {
    shared: Arc<HubShared>,
    intake_tx: mpsc::Sender<ReloadEvent>,
}

/// Intake channel depth. The broadcaster drains quickly; this only has to
/// absorb an engine burst.
const INTAKE_CAP: usize = 64;

impl ReloadHub {
    /// Create the hub and the broadcaster loop future. The caller spawns
    /// the future as a task.
    pub fn new(shutdown: ShutdownListener) -> (Self, impl std::future::Future<Output = ()>) {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAP);
        let hub = Self {
            shared: Arc::new(HubShared {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            intake_tx,
        };
        let broadcaster = Broadcaster {
            shared: hub.shared.clone(),
        };
        (hub, broadcaster.run(intake_rx, shutdown))
    }

    /// The sender the regeneration engine publishes into.
    pub fn intake(&self) -> mpsc::Sender<ReloadEvent> {
        self.intake_tx.clone()
    }

    /// Register a connected client. Dropping the handle disconnects it.
    pub fn register(&self) -> ClientHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ClientState {
            id,
            queue: Mutex::new(VecDeque::with_capacity(CLIENT_QUEUE_CAP)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.shared
            .clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, state.clone());
        debug!(target: "reload.hub", client = id, "client_connected");
        ClientHandle {
            state,
            hub: self.shared.clone(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Non-blocking broadcast; events flow through the debounce window.
    pub fn broadcast(&self, event: ReloadEvent) {
        if self.intake_tx.try_send(event).is_err() {
            debug!(target: "reload.hub", "intake_full_event_dropped");
        }
    }

    /// Graceful shutdown choreography: `shutdown` frame to every client,
    /// bounded drain, then close.
    pub async fn shutdown(&self) {
        let clients = self.shared.all();
        info!(target: "reload.hub", clients = clients.len(), "hub_shutdown");
        for client in &clients {
            client.enqueue(ReloadEvent::Shutdown);
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while Instant::now() < deadline {
            if clients.iter().all(|c| c.is_drained()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        for client in &clients {
            client.close();
        }
    }
}

struct Broadcaster {
    shared: Arc<HubShared>,
}

impl Broadcaster {
    async fn run(self, mut intake_rx: mpsc::Receiver<ReloadEvent>, mut shutdown: ShutdownListener) {
        let mut pending: Vec<ReloadEvent> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                event = intake_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event.class(), EventClass::Shutdown) {
                        // Shutdown is not subject to debouncing.
                        self.fan_out(&event);
                        continue;
                    }
                    coalesce_into(&mut pending, event);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + BROADCAST_DEBOUNCE);
                    }
                }
                _ = async {
                    match deadline {
                        Some(when) => tokio::time::sleep_until(when).await,
                        // Never resolves; recv() drives the loop instead.
                        None => std::future::pending().await,
                    }
                } => {
                    for event in pending.drain(..) {
                        self.fan_out(&event);
                    }
                    deadline = None;
                }
            }
        }

        // Flush whatever the window still holds so a final burst is not
        // silently lost on shutdown.
        for event in pending.drain(..) {
            self.fan_out(&event);
        }
        debug!(target: "reload.hub", "broadcaster_stopped");
    }

    fn fan_out(&self, event: &ReloadEvent) {
        let clients = self.shared.all();
        trace!(
            target: "reload.hub",
            clients = clients.len(),
            "event_fan_out"
        );
        for client in clients {
            client.enqueue(event.clone());
        }
    }
}

/// Merge an incoming event into the pending window.
///
/// Same-class events merge in place, keeping the position of the earliest,
/// so coalescing never reorders across classes. A `Reload` removes any
/// pending `CssHmr` (precedence), and a `CssHmr` arriving while a `Reload`
/// is pending is absorbed by it. An `Error` never displaces a pending
/// `Reload`; both survive in arrival order.
fn coalesce_into(pending: &mut Vec<ReloadEvent>, event: ReloadEvent) {
    match event.class() {
        EventClass::Reload => {
            pending.retain(|e| e.class() != EventClass::CssHmr);
        }
        EventClass::CssHmr => {
            if pending.iter().any(|e| e.class() == EventClass::Reload) {
                return;
            }
        }
        _ => {}
    }

    if let Some(existing) = pending.iter_mut().find(|e| e.class() == event.class()) {
        existing.merge_from(event);
    } else {
        pending.push(event);
    }
}
