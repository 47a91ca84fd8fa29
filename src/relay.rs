//! Relay multiplexer: one logical publish/subscribe surface over a fixed set of
//! relays.
//!
//! Each relay gets a background connection task that is spawned lazily on
//! first use and driven by commands over a channel. Subscriptions fan out to
//! every relay and merge their results into one stream, deduplicated by event
//! id. A relay that fails to connect or drops its connection is treated as
//! finished for every subscription it serves, so the remaining relays carry on.
//! There is no reconnect loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{stream::FuturesUnordered, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{event::Event, filter::Filter};

/// Wait bound for board config and receipt related publishes.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait bound for lightweight publishes.
pub const LIGHT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// Relays used when none are configured.
pub const DEFAULT_RELAYS: [&str; 3] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.snort.social",
];

/// Result of a best-effort publish. Never an error: delivery to at least one
/// relay is the durability model and a timeout counts as "sent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// At least one relay answered `OK true`.
    Acknowledged,
    /// The wait bound elapsed first.
    TimedOut,
    /// Every relay rejected the event or was unreachable.
    Unacknowledged,
}

/// One item of a merged subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    /// First sighting of an event id across all relays.
    Event(Event),
    /// Every relay has exhausted its stored backlog; only live events follow.
    EndOfStoredEvents,
}

/// Shared pool of relay connections.
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    relays: Vec<String>,
    tor_socks: Option<String>,
    verify_sig: bool,
    connections: Mutex<Option<Vec<RelayConnection>>>,
    next_sub: AtomicU64,
}

#[derive(Clone)]
struct RelayConnection {
    commands: mpsc::UnboundedSender<Command>,
}

enum Command {
    Publish {
        event: Event,
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        id: String,
        filter: Filter,
        sink: mpsc::UnboundedSender<(usize, Delivery)>,
    },
    Close {
        id: String,
    },
    Shutdown,
}

#[derive(Debug)]
enum Delivery {
    Event(Event),
    Eose,
    Closed,
}

impl RelayPool {
    /// Create a pool over `relays`. No connection is made until first use.
    pub fn new(relays: Vec<String>, tor_socks: Option<String>, verify_sig: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                relays,
                tor_socks,
                verify_sig,
                connections: Mutex::new(None),
                next_sub: AtomicU64::new(0),
            }),
        }
    }

    /// Configured relay URLs.
    pub fn relays(&self) -> &[String] {
        &self.inner.relays
    }

    /// Spawn the connection tasks if they are not running yet.
    pub fn open(&self) {
        self.connections();
    }

    /// Shut down every connection. Open subscriptions end once their relays
    /// report closure; the next use of the pool opens fresh connections.
    pub fn close_all(&self) {
        if let Some(conns) = lock(&self.inner.connections).take() {
            for conn in conns {
                let _ = conn.commands.send(Command::Shutdown);
            }
        }
    }

    fn connections(&self) -> Vec<RelayConnection> {
        let mut guard = lock(&self.inner.connections);
        guard
            .get_or_insert_with(|| {
                self.inner
                    .relays
                    .iter()
                    .enumerate()
                    .map(|(index, url)| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let url = url.clone();
                        let tor = self.inner.tor_socks.clone();
                        tokio::spawn(run_connection(index, url, tor, rx));
                        RelayConnection { commands: tx }
                    })
                    .collect()
            })
            .clone()
    }

    /// Send `events` to every relay and wait until any relay acknowledges one
    /// of them or `wait` elapses.
    pub async fn publish(&self, events: &[Event], wait: Duration) -> PublishOutcome {
        let mut acks = FuturesUnordered::new();
        for conn in self.connections() {
            for event in events {
                let (tx, rx) = oneshot::channel();
                let cmd = Command::Publish {
                    event: event.clone(),
                    ack: tx,
                };
                if conn.commands.send(cmd).is_ok() {
                    acks.push(rx);
                }
            }
        }
        let first_ack = async move {
            while let Some(res) = acks.next().await {
                if res.is_ok() {
                    return true;
                }
            }
            false
        };
        let outcome = match tokio::time::timeout(wait, first_ack).await {
            Ok(true) => PublishOutcome::Acknowledged,
            Ok(false) => PublishOutcome::Unacknowledged,
            Err(_) => PublishOutcome::TimedOut,
        };
        tracing::debug!(events = events.len(), ?outcome, "publish finished");
        outcome
    }

    /// Open one logical subscription across every relay.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let n = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        let id = format!("zb-{n}");
        let conns = self.connections();
        let (sink, rx) = mpsc::unbounded_channel();
        let mut pending_eose = HashSet::new();
        let mut commands = Vec::with_capacity(conns.len());
        for (index, conn) in conns.into_iter().enumerate() {
            let cmd = Command::Subscribe {
                id: id.clone(),
                filter: filter.clone(),
                sink: sink.clone(),
            };
            if conn.commands.send(cmd).is_ok() {
                pending_eose.insert(index);
                commands.push(conn.commands);
            }
        }
        Subscription {
            id,
            rx,
            seen: HashSet::new(),
            pending_eose,
            eose_sent: false,
            closed: false,
            verify_sig: self.inner.verify_sig,
            commands,
        }
    }

    /// Callback flavour of [`RelayPool::subscribe`]. `on_event` runs once per
    /// distinct event id, `on_eose` once when every relay reached the end of
    /// its stored events.
    pub fn subscribe_with<E, D>(
        &self,
        filter: Filter,
        mut on_event: E,
        on_eose: D,
    ) -> SubscriptionHandle
    where
        E: FnMut(Event) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let mut sub = self.subscribe(filter);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            let mut on_eose = Some(on_eose);
            while let Some(item) = sub.next().await {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                match item {
                    SubscriptionItem::Event(ev) => on_event(ev),
                    SubscriptionItem::EndOfStoredEvents => {
                        if let Some(cb) = on_eose.take() {
                            cb();
                        }
                    }
                }
            }
        });
        SubscriptionHandle {
            cancelled,
            abort: task.abort_handle(),
        }
    }

    /// Collect events until end of stored events, `limit` distinct events, or
    /// `wait`, whichever comes first. A timeout yields whatever arrived.
    pub async fn fetch(&self, filter: Filter, wait: Duration) -> Vec<Event> {
        let limit = filter.limit;
        let mut sub = self.subscribe(filter);
        let mut events = Vec::new();
        let collect = async {
            while let Some(item) = sub.next().await {
                match item {
                    SubscriptionItem::Event(ev) => {
                        events.push(ev);
                        if limit.map_or(false, |l| events.len() >= l) {
                            break;
                        }
                    }
                    SubscriptionItem::EndOfStoredEvents => break,
                }
            }
        };
        if tokio::time::timeout(wait, collect).await.is_err() {
            tracing::debug!(subscription = %sub.id(), "fetch timed out");
        }
        sub.close();
        events
    }

    /// First event accepted by `accept`, or `None` on end of stored events or
    /// timeout.
    pub async fn fetch_first<T>(
        &self,
        filter: Filter,
        wait: Duration,
        mut accept: impl FnMut(&Event) -> Option<T>,
    ) -> Option<T> {
        let mut sub = self.subscribe(filter);
        let find = async {
            while let Some(item) = sub.next().await {
                match item {
                    SubscriptionItem::Event(ev) => {
                        if let Some(found) = accept(&ev) {
                            return Some(found);
                        }
                    }
                    SubscriptionItem::EndOfStoredEvents => return None,
                }
            }
            None
        };
        let found = tokio::time::timeout(wait, find).await.unwrap_or(None);
        sub.close();
        found
    }

    /// Check that a relay accepts a WebSocket connection.
    pub async fn test_connection(url: &str, tor_socks: Option<&str>) -> Result<()> {
        let mut ws = connect_ws(url, tor_socks).await?;
        let _ = ws.close(None).await;
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Merged, deduplicated view of one subscription across all relays.
///
/// Dropping the subscription closes it.
pub struct Subscription {
    id: String,
    rx: mpsc::UnboundedReceiver<(usize, Delivery)>,
    seen: HashSet<String>,
    pending_eose: HashSet<usize>,
    eose_sent: bool,
    closed: bool,
    verify_sig: bool,
    commands: Vec<mpsc::UnboundedSender<Command>>,
}

impl Subscription {
    /// Subscription id used on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next distinct event or the end-of-stored-events marker. Returns `None`
    /// once closed or when every relay has gone away.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        loop {
            if self.closed {
                return None;
            }
            if !self.eose_sent && self.pending_eose.is_empty() {
                self.eose_sent = true;
                return Some(SubscriptionItem::EndOfStoredEvents);
            }
            let (relay, delivery) = self.rx.recv().await?;
            match delivery {
                Delivery::Event(ev) => {
                    if self.verify_sig {
                        if let Err(e) = ev.verify() {
                            tracing::debug!(
                                id = %ev.id,
                                relay,
                                error = %e,
                                "dropping unverifiable event"
                            );
                            continue;
                        }
                    }
                    if self.seen.insert(ev.id.clone()) {
                        return Some(SubscriptionItem::Event(ev));
                    }
                }
                Delivery::Eose | Delivery::Closed => {
                    self.pending_eose.remove(&relay);
                }
            }
        }
    }

    /// Release the relay-level subscriptions. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for commands in &self.commands {
            let _ = commands.send(Command::Close {
                id: self.id.clone(),
            });
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cancellation handle returned by [`RelayPool::subscribe_with`].
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl SubscriptionHandle {
    /// Stop callbacks and close the subscription. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Own one relay connection until the pool shuts it down.
async fn run_connection(
    index: usize,
    url: String,
    tor_socks: Option<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut ws = match connect_ws(&url, tor_socks.as_deref()).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(relay = %url, error = %e, "relay unreachable");
            drain_unreachable(index, commands).await;
            return;
        }
    };
    tracing::debug!(relay = %url, "relay connected");
    let mut subs: HashMap<String, mpsc::UnboundedSender<(usize, Delivery)>> = HashMap::new();
    let mut acks: HashMap<String, Vec<oneshot::Sender<()>>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Publish { event, ack }) => {
                    let msg = json!(["EVENT", event]);
                    acks.entry(event.id.clone()).or_default().push(ack);
                    if ws.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Subscribe { id, filter, sink }) => {
                    let msg = json!(["REQ", id, Value::Object(filter.to_json())]);
                    subs.insert(id, sink);
                    if ws.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close { id }) => {
                    if subs.remove(&id).is_some() {
                        let msg = json!(["CLOSE", id]);
                        if ws.send(Message::Text(msg.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => {
                    handle_text(index, &url, &txt, &mut subs, &mut acks)
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::warn!(relay = %url, "relay connection closed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    for (_, sink) in subs.drain() {
        let _ = sink.send((index, Delivery::Closed));
    }
    drop(acks);
    drain_unreachable(index, commands).await;
}

/// Route one relay message to its subscription or pending publish.
fn handle_text(
    index: usize,
    url: &str,
    txt: &str,
    subs: &mut HashMap<String, mpsc::UnboundedSender<(usize, Delivery)>>,
    acks: &mut HashMap<String, Vec<oneshot::Sender<()>>>,
) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return;
    };
    let Some(arr) = val.as_array() else {
        return;
    };
    let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => match serde_json::from_value::<Event>(arr[2].clone()) {
            Ok(ev) => {
                if let Some(sink) = subs.get(sub_id) {
                    let _ = sink.send((index, Delivery::Event(ev)));
                }
            }
            Err(e) => tracing::debug!(relay = %url, error = %e, "malformed event"),
        },
        Some("EOSE") => {
            if let Some(sink) = subs.get(sub_id) {
                let _ = sink.send((index, Delivery::Eose));
            }
        }
        Some("CLOSED") => {
            if let Some(sink) = subs.remove(sub_id) {
                let _ = sink.send((index, Delivery::Closed));
            }
        }
        Some("OK") => {
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            if let Some(waiters) = acks.remove(sub_id) {
                if accepted {
                    for ack in waiters {
                        let _ = ack.send(());
                    }
                } else {
                    let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
                    tracing::warn!(relay = %url, event = %sub_id, %reason, "event rejected");
                }
            }
        }
        Some("NOTICE") => tracing::debug!(relay = %url, notice = %sub_id, "relay notice"),
        _ => {}
    }
}

/// Answer commands for a relay that is gone: subscriptions finish at once and
/// publishes are never acknowledged.
async fn drain_unreachable(index: usize, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Subscribe { sink, .. } => {
                let _ = sink.send((index, Delivery::Closed));
            }
            Command::Shutdown => break,
            Command::Publish { .. } | Command::Close { .. } => {}
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelayStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
