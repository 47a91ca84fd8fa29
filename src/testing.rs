//! In-process relay used by unit tests.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{event::Event, filter::Filter};

/// Minimal NIP-01 relay: answers `REQ` from its stored events, stores `EVENT`
/// with an `OK`, and forwards newly stored events to open subscriptions.
pub(crate) struct MockRelay {
    pub url: String,
    events: Arc<Mutex<Vec<Event>>>,
    inject: Arc<Mutex<Vec<Event>>>,
    live: broadcast::Sender<Event>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let inject = Arc::new(Mutex::new(Vec::new()));
        let (live, _) = broadcast::channel(64);
        let task = {
            let events = events.clone();
            let inject = inject.clone();
            let live = live.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let events = events.clone();
                    let inject = inject.clone();
                    let live = live.clone();
                    tokio::spawn(async move {
                        if let Ok(ws) = accept_async(stream).await {
                            serve(ws, events, inject, live).await;
                        }
                    });
                }
            })
        };
        Self {
            url: format!("ws://{addr}"),
            events,
            inject,
            live,
            task,
        }
    }

    /// Store an event as if it had been published earlier.
    pub fn seed(&self, ev: Event) {
        self.events.lock().unwrap().push(ev);
    }

    /// Store `ev` right before the next published event is accepted,
    /// simulating a concurrent writer landing in between.
    pub fn inject_on_next_publish(&self, ev: Event) {
        self.inject.lock().unwrap().push(ev);
    }

    /// Store and broadcast an event to open subscriptions.
    pub fn push_live(&self, ev: Event) {
        self.events.lock().unwrap().push(ev.clone());
        let _ = self.live.send(ev);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Relay that completes the WebSocket handshake and then never answers:
/// no `OK`, no `EOSE`, no events.
pub(crate) struct SilentRelay {
    pub url: String,
    task: JoinHandle<()>,
}

impl SilentRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while let Some(Ok(msg)) = ws.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        Self {
            url: format!("ws://{addr}"),
            task,
        }
    }
}

impl Drop for SilentRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    events: Arc<Mutex<Vec<Event>>>,
    inject: Arc<Mutex<Vec<Event>>>,
    live: broadcast::Sender<Event>,
) {
    let mut live_rx = live.subscribe();
    let mut subs: Vec<(String, Filter)> = Vec::new();
    loop {
        tokio::select! {
            msg = ws.next() => {
                let txt = match msg {
                    Some(Ok(Message::Text(txt))) => txt,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(val) = serde_json::from_str::<Value>(&txt) else { continue };
                let Some(arr) = val.as_array() else { continue };
                match arr.first().and_then(|v| v.as_str()) {
                    Some("REQ") if arr.len() >= 3 => {
                        let sub = arr[1].as_str().unwrap_or_default().to_string();
                        let filter = Filter::from_value(&arr[2]);
                        let mut matching: Vec<Event> = events
                            .lock()
                            .unwrap()
                            .iter()
                            .filter(|ev| filter.matches(ev))
                            .cloned()
                            .collect();
                        matching.sort_by_key(|e| std::cmp::Reverse(e.created_at));
                        if let Some(limit) = filter.limit {
                            matching.truncate(limit);
                        }
                        for ev in matching {
                            let msg = json!(["EVENT", sub, ev]);
                            if ws.send(Message::Text(msg.to_string())).await.is_err() {
                                return;
                            }
                        }
                        let _ = ws.send(Message::Text(json!(["EOSE", sub]).to_string())).await;
                        subs.push((sub, filter));
                    }
                    Some("EVENT") if arr.len() >= 2 => {
                        let Ok(ev) = serde_json::from_value::<Event>(arr[1].clone()) else {
                            continue;
                        };
                        let injected: Vec<Event> = inject.lock().unwrap().drain(..).collect();
                        for early in injected {
                            events.lock().unwrap().push(early.clone());
                            let _ = live.send(early);
                        }
                        let fresh = {
                            let mut stored = events.lock().unwrap();
                            let fresh = !stored.iter().any(|e| e.id == ev.id);
                            if fresh {
                                if (30000..40000).contains(&ev.kind) {
                                    // Parameterized replaceable: newest per (author, d) survives.
                                    stored.retain(|e| {
                                        !(e.kind == ev.kind
                                            && e.pubkey == ev.pubkey
                                            && e.tag_value("d") == ev.tag_value("d")
                                            && e.created_at <= ev.created_at)
                                    });
                                }
                                stored.push(ev.clone());
                            }
                            fresh
                        };
                        let ok = json!(["OK", ev.id, true, ""]);
                        let _ = ws.send(Message::Text(ok.to_string())).await;
                        if fresh {
                            let _ = live.send(ev);
                        }
                    }
                    Some("CLOSE") => {
                        let id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                        subs.retain(|(sub, _)| sub != id);
                    }
                    _ => {}
                }
            }
            ev = live_rx.recv() => {
                let Ok(ev) = ev else { continue };
                for (sub, filter) in &subs {
                    if filter.matches(&ev) {
                        let msg = json!(["EVENT", sub, ev]);
                        let _ = ws.send(Message::Text(msg.to_string())).await;
                    }
                }
            }
        }
    }
}
