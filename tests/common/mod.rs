#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use nostr_dm::config::RelayConfig;
use nostr_dm::nostr::{NostrEvent, NostrFilter};
use nostr_dm::relay::{PoolConfig, RelayPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Stores events, answers REQ with stored events and EOSE, fans out live.
    Normal,
    /// Accepts the socket and never answers.
    Silent,
    /// Answers every EVENT with `OK false`; queries behave normally.
    Reject,
    /// Like Normal, but precedes every answer with junk frames.
    Garbage,
    /// Answers every REQ with `CLOSED auth-required:`; EVENT behaves normally.
    Restricted,
}

struct State {
    mode: Mode,
    events: Mutex<Vec<NostrEvent>>,
    live: broadcast::Sender<NostrEvent>,
    connections: AtomicUsize,
    closes: AtomicUsize,
}

/// In-process relay on an ephemeral localhost port.
#[derive(Clone)]
pub struct MockRelay {
    pub url: String,
    state: Arc<State>,
}

impl MockRelay {
    pub async fn start(mode: Mode) -> MockRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (live, _) = broadcast::channel(256);
        let state = Arc::new(State {
            mode,
            events: Mutex::new(Vec::new()),
            live,
            connections: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    handle_client(stream, peer, state).await;
                });
            }
        });
        MockRelay {
            url: format!("ws://{}", addr),
            state,
        }
    }

    /// Stores an event as-is, without validation, and pushes it to live
    /// subscribers.
    pub async fn inject(&self, ev: NostrEvent) {
        self.state.events.lock().await.push(ev.clone());
        let _ = self.state.live.send(ev);
    }

    pub async fn stored(&self) -> Vec<NostrEvent> {
        self.state.events.lock().await.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::new(self.url.clone())
    }
}

pub fn pool_for(relays: &[&MockRelay], timeout: Duration) -> RelayPool {
    pool_with(relays.iter().map(|r| r.relay_config()).collect(), timeout)
}

pub fn pool_with(relays: Vec<RelayConfig>, timeout: Duration) -> RelayPool {
    RelayPool::new(PoolConfig {
        relays,
        connect_timeout: timeout,
        publish_timeout: timeout,
        query_timeout: timeout,
        reconnect_delay: Duration::from_millis(200),
    })
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

struct LiveSub {
    id: String,
    filters: Vec<NostrFilter>,
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, state: Arc<State>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            eprintln!("mock relay handshake with {} failed: {}", peer, err);
            return;
        }
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut tx, mut rx) = ws.split();
    let mut live_rx = state.live.subscribe();
    let mut subs: Vec<LiveSub> = Vec::new();

    loop {
        tokio::select! {
            msg = rx.next() => {
                let txt = match msg {
                    Some(Ok(Message::Text(txt))) => txt,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                if state.mode == Mode::Silent {
                    continue;
                }
                let replies = answer(&state, &txt, &mut subs).await;
                for frame in replies {
                    if tx.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
            }
            ev = live_rx.recv() => {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                if state.mode == Mode::Silent {
                    continue;
                }
                for sub in &subs {
                    if sub.filters.iter().any(|f| f.matches(&ev)) {
                        let frame = json!(["EVENT", sub.id, ev]).to_string();
                        if tx.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn junk(sub_id: &str) -> Vec<String> {
    vec![
        "not json at all".to_string(),
        r#"{"kind": 1}"#.to_string(),
        r#"["OK"]"#.to_string(),
        json!(["EVENT", sub_id, {"bogus": true}]).to_string(),
    ]
}

async fn answer(state: &State, txt: &str, subs: &mut Vec<LiveSub>) -> Vec<String> {
    let v: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(_) => return vec![json!(["NOTICE", "invalid json"]).to_string()],
    };
    let Some(arr) = v.as_array() else {
        return vec![json!(["NOTICE", "expected array"]).to_string()];
    };
    let mut out = Vec::new();
    match arr.first().and_then(|l| l.as_str()) {
        Some("EVENT") => {
            let Some(ev) = arr
                .get(1)
                .and_then(|raw| serde_json::from_value::<NostrEvent>(raw.clone()).ok())
            else {
                return vec![json!(["NOTICE", "bad event"]).to_string()];
            };
            if state.mode == Mode::Garbage {
                out.extend(junk("none"));
            }
            if state.mode == Mode::Reject {
                out.push(json!(["OK", ev.id, false, "blocked: test relay"]).to_string());
                return out;
            }
            let mut events = state.events.lock().await;
            if !events.iter().any(|e| e.id == ev.id) {
                events.push(ev.clone());
                let _ = state.live.send(ev.clone());
            }
            out.push(json!(["OK", ev.id, true, ""]).to_string());
        }
        Some("REQ") => {
            let sub_id = arr.get(1).and_then(|s| s.as_str()).unwrap_or("").to_string();
            let filters: Vec<NostrFilter> = arr
                .iter()
                .skip(2)
                .filter_map(|f| serde_json::from_value(f.clone()).ok())
                .collect();
            if state.mode == Mode::Garbage {
                out.extend(junk(&sub_id));
            }
            if state.mode == Mode::Restricted {
                out.push(json!(["CLOSED", sub_id, "auth-required: sign in first"]).to_string());
                return out;
            }
            let events = state.events.lock().await;
            for filter in &filters {
                let mut matched: Vec<&NostrEvent> = events.iter().filter(|e| filter.matches(e)).collect();
                matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                if let Some(limit) = filter.limit {
                    matched.truncate(limit);
                }
                for ev in matched {
                    out.push(json!(["EVENT", sub_id, ev]).to_string());
                }
            }
            out.push(json!(["EOSE", sub_id]).to_string());
            subs.retain(|s| s.id != sub_id);
            subs.push(LiveSub { id: sub_id, filters });
        }
        Some("CLOSE") => {
            let sub_id = arr.get(1).and_then(|s| s.as_str()).unwrap_or("");
            subs.retain(|s| s.id != sub_id);
            state.closes.fetch_add(1, Ordering::SeqCst);
        }
        _ => out.push(json!(["NOTICE", "unsupported"]).to_string()),
    }
    out
}
