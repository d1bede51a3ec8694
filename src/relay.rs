//! Relay fan-out: publish, one-shot query and live subscription against every
//! configured relay in parallel.
//!
//! Every per-relay operation gets its own timeout, so one silent or broken
//! relay only costs its own slot. Individual relay failures never surface as
//! errors; they are collected into the returned report.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::RelayConfig;
use crate::nostr::{self, NostrEvent, NostrFilter, RelayMessage};
use crate::util;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsRead = SplitStream<WsStream>;
type EventCallback = Arc<dyn Fn(NostrEvent) + Send + Sync>;

pub(crate) const SEEN_MAX: usize = 4096;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Connect(String),
    Timeout,
    Rejected(String),
    Closed(String),
    Io(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Connect(e) => write!(f, "connect failed: {}", e),
            FailureReason::Timeout => f.write_str("timed out"),
            FailureReason::Rejected(msg) => write!(f, "rejected: {}", msg),
            FailureReason::Closed(msg) => write!(f, "closed: {}", msg),
            FailureReason::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayFailure {
    pub url: String,
    pub reason: FailureReason,
}

impl std::fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no relays configured")]
    NoRelays,
    #[error("all {} relays failed", .0.len())]
    AllRelaysFailed(Vec<RelayFailure>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub published: Vec<String>,
    pub failed: Vec<RelayFailure>,
}

impl PublishReport {
    /// At least one relay stored the event.
    pub fn success(&self) -> bool {
        !self.published.is_empty()
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.published.len() + self.failed.len();
        if total == 0 {
            return 0.0;
        }
        self.published.len() as f64 / total as f64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryReport {
    /// Verified, filter-matching, deduplicated events, newest first.
    pub events: Vec<NostrEvent>,
    pub responded: Vec<String>,
    /// Relays that timed out after sending some events. Also in `responded`.
    pub incomplete: Vec<String>,
    pub failed: Vec<RelayFailure>,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub relays: Vec<RelayConfig>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub query_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayPool {
    config: Arc<PoolConfig>,
}

impl RelayPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn empty() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn is_empty(&self) -> bool {
        self.config.relays.is_empty()
    }

    pub fn relays(&self) -> &[RelayConfig] {
        &self.config.relays
    }

    fn write_relays(&self) -> Vec<RelayConfig> {
        self.config.relays.iter().filter(|r| r.write).cloned().collect()
    }

    fn read_relays(&self) -> Vec<RelayConfig> {
        self.config.relays.iter().filter(|r| r.read).cloned().collect()
    }

    pub async fn publish(&self, event: &NostrEvent) -> PublishReport {
        let relays = self.write_relays();
        if relays.is_empty() {
            tracing::warn!(event_id = %event.id, "publish skipped; no write relays configured");
        }
        let frame = nostr::frame_event(event);
        let cfg = &self.config;
        let attempts = relays.iter().map(|relay| {
            let frame = frame.clone();
            async move {
                let res = publish_to_relay(&relay.url, &frame, &event.id, cfg).await;
                (relay.url.clone(), res)
            }
        });

        let mut report = PublishReport {
            event_id: event.id.clone(),
            published: Vec::new(),
            failed: Vec::new(),
        };
        for (url, res) in join_all(attempts).await {
            match res {
                Ok(()) => {
                    tracing::debug!(relay = %url, event_id = %event.id, "event accepted");
                    report.published.push(url);
                }
                Err(reason) => {
                    tracing::warn!(relay = %url, event_id = %event.id, error = %reason, "publish failed");
                    report.failed.push(RelayFailure { url, reason });
                }
            }
        }
        tracing::info!(
            event_id = %event.id,
            published = report.published.len(),
            failed = report.failed.len(),
            "publish finished"
        );
        report
    }

    pub async fn query(&self, filters: &[NostrFilter]) -> Result<QueryReport, TransportError> {
        let relays = self.read_relays();
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let sub_id = util::random_hex(8);
        let cfg = &self.config;
        let attempts = relays.iter().map(|relay| {
            let sub_id = sub_id.clone();
            let filters = clamp_filters(filters, relay.max_limit);
            async move {
                let res = query_relay(&relay.url, &sub_id, &filters, cfg).await;
                (relay.url.clone(), res)
            }
        });

        let mut report = QueryReport::default();
        let mut seen = HashSet::new();
        for (url, res) in join_all(attempts).await {
            match res {
                Ok(outcome) => {
                    if !outcome.complete {
                        tracing::warn!(relay = %url, events = outcome.events.len(), "query timed out; keeping partial result");
                        report.incomplete.push(url.clone());
                    }
                    for ev in outcome.events {
                        if seen.insert(ev.id.clone()) {
                            report.events.push(ev);
                        }
                    }
                    report.responded.push(url);
                }
                Err(reason) => {
                    tracing::warn!(relay = %url, error = %reason, "query failed");
                    report.failed.push(RelayFailure { url, reason });
                }
            }
        }
        if report.responded.is_empty() {
            return Err(TransportError::AllRelaysFailed(report.failed));
        }
        report
            .events
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(report)
    }

    /// Opens a live subscription on every read relay and returns once each
    /// relay has connected or failed its first attempt. Relays that drop are
    /// reconnected until the subscription is closed.
    pub async fn subscribe<F>(
        &self,
        filters: Vec<NostrFilter>,
        on_event: F,
    ) -> Result<Subscription, TransportError>
    where
        F: Fn(NostrEvent) + Send + Sync + 'static,
    {
        let relays = self.read_relays();
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let sub_id = util::random_hex(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let on_event: EventCallback = Arc::new(on_event);
        let seen = Arc::new(Mutex::new(SeenCache::new(SEEN_MAX)));

        let mut tasks = Vec::with_capacity(relays.len());
        let mut pending = Vec::with_capacity(relays.len());
        for relay in &relays {
            let (ready_tx, ready_rx) = oneshot::channel();
            let live = LiveRelay {
                url: relay.url.clone(),
                sub_id: sub_id.clone(),
                filters: clamp_filters(&filters, relay.max_limit),
                on_event: on_event.clone(),
                seen: seen.clone(),
                connect_timeout: self.config.connect_timeout,
                reconnect_delay: self.config.reconnect_delay,
            };
            tasks.push(tokio::spawn(run_live_relay(live, shutdown_rx.clone(), ready_tx)));
            pending.push((relay.url.clone(), ready_rx));
        }

        let subscription = Subscription {
            id: sub_id,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
        };

        let wait = self.config.connect_timeout + Duration::from_secs(1);
        let readies = join_all(pending.into_iter().map(|(url, rx)| async move {
            let res = match timeout(wait, rx).await {
                Ok(Ok(res)) => res,
                Ok(Err(_)) => Err(FailureReason::Closed("relay task ended".to_string())),
                Err(_) => Err(FailureReason::Timeout),
            };
            (url, res)
        }))
        .await;

        let mut failures = Vec::new();
        for (url, res) in readies {
            if let Err(reason) = res {
                failures.push(RelayFailure { url, reason });
            }
        }
        if failures.len() == relays.len() {
            subscription.unsubscribe();
            return Err(TransportError::AllRelaysFailed(failures));
        }
        tracing::info!(
            sub = %subscription.id,
            relays = relays.len() - failures.len(),
            failed = failures.len(),
            "subscription open"
        );
        Ok(subscription)
    }
}

/// Handle to a live subscription. Dropping it closes the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Sends CLOSE to every relay and tears the sockets down. Safe to call
    /// any number of times.
    pub fn unsubscribe(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!(sub = %self.id, "unsubscribing");
        }
    }

    /// Waits for every relay task to finish. Only returns after
    /// [`Subscription::unsubscribe`].
    pub async fn wait_closed(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Bounded set of recently seen ids; the oldest entries fall out first.
pub(crate) struct SeenCache {
    ids: HashSet<String>,
    order: VecDeque<String>,
    max: usize,
}

impl SeenCache {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            max,
        }
    }

    pub(crate) fn seen_or_insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return true;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.max {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        false
    }
}

fn clamp_filters(filters: &[NostrFilter], max_limit: Option<usize>) -> Vec<NostrFilter> {
    filters
        .iter()
        .cloned()
        .map(|mut f| {
            if let (Some(limit), Some(max)) = (f.limit, max_limit) {
                f.limit = Some(limit.min(max));
            }
            f
        })
        .collect()
}

fn accept_event(url: &str, filters: &[NostrFilter], ev: &NostrEvent) -> bool {
    if !filters.iter().any(|f| f.matches(ev)) {
        tracing::warn!(relay = %url, event_id = %ev.id, "event does not match filters; dropped");
        return false;
    }
    match nostr::verify_event(ev) {
        Ok(true) => true,
        _ => {
            tracing::warn!(relay = %url, event_id = %ev.id, "invalid event signature; dropped");
            false
        }
    }
}

async fn connect(url: &str, connect_timeout: Duration) -> Result<WsStream, FailureReason> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(err)) => Err(FailureReason::Connect(err.to_string())),
        Err(_) => Err(FailureReason::Timeout),
    }
}

async fn publish_to_relay(
    url: &str,
    frame: &str,
    event_id: &str,
    cfg: &PoolConfig,
) -> Result<(), FailureReason> {
    let ws = connect(url, cfg.connect_timeout).await?;
    let (mut write, mut read) = ws.split();
    if let Err(err) = write.send(Message::Text(frame.to_string())).await {
        return Err(FailureReason::Io(err.to_string()));
    }

    let deadline = Instant::now() + cfg.publish_timeout;
    let outcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = match timeout(remaining, read.next()).await {
            Ok(m) => m,
            Err(_) => break Err(FailureReason::Timeout),
        };
        match msg {
            Some(Ok(Message::Text(txt))) => match nostr::parse_relay_message(&txt) {
                Ok(RelayMessage::Ok {
                    event_id: id,
                    accepted,
                    message,
                }) if id == event_id => {
                    break if accepted {
                        Ok(())
                    } else {
                        Err(FailureReason::Rejected(message))
                    };
                }
                Ok(RelayMessage::Notice { message }) => {
                    tracing::debug!(relay = %url, notice = %message, "relay notice");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(relay = %url, error = %err, "malformed frame ignored");
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                break Err(FailureReason::Closed("connection closed before OK".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(FailureReason::Io(err.to_string())),
        }
    };
    let _ = write.close().await;
    outcome
}

struct RelayQueryOutcome {
    events: Vec<NostrEvent>,
    complete: bool,
}

async fn query_relay(
    url: &str,
    sub_id: &str,
    filters: &[NostrFilter],
    cfg: &PoolConfig,
) -> Result<RelayQueryOutcome, FailureReason> {
    let ws = connect(url, cfg.connect_timeout).await?;
    let (mut write, mut read) = ws.split();
    if let Err(err) = write
        .send(Message::Text(nostr::frame_req(sub_id, filters)))
        .await
    {
        return Err(FailureReason::Io(err.to_string()));
    }

    let mut events = Vec::new();
    let deadline = Instant::now() + cfg.query_timeout;
    let finished: Result<bool, FailureReason> = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = match timeout(remaining, read.next()).await {
            Ok(m) => m,
            Err(_) => break Ok(false),
        };
        match msg {
            Some(Ok(Message::Text(txt))) => match nostr::parse_relay_message(&txt) {
                Ok(RelayMessage::Event { sub_id: sid, event }) if sid == sub_id => {
                    if accept_event(url, filters, &event) {
                        events.push(*event);
                    }
                }
                Ok(RelayMessage::Eose { sub_id: sid }) if sid == sub_id => break Ok(true),
                Ok(RelayMessage::Closed { sub_id: sid, message }) if sid == sub_id => {
                    break Err(FailureReason::Closed(message))
                }
                Ok(RelayMessage::Notice { message }) => {
                    tracing::debug!(relay = %url, notice = %message, "relay notice");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(relay = %url, error = %err, "malformed frame ignored");
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                break Err(FailureReason::Closed("connection closed before EOSE".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(FailureReason::Io(err.to_string())),
        }
    };

    let _ = write.send(Message::Text(nostr::frame_close(sub_id))).await;
    let _ = write.close().await;

    match finished {
        Ok(complete) if complete || !events.is_empty() => Ok(RelayQueryOutcome { events, complete }),
        Ok(_) => Err(FailureReason::Timeout),
        Err(reason) if !events.is_empty() => {
            tracing::warn!(relay = %url, error = %reason, "query ended early; keeping partial result");
            Ok(RelayQueryOutcome {
                events,
                complete: false,
            })
        }
        Err(reason) => Err(reason),
    }
}

struct LiveRelay {
    url: String,
    sub_id: String,
    filters: Vec<NostrFilter>,
    on_event: EventCallback,
    seen: Arc<Mutex<SeenCache>>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
}

/// How a single live connection ended.
#[derive(Debug, PartialEq, Eq)]
enum LiveEnd {
    Unsubscribed,
    Lost,
    /// The relay answered the REQ with CLOSED, e.g. `auth-required:`.
    Refused(String),
}

async fn run_live_relay(
    live: LiveRelay,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), FailureReason>>,
) {
    let mut ready = Some(ready);
    let mut notify = |res: Result<(), FailureReason>| {
        if let Some(tx) = ready.take() {
            let _ = tx.send(res);
        }
    };
    let mut delay = live.reconnect_delay;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let connected = tokio::select! {
            res = connect(&live.url, live.connect_timeout) => res,
            _ = shutdown.changed() => break,
        };
        match connected {
            Ok(ws) => {
                let (mut write, mut read) = ws.split();
                let req = nostr::frame_req(&live.sub_id, &live.filters);
                if let Err(err) = write.send(Message::Text(req)).await {
                    tracing::warn!(relay = %live.url, error = %err, "relay send REQ failed");
                    notify(Err(FailureReason::Io(err.to_string())));
                } else {
                    tracing::info!(relay = %live.url, sub = %live.sub_id, "relay subscribed");
                    notify(Ok(()));
                    delay = live.reconnect_delay;
                    match live_loop(&live, &mut read, &mut shutdown).await {
                        LiveEnd::Unsubscribed => {
                            let _ = write
                                .send(Message::Text(nostr::frame_close(&live.sub_id)))
                                .await;
                            let _ = write.close().await;
                            break;
                        }
                        LiveEnd::Refused(reason) => {
                            tracing::warn!(
                                relay = %live.url,
                                sub = %live.sub_id,
                                reason = %reason,
                                "relay refused subscription; not retrying"
                            );
                            let _ = write.close().await;
                            break;
                        }
                        LiveEnd::Lost => {}
                    }
                }
                let _ = write.close().await;
            }
            Err(reason) => {
                tracing::warn!(relay = %live.url, error = %reason, "relay connect failed");
                notify(Err(reason));
            }
        }
        tracing::debug!(relay = %live.url, delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        delay = next_reconnect_delay(delay);
    }
    tracing::debug!(relay = %live.url, sub = %live.sub_id, "relay subscription closed");
}

fn next_reconnect_delay(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_RECONNECT_DELAY)
}

/// Pumps one connection until it is lost, refused, or closed locally.
async fn live_loop(
    live: &LiveRelay,
    read: &mut WsRead,
    shutdown: &mut watch::Receiver<bool>,
) -> LiveEnd {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return LiveEnd::Unsubscribed,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(txt))) => {
                    if let Some(end) = handle_live_frame(live, &txt).await {
                        return end;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!(relay = %live.url, "relay closed connection");
                    return LiveEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(relay = %live.url, error = %err, "relay read failed");
                    return LiveEnd::Lost;
                }
            },
        }
    }
}

async fn handle_live_frame(live: &LiveRelay, frame: &str) -> Option<LiveEnd> {
    match nostr::parse_relay_message(frame) {
        Ok(RelayMessage::Event { sub_id, event }) if sub_id == live.sub_id => {
            if !accept_event(&live.url, &live.filters, &event) {
                return None;
            }
            if live.seen.lock().await.seen_or_insert(&event.id) {
                return None;
            }
            (live.on_event)(*event);
        }
        Ok(RelayMessage::Eose { sub_id }) if sub_id == live.sub_id => {
            tracing::debug!(relay = %live.url, sub = %sub_id, "stored events done");
        }
        Ok(RelayMessage::Closed { sub_id, message }) if sub_id == live.sub_id => {
            return Some(LiveEnd::Refused(message));
        }
        Ok(RelayMessage::Notice { message }) => {
            tracing::debug!(relay = %live.url, notice = %message, "relay notice");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(relay = %live.url, error = %err, "malformed frame ignored");
        }
    }
    None
}
