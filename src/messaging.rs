//! Messaging orchestrator: sends direct messages, rebuilds conversation lists
//! and message histories from relay queries, and follows new messages live.
//!
//! Ordering always uses the rumor timestamp. Gift wrap timestamps are
//! randomised and never reach this layer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::envelope::{self, EnvelopeConfig, EnvelopeError, MessageContext, UnwrappedMessage};
use crate::nostr::{self, NostrEvent, NostrFilter};
use crate::relay::{
    PublishReport, RelayPool, SeenCache, Subscription, TransportError, SEEN_MAX,
};
use crate::signer::{Signer, SignerError};
use crate::util;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectMessage {
    /// Rumor id.
    pub id: String,
    pub wrap_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub created_at: u64,
    pub context: Option<MessageContext>,
    pub outgoing: bool,
}

impl DirectMessage {
    pub fn counterpart(&self) -> &str {
        if self.outgoing {
            &self.recipient
        } else {
            &self.sender
        }
    }

    fn from_unwrapped(msg: UnwrappedMessage, me: &str) -> Option<Self> {
        let outgoing = msg.sender == me;
        let recipient = match (msg.recipient, outgoing) {
            (Some(r), _) => r,
            (None, false) => me.to_string(),
            (None, true) => return None,
        };
        Some(Self {
            id: msg.id,
            wrap_id: msg.wrap_id,
            sender: msg.sender,
            recipient,
            content: msg.content,
            created_at: msg.created_at,
            context: msg.context,
            outgoing,
        })
    }

    fn is_newer_than(&self, other: &DirectMessage) -> bool {
        (self.created_at, &self.id) > (other.created_at, &other.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub pubkey: String,
    pub last_message: String,
    pub last_message_at: u64,
    pub last_message_id: String,
    pub last_outgoing: bool,
    pub context: Option<MessageContext>,
}

impl Conversation {
    fn from_message(msg: &DirectMessage) -> Self {
        Self {
            pubkey: msg.counterpart().to_string(),
            last_message: msg.content.clone(),
            last_message_at: msg.created_at,
            last_message_id: msg.id.clone(),
            last_outgoing: msg.outgoing,
            context: msg.context.clone(),
        }
    }

    fn is_older_than(&self, msg: &DirectMessage) -> bool {
        (self.last_message_at, &self.last_message_id) < (msg.created_at, &msg.id)
    }
}

/// Keeps the newest message per counterpart and sorts newest first.
/// Independent of input order.
pub fn group_conversations(messages: &[DirectMessage]) -> Vec<Conversation> {
    let mut newest: HashMap<&str, &DirectMessage> = HashMap::new();
    for msg in messages {
        let slot = newest.entry(msg.counterpart()).or_insert(msg);
        if msg.is_newer_than(*slot) {
            *slot = msg;
        }
    }
    let mut out: Vec<Conversation> = newest.values().map(|m| Conversation::from_message(m)).collect();
    sort_conversations(&mut out);
    out
}

fn sort_conversations(list: &mut [Conversation]) {
    list.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.pubkey.cmp(&b.pubkey))
    });
}

fn apply_message(map: &mut HashMap<String, Conversation>, msg: &DirectMessage) {
    match map.get_mut(msg.counterpart()) {
        Some(conv) if conv.is_older_than(msg) => *conv = Conversation::from_message(msg),
        Some(_) => {}
        None => {
            map.insert(msg.counterpart().to_string(), Conversation::from_message(msg));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStage {
    Idle,
    BuildingEnvelope,
    Publishing,
    Done,
    Failed,
}

impl std::fmt::Display for SendStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SendStage::Idle => "idle",
            SendStage::BuildingEnvelope => "building-envelope",
            SendStage::Publishing => "publishing",
            SendStage::Done => "done",
            SendStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    pub message: DirectMessage,
    pub report: PublishReport,
    /// Outcome of publishing the sender's own copy, when one was sent.
    pub self_copy: Option<PublishReport>,
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid pubkey: {0}")]
    InvalidRecipient(String),
    #[error("message content is empty")]
    EmptyContent,
    #[error(transparent)]
    Signer(SignerError),
    #[error("envelope: {0}")]
    Envelope(EnvelopeError),
    #[error("no relay accepted the message ({} failed)", .report.failed.len())]
    Publish {
        message: Box<DirectMessage>,
        report: PublishReport,
    },
    #[error("relay query failed: {0}")]
    Query(#[from] TransportError),
}

impl From<EnvelopeError> for MessagingError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Signer(e) => MessagingError::Signer(e),
            EnvelopeError::InvalidRecipient(pk) => MessagingError::InvalidRecipient(pk),
            EnvelopeError::EmptyContent => MessagingError::EmptyContent,
            other => MessagingError::Envelope(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    pub envelope: EnvelopeConfig,
    /// Also wrap every outgoing rumor to the sender so it shows up in the
    /// sender's own history.
    pub self_copy: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            envelope: EnvelopeConfig::default(),
            self_copy: true,
        }
    }
}

pub struct Messenger {
    pool: RelayPool,
    config: MessagingConfig,
    conversations: Arc<Mutex<HashMap<String, Conversation>>>,
    skipped: Arc<AtomicU64>,
}

impl Messenger {
    pub fn new(pool: RelayPool, config: MessagingConfig) -> Self {
        Self {
            pool,
            config,
            conversations: Arc::new(Mutex::new(HashMap::new())),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Gift wraps that could not be opened since this messenger was created.
    pub fn skipped_events(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub async fn cached_conversations(&self) -> Vec<Conversation> {
        let map = self.conversations.lock().await;
        let mut list: Vec<Conversation> = map.values().cloned().collect();
        sort_conversations(&mut list);
        list
    }

    pub async fn send_message(
        &self,
        recipient: &str,
        content: &str,
        signer: &dyn Signer,
        context: Option<&MessageContext>,
    ) -> Result<SentMessage, MessagingError> {
        let mut stage = SendStage::Idle;
        tracing::debug!(recipient = %recipient, stage = %stage, "send requested");
        let res = self
            .send_inner(recipient, content, signer, context, &mut stage)
            .await;
        match &res {
            Ok(sent) => {
                stage = SendStage::Done;
                tracing::info!(
                    recipient = %recipient,
                    message_id = %sent.message.id,
                    relays = sent.report.published.len(),
                    stage = %stage,
                    "message sent"
                );
            }
            Err(err) => {
                let failed_at = stage;
                stage = SendStage::Failed;
                tracing::warn!(
                    recipient = %recipient,
                    failed_at = %failed_at,
                    stage = %stage,
                    error = %err,
                    "message send failed"
                );
            }
        }
        res
    }

    async fn send_inner(
        &self,
        recipient: &str,
        content: &str,
        signer: &dyn Signer,
        context: Option<&MessageContext>,
        stage: &mut SendStage,
    ) -> Result<SentMessage, MessagingError> {
        if !nostr::is_valid_pubkey(recipient) {
            return Err(MessagingError::InvalidRecipient(recipient.to_string()));
        }
        if content.trim().is_empty() {
            return Err(MessagingError::EmptyContent);
        }
        if let Some(ctx) = context {
            ctx.validate()?;
        }

        *stage = SendStage::BuildingEnvelope;
        tracing::debug!(recipient = %recipient, stage = %stage, "building envelope");
        let me = signer.public_key().await.map_err(MessagingError::Signer)?;
        let rumor = envelope::build_rumor(recipient, content, &me, util::now_unix_seconds(), context)?;
        let cfg = &self.config.envelope;
        let wrap = envelope::wrap_rumor(&rumor, recipient, signer, cfg).await?;
        let self_wrap = if self.config.self_copy && recipient != me {
            Some(envelope::wrap_rumor(&rumor, &me, signer, cfg).await?)
        } else {
            None
        };

        *stage = SendStage::Publishing;
        tracing::debug!(recipient = %recipient, wrap_id = %wrap.id, stage = %stage, "publishing");
        let (report, self_copy) = match &self_wrap {
            Some(copy) => {
                let (a, b) = tokio::join!(self.pool.publish(&wrap), self.pool.publish(copy));
                if !b.success() {
                    tracing::warn!(wrap_id = %copy.id, "self copy not stored on any relay");
                }
                (a, Some(b))
            }
            None => (self.pool.publish(&wrap).await, None),
        };

        let message = DirectMessage {
            id: rumor.id.clone(),
            wrap_id: wrap.id.clone(),
            sender: me,
            recipient: recipient.to_string(),
            content: content.to_string(),
            created_at: rumor.created_at,
            context: context.cloned(),
            outgoing: true,
        };

        if !report.success() {
            return Err(MessagingError::Publish {
                message: Box::new(message),
                report,
            });
        }
        apply_message(&mut *self.conversations.lock().await, &message);
        Ok(SentMessage {
            message,
            report,
            self_copy,
        })
    }

    pub async fn get_conversations(
        &self,
        signer: &dyn Signer,
    ) -> Result<Vec<Conversation>, MessagingError> {
        let messages = self.fetch_messages(signer).await?;
        let list = group_conversations(&messages);
        let mut map = self.conversations.lock().await;
        map.clear();
        for conv in &list {
            map.insert(conv.pubkey.clone(), conv.clone());
        }
        tracing::info!(conversations = list.len(), messages = messages.len(), "conversations loaded");
        Ok(list)
    }

    /// History with `other` in both directions, oldest first, capped to the
    /// newest `limit` messages.
    pub async fn get_messages(
        &self,
        other: &str,
        signer: &dyn Signer,
        limit: usize,
    ) -> Result<Vec<DirectMessage>, MessagingError> {
        if !nostr::is_valid_pubkey(other) {
            return Err(MessagingError::InvalidRecipient(other.to_string()));
        }
        let mut messages: Vec<DirectMessage> = self
            .fetch_messages(signer)
            .await?
            .into_iter()
            .filter(|m| m.counterpart() == other)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    /// Follows gift wraps addressed to the signer's key. Each event is opened
    /// on a worker task, so `on_message` never runs on a relay socket task.
    pub async fn subscribe_to_messages<F>(
        &self,
        signer: Arc<dyn Signer>,
        on_message: F,
    ) -> Result<MessageSubscription, MessagingError>
    where
        F: Fn(DirectMessage) + Send + Sync + 'static,
    {
        let me = signer.public_key().await.map_err(MessagingError::Signer)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<NostrEvent>();
        let filter = gift_wrap_filter(&me).since(util::now_unix_seconds().saturating_sub(
            self.config.envelope.timestamp_jitter_secs,
        ));
        let subscription = self
            .pool
            .subscribe(vec![filter], move |ev| {
                let _ = tx.send(ev);
            })
            .await?;

        let cfg = self.config.envelope.clone();
        let conversations = self.conversations.clone();
        let skipped = self.skipped.clone();
        let worker = tokio::spawn(async move {
            let mut seen = SeenCache::new(SEEN_MAX);
            while let Some(ev) = rx.recv().await {
                let opened = match envelope::unwrap(&ev, signer.as_ref(), &cfg).await {
                    Ok(opened) => opened,
                    Err(err) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(event_id = %ev.id, error = %err, "live gift wrap skipped");
                        continue;
                    }
                };
                let Some(msg) = DirectMessage::from_unwrapped(opened, &me) else {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event_id = %ev.id, "outgoing rumor without recipient skipped");
                    continue;
                };
                if seen.seen_or_insert(&msg.id) {
                    continue;
                }
                apply_message(&mut *conversations.lock().await, &msg);
                on_message(msg);
            }
            tracing::debug!("message worker finished");
        });

        Ok(MessageSubscription {
            inner: subscription,
            worker,
        })
    }

    async fn fetch_messages(&self, signer: &dyn Signer) -> Result<Vec<DirectMessage>, MessagingError> {
        let me = signer.public_key().await.map_err(MessagingError::Signer)?;
        let report = self.pool.query(&[gift_wrap_filter(&me)]).await?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(report.events.len());
        for ev in &report.events {
            let opened = match envelope::unwrap(ev, signer, &self.config.envelope).await {
                Ok(opened) => opened,
                Err(err) if err.is_terminal() => return Err(err.into()),
                Err(err) => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event_id = %ev.id, error = %err, "gift wrap skipped");
                    continue;
                }
            };
            let Some(msg) = DirectMessage::from_unwrapped(opened, &me) else {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %ev.id, "outgoing rumor without recipient skipped");
                continue;
            };
            if seen.insert(msg.id.clone()) {
                out.push(msg);
            }
        }
        tracing::debug!(
            events = report.events.len(),
            messages = out.len(),
            relays = report.responded.len(),
            "gift wraps opened"
        );
        Ok(out)
    }
}

fn gift_wrap_filter(me: &str) -> NostrFilter {
    NostrFilter::new()
        .kinds([nostr::KIND_GIFT_WRAP])
        .pubkey_tags([me.to_string()])
}

/// Live message feed. Dropping it closes the relay subscription.
pub struct MessageSubscription {
    inner: Subscription,
    worker: JoinHandle<()>,
}

impl MessageSubscription {
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Waits until the relay tasks and the worker have stopped.
    pub async fn closed(self) {
        self.inner.unsubscribe();
        self.inner.wait_closed().await;
        let MessageSubscription { inner, worker } = self;
        drop(inner);
        let _ = worker.await;
    }
}
