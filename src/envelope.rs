//! NIP-17 / NIP-59 envelopes: rumor -> seal -> gift wrap, and back.
//!
//! The rumor (kind 14) carries the real author and text and is never signed.
//! The seal (kind 13) is the rumor encrypted to the recipient and signed by
//! the real author. The gift wrap (kind 1059) is the seal encrypted again
//! under a single-use key, tagged with the recipient, and is the only layer
//! that reaches a relay. Seal and wrap timestamps are pushed back by a random
//! amount so relays cannot correlate sends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip44::{self, ConversationKey, Nip44Error};
use crate::nostr::{self, Keys, NostrEvent, NostrUnsignedEvent};
use crate::signer::{Signer, SignerError};
use crate::util;

/// Two days, the NIP-59 recommendation.
pub const DEFAULT_JITTER_SECS: u64 = 2 * 24 * 60 * 60;

const CONTEXT_TAG: &str = "context";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    GiftWrap,
    Seal,
    Rumor,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layer::GiftWrap => "gift wrap",
            Layer::Seal => "seal",
            Layer::Rumor => "rumor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error(transparent)]
    Signer(SignerError),
    #[error("nip44: {0}")]
    Crypto(Nip44Error),
    #[error("malformed {layer}: {reason}")]
    Malformed { layer: Layer, reason: String },
    #[error("unexpected {layer} kind {kind}")]
    WrongKind { layer: Layer, kind: u32 },
    #[error("invalid {layer} id or signature")]
    InvalidSignature { layer: Layer },
    #[error("seal author {seal} does not match rumor author {rumor}")]
    SenderMismatch { seal: String, rumor: String },
    #[error("invalid recipient pubkey: {0}")]
    InvalidRecipient(String),
    #[error("invalid message context: {0}")]
    InvalidContext(String),
    #[error("message content is empty")]
    EmptyContent,
    #[error("event construction failed: {0}")]
    Build(String),
}

impl From<SignerError> for EnvelopeError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Nip44(e) => EnvelopeError::Crypto(e),
            other => EnvelopeError::Signer(other),
        }
    }
}

impl From<Nip44Error> for EnvelopeError {
    fn from(err: Nip44Error) -> Self {
        EnvelopeError::Crypto(err)
    }
}

impl EnvelopeError {
    /// True when the whole operation must stop (the signer failed), false
    /// when only the event at hand is bad.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeError::Signer(e) if e.is_terminal())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeConfig {
    /// Upper bound for the random backdating of seal and wrap timestamps.
    pub timestamp_jitter_secs: u64,
    /// Parse `[Context: type/id]` prefixes on rumors without a context tag.
    pub legacy_context_prefix: bool,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            timestamp_jitter_secs: DEFAULT_JITTER_SECS,
            legacy_context_prefix: true,
        }
    }
}

/// Reference to the listing a message is about (a product, a heritage item).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageContext {
    pub kind: String,
    pub id: String,
}

impl MessageContext {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Parses `type/id`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, id) = raw.trim().split_once('/')?;
        let ctx = Self::new(kind, id);
        ctx.validate().ok()?;
        Some(ctx)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let kind_ok = !self.kind.is_empty()
            && self
                .kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let id_ok = !self.id.is_empty() && !self.id.contains([']', '\r', '\n']);
        if kind_ok && id_ok {
            Ok(())
        } else {
            Err(EnvelopeError::InvalidContext(self.to_string()))
        }
    }

    pub fn marker(&self) -> String {
        format!("[Context: {}/{}]\n\n", self.kind, self.id)
    }

    fn to_tag(&self) -> Vec<String> {
        vec![CONTEXT_TAG.to_string(), self.kind.clone(), self.id.clone()]
    }

    fn from_tags(tags: &[Vec<String>]) -> Option<Self> {
        let tag = tags
            .iter()
            .find(|t| t.first().map(|k| k == CONTEXT_TAG).unwrap_or(false))?;
        let ctx = Self::new(tag.get(1)?.clone(), tag.get(2)?.clone());
        ctx.validate().ok()?;
        Some(ctx)
    }
}

impl std::fmt::Display for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

const MARKER_OPEN: &str = "[Context: ";

/// Splits a leading `[Context: type/id]\n\n` marker off `content`.
pub fn split_context(content: &str) -> (Option<MessageContext>, &str) {
    let Some(rest) = content.strip_prefix(MARKER_OPEN) else {
        return (None, content);
    };
    let Some(end) = rest.find(']') else {
        return (None, content);
    };
    let Some(text) = rest[end + 1..].strip_prefix("\n\n") else {
        return (None, content);
    };
    let Some((kind, id)) = rest[..end].split_once('/') else {
        return (None, content);
    };
    let ctx = MessageContext::new(kind, id);
    match ctx.validate() {
        Ok(()) => (Some(ctx), text),
        Err(_) => (None, content),
    }
}

/// Unsigned kind-14 event. `id` is computed but there is no signature, so a
/// leaked rumor cannot be proven authentic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    #[serde(default)]
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Rumor {
    fn unsigned(&self) -> NostrUnsignedEvent {
        nostr::build_unsigned_event(
            &self.pubkey,
            self.kind,
            self.tags.clone(),
            self.content.clone(),
            self.created_at,
        )
    }

    pub fn recipient(&self) -> Option<&str> {
        nostr::tag_value(&self.tags, "p")
    }

    pub fn context(&self) -> Option<MessageContext> {
        MessageContext::from_tags(&self.tags)
    }

    fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Build(e.to_string()))
    }
}

/// A gift wrap opened by its recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwrappedMessage {
    /// Rumor id; identical in the recipient's wrap and the sender's copy.
    pub id: String,
    pub wrap_id: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    /// Rumor timestamp. The wrap's own `created_at` is randomised.
    pub created_at: u64,
    pub context: Option<MessageContext>,
}

fn check_recipient(recipient: &str) -> Result<(), EnvelopeError> {
    if nostr::is_valid_pubkey(recipient) {
        Ok(())
    } else {
        Err(EnvelopeError::InvalidRecipient(recipient.to_string()))
    }
}

pub fn build_rumor(
    recipient: &str,
    content: &str,
    sender: &str,
    now: u64,
    context: Option<&MessageContext>,
) -> Result<Rumor, EnvelopeError> {
    check_recipient(recipient)?;
    if content.trim().is_empty() {
        return Err(EnvelopeError::EmptyContent);
    }
    let mut tags = vec![vec!["p".to_string(), recipient.to_string()]];
    let content = match context {
        Some(ctx) => {
            ctx.validate()?;
            tags.push(ctx.to_tag());
            format!("{}{}", ctx.marker(), content)
        }
        None => content.to_string(),
    };
    let mut rumor = Rumor {
        id: String::new(),
        pubkey: sender.to_string(),
        created_at: now,
        kind: nostr::KIND_PRIVATE_DM,
        tags,
        content,
    };
    rumor.id =
        nostr::event_id_hex(&rumor.unsigned()).map_err(|e| EnvelopeError::Build(e.to_string()))?;
    Ok(rumor)
}

pub async fn build_seal(
    rumor: &Rumor,
    recipient: &str,
    signer: &dyn Signer,
    cfg: &EnvelopeConfig,
) -> Result<NostrEvent, EnvelopeError> {
    check_recipient(recipient)?;
    let author = signer.public_key().await?;
    if author != rumor.pubkey {
        return Err(EnvelopeError::Build(
            "rumor author is not the signer".to_string(),
        ));
    }
    let content = signer.nip44_encrypt(recipient, &rumor.to_json()?).await?;
    let created_at = util::jittered_timestamp(util::now_unix_seconds(), cfg.timestamp_jitter_secs);
    let unsigned =
        nostr::build_unsigned_event(&author, nostr::KIND_SEAL, Vec::new(), content, created_at);
    Ok(signer.sign_event(unsigned).await?)
}

pub fn build_gift_wrap(
    seal: &NostrEvent,
    recipient: &str,
    cfg: &EnvelopeConfig,
) -> Result<NostrEvent, EnvelopeError> {
    check_recipient(recipient)?;
    if seal.kind != nostr::KIND_SEAL {
        return Err(EnvelopeError::WrongKind {
            layer: Layer::Seal,
            kind: seal.kind,
        });
    }
    let peer = nostr::parse_pubkey(recipient)
        .map_err(|_| EnvelopeError::InvalidRecipient(recipient.to_string()))?;
    let seal_json = serde_json::to_string(seal).map_err(|e| EnvelopeError::Build(e.to_string()))?;

    let ephemeral = Keys::generate();
    let key = ConversationKey::derive(&ephemeral.secret_key(), &peer);
    let content = nip44::encrypt(&key, &seal_json)?;
    let created_at = util::jittered_timestamp(util::now_unix_seconds(), cfg.timestamp_jitter_secs);
    let unsigned = nostr::build_unsigned_event(
        &ephemeral.public_key_hex(),
        nostr::KIND_GIFT_WRAP,
        vec![vec!["p".to_string(), recipient.to_string()]],
        content,
        created_at,
    );
    ephemeral
        .sign_event(&unsigned)
        .map_err(|e| EnvelopeError::Build(e.to_string()))
}

/// Seals `rumor` for `recipient` and gift-wraps it. Also used to wrap the
/// sender's own copy of an outgoing rumor.
pub async fn wrap_rumor(
    rumor: &Rumor,
    recipient: &str,
    signer: &dyn Signer,
    cfg: &EnvelopeConfig,
) -> Result<NostrEvent, EnvelopeError> {
    let seal = build_seal(rumor, recipient, signer, cfg).await?;
    build_gift_wrap(&seal, recipient, cfg)
}

pub async fn send_flow(
    recipient: &str,
    content: &str,
    signer: &dyn Signer,
    context: Option<&MessageContext>,
    cfg: &EnvelopeConfig,
) -> Result<NostrEvent, EnvelopeError> {
    let sender = signer.public_key().await?;
    let rumor = build_rumor(recipient, content, &sender, util::now_unix_seconds(), context)?;
    wrap_rumor(&rumor, recipient, signer, cfg).await
}

fn ensure_signed(ev: &NostrEvent, layer: Layer) -> Result<(), EnvelopeError> {
    match nostr::verify_event(ev) {
        Ok(true) => Ok(()),
        _ => Err(EnvelopeError::InvalidSignature { layer }),
    }
}

/// Separates the context from the visible text. A context tag wins; the
/// legacy prefix is only consulted on rumors without one.
fn extract_context(rumor: &Rumor, legacy_prefix: bool) -> (Option<MessageContext>, String) {
    if let Some(ctx) = rumor.context() {
        let text = rumor
            .content
            .strip_prefix(ctx.marker().as_str())
            .unwrap_or(&rumor.content)
            .to_string();
        return (Some(ctx), text);
    }
    if legacy_prefix {
        let (ctx, text) = split_context(&rumor.content);
        return (ctx, text.to_string());
    }
    (None, rumor.content.clone())
}

pub async fn unwrap(
    gift_wrap: &NostrEvent,
    signer: &dyn Signer,
    cfg: &EnvelopeConfig,
) -> Result<UnwrappedMessage, EnvelopeError> {
    if gift_wrap.kind != nostr::KIND_GIFT_WRAP {
        return Err(EnvelopeError::WrongKind {
            layer: Layer::GiftWrap,
            kind: gift_wrap.kind,
        });
    }
    ensure_signed(gift_wrap, Layer::GiftWrap)?;

    let seal_json = signer
        .nip44_decrypt(&gift_wrap.pubkey, &gift_wrap.content)
        .await?;
    let seal: NostrEvent =
        serde_json::from_str(&seal_json).map_err(|e| EnvelopeError::Malformed {
            layer: Layer::Seal,
            reason: e.to_string(),
        })?;
    if seal.kind != nostr::KIND_SEAL {
        return Err(EnvelopeError::WrongKind {
            layer: Layer::Seal,
            kind: seal.kind,
        });
    }
    ensure_signed(&seal, Layer::Seal)?;

    let rumor_json = signer.nip44_decrypt(&seal.pubkey, &seal.content).await?;
    let mut rumor: Rumor =
        serde_json::from_str(&rumor_json).map_err(|e| EnvelopeError::Malformed {
            layer: Layer::Rumor,
            reason: e.to_string(),
        })?;
    if rumor.kind != nostr::KIND_PRIVATE_DM {
        return Err(EnvelopeError::WrongKind {
            layer: Layer::Rumor,
            kind: rumor.kind,
        });
    }
    if rumor.pubkey != seal.pubkey {
        return Err(EnvelopeError::SenderMismatch {
            seal: seal.pubkey,
            rumor: rumor.pubkey,
        });
    }
    let computed_id =
        nostr::event_id_hex(&rumor.unsigned()).map_err(|e| EnvelopeError::Malformed {
            layer: Layer::Rumor,
            reason: e.to_string(),
        })?;
    if !rumor.id.is_empty() && rumor.id != computed_id {
        return Err(EnvelopeError::Malformed {
            layer: Layer::Rumor,
            reason: "id does not match content".to_string(),
        });
    }
    rumor.id = computed_id;

    let (context, content) = extract_context(&rumor, cfg.legacy_context_prefix);
    Ok(UnwrappedMessage {
        recipient: rumor.recipient().map(|s| s.to_string()),
        id: rumor.id,
        wrap_id: gift_wrap.id.clone(),
        sender: rumor.pubkey,
        content,
        created_at: rumor.created_at,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::LocalSigner;
    use async_trait::async_trait;

    struct DecliningSigner {
        inner: LocalSigner,
    }

    #[async_trait]
    impl Signer for DecliningSigner {
        async fn public_key(&self) -> Result<String, SignerError> {
            self.inner.public_key().await
        }

        async fn sign_event(&self, _: NostrUnsignedEvent) -> Result<NostrEvent, SignerError> {
            Err(SignerError::Declined("user rejected".to_string()))
        }

        async fn nip44_encrypt(&self, peer: &str, text: &str) -> Result<String, SignerError> {
            self.inner.nip44_encrypt(peer, text).await
        }

        async fn nip44_decrypt(&self, _: &str, _: &str) -> Result<String, SignerError> {
            Err(SignerError::Declined("user rejected".to_string()))
        }
    }

    fn cfg() -> EnvelopeConfig {
        EnvelopeConfig::default()
    }

    #[tokio::test]
    async fn roundtrip_recovers_content_and_context() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let ctx = MessageContext::new("product", "abc-123");
        let wrap = send_flow(&bob.pubkey(), "is this still for sale?", &alice, Some(&ctx), &cfg())
            .await
            .expect("wrap");
        let msg = unwrap(&wrap, &bob, &cfg()).await.expect("unwrap");
        assert_eq!(msg.content, "is this still for sale?");
        assert_eq!(msg.context, Some(ctx));
        assert_eq!(msg.sender, alice.pubkey());
        assert_eq!(msg.recipient.as_deref(), Some(bob.pubkey().as_str()));
        assert_eq!(msg.wrap_id, wrap.id);
    }

    #[tokio::test]
    async fn wrap_hides_sender_and_is_backdated() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let before = util::now_unix_seconds();
        let wrap = send_flow(&bob.pubkey(), "hi", &alice, None, &cfg())
            .await
            .expect("wrap");
        let after = util::now_unix_seconds();
        assert_eq!(wrap.kind, nostr::KIND_GIFT_WRAP);
        assert_ne!(wrap.pubkey, alice.pubkey());
        assert_eq!(wrap.tags, vec![vec!["p".to_string(), bob.pubkey()]]);
        assert!(wrap.created_at <= after);
        assert!(before.saturating_sub(wrap.created_at) <= DEFAULT_JITTER_SECS);
        assert!(nostr::verify_event(&wrap).expect("verify"));

        let msg = unwrap(&wrap, &bob, &cfg()).await.expect("unwrap");
        assert!(msg.created_at >= before && msg.created_at <= after);
    }

    #[tokio::test]
    async fn each_send_uses_fresh_ephemeral_key() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let a = send_flow(&bob.pubkey(), "same", &alice, None, &cfg()).await.expect("a");
        let b = send_flow(&bob.pubkey(), "same", &alice, None, &cfg()).await.expect("b");
        assert_ne!(a.pubkey, b.pubkey);
        assert_ne!(a.content, b.content);
        let ma = unwrap(&a, &bob, &cfg()).await.expect("ma");
        let mb = unwrap(&b, &bob, &cfg()).await.expect("mb");
        assert_eq!(ma.content, mb.content);
    }

    #[tokio::test]
    async fn third_party_cannot_open_wrap() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let eve = LocalSigner::generate();
        let wrap = send_flow(&bob.pubkey(), "private", &alice, None, &cfg())
            .await
            .expect("wrap");
        let err = unwrap(&wrap, &eve, &cfg()).await.expect_err("eve");
        assert_eq!(err, EnvelopeError::Crypto(Nip44Error::InvalidMac));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn tampered_wrap_is_rejected() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let mut wrap = send_flow(&bob.pubkey(), "x", &alice, None, &cfg())
            .await
            .expect("wrap");
        let replacement = if &wrap.content[60..61] == "A" { "B" } else { "A" };
        wrap.content.replace_range(60..61, replacement);
        let err = unwrap(&wrap, &bob, &cfg()).await.expect_err("tampered");
        assert_eq!(
            err,
            EnvelopeError::InvalidSignature {
                layer: Layer::GiftWrap
            }
        );
    }

    #[tokio::test]
    async fn seal_signed_by_someone_else_is_rejected() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let mallory = LocalSigner::generate();
        // Mallory builds a rumor claiming Alice wrote it and seals it herself.
        let rumor = build_rumor(&bob.pubkey(), "send money", &alice.pubkey(), 100, None)
            .expect("rumor");
        let content = mallory
            .nip44_encrypt(&bob.pubkey(), &rumor.to_json().expect("json"))
            .await
            .expect("encrypt");
        let unsigned = nostr::build_unsigned_event(
            &mallory.pubkey(),
            nostr::KIND_SEAL,
            Vec::new(),
            content,
            100,
        );
        let seal = mallory.sign_event(unsigned).await.expect("seal");
        let wrap = build_gift_wrap(&seal, &bob.pubkey(), &cfg()).expect("wrap");
        let err = unwrap(&wrap, &bob, &cfg()).await.expect_err("mismatch");
        assert!(matches!(err, EnvelopeError::SenderMismatch { .. }));
    }

    #[tokio::test]
    async fn rumor_id_must_match_its_content() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();
        let mallory = LocalSigner::generate();
        let genuine = build_rumor(&bob.pubkey(), "real", &alice.pubkey(), 100, None)
            .expect("genuine");

        let mut borrowed = build_rumor(&bob.pubkey(), "spam", &mallory.pubkey(), 200, None)
            .expect("borrowed");
        borrowed.id = genuine.id.clone();
        let wrap = wrap_rumor(&borrowed, &bob.pubkey(), &mallory, &cfg())
            .await
            .expect("wrap");
        let err = unwrap(&wrap, &bob, &cfg()).await.expect_err("borrowed id");
        assert!(matches!(
            err,
            EnvelopeError::Malformed {
                layer: Layer::Rumor,
                ..
            }
        ));
        assert!(!err.is_terminal());

        let mut anonymous = genuine.clone();
        anonymous.id = String::new();
        let wrap = wrap_rumor(&anonymous, &bob.pubkey(), &alice, &cfg())
            .await
            .expect("wrap");
        let msg = unwrap(&wrap, &bob, &cfg()).await.expect("empty id");
        assert_eq!(msg.id, genuine.id);
    }

    #[tokio::test]
    async fn declined_signature_is_terminal() {
        let alice = DecliningSigner {
            inner: LocalSigner::generate(),
        };
        let bob = LocalSigner::generate();
        let err = send_flow(&bob.pubkey(), "hi", &alice, None, &cfg())
            .await
            .expect_err("declined");
        assert!(matches!(err, EnvelopeError::Signer(SignerError::Declined(_))));
        assert!(err.is_terminal());

        let wrap = send_flow(&alice.inner.pubkey(), "hi", &bob, None, &cfg())
            .await
            .expect("wrap");
        let err = unwrap(&wrap, &alice, &cfg()).await.expect_err("declined");
        assert!(err.is_terminal());
    }

    #[test]
    fn rumor_validation() {
        let sender = LocalSigner::generate().pubkey();
        let recipient = LocalSigner::generate().pubkey();
        assert_eq!(
            build_rumor("nope", "hi", &sender, 1, None),
            Err(EnvelopeError::InvalidRecipient("nope".to_string()))
        );
        assert_eq!(
            build_rumor(&recipient, "   ", &sender, 1, None),
            Err(EnvelopeError::EmptyContent)
        );
        let bad = MessageContext::new("pro/duct", "1");
        assert!(matches!(
            build_rumor(&recipient, "hi", &sender, 1, Some(&bad)),
            Err(EnvelopeError::InvalidContext(_))
        ));
        let rumor = build_rumor(&recipient, "hi", &sender, 1, None).expect("rumor");
        assert_eq!(rumor.kind, nostr::KIND_PRIVATE_DM);
        assert_eq!(rumor.recipient(), Some(recipient.as_str()));
        assert_eq!(rumor.id.len(), 64);
        let json: serde_json::Value =
            serde_json::from_str(&rumor.to_json().expect("json")).expect("value");
        assert!(json.get("sig").is_none());
    }

    #[test]
    fn context_marker_parsing() {
        let (ctx, text) = split_context("[Context: heritage/h-42]\n\nnice story");
        assert_eq!(ctx, Some(MessageContext::new("heritage", "h-42")));
        assert_eq!(text, "nice story");

        let (ctx, text) = split_context("[Context: heritage/h-42] no blank line");
        assert_eq!(ctx, None);
        assert_eq!(text, "[Context: heritage/h-42] no blank line");

        assert_eq!(
            MessageContext::parse("product/p1"),
            Some(MessageContext::new("product", "p1"))
        );
        assert_eq!(MessageContext::parse("product"), None);
    }

    #[test]
    fn context_tag_wins_over_prefix() {
        let sender = LocalSigner::generate().pubkey();
        let recipient = LocalSigner::generate().pubkey();
        let ctx = MessageContext::new("product", "p1");
        let rumor = build_rumor(&recipient, "hello", &sender, 1, Some(&ctx)).expect("rumor");
        assert!(rumor.content.starts_with("[Context: product/p1]\n\n"));
        assert_eq!(
            extract_context(&rumor, false),
            (Some(ctx), "hello".to_string())
        );

        let plain = build_rumor(&recipient, "[Context: a/b]\n\nhey", &sender, 1, None)
            .expect("rumor");
        assert_eq!(
            extract_context(&plain, false),
            (None, "[Context: a/b]\n\nhey".to_string())
        );
        assert_eq!(
            extract_context(&plain, true),
            (Some(MessageContext::new("a", "b")), "hey".to_string())
        );
    }
}
