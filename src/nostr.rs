use anyhow::{anyhow, Result};
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Private direct message (NIP-17). Only ever travels as a rumor.
pub const KIND_PRIVATE_DM: u32 = 14;
/// Seal (NIP-59).
pub const KIND_SEAL: u32 = 13;
/// Gift wrap (NIP-59).
pub const KIND_GIFT_WRAP: u32 = 1059;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrUnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Subscription filter (NIP-01). Tag filters serialise as `#p`, `#d`, `#t`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl NostrFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn pubkey_tags(mut self, pubkeys: impl IntoIterator<Item = String>) -> Self {
        self.p = Some(pubkeys.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Client-side check; relays are untrusted and may return anything.
    /// `limit` only bounds the stored result set and is not checked here.
    pub fn matches(&self, ev: &NostrEvent) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        let tag_filters = [("p", &self.p), ("d", &self.d), ("t", &self.t)];
        for (key, values) in tag_filters {
            if let Some(values) = values {
                if !values.iter().any(|v| has_tag(&ev.tags, key, v)) {
                    return false;
                }
            }
        }
        true
    }
}

/// Secret key material held in memory. Used for the local signer and for
/// single-use gift wrap keys.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (sk, _pk) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            keypair: Keypair::from_secret_key(&secp, &sk),
        }
    }

    pub fn from_sk_hex(sk_hex: &str) -> Result<Self> {
        let sk_bytes = hex_to_bytes(sk_hex)?;
        let sk = SecretKey::from_slice(&sk_bytes).map_err(|_| anyhow!("invalid nostr sk"))?;
        let secp = Secp256k1::new();
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &sk),
        })
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_key_hex(&self) -> String {
        bytes_to_hex(&self.keypair.secret_key().secret_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        xonly_pk_hex(&self.keypair)
    }

    pub fn sign_event(&self, unsigned: &NostrUnsignedEvent) -> Result<NostrEvent> {
        if unsigned.pubkey != self.public_key_hex() {
            return Err(anyhow!("event pubkey does not match signing key"));
        }
        let id = event_id_hex(unsigned)?;
        let hash = hex_to_bytes(&id)?;
        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr(&hash, &self.keypair);
        let sig_hex = bytes_to_hex(sig.as_ref());

        Ok(NostrEvent {
            id,
            pubkey: unsigned.pubkey.clone(),
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags.clone(),
            content: unsigned.content.clone(),
            sig: sig_hex,
        })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("pubkey", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

pub fn pubkey_from_sk_hex(sk_hex: &str) -> Result<String> {
    Ok(Keys::from_sk_hex(sk_hex)?.public_key_hex())
}

pub fn build_unsigned_event(
    pubkey: &str,
    kind: u32,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: u64,
) -> NostrUnsignedEvent {
    NostrUnsignedEvent {
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content,
    }
}

pub fn frame_event(ev: &NostrEvent) -> String {
    serde_json::to_string(&json!(["EVENT", ev])).unwrap_or_else(|_| "[]".to_string())
}

pub fn frame_req(sub_id: &str, filters: &[NostrFilter]) -> String {
    let mut frame = vec![json!("REQ"), json!(sub_id)];
    frame.extend(filters.iter().map(|f| json!(f)));
    serde_json::to_string(&frame).unwrap_or_else(|_| "[]".to_string())
}

pub fn frame_close(sub_id: &str) -> String {
    serde_json::to_string(&json!(["CLOSE", sub_id])).unwrap_or_else(|_| "[]".to_string())
}

/// Relay-to-client frames this crate understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        sub_id: String,
        event: Box<NostrEvent>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        sub_id: String,
    },
    Closed {
        sub_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    /// Well-formed frame of a type this client ignores (AUTH, COUNT, ...).
    Other(String),
}

pub fn parse_relay_message(frame: &str) -> Result<RelayMessage> {
    let v: Value = serde_json::from_str(frame).map_err(|e| anyhow!("invalid json frame: {}", e))?;
    let arr = v.as_array().ok_or_else(|| anyhow!("frame is not an array"))?;
    let label = arr
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("frame has no label"))?;
    let str_at = |idx: usize| -> Result<String> {
        arr.get(idx)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("{} frame missing field {}", label, idx))
    };
    match label {
        "EVENT" => {
            let sub_id = str_at(1)?;
            let raw = arr
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("EVENT frame missing event"))?;
            let event: NostrEvent =
                serde_json::from_value(raw).map_err(|e| anyhow!("invalid event object: {}", e))?;
            Ok(RelayMessage::Event {
                sub_id,
                event: Box::new(event),
            })
        }
        "OK" => {
            let event_id = str_at(1)?;
            let accepted = arr
                .get(2)
                .and_then(|v| v.as_bool())
                .ok_or_else(|| anyhow!("OK frame missing status"))?;
            let message = str_at(3).unwrap_or_default();
            Ok(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            })
        }
        "EOSE" => Ok(RelayMessage::Eose { sub_id: str_at(1)? }),
        "CLOSED" => Ok(RelayMessage::Closed {
            sub_id: str_at(1)?,
            message: str_at(2).unwrap_or_default(),
        }),
        "NOTICE" => Ok(RelayMessage::Notice {
            message: str_at(1).unwrap_or_default(),
        }),
        other => Ok(RelayMessage::Other(other.to_string())),
    }
}

pub fn verify_event(ev: &NostrEvent) -> Result<bool> {
    let unsigned = NostrUnsignedEvent {
        pubkey: ev.pubkey.clone(),
        created_at: ev.created_at,
        kind: ev.kind,
        tags: ev.tags.clone(),
        content: ev.content.clone(),
    };
    let expected_id = event_id_hex(&unsigned)?;
    if expected_id != ev.id {
        return Ok(false);
    }
    let hash = hex_to_bytes(&ev.id)?;
    if hash.len() != 32 {
        return Err(anyhow!("invalid event id"));
    }
    let sig_bytes = hex_to_bytes(&ev.sig)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| anyhow!("invalid signature"))?;
    let pk = parse_pubkey(&ev.pubkey)?;
    let secp = Secp256k1::verification_only();
    Ok(secp.verify_schnorr(&sig, &hash, &pk).is_ok())
}

pub fn event_id_hex(unsigned: &NostrUnsignedEvent) -> Result<String> {
    let content = json!([
        0,
        unsigned.pubkey,
        unsigned.created_at,
        unsigned.kind,
        unsigned.tags,
        unsigned.content,
    ]);
    let raw = serde_json::to_string(&content).map_err(|_| anyhow!("event serialize failed"))?;
    let digest = Sha256::digest(raw.as_bytes());
    Ok(bytes_to_hex(digest.as_slice()))
}

/// Parses a 32-byte hex x-only public key.
pub fn parse_pubkey(hex: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.len() != 32 {
        return Err(anyhow!("invalid pubkey length"));
    }
    XOnlyPublicKey::from_slice(&bytes).map_err(|_| anyhow!("invalid pubkey"))
}

pub fn is_valid_pubkey(hex: &str) -> bool {
    hex.len() == 64 && parse_pubkey(hex).is_ok()
}

pub fn tag_value<'a>(tags: &'a [Vec<String>], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.first().map(|k| k == key).unwrap_or(false))
        .and_then(|t| t.get(1))
        .map(|s| s.as_str())
}

pub fn has_tag(tags: &[Vec<String>], key: &str, value: &str) -> bool {
    tags.iter().any(|t| {
        t.first().map(|k| k == key).unwrap_or(false) && t.get(1).map(|v| v == value).unwrap_or(false)
    })
}

pub(crate) fn hex_to_bytes(hex: &str) -> Result<Vec<u8>> {
    let h = hex.trim();
    if h.len() % 2 != 0 || !h.is_ascii() {
        return Err(anyhow!("invalid hex"));
    }
    let mut out = Vec::with_capacity(h.len() / 2);
    for i in (0..h.len()).step_by(2) {
        let b = u8::from_str_radix(&h[i..i + 2], 16).map_err(|_| anyhow!("invalid hex"))?;
        out.push(b);
    }
    Ok(out)
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

fn xonly_pk_hex(keypair: &Keypair) -> String {
    let (pk, _) = XOnlyPublicKey::from_keypair(keypair);
    bytes_to_hex(&pk.serialize())
}
