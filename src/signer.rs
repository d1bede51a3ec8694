//! Signing capability.
//!
//! The messenger never holds the user's secret key. Everything that needs it
//! (event signatures and NIP-44 under the user's key) goes through a
//! [`Signer`], in the shape browser extensions expose (NIP-07).

use async_trait::async_trait;
use thiserror::Error;

use crate::nip44::{self, ConversationKey, Nip44Error};
use crate::nostr::{self, Keys, NostrEvent, NostrUnsignedEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// No signer present, locked, or unreachable.
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    /// The user refused the request.
    #[error("signer request declined: {0}")]
    Declined(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Nip44(#[from] Nip44Error),
}

impl SignerError {
    /// Errors that end the current operation instead of skipping one event.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SignerError::Nip44(_))
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Fills `id`, `sig` and, when empty, `pubkey`.
    async fn sign_event(&self, unsigned: NostrUnsignedEvent) -> Result<NostrEvent, SignerError>;

    async fn nip44_encrypt(&self, peer_pubkey: &str, plaintext: &str)
        -> Result<String, SignerError>;

    async fn nip44_decrypt(&self, peer_pubkey: &str, payload: &str)
        -> Result<String, SignerError>;
}

/// In-process signer backed by a key loaded from the keystore.
#[derive(Clone, Debug)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn generate() -> Self {
        Self::new(Keys::generate())
    }

    pub fn from_sk_hex(sk_hex: &str) -> anyhow::Result<Self> {
        Ok(Self::new(Keys::from_sk_hex(sk_hex)?))
    }

    pub fn pubkey(&self) -> String {
        self.keys.public_key_hex()
    }

    fn conversation_key(&self, peer_pubkey: &str) -> Result<ConversationKey, SignerError> {
        let peer = nostr::parse_pubkey(peer_pubkey)
            .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
        Ok(ConversationKey::derive(&self.keys.secret_key(), &peer))
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.keys.public_key_hex())
    }

    async fn sign_event(&self, mut unsigned: NostrUnsignedEvent) -> Result<NostrEvent, SignerError> {
        if unsigned.pubkey.is_empty() {
            unsigned.pubkey = self.keys.public_key_hex();
        }
        self.keys
            .sign_event(&unsigned)
            .map_err(|e| SignerError::Signing(e.to_string()))
    }

    async fn nip44_encrypt(
        &self,
        peer_pubkey: &str,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        let key = self.conversation_key(peer_pubkey)?;
        Ok(nip44::encrypt(&key, plaintext)?)
    }

    async fn nip44_decrypt(
        &self,
        peer_pubkey: &str,
        payload: &str,
    ) -> Result<String, SignerError> {
        let key = self.conversation_key(peer_pubkey)?;
        Ok(nip44::decrypt(&key, payload)?)
    }
}
