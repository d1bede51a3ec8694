//! NIP-44 (version 2) payload encryption.
//!
//! secp256k1 ECDH x-coordinate -> HKDF-SHA256 conversation key, per-message
//! keys expanded from a random 32-byte nonce, ChaCha20 over a length-prefixed
//! padded plaintext, HMAC-SHA256 over `nonce || ciphertext`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, Parity, SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::nostr;

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;
const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;
const MIN_PAYLOAD_LEN: usize = 132;
const MAX_PAYLOAD_LEN: usize = 87472;
const MIN_DECODED_LEN: usize = 99;
const MAX_DECODED_LEN: usize = 65603;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Nip44Error {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("unsupported payload encoding")]
    UnsupportedEncoding,
    #[error("unknown encryption version {0}")]
    UnknownVersion(u8),
    #[error("invalid payload length {0}")]
    InvalidPayloadLength(usize),
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("invalid MAC")]
    InvalidMac,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("invalid plaintext length {0}")]
    InvalidPlaintextLength(usize),
    #[error("plaintext is not valid utf-8")]
    InvalidUtf8,
}

/// Long-lived symmetric key shared by two parties. Either side derives the
/// same value from its own secret key and the other's public key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn derive(secret: &SecretKey, peer: &XOnlyPublicKey) -> Self {
        let point = ecdh::shared_secret_point(&peer.public_key(Parity::Even), secret);
        let mut shared_x = [0u8; 32];
        shared_x.copy_from_slice(&point[..32]);
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared_x);
        shared_x.zeroize();
        let mut key = [0u8; 32];
        key.copy_from_slice(prk.as_slice());
        Self(key)
    }

    pub fn from_hex(sk_hex: &str, peer_pubkey_hex: &str) -> Result<Self, Nip44Error> {
        let sk_bytes =
            nostr::hex_to_bytes(sk_hex).map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&sk_bytes)
            .map_err(|_| Nip44Error::InvalidKey("secret key".to_string()))?;
        let peer = nostr::parse_pubkey(peer_pubkey_hex)
            .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
        Ok(Self::derive(&secret, &peer))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

fn message_keys(key: &ConversationKey, nonce: &[u8]) -> Result<MessageKeys, Nip44Error> {
    let hk = Hkdf::<Sha256>::from_prk(key.as_bytes())
        .map_err(|_| Nip44Error::InvalidKey("conversation key".to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|_| Nip44Error::InvalidKey("hkdf expand".to_string()))?;
    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    okm.zeroize();
    Ok(keys)
}

/// Padded size for a plaintext of `unpadded_len` bytes (excluding the
/// two-byte length prefix).
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Nip44Error::InvalidPlaintextLength(len));
    }
    let padded_len = calc_padded_len(len);
    let mut out = Vec::with_capacity(2 + padded_len);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(2 + padded_len, 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN
        || 2 + len > padded.len()
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(Nip44Error::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}

fn mac_for(hmac_key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, Nip44Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key)
        .map_err(|_| Nip44Error::InvalidKey("hmac key".to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

fn apply_chacha(keys: &MessageKeys, buf: &mut [u8]) -> Result<(), Nip44Error> {
    let mut cipher = ChaCha20::new_from_slices(&keys.chacha_key, &keys.chacha_nonce)
        .map_err(|_| Nip44Error::InvalidKey("chacha20 key".to_string()))?;
    cipher.apply_keystream(buf);
    Ok(())
}

pub fn encrypt(key: &ConversationKey, plaintext: &str) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(key, plaintext, &nonce)
}

/// Deterministic form of [`encrypt`]. A nonce must never be reused with the
/// same conversation key.
pub fn encrypt_with_nonce(
    key: &ConversationKey,
    plaintext: &str,
    nonce: &[u8; NONCE_LEN],
) -> Result<String, Nip44Error> {
    let keys = message_keys(key, nonce)?;
    let mut ciphertext = pad(plaintext.as_bytes())?;
    apply_chacha(&keys, &mut ciphertext)?;
    let tag = mac_for(&keys.hmac_key, nonce, &ciphertext)?
        .finalize()
        .into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len() + MAC_LEN);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(tag.as_slice());
    Ok(STANDARD.encode(payload))
}

pub fn decrypt(key: &ConversationKey, payload: &str) -> Result<String, Nip44Error> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(Nip44Error::UnsupportedEncoding);
    }
    let plen = payload.len();
    if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&plen) {
        return Err(Nip44Error::InvalidPayloadLength(plen));
    }
    let data = STANDARD
        .decode(payload)
        .map_err(|_| Nip44Error::InvalidBase64)?;
    let dlen = data.len();
    if !(MIN_DECODED_LEN..=MAX_DECODED_LEN).contains(&dlen) {
        return Err(Nip44Error::InvalidPayloadLength(dlen));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::UnknownVersion(data[0]));
    }
    let nonce = &data[1..1 + NONCE_LEN];
    let ciphertext = &data[1 + NONCE_LEN..dlen - MAC_LEN];
    let tag = &data[dlen - MAC_LEN..];

    let keys = message_keys(key, nonce)?;
    mac_for(&keys.hmac_key, nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| Nip44Error::InvalidMac)?;

    let mut padded = ciphertext.to_vec();
    apply_chacha(&keys, &mut padded)?;
    let plaintext = unpad(&padded)?;
    padded.zeroize();
    String::from_utf8(plaintext).map_err(|_| Nip44Error::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sk_hex(n: u8) -> String {
        format!("{:064x}", n)
    }

    const PK1: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PK2: &str = "c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn key_12() -> ConversationKey {
        ConversationKey::from_hex(&sk_hex(1), PK2).expect("conversation key")
    }

    #[test]
    fn reference_vector_matches() {
        let key = key_12();
        assert_eq!(
            nostr::bytes_to_hex(key.as_bytes()),
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d"
        );
        let mut nonce = [0u8; 32];
        nonce[31] = 1;
        let payload = encrypt_with_nonce(&key, "a", &nonce).expect("encrypt");
        assert_eq!(
            payload,
            "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb"
        );
        assert_eq!(decrypt(&key, &payload).expect("decrypt"), "a");
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let a = ConversationKey::from_hex(&sk_hex(1), PK2).expect("a");
        let b = ConversationKey::from_hex(&sk_hex(2), PK1).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn padded_lengths() {
        let cases = [
            (1, 32),
            (16, 32),
            (32, 32),
            (33, 64),
            (37, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (200, 224),
            (250, 256),
            (320, 320),
            (383, 384),
            (400, 448),
            (515, 640),
            (900, 1024),
            (1020, 1024),
            (65535, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(calc_padded_len(len), expected, "len {}", len);
        }
    }

    #[test]
    fn roundtrip_various_sizes() {
        let key = key_12();
        for text in ["x".to_string(), "hello 🌍 ñ".to_string(), "z".repeat(65535)] {
            let payload = encrypt(&key, &text).expect("encrypt");
            assert_eq!(decrypt(&key, &payload).expect("decrypt"), text);
        }
    }

    #[test]
    fn fresh_nonce_per_message() {
        let key = key_12();
        let a = encrypt(&key, "same").expect("a");
        let b = encrypt(&key, "same").expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn plaintext_length_limits() {
        let key = key_12();
        assert_eq!(
            encrypt(&key, ""),
            Err(Nip44Error::InvalidPlaintextLength(0))
        );
        assert_eq!(
            encrypt(&key, &"z".repeat(65536)),
            Err(Nip44Error::InvalidPlaintextLength(65536))
        );
    }

    #[test]
    fn wrong_key_fails_mac() {
        let payload = encrypt(&key_12(), "secret").expect("encrypt");
        let other = ConversationKey::from_hex(&sk_hex(3), PK2).expect("other");
        assert_eq!(decrypt(&other, &payload), Err(Nip44Error::InvalidMac));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let key = key_12();
        let payload = encrypt(&key, "secret").expect("encrypt");
        let mut data = STANDARD.decode(&payload).expect("b64");
        data[40] ^= 0x01;
        let tampered = STANDARD.encode(&data);
        assert_eq!(decrypt(&key, &tampered), Err(Nip44Error::InvalidMac));
    }

    #[test]
    fn rejects_unknown_version_and_encoding() {
        let key = key_12();
        let payload = encrypt(&key, "secret").expect("encrypt");
        let mut data = STANDARD.decode(&payload).expect("b64");
        data[0] = 1;
        assert_eq!(
            decrypt(&key, &STANDARD.encode(&data)),
            Err(Nip44Error::UnknownVersion(1))
        );
        assert_eq!(
            decrypt(&key, "#not-supported"),
            Err(Nip44Error::UnsupportedEncoding)
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        let key = key_12();
        assert_eq!(
            decrypt(&key, "AgAA"),
            Err(Nip44Error::InvalidPayloadLength(4))
        );
        assert_eq!(
            decrypt(&key, &"!".repeat(132)),
            Err(Nip44Error::InvalidBase64)
        );
    }

    #[test]
    fn unpad_rejects_inconsistent_length() {
        let mut padded = pad(b"hello").expect("pad");
        assert_eq!(unpad(&padded).expect("unpad"), b"hello".to_vec());
        padded[1] = 40;
        assert_eq!(unpad(&padded), Err(Nip44Error::InvalidPadding));
        assert_eq!(unpad(&[0, 0]), Err(Nip44Error::InvalidPadding));
    }
}
