//! Encrypted at-rest storage for the local signer's secret key.
//!
//! The store is sealed with ChaCha20-Poly1305 under either an Argon2id key
//! derived from `NOSTR_DM_PASSPHRASE` or a random raw key kept next to it in
//! `keystore.key`.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::nostr::{self, Keys};

pub const ENV_PASSPHRASE: &str = "NOSTR_DM_PASSPHRASE";

const KEY_FILE_NAME: &str = "keystore.key";
const STORE_FILE_NAME: &str = "keystore.json";
const KEY_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySourceKind {
    Passphrase,
    KeyFile,
}

impl std::fmt::Display for KeySourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeySourceKind::Passphrase => "passphrase",
            KeySourceKind::KeyFile => "keyfile",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StorePayload {
    pubkey: String,
    sk_hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedStore {
    version: u8,
    kdf: String,
    salt_b64: String,
    nonce_b64: String,
    ciphertext_b64: String,
    mem_kib: u32,
    iterations: u32,
    parallelism: u32,
}

pub struct LoadedKeys {
    pub keys: Keys,
    pub source: KeySourceKind,
    /// True when the store was written by this call.
    pub created: bool,
}

/// Opens the keystore in `data_dir`, creating it on first use. `import_sk_hex`
/// seeds a new store; it is refused when a store already exists with a
/// different key.
pub fn load_or_init(data_dir: &Path, import_sk_hex: Option<&str>) -> Result<LoadedKeys> {
    let passphrase = std::env::var(ENV_PASSPHRASE).ok();
    load_or_init_with(data_dir, import_sk_hex, passphrase.as_deref())
}

pub fn load_or_init_with(
    data_dir: &Path,
    import_sk_hex: Option<&str>,
    passphrase: Option<&str>,
) -> Result<LoadedKeys> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let store_path = data_dir.join(STORE_FILE_NAME);
    let (key_source, source) = select_key_source(data_dir, passphrase)?;

    if store_path.exists() {
        let raw = std::fs::read_to_string(&store_path)?;
        let enc: EncryptedStore = serde_json::from_str(&raw).context("parse keystore")?;
        let key = key_source.derive_key(&enc)?;
        let payload = decrypt_payload(&enc, &key)?;
        let keys = Keys::from_sk_hex(&payload.sk_hex)?;
        if keys.public_key_hex() != payload.pubkey {
            return Err(anyhow!("keystore pubkey does not match secret key"));
        }
        if let Some(sk) = import_sk_hex {
            if nostr::pubkey_from_sk_hex(sk)? != payload.pubkey {
                return Err(anyhow!(
                    "keystore already holds a different key; remove {} to import",
                    store_path.display()
                ));
            }
        }
        tracing::debug!(source = %source, "keystore opened");
        return Ok(LoadedKeys {
            keys,
            source,
            created: false,
        });
    }

    let keys = match import_sk_hex {
        Some(sk) => Keys::from_sk_hex(sk.trim())?,
        None => Keys::generate(),
    };
    let payload = StorePayload {
        pubkey: keys.public_key_hex(),
        sk_hex: keys.secret_key_hex(),
    };
    let enc = encrypt_payload(&payload, &key_source)?;
    write_private(&store_path, &serde_json::to_string_pretty(&enc)?)?;
    tracing::info!(source = %source, pubkey = %payload.pubkey, "keystore created");
    Ok(LoadedKeys {
        keys,
        source,
        created: true,
    })
}

pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STORE_FILE_NAME)
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

fn select_key_source(dir: &Path, passphrase: Option<&str>) -> Result<(KeySource, KeySourceKind)> {
    if let Some(pass) = passphrase {
        if !pass.trim().is_empty() {
            return Ok((
                KeySource::Passphrase(Zeroizing::new(pass.to_string())),
                KeySourceKind::Passphrase,
            ));
        }
    }

    let key_path = dir.join(KEY_FILE_NAME);
    if key_path.exists() {
        let raw = std::fs::read_to_string(&key_path)?;
        let bytes = STANDARD_NO_PAD
            .decode(raw.trim())
            .map_err(|_| anyhow!("invalid key file"))?;
        if bytes.len() != KEY_BYTES {
            return Err(anyhow!("invalid key file length"));
        }
        return Ok((KeySource::RawKey(Zeroizing::new(bytes)), KeySourceKind::KeyFile));
    }

    let mut key = Zeroizing::new(vec![0u8; KEY_BYTES]);
    rand::thread_rng().fill_bytes(&mut key);
    write_private(&key_path, &STANDARD_NO_PAD.encode(&*key))?;
    Ok((KeySource::RawKey(key), KeySourceKind::KeyFile))
}

enum KeySource {
    RawKey(Zeroizing<Vec<u8>>),
    Passphrase(Zeroizing<String>),
}

impl KeySource {
    fn derive_key(&self, enc: &EncryptedStore) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            KeySource::RawKey(k) => {
                if enc.kdf != "raw" {
                    return Err(anyhow!(
                        "keystore is passphrase protected; set {}",
                        ENV_PASSPHRASE
                    ));
                }
                Ok(k.clone())
            }
            KeySource::Passphrase(pass) => {
                if enc.kdf != "argon2id" {
                    return Err(anyhow!("passphrase provided but keystore not argon2id"));
                }
                let salt = STANDARD_NO_PAD
                    .decode(enc.salt_b64.trim())
                    .map_err(|_| anyhow!("invalid salt"))?;
                derive_key_from_pass(pass, &salt, enc.mem_kib, enc.iterations, enc.parallelism)
            }
        }
    }
}

fn derive_key_from_pass(
    pass: &str,
    salt: &[u8],
    mem_kib: u32,
    iterations: u32,
    parallelism: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; KEY_BYTES]);
    let params = argon2::Params::new(mem_kib, iterations, parallelism, Some(KEY_BYTES))
        .map_err(|_| anyhow!("invalid argon2 params"))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    argon2
        .hash_password_into(pass.as_bytes(), salt, &mut out)
        .map_err(|_| anyhow!("argon2 failed"))?;
    Ok(out)
}

fn encrypt_payload(payload: &StorePayload, key_source: &KeySource) -> Result<EncryptedStore> {
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);

    let (key, kdf, salt, mem_kib, iterations, parallelism) = match key_source {
        KeySource::RawKey(k) => (k.clone(), "raw", vec![], 0, 0, 0),
        KeySource::Passphrase(pass) => {
            let mut salt = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let mem_kib = 64 * 1024;
            let iterations = 3;
            let parallelism = 1;
            let key = derive_key_from_pass(pass, &salt, mem_kib, iterations, parallelism)?;
            (key, "argon2id", salt, mem_kib, iterations, parallelism)
        }
    };

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| anyhow!("encrypt failed"))?;

    Ok(EncryptedStore {
        version: 1,
        kdf: kdf.to_string(),
        salt_b64: STANDARD_NO_PAD.encode(&salt),
        nonce_b64: STANDARD_NO_PAD.encode(nonce),
        ciphertext_b64: STANDARD_NO_PAD.encode(&ciphertext),
        mem_kib,
        iterations,
        parallelism,
    })
}

fn decrypt_payload(enc: &EncryptedStore, key: &[u8]) -> Result<StorePayload> {
    if enc.version != 1 {
        return Err(anyhow!("unsupported keystore version {}", enc.version));
    }
    let nonce = STANDARD_NO_PAD
        .decode(enc.nonce_b64.trim())
        .map_err(|_| anyhow!("invalid nonce"))?;
    if nonce.len() != 12 || key.len() != KEY_BYTES {
        return Err(anyhow!("invalid keystore parameters"));
    }
    let ciphertext = STANDARD_NO_PAD
        .decode(enc.ciphertext_b64.trim())
        .map_err(|_| anyhow!("invalid ciphertext"))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| anyhow!("decrypt failed; wrong passphrase or key file"))?,
    );

    let payload: StorePayload = serde_json::from_slice(&plaintext)?;
    Ok(payload)
}
