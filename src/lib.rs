//! Nostr direct messaging library surface.
//!
//! This crate exposes the pieces of a NIP-17 messaging client:
//! - NIP-44 v2 payload encryption
//! - rumor / seal / gift wrap envelopes
//! - a multi-relay publish, query and subscribe pool
//! - a messenger that turns gift wraps into conversations

/// Runtime configuration and relay descriptors.
pub mod config;
/// Rumor, seal and gift wrap construction and unwrapping.
pub mod envelope;
/// Encrypted key storage.
pub mod keystore;
/// Send, history and live message orchestration.
pub mod messaging;
/// NIP-44 v2 encryption.
pub mod nip44;
/// Nostr key/event/signature helpers and relay wire frames.
pub mod nostr;
/// Outbound relay pool client.
pub mod relay;
/// Signing capability.
pub mod signer;
/// Shared utility helpers.
pub mod util;
