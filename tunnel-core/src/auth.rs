//! Handshake authentication.
//!
//! Client side builds an `Authorization`-style pair of headers
//! (`username`, `token`) carrying an AEAD-sealed timestamp; server side
//! verifies them and fails closed into [`crate::masquerade`] on any
//! problem, indistinguishably from an auth header that was never sent.
//!
//! Grounded on `client.go`'s `buildHeader` and `server.go`'s
//! `authenticate`, with one deliberate deviation: this implementation
//! uses the stronger Argon2id parameters mandated by the tunnel's
//! handshake design (`m=32 MiB, t=3, p=4`) rather than the original's
//! `m=1 MiB, t=1, p=2`, and it checks the nonce store before deriving
//! the key rather than after, so a replayed nonce never pays for a KDF.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use rand::RngCore;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const MAX_CLOCK_SKEW_SECS: i64 = 60;

fn kdf(password: &str, nonce: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(32 * 1024, 3, 4, Some(32))
        .map_err(|e| Error::Fatal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), nonce, &mut out)
        .map_err(|e| Error::Fatal(format!("argon2 derivation failed: {e}")))?;
    Ok(out)
}

/// Builds the `(username, token)` header pair the client attaches to its
/// WebSocket upgrade request.
pub fn build_auth_headers(username: &str, password: &str) -> Result<(String, String)> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key_bytes = kdf(password, &nonce_bytes)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Fatal(format!("system clock before epoch: {e}")))?
        .as_nanos() as u64;
    let plaintext = now_ns.to_be_bytes();

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: &plaintext,
                aad: &[],
            },
        )
        .map_err(|_| Error::Fatal("aead seal failed".into()))?;

    let mut token_bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    token_bytes.extend_from_slice(&nonce_bytes);
    token_bytes.extend_from_slice(&ciphertext);

    Ok((username.to_string(), hex::encode(token_bytes)))
}

/// Looks up a user's password by username. The only supplied
/// implementation is a TOML-file-backed map; a real deployment's
/// database-backed store lives outside this crate.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn password_for(&self, username: &str) -> Option<String>;
}

/// Records which `(username, nonce)` pairs have already been accepted,
/// defending against token replay. `check_and_insert` must be atomic:
/// the original store this is displacing fell to TOCTOU if it were not.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Returns `true` if the nonce was newly inserted (i.e. not seen
    /// before), `false` if it was already present.
    async fn check_and_insert(&self, username: &str, nonce: &[u8]) -> bool;
}

/// An in-process `NonceStore`, sufficient for a single server instance
/// and for tests. Persistent, multi-instance deployments must supply
/// their own.
pub struct InMemoryNonceStore {
    seen: Mutex<HashSet<(String, Vec<u8>)>>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn check_and_insert(&self, username: &str, nonce: &[u8]) -> bool {
        let mut seen = self.seen.lock().expect("nonce store mutex poisoned");
        seen.insert((username.to_string(), nonce.to_vec()))
    }
}

/// A TOML-file-backed `UserStore`: a flat `username -> password` map.
pub struct TomlUserStore {
    users: std::collections::HashMap<String, String>,
}

impl TomlUserStore {
    pub fn new(users: std::collections::HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserStore for TomlUserStore {
    async fn password_for(&self, username: &str) -> Option<String> {
        self.users.get(username).cloned()
    }
}

/// Verifies a client's `(username, token)` header pair.
///
/// Returns `Ok(())` on success and `Err(Error::Auth)` on *any* failure
/// (bad hex, short token, unknown user, replayed nonce, bad MAC, clock
/// skew). Callers must treat every `Err` identically and route it to
/// [`crate::masquerade`] — the distinct failure reasons exist only for
/// logging, never for the response sent back to the client.
pub async fn authenticate(
    username: &str,
    token_hex: &str,
    users: &dyn UserStore,
    nonces: &dyn NonceStore,
) -> Result<()> {
    let token = hex::decode(token_hex).map_err(|_| Error::Auth)?;
    if token.len() < NONCE_LEN {
        return Err(Error::Auth);
    }
    let (nonce_bytes, ciphertext) = token.split_at(NONCE_LEN);

    // Nonce freshness is checked before any KDF work so a replay attempt
    // never earns the attacker a free expensive Argon2 computation.
    if !nonces.check_and_insert(username, nonce_bytes).await {
        return Err(Error::Auth);
    }

    let password = users.password_for(username).await.ok_or(Error::Auth)?;
    let key_bytes = kdf(&password, nonce_bytes).map_err(|_| Error::Auth)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::Auth)?;
    if plaintext.len() != 8 {
        return Err(Error::Auth);
    }
    let sent_ns = u64::from_be_bytes(plaintext.try_into().unwrap());
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Auth)?
        .as_nanos() as u64;

    let skew_secs = (now_ns as i128 - sent_ns as i128) / 1_000_000_000;
    if skew_secs.unsigned_abs() > MAX_CLOCK_SKEW_SECS as u128 {
        return Err(Error::Auth);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_succeeds() {
        let users = TomlUserStore::new(
            [("alice".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
        );
        let nonces = InMemoryNonceStore::new();

        let (username, token) = build_auth_headers("alice", "hunter2").unwrap();
        assert_eq!(username, "alice");
        authenticate(&username, &token, &users, &nonces)
            .await
            .expect("valid header should authenticate");
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let users = TomlUserStore::new(
            [("alice".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
        );
        let nonces = InMemoryNonceStore::new();
        let (username, token) = build_auth_headers("alice", "hunter2").unwrap();
        authenticate(&username, &token, &users, &nonces)
            .await
            .unwrap();
        let err = authenticate(&username, &token, &users, &nonces)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let users = TomlUserStore::new(
            [("alice".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
        );
        let nonces = InMemoryNonceStore::new();
        let (username, token) = build_auth_headers("alice", "wrong-password").unwrap();
        let err = authenticate(&username, &token, &users, &nonces)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let users = TomlUserStore::new(Default::default());
        let nonces = InMemoryNonceStore::new();
        let (username, token) = build_auth_headers("ghost", "irrelevant").unwrap();
        let err = authenticate(&username, &token, &users, &nonces)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    /// Builds a token by hand, the way [`build_auth_headers`] does, but
    /// sealing a timestamp that's already outside the clock-skew window.
    fn build_stale_token(password: &str, skew_secs: i64) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = kdf(password, &nonce_bytes).unwrap();
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        let stale_ns = (now_ns - skew_secs * 1_000_000_000) as u64;
        let plaintext = stale_ns.to_be_bytes();

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &[],
                },
            )
            .unwrap();

        let mut token_bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token_bytes.extend_from_slice(&nonce_bytes);
        token_bytes.extend_from_slice(&ciphertext);
        hex::encode(token_bytes)
    }

    #[tokio::test]
    async fn stale_timestamp_outside_clock_skew_is_rejected() {
        let users = TomlUserStore::new(
            [("alice".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
        );
        let nonces = InMemoryNonceStore::new();
        let token = build_stale_token("hunter2", MAX_CLOCK_SKEW_SECS + 60);
        let err = authenticate("alice", &token, &users, &nonces)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth));
    }
}
