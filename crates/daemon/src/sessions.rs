// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Resumable session tokens.
//!
//! A token is `base64url(payload) "." base64url(hmac_sha256(secret,
//! payload))` over a JSON payload carrying the player name (lowercased),
//! the issuing connection id, a salted hash of the remote address, the
//! expiry, and a random nonce. Tokens are single-issuing: a successful
//! resume invalidates the old token and mints a fresh one. The active
//! map is capped; at the cap, expired sessions are evicted before new
//! creation is refused.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SESSION_CAP: usize = 10_000;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("malformed session token")]
    Malformed,
    #[error("bad token signature")]
    BadSignature,
    #[error("session expired")]
    Expired,
    #[error("unknown session")]
    Unknown,
    #[error("address mismatch")]
    AddressMismatch,
    #[error("session capacity exhausted")]
    CapacityExhausted,
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    name: String,
    connection_id: Uuid,
    ip_hash: String,
    expires_ms: u64,
    nonce: String,
}

/// What a validated resume grants.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResumedSession {
    pub name: String,
    pub connection_id: Uuid,
}

pub struct SessionManager {
    secret: Vec<u8>,
    ttl: Duration,
    cap: usize,
    /// Whether the remote-address hash is enforced on resume. Off by
    /// default: roaming clients legitimately change addresses inside a
    /// TTL.
    enforce_address: bool,
    active: Mutex<HashMap<String, u64>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(secret: Vec<u8>, ttl: Duration, cap: usize, enforce_address: bool) -> Self {
        Self {
            secret,
            ttl,
            cap,
            enforce_address,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token for an authenticated player on a connection.
    /// Refuses once the active map is full of live sessions.
    pub fn mint(
        &self,
        name: &str,
        connection_id: Uuid,
        remote: IpAddr,
    ) -> Result<String, AuthError> {
        let now = now_ms();
        let expires_ms = now + self.ttl.as_millis() as u64;
        let nonce = mk_nonce();

        {
            let mut active = self.active.lock().unwrap();
            if active.len() >= self.cap {
                active.retain(|_, &mut exp| exp > now);
            }
            if active.len() >= self.cap {
                return Err(AuthError::CapacityExhausted);
            }
            active.insert(nonce.clone(), expires_ms);
        }

        let payload = TokenPayload {
            name: name.to_lowercase(),
            connection_id,
            ip_hash: self.ip_hash(remote),
            expires_ms,
            nonce,
        };
        let payload_bytes = serde_json::to_vec(&payload).expect("token payload serializes");
        let sig = self.sign(&payload_bytes);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload_bytes),
            URL_SAFE_NO_PAD.encode(sig)
        ))
    }

    /// Validate a resume token. On success the token is spent: its nonce
    /// leaves the active map and can never validate again.
    pub fn resume(&self, token: &str, remote: IpAddr) -> Result<ResumedSession, AuthError> {
        let Some((payload_b64, sig_b64)) = token.split_once('.') else {
            return Err(AuthError::Malformed);
        };
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(&payload_bytes);
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let payload: TokenPayload =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::Malformed)?;
        if payload.expires_ms <= now_ms() {
            // Expired nonces get cleaned up lazily here and at mint time.
            self.active.lock().unwrap().remove(&payload.nonce);
            return Err(AuthError::Expired);
        }
        if self.enforce_address && payload.ip_hash != self.ip_hash(remote) {
            return Err(AuthError::AddressMismatch);
        }

        // Single use: the nonce must be live, and leaves the map now.
        let mut active = self.active.lock().unwrap();
        if active.remove(&payload.nonce).is_none() {
            return Err(AuthError::Unknown);
        }
        debug!(name = %payload.name, "session resumed");
        Ok(ResumedSession {
            name: payload.name,
            connection_id: payload.connection_id,
        })
    }

    /// Explicitly invalidate a token (clean quit).
    pub fn invalidate(&self, token: &str) {
        let Some((payload_b64, _)) = token.split_once('.') else {
            return;
        };
        let Ok(payload_bytes) = URL_SAFE_NO_PAD.decode(payload_b64) else {
            return;
        };
        let Ok(payload) = serde_json::from_slice::<TokenPayload>(&payload_bytes) else {
            return;
        };
        self.active.lock().unwrap().remove(&payload.nonce);
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// 8 hex chars of a salted address hash; enough to catch a stolen
    /// token crossing networks without storing addresses.
    fn ip_hash(&self, remote: IpAddr) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(remote.to_string().as_bytes());
        let digest = hasher.finalize();
        digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn mk_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager(ttl: Duration) -> SessionManager {
        SessionManager::new(b"test-secret".to_vec(), ttl, 100, false)
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn round_trip_before_expiry() {
        let mgr = manager(Duration::from_secs(60));
        let cid = Uuid::new_v4();
        let token = mgr.mint("Alice", cid, ip()).unwrap();

        let resumed = mgr.resume(&token, ip()).unwrap();
        assert_eq!(resumed.name, "alice");
        assert_eq!(resumed.connection_id, cid);
    }

    #[test]
    fn tokens_are_single_use() {
        let mgr = manager(Duration::from_secs(60));
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();

        mgr.resume(&token, ip()).unwrap();
        assert_eq!(mgr.resume(&token, ip()), Err(AuthError::Unknown));
    }

    #[test]
    fn tampered_tokens_rejected() {
        let mgr = manager(Duration::from_secs(60));
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();

        // Flip a payload byte: base64url of a JSON body starting with
        // a different character.
        let (payload, sig) = token.split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        bytes[10] ^= 1;
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode(&bytes));
        assert_eq!(mgr.resume(&forged, ip()), Err(AuthError::BadSignature));

        assert_eq!(mgr.resume("garbage", ip()), Err(AuthError::Malformed));
        assert_eq!(mgr.resume("a.b", ip()), Err(AuthError::Malformed));
    }

    #[test]
    fn expired_tokens_rejected() {
        let mgr = manager(Duration::from_millis(0));
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.resume(&token, ip()), Err(AuthError::Expired));
    }

    #[test]
    fn invalidation_spends_the_token() {
        let mgr = manager(Duration::from_secs(60));
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();
        mgr.invalidate(&token);
        assert_eq!(mgr.resume(&token, ip()), Err(AuthError::Unknown));
    }

    #[test]
    fn address_enforcement_when_enabled() {
        let mgr = SessionManager::new(b"s".to_vec(), Duration::from_secs(60), 100, true);
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(mgr.resume(&token, other), Err(AuthError::AddressMismatch));
        assert!(mgr.resume(&token, ip()).is_ok());
    }

    #[test]
    fn capacity_evicts_expired_then_refuses() {
        let mgr = SessionManager::new(b"s".to_vec(), Duration::from_millis(1), 2, false);
        mgr.mint("a", Uuid::new_v4(), ip()).unwrap();
        mgr.mint("b", Uuid::new_v4(), ip()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // Full of expired sessions: eviction makes room.
        let long = SessionManager::new(b"s".to_vec(), Duration::from_secs(60), 2, false);
        long.mint("a", Uuid::new_v4(), ip()).unwrap();
        long.mint("b", Uuid::new_v4(), ip()).unwrap();
        assert_eq!(
            long.mint("c", Uuid::new_v4(), ip()),
            Err(AuthError::CapacityExhausted)
        );

        assert!(mgr.mint("c", Uuid::new_v4(), ip()).is_ok());
    }

    #[test]
    fn token_shape_is_two_base64url_parts() {
        let mgr = manager(Duration::from_secs(60));
        let token = mgr.mint("alice", Uuid::new_v4(), ip()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 2);
        let payload = URL_SAFE_NO_PAD.decode(parts[0]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["name"], "alice");
        assert_eq!(json["ip_hash"].as_str().unwrap().len(), 8);
        assert!(json["expires_ms"].as_u64().unwrap() > 0);
    }
}
