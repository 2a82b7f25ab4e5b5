//! Stateless signed session tokens plus the set of currently active users.
//!
//! A token is `<user_id>.<issued_ms>.<signature>`, where the signature is the
//! lowercase hex HMAC-SHA256 of `<user_id>.<issued_ms>` under the server
//! secret. Logged-out tokens are remembered until they would have expired.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Tokens older than this are rejected, in milliseconds (7 days).
pub const SESSION_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

const EVENT_CAPACITY: usize = 64;

/// Session-changed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn { user_id: Uuid },
    SignedOut { user_id: Uuid },
}

/// Stable user id for an email address, case-insensitive.
///
/// Returns `None` unless the address has a non-empty local part and domain.
pub fn user_id_for_email(email: &str) -> Option<Uuid> {
    let email = email.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{email}").as_bytes()))
}

#[derive(Clone)]
pub struct Sessions {
    inner: Arc<Inner>,
}

struct Inner {
    secret: Vec<u8>,
    state: RwLock<State>,
    events: broadcast::Sender<AuthEvent>,
}

/// Raw HMAC bytes of a token. Revocation and session tracking key on these,
/// so differently spelled copies of one token are the same session.
type Signature = Vec<u8>;

#[derive(Default)]
struct State {
    /// signature → issued_ms of logged-out tokens
    revoked: HashMap<Signature, i64>,
    /// user → signature → issued_ms of tokens that have not been logged out
    live: HashMap<Uuid, HashMap<Signature, i64>>,
}

impl State {
    fn has_live_session(&self, user_id: Uuid, now_ms: i64) -> bool {
        self.live
            .get(&user_id)
            .is_some_and(|tokens| tokens.values().any(|&issued| now_ms - issued <= SESSION_TTL_MS))
    }
}

struct Claims {
    user_id: Uuid,
    issued_ms: i64,
    signature: Signature,
}

impl Sessions {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                secret: secret.into(),
                state: RwLock::new(State::default()),
                events,
            }),
        }
    }

    /// Issue a token for `user_id` and mark the user active.
    pub async fn sign_in(&self, user_id: Uuid) -> String {
        self.sign_in_at(user_id, Utc::now().timestamp_millis()).await
    }

    async fn sign_in_at(&self, user_id: Uuid, issued_ms: i64) -> String {
        let signature = sign(&self.inner.secret, user_id, issued_ms);
        let token = format!("{user_id}.{issued_ms}.{}", hex::encode(&signature));
        self.activate(Claims { user_id, issued_ms, signature }).await;
        info!(user_id = %user_id, "auth: signed in");
        token
    }

    /// Revoke `token`. Its user stays active while another of their tokens is
    /// still live. `None` if the token is invalid.
    pub async fn sign_out(&self, token: &str) -> Option<Uuid> {
        let now_ms = Utc::now().timestamp_millis();
        let claims = self.check(token, now_ms).await?;
        let user_id = claims.user_id;

        let mut state = self.inner.state.write().await;
        state.revoked.retain(|_, issued| now_ms - *issued <= SESSION_TTL_MS);
        if let Some(tokens) = state.live.get_mut(&user_id) {
            tokens.remove(&claims.signature);
            tokens.retain(|_, issued| now_ms - *issued <= SESSION_TTL_MS);
        }
        state.revoked.insert(claims.signature, claims.issued_ms);
        let deactivated = !state.has_live_session(user_id, now_ms);
        if deactivated {
            state.live.remove(&user_id);
        }
        drop(state);

        if deactivated {
            let _ = self.inner.events.send(AuthEvent::SignedOut { user_id });
        }
        info!(user_id = %user_id, deactivated, "auth: signed out");
        Some(user_id)
    }

    /// The user a token belongs to, if it is authentic, unexpired and not revoked.
    pub async fn verify(&self, token: &str) -> Option<Uuid> {
        self.check(token, Utc::now().timestamp_millis())
            .await
            .map(|c| c.user_id)
    }

    /// [`verify`](Self::verify), re-activating the user on success.
    pub async fn authenticate(&self, token: &str) -> Option<Uuid> {
        let claims = self.check(token, Utc::now().timestamp_millis()).await?;
        let user_id = claims.user_id;
        self.activate(claims).await;
        Some(user_id)
    }

    /// Users holding at least one live, unexpired session.
    pub async fn active_users(&self) -> Vec<Uuid> {
        let now_ms = Utc::now().timestamp_millis();
        let state = self.inner.state.read().await;
        let mut users: Vec<Uuid> = state
            .live
            .keys()
            .copied()
            .filter(|&u| state.has_live_session(u, now_ms))
            .collect();
        users.sort();
        users
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    async fn activate(&self, claims: Claims) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.inner.state.write().await;
        let newly_active = !state.has_live_session(claims.user_id, now_ms);
        state
            .live
            .entry(claims.user_id)
            .or_default()
            .insert(claims.signature, claims.issued_ms);
        drop(state);

        if newly_active {
            let _ = self
                .inner
                .events
                .send(AuthEvent::SignedIn { user_id: claims.user_id });
        }
    }

    async fn check(&self, token: &str, now_ms: i64) -> Option<Claims> {
        let claims = parse_and_verify(&self.inner.secret, token)?;
        if now_ms - claims.issued_ms > SESSION_TTL_MS {
            debug!(user_id = %claims.user_id, "auth: token expired");
            return None;
        }
        if self.inner.state.read().await.revoked.contains_key(&claims.signature) {
            debug!(user_id = %claims.user_id, "auth: token revoked");
            return None;
        }
        Some(claims)
    }
}

fn mac_for(secret: &[u8], user_id: Uuid, issued_ms: i64) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(format!("{user_id}.{issued_ms}").as_bytes());
    mac
}

fn sign(secret: &[u8], user_id: Uuid, issued_ms: i64) -> Signature {
    mac_for(secret, user_id, issued_ms).finalize().into_bytes().to_vec()
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Parse a token and check its signature. Only the exact form that
/// [`Sessions::sign_in`] issues is accepted.
fn parse_and_verify(secret: &[u8], token: &str) -> Option<Claims> {
    let mut parts = token.trim().splitn(3, '.');
    let (user_part, issued_part, signature) = (parts.next()?, parts.next()?, parts.next()?);

    let user_id: Uuid = user_part.parse().ok()?;
    let issued_ms: i64 = issued_part.parse().ok()?;
    if user_part != user_id.to_string()
        || issued_part != issued_ms.to_string()
        || !is_lower_hex(signature)
    {
        return None;
    }

    let raw = hex::decode(signature).ok()?;
    mac_for(secret, user_id, issued_ms).verify_slice(&raw).ok()?;

    Some(Claims { user_id, issued_ms, signature: raw })
}
