//! ==============================================================================
//! push.rs - push-channel connection registry (fan-out layer)
//! ==============================================================================
//!
//! purpose:
//!     tracks live websocket viewers, checks their credential at handshake
//!     time and broadcasts each reading to all of them.
//!
//! model:
//!     every connection is represented by the sending half of a small bounded
//!     channel (its "outbox"). a writer task owned by the websocket session
//!     (server.rs) drains the outbox into the socket. broadcast only ever
//!     touches outboxes, each with its own timeout, so a stuck viewer costs at
//!     most `send_timeout` and never holds up the others.
//!
//!     ┌──────────────┐  frame   ┌─────────┐   ┌──────────────┐
//!     │  broadcast   │ ───────> │ outbox  │ ─>│ writer task  │ ─> socket
//!     │ (pump task)  │ ───────> │ outbox  │ ─>│ writer task  │ ─> socket
//!     └──────────────┘          └─────────┘   └──────────────┘
//!
//!     a failed outbox send (receiver gone, or full past the timeout) drops
//!     that connection from the live set inside the same broadcast call.
//!
//! relationships:
//!     - used by: handoff.rs (broadcast), server.rs (handshake, register, unregister)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DeliveryFailure, DeliveryFailureReason, HandshakeRejected};
use crate::telemetry::Reading;

pub type ConnectionId = u64;

/// serialized frame shared by every outbox in one broadcast
pub type Frame = Arc<str>;

pub type Outbox = mpsc::Sender<Frame>;

// ==============================================================================
// wire format
// ==============================================================================

/// server -> client payload, one per reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub dev_eui: String,
    /// epoch seconds
    pub timestamp: i64,
    pub raw_value: u64,
    pub moisture_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub longitude: Option<f64>,
}

impl From<&Reading> for PushFrame {
    fn from(r: &Reading) -> Self {
        Self {
            dev_eui: r.device_id.clone(),
            timestamp: r.observed_at.timestamp(),
            raw_value: r.raw_value,
            moisture_pct: r.moisture_pct,
            latitude: r.latitude,
            longitude: r.longitude,
        }
    }
}

// ==============================================================================
// handshake
// ==============================================================================

/// verifies a bearer identity token. black box to the registry.
pub trait IdentityVerifier: Send + Sync {
    /// returns the viewer identity on success
    fn verify(&self, token: &str) -> Result<String, HandshakeRejected>;
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: Option<String>,
    email: Option<String>,
}

/// HS256 jwt with a `sub` or `email` claim
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, HandshakeRejected> {
        let data = jsonwebtoken::decode::<IdentityClaims>(token, &self.key, &self.validation)
            .map_err(|e| HandshakeRejected::InvalidIdentity(e.to_string()))?;
        data.claims
            .email
            .or(data.claims.sub)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HandshakeRejected::InvalidIdentity("token names no identity".into()))
    }
}

/// how a viewer proves it may receive readings
pub enum Authenticator {
    /// offered subprotocol must equal the configured key
    SharedSecret(String),
    /// offered subprotocol is a bearer token checked by the verifier
    IdentityToken(Arc<dyn IdentityVerifier>),
}

/// successful handshake. `protocol` is echoed back on the upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub protocol: String,
    pub identity: Option<String>,
}

impl Authenticator {
    /// `offered` is the client's Sec-WebSocket-Protocol list, in order
    pub fn authenticate<'a, I>(&self, offered: I) -> Result<Grant, HandshakeRejected>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut offered = offered
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .peekable();
        if offered.peek().is_none() {
            return Err(HandshakeRejected::MissingCredential);
        }

        match self {
            Authenticator::SharedSecret(secret) => offered
                .find(|p| *p == secret.as_str())
                .map(|p| Grant {
                    protocol: p.to_string(),
                    identity: None,
                })
                .ok_or(HandshakeRejected::BadCredential),
            Authenticator::IdentityToken(verifier) => {
                let mut last_err = HandshakeRejected::BadCredential;
                for token in offered {
                    match verifier.verify(token) {
                        Ok(identity) => {
                            return Ok(Grant {
                                protocol: token.to_string(),
                                identity: Some(identity),
                            })
                        }
                        Err(e) => last_err = e,
                    }
                }
                Err(last_err)
            }
        }
    }
}

/// splits a raw Sec-WebSocket-Protocol header value
pub fn offered_protocols(header: Option<&str>) -> Vec<&str> {
    header
        .map(|h| h.split(',').map(str::trim).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}

// ==============================================================================
// registry
// ==============================================================================

pub struct Connection {
    pub id: ConnectionId,
    pub identity: Option<String>,
    pub authenticated: bool,
    outbox: Outbox,
}

/// outcome of one broadcast call
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

pub struct ConnectionRegistry {
    authenticator: Authenticator,
    send_timeout: Duration,
    live: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(authenticator: Authenticator, send_timeout: Duration) -> Self {
        Self {
            authenticator,
            send_timeout,
            live: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// handshake check without touching the live set
    pub fn authenticate<'a, I>(&self, offered: I) -> Result<Grant, HandshakeRejected>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.authenticator.authenticate(offered)
    }

    /// promotes an accepted upgrade into the live set
    pub fn admit(&self, grant: Grant, outbox: Outbox) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut live = self.live.lock();
        live.push(Connection {
            id,
            identity: grant.identity,
            authenticated: true,
            outbox,
        });
        info!(connection = id, total = live.len(), "push client connected");
        id
    }

    /// handshake + admit in one step
    pub fn register<'a, I>(&self, offered: I, outbox: Outbox) -> Result<ConnectionId, HandshakeRejected>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let grant = self.authenticate(offered)?;
        Ok(self.admit(grant, outbox))
    }

    /// no-op if the connection is already gone
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|c| c.id != id);
        let removed = live.len() != before;
        if removed {
            info!(connection = id, total = live.len(), "push client disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.live.lock().iter().any(|c| c.id == id)
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// sends `reading` to every authenticated connection and prunes the ones that fail
    pub async fn broadcast(&self, reading: &Reading) -> BroadcastReport {
        let frame: Frame = match serde_json::to_string(&PushFrame::from(reading)) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(device = %reading.device_id, "failed to serialize push frame: {}", e);
                return BroadcastReport::default();
            }
        };

        // snapshot, so no lock is held across an await
        let targets: Vec<(ConnectionId, Outbox)> = self
            .live
            .lock()
            .iter()
            .filter(|c| c.authenticated)
            .map(|c| (c.id, c.outbox.clone()))
            .collect();

        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let send_timeout = self.send_timeout;
        let attempts = targets.into_iter().map(|(id, outbox)| {
            let frame = frame.clone();
            async move {
                match tokio::time::timeout(send_timeout, outbox.send(frame)).await {
                    Ok(Ok(())) => Ok(id),
                    Ok(Err(_)) => Err(DeliveryFailure {
                        connection_id: id,
                        reason: DeliveryFailureReason::Closed,
                    }),
                    Err(_) => Err(DeliveryFailure {
                        connection_id: id,
                        reason: DeliveryFailureReason::TimedOut,
                    }),
                }
            }
        });

        let mut report = BroadcastReport::default();
        for result in join_all(attempts).await {
            match result {
                Ok(_) => report.delivered += 1,
                Err(failure) => {
                    debug!("{}", failure);
                    report.failures.push(failure);
                }
            }
        }

        if !report.failures.is_empty() {
            let mut live = self.live.lock();
            live.retain(|c| !report.failures.iter().any(|f| f.connection_id == c.id));
            warn!(
                pruned = report.failures.len(),
                remaining = live.len(),
                "dropped unreachable push clients"
            );
        }

        report
    }
}
