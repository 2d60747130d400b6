//! Key agreement for a session using Elliptic Curve Diffie-Hellman (X25519).
//!
//! Three messages establish the keys:
//!
//! 1. client -> server `ConnectionRequest`: version, public key, nonce,
//!    timestamp
//! 2. server -> client `HandshakeResponse`: public key, nonce, SHA-256 of the
//!    client nonce
//! 3. client -> server `HandshakeConfirm`: SHA-256 of the server nonce
//!
//! Both sides then hash the shared secret with both nonces into one key per
//! direction. Requests with a stale or future timestamp, or a (peer, nonce,
//! timestamp) already seen, are refused.
//!
//! Handshake state is per session and owned by the session; nothing here is
//! global except the replay cache passed in by the caller.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroize;

use crate::core::packet::{ConnectionRequest, HandshakeResponse};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{SessionKey, SessionKeys};
use crate::utils::replay_cache::ReplayCache;

use tracing::{debug, instrument};

/// Oldest acceptable `ConnectionRequest` timestamp, in seconds
pub const TIMESTAMP_MAX_AGE_SECS: u64 = 30;

/// Allowed clock skew for timestamps from the future, in milliseconds
const FUTURE_TOLERANCE_MS: u64 = 2000;

/// Client-side state between sending the request and receiving the response
pub struct ClientHandshake {
    secret: Option<EphemeralSecret>,
    client_nonce: [u8; 16],
}

impl Drop for ClientHandshake {
    fn drop(&mut self) {
        self.client_nonce.zeroize();
    }
}

/// Server-side state between sending the response and receiving the confirm
pub struct ServerHandshake {
    secret: Option<EphemeralSecret>,
    client_public: [u8; 32],
    client_nonce: [u8; 16],
    server_nonce: [u8; 16],
}

impl Drop for ServerHandshake {
    fn drop(&mut self) {
        self.client_public.zeroize();
        self.client_nonce.zeroize();
        self.server_nonce.zeroize();
    }
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake").finish_non_exhaustive()
    }
}

/// Get the current timestamp in milliseconds
fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify that a timestamp is recent enough
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };

    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }
    if current > timestamp && current - timestamp > max_age_seconds * 1000 {
        return false;
    }
    true
}

fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

fn derive_directional_key(
    shared_secret: &SharedSecret,
    client_nonce: &[u8],
    server_nonce: &[u8],
    direction: &[u8],
) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    hasher.update(direction);
    SessionKey::from_bytes(hasher.finalize().into())
}

/// Returns (client-to-server, server-to-client) keys
fn derive_keys(
    shared_secret: &SharedSecret,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> (SessionKey, SessionKey) {
    (
        derive_directional_key(shared_secret, client_nonce, server_nonce, b"c2s"),
        derive_directional_key(shared_secret, client_nonce, server_nonce, b"s2c"),
    )
}

/// Start a handshake: fresh key pair, nonce and timestamp
#[instrument]
pub fn client_init(protocol_version: u32) -> Result<(ClientHandshake, ConnectionRequest)> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let nonce = generate_nonce();
    let timestamp = current_timestamp()?;

    debug!("Client initiating handshake");

    Ok((
        ClientHandshake {
            secret: Some(secret),
            client_nonce: nonce,
        },
        ConnectionRequest {
            protocol_version,
            pub_key: public.to_bytes(),
            nonce,
            timestamp,
        },
    ))
}

/// Answer a `ConnectionRequest` whose version has already been accepted
#[instrument(skip(request, replay_cache))]
pub fn server_respond(
    request: &ConnectionRequest,
    peer: SocketAddr,
    replay_cache: &mut ReplayCache,
) -> Result<(ServerHandshake, HandshakeResponse)> {
    if !verify_timestamp(request.timestamp, TIMESTAMP_MAX_AGE_SECS) {
        return Err(ProtocolError::HandshakeFailed(
            constants::ERR_INVALID_TIMESTAMP.into(),
        ));
    }
    if replay_cache.is_replay(peer, &request.nonce, request.timestamp) {
        return Err(ProtocolError::HandshakeFailed(
            constants::ERR_REPLAY_ATTACK.into(),
        ));
    }

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let server_nonce = generate_nonce();

    debug!("Server responding to handshake");

    Ok((
        ServerHandshake {
            secret: Some(secret),
            client_public: request.pub_key,
            client_nonce: request.nonce,
            server_nonce,
        },
        HandshakeResponse {
            pub_key: public.to_bytes(),
            nonce: server_nonce,
            nonce_verification: hash_nonce(&request.nonce),
        },
    ))
}

impl ClientHandshake {
    /// Check the server's proof, derive keys and produce the confirm hash.
    ///
    /// The returned keys are oriented for the client (outbound = c2s).
    #[instrument(skip_all)]
    pub fn verify(mut self, response: &HandshakeResponse) -> Result<(SessionKeys, [u8; 32])> {
        if hash_nonce(&self.client_nonce) != response.nonce_verification {
            return Err(ProtocolError::HandshakeFailed(
                constants::ERR_NONCE_VERIFICATION_FAILED.into(),
            ));
        }
        let secret = self.secret.take().ok_or_else(|| {
            ProtocolError::HandshakeFailed(constants::ERR_CLIENT_SECRET_NOT_FOUND.into())
        })?;

        let shared = secret.diffie_hellman(&PublicKey::from(response.pub_key));
        let (c2s, s2c) = derive_keys(&shared, &self.client_nonce, &response.nonce);

        debug!("Client verified server response");

        Ok((
            SessionKeys {
                inbound: s2c,
                outbound: c2s,
            },
            hash_nonce(&response.nonce),
        ))
    }
}

impl ServerHandshake {
    /// Check the client's confirm hash and derive keys oriented for the server
    #[instrument(skip_all)]
    pub fn finalize(mut self, nonce_verification: [u8; 32]) -> Result<SessionKeys> {
        if hash_nonce(&self.server_nonce) != nonce_verification {
            return Err(ProtocolError::HandshakeFailed(
                constants::ERR_SERVER_VERIFICATION_FAILED.into(),
            ));
        }
        let secret = self.secret.take().ok_or_else(|| {
            ProtocolError::HandshakeFailed(constants::ERR_SERVER_SECRET_NOT_FOUND.into())
        })?;

        let shared = secret.diffie_hellman(&PublicKey::from(self.client_public));
        let (c2s, s2c) = derive_keys(&shared, &self.client_nonce, &self.server_nonce);

        debug!("Server finalized handshake");

        Ok(SessionKeys {
            inbound: c2s,
            outbound: s2c,
        })
    }
}
