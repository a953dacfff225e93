//! Mutual authentication of the two ends of a link.
//!
//! Both sides exchange `HELLO = "PLTR" || version || bundle || nonce`, hash
//! both hellos into a transcript (initiator first) and then exchange
//! `AUTH = sign(transcript_hash || role || credential) || credential`. The
//! role tag keeps a peer from reflecting our own signature back at us. Only
//! the initiator attaches a credential; the responder hands it to its
//! [`Admission`] policy and answers with a one-byte verdict, followed by a
//! reason on rejection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use palantir_crypto::transcript::tags;
use palantir_crypto::{verify_signature, Identity, PeerBundle, PeerId, Transcript, BUNDLE_LEN};
use tracing::{debug, warn};

use crate::admission::{AdmitAll, Admission, Rejection, MAX_CREDENTIAL_LEN};
use crate::error::{LayerError, Origin};
use crate::traits::{ChannelId, Envelope, Layer, LayerEvent, PeerHandle, Route};

pub const HANDSHAKE_MAGIC: &[u8; 4] = b"PLTR";
pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const TRANSCRIPT_DOMAIN: &str = "palantir-handshake-v1";
const NONCE_LEN: usize = 32;
const HELLO_LEN: usize = 4 + 1 + BUNDLE_LEN + NONCE_LEN;
const AUTH_LEN: usize = 64;
const HANDSHAKE_CHANNEL: ChannelId = ChannelId(0);
const VERDICT_REJECT: u8 = 0x00;
const VERDICT_ACCEPT: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn tag(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

struct Hello {
    bundle: PeerBundle,
    raw: Bytes,
}

fn encode_hello(bundle: &PeerBundle) -> Bytes {
    let nonce: [u8; NONCE_LEN] = rand::random();
    let mut out = BytesMut::with_capacity(HELLO_LEN);
    out.extend_from_slice(HANDSHAKE_MAGIC);
    out.put_u8(PROTOCOL_VERSION);
    out.extend_from_slice(&bundle.to_bytes());
    out.extend_from_slice(&nonce);
    out.freeze()
}

fn decode_hello(raw: Bytes) -> Result<Hello, LayerError> {
    if raw.len() != HELLO_LEN {
        return Err(LayerError::handshake(format!("hello has {} bytes", raw.len())));
    }
    if &raw[..4] != HANDSHAKE_MAGIC {
        return Err(LayerError::handshake("bad magic"));
    }
    if raw[4] != PROTOCOL_VERSION {
        return Err(LayerError::handshake(format!("unsupported version {}", raw[4])));
    }
    let bundle = PeerBundle::from_bytes(&raw[5..5 + BUNDLE_LEN])
        .map_err(|e| LayerError::handshake(e.to_string()))?;
    Ok(Hello { bundle, raw })
}

fn auth_message(transcript_hash: &[u8; 32], role: Role, credential: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + 9 + credential.len());
    msg.extend_from_slice(transcript_hash);
    msg.extend_from_slice(role.tag());
    msg.extend_from_slice(credential);
    msg
}

fn encode_auth(signature: &[u8; AUTH_LEN], credential: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(AUTH_LEN + credential.len());
    out.extend_from_slice(signature);
    out.extend_from_slice(credential);
    out.freeze()
}

/// Split an AUTH sent by `sender` into its signature and credential.
fn split_auth(auth: &[u8], sender: Role) -> Result<([u8; AUTH_LEN], &[u8]), LayerError> {
    let max = match sender {
        Role::Initiator => AUTH_LEN + MAX_CREDENTIAL_LEN,
        Role::Responder => AUTH_LEN,
    };
    if auth.len() < AUTH_LEN || auth.len() > max {
        return Err(LayerError::handshake(format!("auth has {} bytes", auth.len())));
    }
    let (sig, credential) = auth.split_at(AUTH_LEN);
    let sig = sig
        .try_into()
        .map_err(|_| LayerError::handshake("auth signature truncated"))?;
    Ok((sig, credential))
}

fn encode_verdict(verdict: &Result<(), Rejection>) -> Bytes {
    match verdict {
        Ok(()) => Bytes::from_static(&[VERDICT_ACCEPT]),
        Err(rejection) => {
            let mut out = BytesMut::with_capacity(1 + rejection.0.len());
            out.put_u8(VERDICT_REJECT);
            out.extend_from_slice(rejection.0.as_bytes());
            out.freeze()
        }
    }
}

fn decode_verdict(raw: &[u8]) -> Result<(), LayerError> {
    match raw.split_first() {
        Some((&VERDICT_ACCEPT, [])) => Ok(()),
        Some((&VERDICT_REJECT, reason)) => Err(LayerError::handshake(format!(
            "rejected by peer: {}",
            String::from_utf8_lossy(reason)
        ))),
        _ => Err(LayerError::handshake("malformed verdict")),
    }
}

/// Layer that authenticates the remote end before passing any traffic.
///
/// Constructing it runs the handshake; afterwards the inbound source
/// [`PeerId::UNBOUND`] is rewritten to the authenticated id and outbound
/// envelopes must name that id.
pub struct HandshakeLayer {
    inner: Box<dyn Layer>,
    remote: PeerHandle,
    announced: AtomicBool,
}

impl HandshakeLayer {
    pub async fn initiate(
        inner: Box<dyn Layer>,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Self, LayerError> {
        Self::initiate_with_credential(inner, identity, timeout, &[]).await
    }

    /// Initiate, presenting `credential` to the responder's admission policy.
    pub async fn initiate_with_credential(
        inner: Box<dyn Layer>,
        identity: &Identity,
        timeout: Duration,
        credential: &[u8],
    ) -> Result<Self, LayerError> {
        let side = Side::Initiator { credential };
        Self::establish(inner, identity, side, timeout).await
    }

    pub async fn respond(
        inner: Box<dyn Layer>,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Self, LayerError> {
        Self::respond_with(inner, identity, timeout, &AdmitAll).await
    }

    /// Respond, admitting the initiator only if `admission` accepts it.
    pub async fn respond_with(
        inner: Box<dyn Layer>,
        identity: &Identity,
        timeout: Duration,
        admission: &dyn Admission,
    ) -> Result<Self, LayerError> {
        let side = Side::Responder { admission };
        Self::establish(inner, identity, side, timeout).await
    }

    async fn establish(
        inner: Box<dyn Layer>,
        identity: &Identity,
        side: Side<'_>,
        timeout: Duration,
    ) -> Result<Self, LayerError> {
        let role = side.role();
        let exchange = exchange(inner.as_ref(), identity, side);
        let outcome = tokio::time::timeout(timeout, exchange).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(LayerError::handshake(format!("timed out after {timeout:?}"))),
        };
        match result {
            Ok(bundle) => {
                let peer_id = bundle.peer_id();
                debug!(peer = %peer_id.short(), ?role, "handshake complete");
                Ok(Self {
                    inner,
                    remote: PeerHandle {
                        peer_id,
                        bundle: Some(bundle),
                        route: Route::Direct,
                    },
                    announced: AtomicBool::new(false),
                })
            }
            Err(err) => {
                warn!(
                    security = err.is_security_relevant(),
                    ?role,
                    error = %err,
                    "handshake failed"
                );
                inner.close().await;
                Err(err)
            }
        }
    }

    /// The authenticated remote peer.
    pub fn remote(&self) -> &PeerHandle {
        &self.remote
    }
}

/// Receive the next handshake frame, skipping link announcements.
async fn recv_frame(inner: &dyn Layer) -> Result<Bytes, LayerError> {
    loop {
        match inner.next_event().await {
            Ok(LayerEvent::Joined(_)) => continue,
            Ok(LayerEvent::Left(_)) => return Err(LayerError::handshake("link lost")),
            Ok(LayerEvent::Message(env)) if env.channel == HANDSHAKE_CHANNEL => {
                return Ok(env.payload)
            }
            Ok(LayerEvent::Message(env)) => {
                return Err(LayerError::handshake(format!(
                    "traffic on channel {} before authentication",
                    env.channel.0
                )))
            }
            // Protocol violations keep their origin; a dropped link just means no handshake.
            Err(err) if err.is_security_relevant() => return Err(err),
            Err(err) => return Err(LayerError::handshake(err.to_string())),
        }
    }
}

async fn send_frame(inner: &dyn Layer, payload: Bytes) -> Result<(), LayerError> {
    inner
        .send(Envelope {
            peer: PeerId::UNBOUND,
            channel: HANDSHAKE_CHANNEL,
            payload,
        })
        .await
        .map_err(|e| LayerError::handshake(e.to_string()))
}

/// What each end brings to the exchange beyond its identity.
#[derive(Clone, Copy)]
enum Side<'a> {
    Initiator { credential: &'a [u8] },
    Responder { admission: &'a dyn Admission },
}

impl Side<'_> {
    fn role(&self) -> Role {
        match self {
            Side::Initiator { .. } => Role::Initiator,
            Side::Responder { .. } => Role::Responder,
        }
    }
}

async fn exchange(
    inner: &dyn Layer,
    identity: &Identity,
    side: Side<'_>,
) -> Result<PeerBundle, LayerError> {
    let role = side.role();
    let credential: &[u8] = match side {
        Side::Initiator { credential } if credential.len() > MAX_CREDENTIAL_LEN => {
            return Err(LayerError::handshake(format!(
                "credential has {} bytes (max: {MAX_CREDENTIAL_LEN})",
                credential.len()
            )));
        }
        Side::Initiator { credential } => credential,
        Side::Responder { .. } => &[],
    };

    let ours = encode_hello(&identity.bundle());
    send_frame(inner, ours.clone()).await?;

    let theirs = decode_hello(recv_frame(inner).await?)?;
    theirs
        .bundle
        .verify()
        .map_err(|e| LayerError::handshake(format!("peer bundle: {e}")))?;

    let (initiator, responder) = match role {
        Role::Initiator => (&ours, &theirs.raw),
        Role::Responder => (&theirs.raw, &ours),
    };
    let mut transcript = Transcript::new(TRANSCRIPT_DOMAIN);
    transcript
        .append_u8(tags::VERSION, PROTOCOL_VERSION)
        .append_bytes(tags::INITIATOR_HELLO, initiator)
        .append_bytes(tags::RESPONDER_HELLO, responder);
    let hash = transcript.hash();

    let sig = identity.sign(&auth_message(&hash, role, credential));
    send_frame(inner, encode_auth(&sig, credential)).await?;

    let auth = recv_frame(inner).await?;
    let (peer_sig, peer_credential) = split_auth(&auth, role.peer())?;
    let signed = auth_message(&hash, role.peer(), peer_credential);
    verify_signature(&theirs.bundle.sign_pub, &signed, &peer_sig)
        .map_err(|_| LayerError::handshake("peer signature invalid"))?;

    match side {
        Side::Responder { admission } => {
            let handle = PeerHandle {
                peer_id: theirs.bundle.peer_id(),
                bundle: Some(theirs.bundle),
                route: Route::Direct,
            };
            let verdict = admission.admit(&handle, peer_credential).await;
            send_frame(inner, encode_verdict(&verdict)).await?;
            verdict.map_err(|r| LayerError::handshake(format!("admission denied: {r}")))?;
        }
        Side::Initiator { .. } => decode_verdict(&recv_frame(inner).await?)?,
    }

    Ok(theirs.bundle)
}

#[async_trait]
impl Layer for HandshakeLayer {
    fn kind(&self) -> Origin {
        Origin::Handshake
    }

    fn inner(&self) -> Option<&dyn Layer> {
        Some(self.inner.as_ref())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        if envelope.peer != self.remote.peer_id {
            return Err(LayerError::unknown_peer(Origin::Handshake, envelope.peer));
        }
        self.inner
            .send(Envelope {
                peer: PeerId::UNBOUND,
                ..envelope
            })
            .await
    }

    async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        if !self.announced.swap(true, Ordering::AcqRel) {
            return Ok(LayerEvent::Joined(self.remote.clone()));
        }
        loop {
            match self.inner.next_event().await? {
                LayerEvent::Message(env) => {
                    return Ok(LayerEvent::Message(Envelope {
                        peer: self.remote.peer_id,
                        ..env
                    }))
                }
                LayerEvent::Left(_) => return Ok(LayerEvent::Left(self.remote.peer_id)),
                LayerEvent::Joined(_) => continue,
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
