//! The backend adapter contract
//!
//! Each OMEMO-version backend implements one namespace atop X3DH and a
//! Double Ratchet. The core drives backends exclusively through this
//! contract; backends never touch storage — every mutation is exposed as a
//! serializable delta (`state`, session blobs) which the core writes
//! through storage only after the whole operation succeeded.
//!
//! Sessions are opaque serialized values keyed by
//! `(bare JID, device id, namespace)`. Backends decode a blob, operate,
//! and hand back the successor blob; the core never inspects one beyond
//! the introspection operations below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_core::{BareJid, DeviceId};
use weft_crypto::IdentityKeyMaterial;

use crate::MAX_ONE_TIME_PRE_KEYS;

/// Which identity-key form a backend consumes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityKeyFormat {
    /// Ed25519 seed required
    Ed,
    /// Curve25519 secret scalar required
    Mont,
    /// Either form accepted (the core supplies the Ed seed)
    Flexible,
}

/// Skipped-message-key limits handed to every backend at load time
#[derive(Clone, Copy, Debug)]
pub struct SkippedKeyLimits {
    /// Maximum skipped keys kept per session
    pub per_session: u32,
    /// Maximum skipped keys accepted from a single message
    pub per_message: u32,
}

/// A published signed pre key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    /// Key id (monotonic per backend)
    pub id: u32,
    /// Curve25519 public key
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    /// Signature over the public key by the identity key
    #[serde(with = "hex::serde")]
    pub signature: [u8; 64],
    /// Rotation timestamp (Unix seconds)
    pub timestamp: i64,
}

/// A published one-time pre key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Key id
    pub id: u32,
    /// Curve25519 public key
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
}

/// A device's published X3DH material.
///
/// The identity key is carried in the backend's published form: Curve25519
/// bytes for `Mont` backends, Ed25519 bytes otherwise. Used one-time pre
/// keys that are retained during catch-up are not listed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bundle {
    /// The backend namespace this bundle belongs to
    pub namespace: String,
    /// Identity public key in the backend's published form
    #[serde(with = "hex::serde")]
    pub identity_key: Vec<u8>,
    /// Current signed pre key
    pub signed_pre_key: SignedPreKeyPublic,
    /// Previous signed pre key, retained one rotation period for delayed
    /// messages
    pub previous_signed_pre_key: Option<SignedPreKeyPublic>,
    /// Unused one-time pre keys (at most 100)
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

impl Bundle {
    /// Whether the one-time pre key count dropped below `threshold`
    pub fn replenishment_due(&self, threshold: usize) -> bool {
        self.one_time_pre_keys.len() < threshold
    }

    /// Structural sanity check on the pre-key count cap
    pub fn within_pre_key_cap(&self) -> bool {
        self.one_time_pre_keys.len() <= MAX_ONE_TIME_PRE_KEYS
    }
}

/// The initial X3DH key-exchange information produced when a session is
/// built actively. Informational to the core: the backend also embeds it in
/// every pre-key message header until the session is confirmed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyExchange(pub Vec<u8>);

/// Per-device output of a backend encrypt operation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedKey {
    /// Backend-opaque header bytes (ratchet public key, counters, and the
    /// key exchange when `pre_key` is set)
    pub header: Vec<u8>,
    /// Ciphertext bytes
    pub ciphertext: Vec<u8>,
    /// Whether this is a pre-key message
    pub pre_key: bool,
}

/// Errors reported by backends
#[derive(Debug, Error)]
pub enum BackendError {
    /// No session blob decodes for this peer
    #[error("No session")]
    NoSession,

    /// The pre-key message re-used an already-consumed one-time pre key
    #[error("Duplicated pre-key message")]
    DuplicatedPreKeyMessage,

    /// The session state is unusable
    #[error("Session broken: {0}")]
    SessionBroken(String),

    /// The downloaded bundle failed verification or parsing
    #[error("Bundle corrupted: {0}")]
    BundleCorrupted(String),

    /// The backend was driven before `load`
    #[error("Backend not loaded")]
    NotLoaded,

    /// Identity-key material was rejected
    #[error("Crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),

    /// Internal backend failure
    #[error("Internal backend error: {0}")]
    Internal(String),
}

/// The adapter each OMEMO-version backend implements.
///
/// All mutating operations update only in-memory state; the core persists
/// `state()` and the returned session blobs after success.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The OMEMO namespace this backend implements
    fn namespace(&self) -> &str;

    /// Which identity-key form this backend consumes
    fn identity_key_format(&self) -> IdentityKeyFormat;

    /// Load previously persisted internal state, or create fresh bundle
    /// material when `state` is `None`. `now` only stamps freshly created
    /// material; restores ignore it. Also used to roll in-memory state
    /// back to the last committed blob after an aborted operation.
    async fn load(
        &self,
        identity: IdentityKeyMaterial,
        state: Option<Vec<u8>>,
        limits: SkippedKeyLimits,
        now: i64,
    ) -> Result<(), BackendError>;

    /// Serializable internal state (own pre-key material, consumed-key
    /// bookkeeping). Persisted by the core after successful operations.
    fn state(&self) -> Result<Vec<u8>, BackendError>;

    /// The current publishable bundle
    fn bundle(&self) -> Result<Bundle, BackendError>;

    /// Rotate the signed pre key. The previous key stays decryptable for
    /// one more rotation period; the one before that is discarded.
    fn rotate_signed_pre_key(&self, now: i64) -> Result<Bundle, BackendError>;

    /// Draw fresh one-time pre keys until the bundle holds 100
    fn replenish_pre_keys(&self) -> Result<Bundle, BackendError>;

    /// Discard one-time pre keys that were consumed but retained for
    /// catch-up replays
    fn delete_used_pre_keys(&self) -> Result<(), BackendError>;

    /// Build a session actively from a downloaded bundle
    async fn build_active_session(
        &self,
        remote_jid: &BareJid,
        remote_device: DeviceId,
        remote_bundle: &Bundle,
    ) -> Result<(Vec<u8>, KeyExchange), BackendError>;

    /// Build a session passively from an incoming pre-key message,
    /// returning the session blob and the embedded initial plaintext
    async fn build_passive_session(
        &self,
        sender_jid: &BareJid,
        sender_device: DeviceId,
        header: &[u8],
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), BackendError>;

    /// Encrypt serialized plaintext for one session, returning the
    /// successor session blob and the per-device message parts
    async fn encrypt(
        &self,
        session: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, EncryptedKey), BackendError>;

    /// Decrypt one message, returning the successor session blob and the
    /// plaintext bytes
    async fn decrypt(
        &self,
        session: &[u8],
        header: &[u8],
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), BackendError>;

    /// Length of our sending chain in this session
    fn sending_chain_length(&self, session: &[u8]) -> Result<u32, BackendError>;

    /// Length of the peer's sending chain as observed from received
    /// headers (staleness introspection)
    fn receiving_chain_length(&self, session: &[u8]) -> Result<u32, BackendError>;

    /// The peer identity key bound to this session, in the backend's
    /// published form
    fn session_identity_key(&self, session: &[u8]) -> Result<Vec<u8>, BackendError>;
}
