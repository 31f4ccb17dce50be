//! The top-level session manager
//!
//! Owns all process-wide state: the identity key, loaded backends, device
//! lists, trust, bundle lifecycles, the catch-up flag, and the pending
//! response queues. All public operations are async and serialize per bare
//! JID; no operation returns a plaintext or ciphertext whose state change
//! has not been committed to storage.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use weft_core::{BareJid, DeviceId, KeyValueStore};
use weft_crypto::{
    ed_public_to_mont, IdentityKeyMaterial, IdentityKeyPair, MontIdentityKey, StoredIdentityKey,
};

use crate::backend::{
    Backend, BackendError, Bundle, EncryptedKey, IdentityKeyFormat, SkippedKeyLimits,
};
use crate::bundle::BundleLifecycle;
use crate::callbacks::{AnnouncedDevice, AppCallbacks};
use crate::catchup::CatchUpState;
use crate::config::{ManagerConfig, UndecidedPolicy};
use crate::devices::{DeviceRecord, DeviceRegistry};
use crate::error::{DeviceFailure, FailedDevice, OmemoError, Result};
use crate::stale::{is_stale, PendingResponse, ResponseQueue};
use crate::store::StoreFacade;
use crate::trust::{TrustEngine, TrustLevel};

/// The application's plaintext type.
///
/// Backends operate on bytes; this trait supplies the per-namespace
/// serialization the application and its backends agreed on (one backend
/// may expect stanzas, another raw text).
pub trait Payload: Send + Sync + Sized {
    /// Serialize for the given backend namespace
    fn encode(&self, namespace: &str) -> Vec<u8>;

    /// Deserialize bytes produced under the given backend namespace
    fn decode(namespace: &str, bytes: &[u8]) -> std::result::Result<Self, PayloadError>;
}

/// A plaintext (de)serialization failure
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

impl Payload for Vec<u8> {
    fn encode(&self, _namespace: &str) -> Vec<u8> {
        self.clone()
    }

    fn decode(_namespace: &str, bytes: &[u8]) -> std::result::Result<Self, PayloadError> {
        Ok(bytes.to_vec())
    }
}

impl Payload for String {
    fn encode(&self, _namespace: &str) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(_namespace: &str, bytes: &[u8]) -> std::result::Result<Self, PayloadError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| PayloadError(e.to_string()))
    }
}

/// One per-device entry of an encryption fan-out
#[derive(Clone, Debug)]
pub struct DeviceKey {
    /// Recipient bare JID
    pub jid: BareJid,
    /// Recipient device id
    pub device_id: DeviceId,
    /// Header, ciphertext, and pre-key flag for this device
    pub key: EncryptedKey,
}

/// The result of an encryption fan-out. The core does not transmit it.
#[derive(Clone, Debug, Default)]
pub struct EncryptedMessage {
    /// Per-device entries grouped by backend namespace
    pub payloads: BTreeMap<String, Vec<DeviceKey>>,
    /// Devices dropped from the fan-out, with reasons
    pub failures: Vec<FailedDevice>,
    /// Devices silently skipped because their identity key is distrusted
    pub skipped_distrusted: Vec<(BareJid, DeviceId)>,
}

impl EncryptedMessage {
    /// Total number of successful per-device entries
    pub fn device_count(&self) -> usize {
        self.payloads.values().map(Vec::len).sum()
    }
}

/// An incoming wire message routed to the core for decryption
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// Backend namespace (from the message type)
    pub namespace: String,
    /// Sender bare JID
    pub sender: BareJid,
    /// Sender device id
    pub sender_device: DeviceId,
    /// The header addressed to this device
    pub header: Vec<u8>,
    /// The ciphertext addressed to this device
    pub ciphertext: Vec<u8>,
    /// Whether this is a pre-key message
    pub pre_key: bool,
}

/// A successful decryption
#[derive(Clone, Debug)]
pub struct DecryptedMessage<P> {
    /// The decoded plaintext
    pub payload: P,
    /// Sender bare JID
    pub sender: BareJid,
    /// Sender device id
    pub sender_device: DeviceId,
    /// Set when the sender's trust is undecided and the configuration
    /// allows flagged decryption
    pub from_undecided: bool,
}

/// One row of a bulk device-information query
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// The device's bare JID
    pub jid: BareJid,
    /// The device id
    pub device_id: DeviceId,
    /// Advertised label
    pub label: Option<String>,
    /// Whether any backend currently lists the device
    pub active: bool,
    /// Namespaces currently advertising the device
    pub namespaces: Vec<String>,
    /// Identity-key fingerprint (hex of the Curve25519 form), once known
    pub fingerprint: Option<String>,
    /// Stored custom trust label, once an identity key is known
    pub trust_label: Option<String>,
    /// Translated core trust level
    pub trust: TrustLevel,
    /// Whether this row describes the local device
    pub is_this_device: bool,
}

/// The identity key in whichever form this installation holds
enum OwnIdentity {
    /// Seed-based pair; every key form derivable
    Full(IdentityKeyPair),
    /// Historical Curve25519-only key
    MontOnly(MontIdentityKey),
}

impl OwnIdentity {
    fn fingerprint(&self) -> String {
        match self {
            OwnIdentity::Full(pair) => pair.fingerprint(),
            OwnIdentity::MontOnly(key) => key.fingerprint(),
        }
    }

    fn mont_public_bytes(&self) -> [u8; 32] {
        match self {
            OwnIdentity::Full(pair) => pair.mont_public_bytes(),
            OwnIdentity::MontOnly(key) => key.mont_public_bytes(),
        }
    }

    fn material_for(
        &self,
        format: IdentityKeyFormat,
        namespace: &str,
    ) -> Result<IdentityKeyMaterial> {
        match (self, format) {
            (OwnIdentity::Full(pair), IdentityKeyFormat::Mont) => Ok(pair.material_mont()),
            (OwnIdentity::Full(pair), _) => Ok(pair.material_ed()),
            (OwnIdentity::MontOnly(key), IdentityKeyFormat::Mont)
            | (OwnIdentity::MontOnly(key), IdentityKeyFormat::Flexible) => {
                Ok(key.material_mont())
            }
            (OwnIdentity::MontOnly(_), IdentityKeyFormat::Ed) => {
                Err(OmemoError::IdentityKeyFormatIncompatible {
                    namespace: namespace.to_string(),
                })
            }
        }
    }
}

/// Where a fan-out device's session comes from
enum SessionSource {
    /// An established session loaded from storage
    Existing(Vec<u8>),
    /// A downloaded bundle; the session is built on demand
    Bundle(Bundle),
}

/// One device picked up by the encryption fan-out
struct Selection {
    record: DeviceRecord,
    namespace: String,
    source: SessionSource,
    identity_key: Vec<u8>,
}

const STALE_QUEUE: &str = "stale-responses";
const COMPLETION_QUEUE: &str = "pending-completions";

fn commit_err(e: impl std::fmt::Display) -> OmemoError {
    OmemoError::StorageCommitFailed(e.to_string())
}

/// The single owner of all process-wide OMEMO state
pub struct SessionManager<P: Payload> {
    own_jid: BareJid,
    own_device_id: DeviceId,
    config: ManagerConfig,
    rotation_period_secs: i64,
    identity: OwnIdentity,
    identity_regenerated: bool,
    backends: Vec<Arc<dyn Backend>>,
    store: StoreFacade,
    callbacks: Arc<dyn AppCallbacks>,
    registry: DeviceRegistry,
    trust: TrustEngine,
    catch_up: CatchUpState,
    stale_queue: ResponseQueue,
    completion_queue: ResponseQueue,
    own_label: RwLock<Option<String>>,
    jid_locks: parking_lot::Mutex<HashMap<BareJid, Arc<tokio::sync::Mutex<()>>>>,
    _payload: PhantomData<fn(P) -> P>,
}

impl<P: Payload> SessionManager<P> {
    /// Create or load the session manager.
    ///
    /// `backends` order defines the implicit encryption priority. On a
    /// historical installation whose identity key exists only in
    /// Curve25519 form, loading a backend that requires the Ed25519 form
    /// discards the old key, regenerates, reloads every backend from
    /// scratch, and purges the own account's trust entries; the outcome is
    /// reported through [`SessionManager::identity_regenerated`].
    pub async fn create(
        own_jid: BareJid,
        backends: Vec<Arc<dyn Backend>>,
        storage: Arc<dyn KeyValueStore>,
        callbacks: Arc<dyn AppCallbacks>,
        config: ManagerConfig,
        now: i64,
    ) -> Result<Self> {
        config.validate()?;
        if backends.is_empty() {
            return Err(OmemoError::Config(
                "at least one backend is required".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for backend in &backends {
            if !seen.insert(backend.namespace().to_string()) {
                return Err(OmemoError::Config(format!(
                    "duplicate backend namespace: {}",
                    backend.namespace()
                )));
            }
        }

        let store = StoreFacade::new(storage);
        let registry = DeviceRegistry::new(store.clone(), own_jid.clone());

        let needs_ed = backends
            .iter()
            .any(|b| b.identity_key_format() == IdentityKeyFormat::Ed);
        let (identity, identity_regenerated) = match store.load_identity().await? {
            None => {
                let pair = IdentityKeyPair::generate();
                store.store_identity(&pair.to_stored()).await?;
                info!("generated fresh identity key");
                (OwnIdentity::Full(pair), false)
            }
            Some(StoredIdentityKey::Seed { seed }) => {
                (OwnIdentity::Full(IdentityKeyPair::from_seed(seed)), false)
            }
            Some(StoredIdentityKey::MontScalar { scalar }) => {
                if needs_ed {
                    warn!(
                        "stored identity key is Curve25519-only but a loaded backend \
                         requires the Ed25519 form; regenerating (trust decisions for \
                         the own account are reset)"
                    );
                    let pair = IdentityKeyPair::generate();
                    store.store_identity(&pair.to_stored()).await?;
                    store.purge_trust(&own_jid).await?;
                    (OwnIdentity::Full(pair), true)
                } else {
                    (
                        OwnIdentity::MontOnly(MontIdentityKey::from_scalar(scalar)),
                        false,
                    )
                }
            }
        };

        let rotation_period_secs = match store.load_rotation_period().await? {
            Some(secs) => secs,
            None => {
                let secs = config.rotation_period_or_sample();
                store.store_rotation_period(secs).await?;
                secs
            }
        };

        let own_device_id = match store.load_own_device_id().await? {
            Some(id) => id,
            None => {
                let taken = registry.own_cached_ids().await?;
                let id = loop {
                    let candidate =
                        DeviceId::new(rand::thread_rng().gen_range(1..=0x7FFF_FFFFu32));
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                };
                store.store_own_device_id(id).await?;
                info!(device_id = %id, "generated own device id");
                id
            }
        };

        let limits = SkippedKeyLimits {
            per_session: config.max_skipped_message_keys_per_session,
            per_message: config.skipped_keys_per_message(),
        };

        for backend in &backends {
            let ns = backend.namespace().to_string();
            let material = identity.material_for(backend.identity_key_format(), &ns)?;
            let state = if identity_regenerated {
                None
            } else {
                store.load_backend_state(&ns).await?
            };
            backend.load(material, state, limits, now).await?;
            store.store_backend_state(&ns, backend.state()?).await?;

            let lifecycle = if identity_regenerated {
                BundleLifecycle::fresh(now)
            } else {
                store
                    .load_lifecycle(&ns)
                    .await?
                    .unwrap_or_else(|| BundleLifecycle::fresh(now))
            };
            store.store_lifecycle(&ns, &lifecycle).await?;
        }

        let own_label = match store.load_own_label().await? {
            Some(label) if !label.is_empty() => Some(label),
            Some(_) => None,
            None => config.own_device_label.clone(),
        };

        let identity_pub = identity.mont_public_bytes();
        registry
            .ensure_own_device(
                own_device_id,
                own_label.clone(),
                &identity_pub,
                backends.iter().map(|b| b.namespace().to_string()),
            )
            .await?;

        let trust = TrustEngine::new(
            store.clone(),
            callbacks.clone(),
            config.default_trust_level.clone(),
        );

        Ok(Self {
            own_jid,
            own_device_id,
            config,
            rotation_period_secs,
            identity,
            identity_regenerated,
            backends,
            store: store.clone(),
            callbacks,
            registry,
            trust,
            catch_up: CatchUpState::new(),
            stale_queue: ResponseQueue::new(store.clone(), STALE_QUEUE),
            completion_queue: ResponseQueue::new(store, COMPLETION_QUEUE),
            own_label: RwLock::new(own_label),
            jid_locks: parking_lot::Mutex::new(HashMap::new()),
            _payload: PhantomData,
        })
    }

    /// Whether loading discarded a historical Curve25519-only identity key
    /// and regenerated a fresh Ed25519 seed
    pub fn identity_regenerated(&self) -> bool {
        self.identity_regenerated
    }

    /// The own bare JID
    pub fn own_jid(&self) -> &BareJid {
        &self.own_jid
    }

    /// The own device id
    pub fn own_device_id(&self) -> DeviceId {
        self.own_device_id
    }

    /// Fingerprint of the own identity key (hex of the Curve25519 form)
    pub fn own_fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Whether catch-up mode is currently active
    pub fn catch_up_active(&self) -> bool {
        self.catch_up.is_active()
    }

    // ── Per-JID serialization ────────────────────────────────────────────

    fn lock_for(&self, jid: &BareJid) -> Arc<tokio::sync::Mutex<()>> {
        self.jid_locks
            .lock()
            .entry(jid.clone())
            .or_default()
            .clone()
    }

    /// Acquire guards for a set of JIDs in a global order
    async fn guards_for(&self, jids: &[BareJid]) -> Vec<OwnedMutexGuard<()>> {
        let mut unique: Vec<BareJid> = jids.to_vec();
        unique.sort();
        unique.dedup();

        let mut guards = Vec::with_capacity(unique.len());
        for jid in unique {
            let lock = self.lock_for(&jid);
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    // ── Backend helpers ──────────────────────────────────────────────────

    fn backend_by_namespace(&self, namespace: &str) -> Result<&Arc<dyn Backend>> {
        self.backends
            .iter()
            .find(|b| b.namespace() == namespace)
            .ok_or_else(|| OmemoError::UnknownNamespace(namespace.to_string()))
    }

    /// Normalize a backend-form identity key to Curve25519 bytes
    fn normalize_identity(format: IdentityKeyFormat, bytes: &[u8]) -> Result<Vec<u8>> {
        match format {
            IdentityKeyFormat::Mont => Ok(bytes.to_vec()),
            IdentityKeyFormat::Ed | IdentityKeyFormat::Flexible => {
                let ed: [u8; 32] = bytes.try_into().map_err(|_| {
                    OmemoError::Crypto(weft_crypto::CryptoError::MalformedKeyMaterial(
                        "identity key is not 32 bytes".to_string(),
                    ))
                })?;
                Ok(ed_public_to_mont(&ed)?.to_vec())
            }
        }
    }

    // ── Encryption fan-out ───────────────────────────────────────────────

    /// Encrypt `payload` for every active device of `recipients` plus the
    /// own account's other devices.
    ///
    /// Per-device failures (missing bundles, broken sessions, no eligible
    /// backend) are bucketed into the result; distrusted devices are
    /// silently skipped; any device with undecided trust fails the whole
    /// call with [`OmemoError::StillUndecided`] so the application can
    /// resolve trust in bulk and retry. Session-state deltas are committed
    /// before the message is returned.
    pub async fn encrypt(
        &self,
        recipients: &[BareJid],
        payload: &P,
        backend_priority: Option<&[String]>,
    ) -> Result<EncryptedMessage> {
        let priority: Vec<String> = match backend_priority {
            Some(namespaces) => {
                for ns in namespaces {
                    self.backend_by_namespace(ns)?;
                }
                namespaces.to_vec()
            }
            None => self
                .backends
                .iter()
                .map(|b| b.namespace().to_string())
                .collect(),
        };

        let mut jids: Vec<BareJid> = recipients.to_vec();
        jids.push(self.own_jid.clone());
        jids.sort();
        jids.dedup();
        let _guards = self.guards_for(&jids).await;

        // 1. Target device set: active devices of every recipient plus the
        //    own account's other active devices.
        let mut targets: Vec<DeviceRecord> = Vec::new();
        for jid in &jids {
            for record in self.registry.records(jid).await? {
                if record.jid == self.own_jid && record.device_id == self.own_device_id {
                    continue;
                }
                if record.active() {
                    targets.push(record);
                }
            }
        }

        let mut failures: Vec<FailedDevice> = Vec::new();
        let mut selections: Vec<Selection> = Vec::new();

        // 2. Pick a backend per device: the first namespace in the
        //    priority list the device supports, preferring an existing
        //    session, falling back to a fetchable bundle.
        'devices: for record in targets {
            let mut bundle_failure: Option<DeviceFailure> = None;
            let mut supported_any = false;

            for ns in &priority {
                if !record.supports(ns) {
                    continue;
                }
                supported_any = true;

                if let Some(session) = self
                    .store
                    .load_session(&record.jid, record.device_id, ns)
                    .await?
                {
                    selections.push(Selection {
                        namespace: ns.clone(),
                        source: SessionSource::Existing(session),
                        identity_key: Vec::new(),
                        record,
                    });
                    continue 'devices;
                }

                match self
                    .callbacks
                    .download_bundle(&record.jid, record.device_id, ns)
                    .await
                {
                    Ok(Some(bundle)) => {
                        selections.push(Selection {
                            namespace: ns.clone(),
                            source: SessionSource::Bundle(bundle),
                            identity_key: Vec::new(),
                            record,
                        });
                        continue 'devices;
                    }
                    Ok(None) => {
                        bundle_failure = Some(DeviceFailure::BundleNotFound);
                    }
                    Err(e) => {
                        bundle_failure =
                            Some(DeviceFailure::BundleDownloadFailed { reason: e.0 });
                    }
                }
            }

            let failure = if supported_any {
                bundle_failure.unwrap_or(DeviceFailure::NoEligibleBackend)
            } else {
                DeviceFailure::NoEligibleBackend
            };
            failures.push(FailedDevice {
                jid: record.jid.clone(),
                device_id: record.device_id,
                failure,
            });
        }

        // Resolve identity keys for the trust filter.
        for selection in &mut selections {
            if !selection.record.identity_key.is_empty() {
                selection.identity_key = selection.record.identity_key.clone();
                continue;
            }
            let backend = self.backend_by_namespace(&selection.namespace)?;
            let raw = match &selection.source {
                SessionSource::Bundle(bundle) => bundle.identity_key.clone(),
                SessionSource::Existing(session) => backend.session_identity_key(session)?,
            };
            let normalized = Self::normalize_identity(backend.identity_key_format(), &raw)?;
            self.registry
                .set_identity_key(&selection.record.jid, selection.record.device_id, &normalized)
                .await?;
            selection.identity_key = normalized;
        }

        // 3. Trust filter: fail fast on any undecided device, silently
        //    drop distrusted ones.
        let queried: Vec<(BareJid, DeviceId, Vec<u8>)> = selections
            .iter()
            .map(|s| (s.record.jid.clone(), s.record.device_id, s.identity_key.clone()))
            .collect();
        let levels = self.trust.evaluate_devices(&queried).await?;

        let mut undecided: Vec<(BareJid, DeviceId)> = Vec::new();
        let mut skipped_distrusted: Vec<(BareJid, DeviceId)> = Vec::new();
        let mut kept: Vec<Selection> = Vec::new();
        for (selection, level) in selections.into_iter().zip(levels) {
            match level {
                TrustLevel::Undecided => {
                    undecided.push((selection.record.jid.clone(), selection.record.device_id));
                }
                TrustLevel::Distrusted => {
                    skipped_distrusted
                        .push((selection.record.jid.clone(), selection.record.device_id));
                }
                TrustLevel::Trusted => kept.push(selection),
            }
        }
        if !undecided.is_empty() {
            return Err(OmemoError::StillUndecided(undecided));
        }

        // 4. Build missing sessions from the already-downloaded bundles.
        let mut ready: Vec<(Selection, Vec<u8>)> = Vec::new();
        for selection in kept {
            let backend = self.backend_by_namespace(&selection.namespace)?;
            match &selection.source {
                SessionSource::Existing(session) => {
                    let session = session.clone();
                    ready.push((selection, session));
                }
                SessionSource::Bundle(bundle) => {
                    match backend
                        .build_active_session(
                            &selection.record.jid,
                            selection.record.device_id,
                            bundle,
                        )
                        .await
                    {
                        Ok((session, _key_exchange)) => {
                            debug!(
                                jid = %selection.record.jid,
                                device = %selection.record.device_id,
                                namespace = %selection.namespace,
                                "built active session"
                            );
                            ready.push((selection, session));
                        }
                        Err(BackendError::SessionBroken(reason)) => {
                            failures.push(FailedDevice {
                                jid: selection.record.jid.clone(),
                                device_id: selection.record.device_id,
                                failure: DeviceFailure::SessionBroken { reason },
                            });
                        }
                        Err(BackendError::BundleCorrupted(reason)) => {
                            failures.push(FailedDevice {
                                jid: selection.record.jid.clone(),
                                device_id: selection.record.device_id,
                                failure: DeviceFailure::BundleCorrupted { reason },
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        // 5./6. Serialize the plaintext once per backend; encrypt per
        //       device.
        let mut encoded: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut staged: Vec<(BareJid, DeviceId, String, Vec<u8>)> = Vec::new();
        let mut payloads: BTreeMap<String, Vec<DeviceKey>> = BTreeMap::new();
        for (selection, session) in ready {
            let backend = self.backend_by_namespace(&selection.namespace)?;
            let plaintext = encoded
                .entry(selection.namespace.clone())
                .or_insert_with(|| payload.encode(&selection.namespace))
                .clone();
            match backend.encrypt(&session, &plaintext).await {
                Ok((new_session, key)) => {
                    staged.push((
                        selection.record.jid.clone(),
                        selection.record.device_id,
                        selection.namespace.clone(),
                        new_session,
                    ));
                    payloads
                        .entry(selection.namespace.clone())
                        .or_default()
                        .push(DeviceKey {
                            jid: selection.record.jid.clone(),
                            device_id: selection.record.device_id,
                            key,
                        });
                }
                Err(BackendError::SessionBroken(reason)) => {
                    failures.push(FailedDevice {
                        jid: selection.record.jid.clone(),
                        device_id: selection.record.device_id,
                        failure: DeviceFailure::SessionBroken { reason },
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        // 7. Commit every session delta; abort without further writes on
        //    the first failure.
        for (jid, device_id, namespace, session) in staged {
            self.store
                .store_session(&jid, device_id, &namespace, session)
                .await
                .map_err(commit_err)?;
        }

        Ok(EncryptedMessage {
            payloads,
            failures,
            skipped_distrusted,
        })
    }

    // ── Decryption ───────────────────────────────────────────────────────

    /// Decrypt one received message.
    ///
    /// Unknown sender devices trigger an implicit device-list refresh.
    /// Pre-key messages build a passive session; a duplicated pre-key
    /// message is replayed against the stored session while catch-up is
    /// active. The updated session state is committed before the plaintext
    /// is returned; if that commit fails the plaintext is discarded.
    pub async fn decrypt(&self, message: ReceivedMessage) -> Result<DecryptedMessage<P>> {
        let backend = self.backend_by_namespace(&message.namespace)?.clone();
        let _guards = self.guards_for(std::slice::from_ref(&message.sender)).await;

        let mut passive = false;
        let result = self
            .decrypt_inner(backend.as_ref(), &message, &mut passive)
            .await;

        // A failed operation leaves no trace: when the passive build
        // already consumed a one-time pre key in memory, roll the backend
        // back to its persisted state so the next operation re-reads from
        // storage.
        if result.is_err() && passive {
            if let Err(e) = self.restore_backend(&message.namespace).await {
                warn!(
                    namespace = %message.namespace,
                    "failed to restore backend state after aborted decrypt: {e}"
                );
            }
        }
        result
    }

    async fn decrypt_inner(
        &self,
        backend: &dyn Backend,
        message: &ReceivedMessage,
        passive: &mut bool,
    ) -> Result<DecryptedMessage<P>> {
        // 1. Refresh the sender's device lists when the device is unknown.
        if !self
            .registry
            .knows_device(&message.sender, message.sender_device)
            .await?
        {
            debug!(
                jid = %message.sender,
                device = %message.sender_device,
                "unknown sender device; refreshing device lists"
            );
            self.refresh_locked(&message.sender).await?;
        }

        // 2./3. Passive session for pre-key messages; the stored session
        //       otherwise (including catch-up replays of duplicated
        //       pre-key messages).
        let passive_built = if message.pre_key {
            self.try_build_passive(backend, message).await?
        } else {
            None
        };
        *passive = passive_built.is_some();

        let (new_session, plaintext, from_undecided) = match passive_built {
            Some((session, plaintext)) => {
                // 4. The key exchange revealed the sender's identity key;
                //    gate before committing anything.
                let identity_key = Self::normalize_identity(
                    backend.identity_key_format(),
                    &backend.session_identity_key(&session)?,
                )?;
                let flag = self.gate_sender_trust(message, &identity_key).await?;
                self.registry
                    .set_identity_key(&message.sender, message.sender_device, &identity_key)
                    .await?;
                (session, plaintext, flag)
            }
            None => {
                let session = self
                    .store
                    .load_session(&message.sender, message.sender_device, &message.namespace)
                    .await?
                    .ok_or_else(|| OmemoError::NoSession {
                        jid: message.sender.clone(),
                        device: message.sender_device,
                    })?;

                // 4. Trust gate before advancing the ratchet.
                let identity_key = Self::normalize_identity(
                    backend.identity_key_format(),
                    &backend.session_identity_key(&session)?,
                )?;
                let flag = self.gate_sender_trust(message, &identity_key).await?;
                self.registry
                    .set_identity_key(&message.sender, message.sender_device, &identity_key)
                    .await?;

                // 5. Backend decrypt.
                match backend
                    .decrypt(&session, &message.header, &message.ciphertext)
                    .await
                {
                    Ok((new_session, plaintext)) => (new_session, plaintext, flag),
                    Err(BackendError::NoSession) => {
                        return Err(OmemoError::NoSession {
                            jid: message.sender.clone(),
                            device: message.sender_device,
                        });
                    }
                    Err(BackendError::SessionBroken(reason)) => {
                        return Err(OmemoError::SessionBroken {
                            jid: message.sender.clone(),
                            device: message.sender_device,
                            reason,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // Decode before committing; an undecodable payload leaves no
        // trace.
        let payload = P::decode(&message.namespace, &plaintext)
            .map_err(|e| OmemoError::PayloadDecode(e.to_string()))?;

        // 6. Staleness observation from the post-decrypt receiving chain.
        let receiving_chain = backend.receiving_chain_length(&new_session)?;

        // 7. Commit group: session blob, backend state, pending-response
        //    queues. Any failure discards the plaintext.
        self.store
            .store_session(
                &message.sender,
                message.sender_device,
                &message.namespace,
                new_session,
            )
            .await
            .map_err(commit_err)?;

        if *passive {
            self.commit_passive_side_effects(message).await?;
        }

        // A passive session already queues its completing empty message;
        // only established sessions need a separate staleness response.
        if !*passive && is_stale(receiving_chain) {
            debug!(
                jid = %message.sender,
                device = %message.sender_device,
                receiving_chain,
                "session is stale; scheduling empty response"
            );
            self.stale_queue
                .schedule(PendingResponse {
                    namespace: message.namespace.clone(),
                    jid: message.sender.clone(),
                    device_id: message.sender_device,
                })
                .await
                .map_err(commit_err)?;
        }

        // Deferred sends run after the commit; during catch-up they wait
        // for the transition.
        if !self.catch_up.is_active() {
            self.drain_response_queues().await;
        }

        Ok(DecryptedMessage {
            payload,
            sender: message.sender.clone(),
            sender_device: message.sender_device,
            from_undecided,
        })
    }

    /// Reload one backend's in-memory state from the last committed blob
    async fn restore_backend(&self, namespace: &str) -> Result<()> {
        let backend = self.backend_by_namespace(namespace)?;
        let material = self
            .identity
            .material_for(backend.identity_key_format(), namespace)?;
        let state = self.store.load_backend_state(namespace).await?;
        let limits = SkippedKeyLimits {
            per_session: self.config.max_skipped_message_keys_per_session,
            per_message: self.config.skipped_keys_per_message(),
        };
        backend.load(material, state, limits, 0).await?;
        Ok(())
    }

    /// Attempt the passive-session build for a pre-key message.
    /// `Ok(None)` means: duplicated pre-key message during catch-up —
    /// replay against the stored session instead.
    async fn try_build_passive(
        &self,
        backend: &dyn Backend,
        message: &ReceivedMessage,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match backend
            .build_passive_session(
                &message.sender,
                message.sender_device,
                &message.header,
                &message.ciphertext,
            )
            .await
        {
            Ok((session, plaintext)) => {
                info!(
                    jid = %message.sender,
                    device = %message.sender_device,
                    namespace = %message.namespace,
                    "built passive session"
                );
                Ok(Some((session, plaintext)))
            }
            Err(BackendError::DuplicatedPreKeyMessage) => {
                if self.catch_up.is_active() {
                    debug!(
                        jid = %message.sender,
                        device = %message.sender_device,
                        "duplicated pre-key message during catch-up; replaying"
                    );
                    Ok(None)
                } else {
                    Err(OmemoError::DuplicatedPreKeyMessage {
                        jid: message.sender.clone(),
                        device: message.sender_device,
                    })
                }
            }
            Err(BackendError::SessionBroken(reason)) => Err(OmemoError::SessionBroken {
                jid: message.sender.clone(),
                device: message.sender_device,
                reason,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the decrypt trust gate; returns the `from_undecided` flag
    async fn gate_sender_trust(
        &self,
        message: &ReceivedMessage,
        identity_key: &[u8],
    ) -> Result<bool> {
        match self.trust.evaluate(&message.sender, identity_key).await? {
            TrustLevel::Trusted => Ok(false),
            TrustLevel::Distrusted => Err(OmemoError::SenderDistrusted {
                jid: message.sender.clone(),
                device: message.sender_device,
            }),
            TrustLevel::Undecided => match self.config.undecided_policy {
                UndecidedPolicy::AllowFlagged => Ok(true),
                UndecidedPolicy::Reject => Err(OmemoError::StillUndecided(vec![(
                    message.sender.clone(),
                    message.sender_device,
                )])),
            },
        }
    }

    /// Commit-phase side effects of a freshly built passive session
    async fn commit_passive_side_effects(&self, message: &ReceivedMessage) -> Result<()> {
        let backend = self.backend_by_namespace(&message.namespace)?;

        if !self.catch_up.is_active() {
            // Outside catch-up the consumed one-time pre key dies
            // immediately and the bundle is refilled.
            backend.delete_used_pre_keys().map_err(commit_err)?;
            let bundle = backend.bundle().map_err(commit_err)?;
            if bundle.replenishment_due(self.config.pre_key_refill_threshold as usize) {
                backend.replenish_pre_keys().map_err(commit_err)?;
                info!(namespace = %message.namespace, "replenished one-time pre keys");
            }
        }
        self.store
            .store_backend_state(&message.namespace, backend.state().map_err(commit_err)?)
            .await
            .map_err(commit_err)?;

        let mut lifecycle = self
            .store
            .load_lifecycle(&message.namespace)
            .await
            .map_err(commit_err)?
            .unwrap_or_else(|| BundleLifecycle::fresh(0));
        lifecycle.record_change();
        self.store
            .store_lifecycle(&message.namespace, &lifecycle)
            .await
            .map_err(commit_err)?;

        // The confirming empty message completes the session on the
        // peer's side; during catch-up it waits for the transition.
        self.completion_queue
            .schedule(PendingResponse {
                namespace: message.namespace.clone(),
                jid: message.sender.clone(),
                device_id: message.sender_device,
            })
            .await
            .map_err(commit_err)?;
        Ok(())
    }

    // ── Empty messages ───────────────────────────────────────────────────

    /// Send one empty OMEMO message over an existing session. Empty
    /// messages bypass trust.
    async fn send_empty(&self, entry: &PendingResponse) -> Result<()> {
        let Some(session) = self
            .store
            .load_session(&entry.jid, entry.device_id, &entry.namespace)
            .await?
        else {
            warn!(
                jid = %entry.jid,
                device = %entry.device_id,
                "no session for queued empty message; dropping"
            );
            return Ok(());
        };
        let backend = self.backend_by_namespace(&entry.namespace)?;
        let (new_session, key) = backend.encrypt(&session, &[]).await?;
        self.store
            .store_session(&entry.jid, entry.device_id, &entry.namespace, new_session)
            .await
            .map_err(commit_err)?;
        self.callbacks
            .send_empty_message(&entry.namespace, &entry.jid, entry.device_id, &key)
            .await
            .map_err(|e| OmemoError::Callback(e.0))?;
        Ok(())
    }

    /// Send every queued response; failures re-queue for the next drain
    async fn drain_response_queues(&self) {
        for queue in [&self.completion_queue, &self.stale_queue] {
            let entries = match queue.drain().await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("failed to drain response queue: {e}");
                    continue;
                }
            };
            for entry in entries {
                if let Err(e) = self.send_empty(&entry).await {
                    warn!(
                        jid = %entry.jid,
                        device = %entry.device_id,
                        "empty message failed, re-queueing: {e}"
                    );
                    if let Err(e) = queue.schedule(entry).await {
                        warn!("failed to re-queue response: {e}");
                    }
                }
            }
        }
    }

    // ── Catch-up transitions ─────────────────────────────────────────────

    /// Enter catch-up mode: retain used one-time pre keys, defer signed
    /// pre key rotation and empty-message responses
    pub fn begin_catch_up(&self) {
        self.catch_up.begin();
        info!("catch-up started");
    }

    /// Leave catch-up mode: purge retained used pre keys, run the deferred
    /// rotation check, and flush deferred responses
    pub async fn finish_catch_up(&self, now: i64) -> Result<()> {
        if !self.catch_up.finish() {
            return Ok(());
        }
        info!("catch-up finished");

        for backend in &self.backends {
            backend.delete_used_pre_keys()?;
            self.store
                .store_backend_state(backend.namespace(), backend.state()?)
                .await?;
        }

        self.maintenance(now).await?;
        self.drain_response_queues().await;
        Ok(())
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Idempotent per-backend upkeep: signed pre key rotation (deferred
    /// during catch-up), one-time pre key replenishment, and bundle
    /// publication with backoff. Call periodically and after bundle
    /// changes.
    pub async fn maintenance(&self, now: i64) -> Result<()> {
        for backend in &self.backends {
            let ns = backend.namespace().to_string();
            let mut lifecycle = self
                .store
                .load_lifecycle(&ns)
                .await?
                .unwrap_or_else(|| BundleLifecycle::fresh(now));

            if !self.catch_up.is_active()
                && lifecycle.rotation_due(now, self.rotation_period_secs)
            {
                backend.rotate_signed_pre_key(now)?;
                self.store.store_backend_state(&ns, backend.state()?).await?;
                lifecycle.record_rotation(now);
                info!(namespace = %ns, "rotated signed pre key");
            }

            let bundle = backend.bundle()?;
            if bundle.replenishment_due(self.config.pre_key_refill_threshold as usize) {
                backend.replenish_pre_keys()?;
                self.store.store_backend_state(&ns, backend.state()?).await?;
                lifecycle.record_change();
                info!(namespace = %ns, "replenished one-time pre keys");
            }

            if lifecycle.publish_due(now) {
                let bundle = backend.bundle()?;
                match self.callbacks.upload_bundle(&ns, &bundle).await {
                    Ok(()) => {
                        lifecycle.record_published();
                        info!(namespace = %ns, "published bundle");
                    }
                    Err(e) => {
                        lifecycle.record_publish_failure(now, self.rotation_period_secs);
                        warn!(
                            namespace = %ns,
                            retry_in = lifecycle.publish_backoff_secs,
                            "bundle publication failed: {}",
                            e.0
                        );
                    }
                }
            }

            self.store.store_lifecycle(&ns, &lifecycle).await?;
        }
        Ok(())
    }

    // ── Device lists ─────────────────────────────────────────────────────

    /// Re-fetch and merge the device lists of `jid` across all backends
    pub async fn refresh_device_lists(&self, jid: &BareJid) -> Result<()> {
        let _guards = self.guards_for(std::slice::from_ref(jid)).await;
        self.refresh_locked(jid).await
    }

    async fn refresh_locked(&self, jid: &BareJid) -> Result<()> {
        let downloads = join_all(self.backends.iter().map(|backend| {
            let ns = backend.namespace().to_string();
            async move {
                let result = self.callbacks.download_device_list(jid, &ns).await;
                (ns, result)
            }
        }))
        .await;

        for (ns, result) in downloads {
            match result {
                Ok(list) => self.apply_update(jid, &ns, &list).await?,
                Err(e) => {
                    warn!(jid = %jid, namespace = %ns, "device list download failed: {}", e.0);
                }
            }
        }
        Ok(())
    }

    /// Feed one backend's device-list update (a received PEP event) into
    /// the registry
    pub async fn update_device_list(
        &self,
        jid: &BareJid,
        namespace: &str,
        devices: &[AnnouncedDevice],
    ) -> Result<()> {
        self.backend_by_namespace(namespace)?;
        let _guards = self.guards_for(std::slice::from_ref(jid)).await;
        self.apply_update(jid, namespace, devices).await
    }

    async fn apply_update(
        &self,
        jid: &BareJid,
        namespace: &str,
        devices: &[AnnouncedDevice],
    ) -> Result<()> {
        let own = (jid == &self.own_jid)
            .then(|| (self.own_device_id, self.own_label.read().clone()));
        let outcome = self
            .registry
            .process_update(jid, namespace, devices, own)
            .await?;

        if outcome.own_list_amended {
            info!(namespace = %namespace, "own device missing from list; republishing");
            let announce = self.registry.announced_list(jid, namespace).await?;
            if let Err(e) = self
                .callbacks
                .upload_device_list(jid, namespace, &announce)
                .await
            {
                warn!(namespace = %namespace, "device list upload failed: {}", e.0);
            }
        }
        Ok(())
    }

    /// Change the label announced for the own device and republish the
    /// own device lists
    pub async fn set_own_label(&self, label: Option<String>) -> Result<()> {
        let own = self.own_jid.clone();
        let _guards = self.guards_for(std::slice::from_ref(&own)).await;

        self.store
            .store_own_label(label.as_deref().unwrap_or(""))
            .await?;
        *self.own_label.write() = label.clone();
        self.registry
            .set_label(&own, self.own_device_id, label)
            .await?;

        for backend in &self.backends {
            let ns = backend.namespace();
            let announce = self.registry.announced_list(&own, ns).await?;
            if let Err(e) = self.callbacks.upload_device_list(&own, ns, &announce).await {
                warn!(namespace = %ns, "device list upload failed: {}", e.0);
            }
        }
        Ok(())
    }

    // ── Trust ────────────────────────────────────────────────────────────

    /// Overwrite the custom trust label of one identity key
    pub async fn set_trust(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
        label: &str,
    ) -> Result<()> {
        self.trust.set_trust(jid, identity_key, label).await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Bulk device information for one bare JID
    pub async fn device_info(&self, jid: &BareJid) -> Result<Vec<DeviceInfo>> {
        let records = self.registry.records(jid).await?;
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let (fingerprint, trust_label, trust) = if record.identity_key.is_empty() {
                (None, None, TrustLevel::Undecided)
            } else {
                let label = self
                    .store
                    .load_trust_label(jid, &record.identity_key)
                    .await?
                    .unwrap_or_else(|| self.config.default_trust_level.clone());
                let level = self
                    .callbacks
                    .evaluate_custom_trust(jid, &record.identity_key, &label)
                    .await;
                (Some(hex::encode(&record.identity_key)), Some(label), level)
            };
            infos.push(DeviceInfo {
                is_this_device: record.jid == self.own_jid
                    && record.device_id == self.own_device_id,
                jid: record.jid,
                device_id: record.device_id,
                label: record.label,
                active: !record.namespaces.is_empty(),
                namespaces: record.namespaces.into_iter().collect(),
                fingerprint,
                trust_label,
                trust,
            });
        }
        Ok(infos)
    }

    /// Information about the local device
    pub async fn own_device_info(&self) -> Result<Option<DeviceInfo>> {
        Ok(self
            .device_info(&self.own_jid)
            .await?
            .into_iter()
            .find(|info| info.is_this_device))
    }

    // ── Purge ────────────────────────────────────────────────────────────

    /// Remove all device records, sessions, trust entries, and queued
    /// responses for one bare JID across every backend. The identity key
    /// is untouched.
    pub async fn purge_bare_jid(&self, jid: &BareJid) -> Result<()> {
        let _guards = self.guards_for(std::slice::from_ref(jid)).await;
        self.store.purge_jid(jid).await?;
        self.stale_queue.remove_jid(jid).await?;
        self.completion_queue.remove_jid(jid).await?;
        self.registry.evict(jid);
        info!(jid = %jid, "purged account data");
        Ok(())
    }
}
