//! Shared test harness: a deterministic mock backend, an in-memory PEP
//! directory with recording callbacks, and a write-failure-injecting store.

#![allow(dead_code)] // each tests/*.rs compiles its own copy

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use weft_core::{BareJid, DeviceId, KeyValueStore, MemoryStore};
use weft_crypto::{IdentityKeyMaterial, IdentityKeyPair};
use weft_omemo::backend::{
    Backend, BackendError, Bundle, EncryptedKey, IdentityKeyFormat, KeyExchange,
    OneTimePreKeyPublic, SignedPreKeyPublic, SkippedKeyLimits,
};
use weft_omemo::callbacks::{AnnouncedDevice, AppCallbacks, CallbackError};
use weft_omemo::config::ManagerConfig;
use weft_omemo::manager::SessionManager;
use weft_omemo::trust::TrustLevel;

/// The namespace the mock backend implements
pub const NS: &str = "urn:xmpp:omemo:mock:0";

// ── Mock backend ─────────────────────────────────────────────────────────
//
// Stand-in session cipher, not real cryptography: the "key agreement"
// ships the session key inside the key-exchange header and messages are
// sealed with ChaCha20-Poly1305 under a counter nonce. It faithfully
// models everything the core observes: bundles, pre-key consumption and
// retention, duplicated pre-key messages, chain counters, and
// serializable state deltas.

#[derive(Clone, Serialize, Deserialize)]
struct MockSignedPreKey {
    id: u32,
    public: [u8; 32],
    signature: Vec<u8>,
    timestamp: i64,
}

#[derive(Clone, Serialize, Deserialize)]
struct MockState {
    identity_pub: Vec<u8>,
    ed_seed: Option<[u8; 32]>,
    spk: MockSignedPreKey,
    prev_spk: Option<MockSignedPreKey>,
    available: Vec<(u32, [u8; 32])>,
    used: Vec<u32>,
    next_pre_key_id: u32,
    next_spk_id: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct MockKeyExchangeData {
    identity_pub: Vec<u8>,
    pre_key_id: u32,
    session_key: [u8; 32],
}

#[derive(Clone, Serialize, Deserialize)]
struct MockHeader {
    counter: u32,
    key_exchange: Option<MockKeyExchangeData>,
}

#[derive(Clone, Serialize, Deserialize)]
struct MockSession {
    peer_identity: Vec<u8>,
    key: [u8; 32],
    initiator: bool,
    send_count: u32,
    recv_chain: u32,
    pending_kx: Option<MockKeyExchangeData>,
}

pub struct MockBackend {
    namespace: String,
    format: IdentityKeyFormat,
    state: Mutex<Option<MockState>>,
}

impl MockBackend {
    pub fn new(namespace: &str, format: IdentityKeyFormat) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.to_string(),
            format,
            state: Mutex::new(None),
        })
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(BackendError::NotLoaded)?;
        f(state)
    }

    fn fresh_state(&self, material: &IdentityKeyMaterial, now: i64) -> MockState {
        let (identity_pub, ed_seed) = match material {
            IdentityKeyMaterial::Ed { seed } => {
                let pair = IdentityKeyPair::from_seed(*seed);
                match self.format {
                    IdentityKeyFormat::Mont => (pair.mont_public_bytes().to_vec(), Some(*seed)),
                    _ => (pair.ed_public_bytes().to_vec(), Some(*seed)),
                }
            }
            IdentityKeyMaterial::Mont { scalar } => (mock_mont_public(*scalar), None),
        };

        let mut state = MockState {
            identity_pub,
            ed_seed,
            spk: MockSignedPreKey {
                id: 0,
                public: [0; 32],
                signature: Vec::new(),
                timestamp: 0,
            },
            prev_spk: None,
            available: Vec::new(),
            used: Vec::new(),
            next_pre_key_id: 0,
            next_spk_id: 0,
        };
        state.spk = Self::new_spk(&mut state, now);
        while state.available.len() < 100 {
            state.next_pre_key_id += 1;
            state.available.push((state.next_pre_key_id, rand::random()));
        }
        state
    }

    fn new_spk(state: &mut MockState, now: i64) -> MockSignedPreKey {
        state.next_spk_id += 1;
        let public: [u8; 32] = rand::random();
        let signature = match &state.ed_seed {
            Some(seed) => IdentityKeyPair::from_seed(*seed).sign(&public).to_vec(),
            None => vec![0; 64],
        };
        MockSignedPreKey {
            id: state.next_spk_id,
            public,
            signature,
            timestamp: now,
        }
    }

    fn bundle_of(&self, state: &MockState) -> Bundle {
        Bundle {
            namespace: self.namespace.clone(),
            identity_key: state.identity_pub.clone(),
            signed_pre_key: spk_public(&state.spk),
            previous_signed_pre_key: state.prev_spk.as_ref().map(spk_public),
            one_time_pre_keys: state
                .available
                .iter()
                .map(|(id, public)| OneTimePreKeyPublic {
                    id: *id,
                    public_key: *public,
                })
                .collect(),
        }
    }
}

fn spk_public(spk: &MockSignedPreKey) -> SignedPreKeyPublic {
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&spk.signature);
    SignedPreKeyPublic {
        id: spk.id,
        public_key: spk.public,
        signature,
        timestamp: spk.timestamp,
    }
}

fn mock_mont_public(scalar: [u8; 32]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    // Mock stand-in for the Curve25519 base-point multiplication: a hash
    // keeps the "public key" deterministic without pulling dalek in here.
    let mut hasher = Sha256::new();
    hasher.update(b"mock-mont-pub");
    hasher.update(scalar);
    hasher.finalize().to_vec()
}

fn seal(
    key: &[u8; 32],
    direction: u8,
    counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, BackendError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    nonce[8..12].copy_from_slice(&counter.to_le_bytes());
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| BackendError::Internal("seal failed".to_string()))
}

fn open(
    key: &[u8; 32],
    direction: u8,
    counter: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, BackendError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    nonce[8..12].copy_from_slice(&counter.to_le_bytes());
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| BackendError::SessionBroken("authentication failed".to_string()))
}

fn decode_session(blob: &[u8]) -> Result<MockSession, BackendError> {
    bincode::deserialize(blob).map_err(|_| BackendError::NoSession)
}

fn encode_session(session: &MockSession) -> Result<Vec<u8>, BackendError> {
    bincode::serialize(session).map_err(|e| BackendError::Internal(e.to_string()))
}

#[async_trait]
impl Backend for MockBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn identity_key_format(&self) -> IdentityKeyFormat {
        self.format
    }

    async fn load(
        &self,
        identity: IdentityKeyMaterial,
        state: Option<Vec<u8>>,
        _limits: SkippedKeyLimits,
        now: i64,
    ) -> Result<(), BackendError> {
        let restored = match state {
            Some(blob) => bincode::deserialize(&blob)
                .map_err(|e| BackendError::Internal(e.to_string()))?,
            None => self.fresh_state(&identity, now),
        };
        *self.state.lock() = Some(restored);
        Ok(())
    }

    fn state(&self) -> Result<Vec<u8>, BackendError> {
        self.with_state(|state| {
            bincode::serialize(state).map_err(|e| BackendError::Internal(e.to_string()))
        })
    }

    fn bundle(&self) -> Result<Bundle, BackendError> {
        self.with_state(|state| Ok(self.bundle_of(state)))
    }

    fn rotate_signed_pre_key(&self, now: i64) -> Result<Bundle, BackendError> {
        self.with_state(|state| {
            let new = Self::new_spk(state, now);
            state.prev_spk = Some(std::mem::replace(&mut state.spk, new));
            Ok(self.bundle_of(state))
        })
    }

    fn replenish_pre_keys(&self) -> Result<Bundle, BackendError> {
        self.with_state(|state| {
            while state.available.len() < 100 {
                state.next_pre_key_id += 1;
                state.available.push((state.next_pre_key_id, rand::random()));
            }
            Ok(self.bundle_of(state))
        })
    }

    fn delete_used_pre_keys(&self) -> Result<(), BackendError> {
        self.with_state(|state| {
            state.used.clear();
            Ok(())
        })
    }

    async fn build_active_session(
        &self,
        _remote_jid: &BareJid,
        _remote_device: DeviceId,
        remote_bundle: &Bundle,
    ) -> Result<(Vec<u8>, KeyExchange), BackendError> {
        if self.format != IdentityKeyFormat::Mont {
            let ed: [u8; 32] = remote_bundle
                .identity_key
                .as_slice()
                .try_into()
                .map_err(|_| BackendError::BundleCorrupted("bad identity key".to_string()))?;
            weft_crypto::verify_detached(
                &ed,
                &remote_bundle.signed_pre_key.public_key,
                &remote_bundle.signed_pre_key.signature,
            )
            .map_err(|_| {
                BackendError::BundleCorrupted("signed pre key signature".to_string())
            })?;
        }

        let pre_key = remote_bundle
            .one_time_pre_keys
            .first()
            .ok_or_else(|| BackendError::BundleCorrupted("no one-time pre keys".to_string()))?;

        let identity_pub = self.with_state(|state| Ok(state.identity_pub.clone()))?;
        let kx = MockKeyExchangeData {
            identity_pub,
            pre_key_id: pre_key.id,
            session_key: rand::random(),
        };
        let session = MockSession {
            peer_identity: remote_bundle.identity_key.clone(),
            key: kx.session_key,
            initiator: true,
            send_count: 0,
            recv_chain: 0,
            pending_kx: Some(kx.clone()),
        };
        let kx_bytes =
            bincode::serialize(&kx).map_err(|e| BackendError::Internal(e.to_string()))?;
        Ok((encode_session(&session)?, KeyExchange(kx_bytes)))
    }

    async fn build_passive_session(
        &self,
        _sender_jid: &BareJid,
        _sender_device: DeviceId,
        header: &[u8],
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), BackendError> {
        let header: MockHeader = bincode::deserialize(header)
            .map_err(|_| BackendError::SessionBroken("malformed header".to_string()))?;
        let kx = header
            .key_exchange
            .ok_or_else(|| BackendError::Internal("not a pre-key message".to_string()))?;

        // Check availability first; nothing is consumed until the
        // message authenticates.
        self.with_state(|state| {
            if state.used.contains(&kx.pre_key_id) {
                return Err(BackendError::DuplicatedPreKeyMessage);
            }
            if !state.available.iter().any(|(id, _)| *id == kx.pre_key_id) {
                return Err(BackendError::SessionBroken(
                    "unknown one-time pre key".to_string(),
                ));
            }
            Ok(())
        })?;

        // The sender is the initiator; their messages use direction 1.
        let plaintext = open(&kx.session_key, 1, header.counter, ciphertext)?;

        self.with_state(|state| {
            let Some(position) = state
                .available
                .iter()
                .position(|(id, _)| *id == kx.pre_key_id)
            else {
                return Err(BackendError::SessionBroken(
                    "unknown one-time pre key".to_string(),
                ));
            };
            let (id, _) = state.available.remove(position);
            state.used.push(id);
            Ok(())
        })?;
        let session = MockSession {
            peer_identity: kx.identity_pub.clone(),
            key: kx.session_key,
            initiator: false,
            send_count: 0,
            recv_chain: header.counter + 1,
            pending_kx: None,
        };
        Ok((encode_session(&session)?, plaintext))
    }

    async fn encrypt(
        &self,
        session: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, EncryptedKey), BackendError> {
        let mut session = decode_session(session)?;
        let direction = if session.initiator { 1 } else { 2 };
        let counter = session.send_count;
        let ciphertext = seal(&session.key, direction, counter, plaintext)?;
        session.send_count += 1;

        let header = MockHeader {
            counter,
            key_exchange: session.pending_kx.clone(),
        };
        let pre_key = header.key_exchange.is_some();
        let header =
            bincode::serialize(&header).map_err(|e| BackendError::Internal(e.to_string()))?;
        Ok((
            encode_session(&session)?,
            EncryptedKey {
                header,
                ciphertext,
                pre_key,
            },
        ))
    }

    async fn decrypt(
        &self,
        session: &[u8],
        header: &[u8],
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), BackendError> {
        let mut session = decode_session(session)?;
        let header: MockHeader = bincode::deserialize(header)
            .map_err(|_| BackendError::SessionBroken("malformed header".to_string()))?;

        let peer_direction = if session.initiator { 2 } else { 1 };
        let plaintext = open(&session.key, peer_direction, header.counter, ciphertext)?;

        session.recv_chain = session.recv_chain.max(header.counter + 1);
        // Hearing back confirms the session; stop attaching the key
        // exchange.
        session.pending_kx = None;
        Ok((encode_session(&session)?, plaintext))
    }

    fn sending_chain_length(&self, session: &[u8]) -> Result<u32, BackendError> {
        Ok(decode_session(session)?.send_count)
    }

    fn receiving_chain_length(&self, session: &[u8]) -> Result<u32, BackendError> {
        Ok(decode_session(session)?.recv_chain)
    }

    fn session_identity_key(&self, session: &[u8]) -> Result<Vec<u8>, BackendError> {
        Ok(decode_session(session)?.peer_identity)
    }
}

// ── PEP directory + recording callbacks ──────────────────────────────────

type DeviceListKey = (String, String);
type BundleKey = (String, u32, String);

/// Shared in-memory stand-in for the server's PEP nodes
#[derive(Default)]
pub struct Directory {
    pub device_lists: Mutex<HashMap<DeviceListKey, Vec<AnnouncedDevice>>>,
    pub bundles: Mutex<HashMap<BundleKey, Bundle>>,
    pub failing_bundles: Mutex<HashSet<BundleKey>>,
    pub bundle_uploads: Mutex<Vec<(String, Bundle)>>,
    pub list_uploads: Mutex<Vec<(String, String, Vec<AnnouncedDevice>)>>,
    pub empties: Mutex<Vec<(String, String, u32)>>,
    pub fail_bundle_uploads: AtomicBool,
}

impl Directory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_device_list(&self, jid: &str, namespace: &str, devices: Vec<AnnouncedDevice>) {
        self.device_lists
            .lock()
            .insert((jid.to_string(), namespace.to_string()), devices);
    }

    pub fn set_bundle(&self, jid: &str, device: u32, namespace: &str, bundle: Bundle) {
        self.bundles
            .lock()
            .insert((jid.to_string(), device, namespace.to_string()), bundle);
    }

    pub fn fail_bundle(&self, jid: &str, device: u32, namespace: &str) {
        self.failing_bundles
            .lock()
            .insert((jid.to_string(), device, namespace.to_string()));
    }

    pub fn empty_count(&self) -> usize {
        self.empties.lock().len()
    }
}

/// Callbacks bound to one simulated client
pub struct DirCallbacks {
    dir: Arc<Directory>,
    own_jid: String,
    own_device: Mutex<Option<u32>>,
}

impl DirCallbacks {
    pub fn new(dir: Arc<Directory>, own_jid: &str) -> Arc<Self> {
        Arc::new(Self {
            dir,
            own_jid: own_jid.to_string(),
            own_device: Mutex::new(None),
        })
    }

    pub fn set_own_device(&self, device: DeviceId) {
        *self.own_device.lock() = Some(device.value());
    }
}

#[async_trait]
impl AppCallbacks for DirCallbacks {
    async fn download_device_list(
        &self,
        jid: &BareJid,
        namespace: &str,
    ) -> Result<Vec<AnnouncedDevice>, CallbackError> {
        Ok(self
            .dir
            .device_lists
            .lock()
            .get(&(jid.to_string(), namespace.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn upload_device_list(
        &self,
        jid: &BareJid,
        namespace: &str,
        devices: &[AnnouncedDevice],
    ) -> Result<(), CallbackError> {
        self.dir
            .device_lists
            .lock()
            .insert((jid.to_string(), namespace.to_string()), devices.to_vec());
        self.dir.list_uploads.lock().push((
            jid.to_string(),
            namespace.to_string(),
            devices.to_vec(),
        ));
        Ok(())
    }

    async fn download_bundle(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        namespace: &str,
    ) -> Result<Option<Bundle>, CallbackError> {
        let key = (jid.to_string(), device_id.value(), namespace.to_string());
        if self.dir.failing_bundles.lock().contains(&key) {
            return Err(CallbackError("simulated download failure".to_string()));
        }
        Ok(self.dir.bundles.lock().get(&key).cloned())
    }

    async fn upload_bundle(
        &self,
        namespace: &str,
        bundle: &Bundle,
    ) -> Result<(), CallbackError> {
        if self.dir.fail_bundle_uploads.load(Ordering::Acquire) {
            return Err(CallbackError("simulated upload failure".to_string()));
        }
        self.dir
            .bundle_uploads
            .lock()
            .push((namespace.to_string(), bundle.clone()));
        if let Some(device) = *self.own_device.lock() {
            self.dir.bundles.lock().insert(
                (self.own_jid.clone(), device, namespace.to_string()),
                bundle.clone(),
            );
        }
        Ok(())
    }

    async fn send_empty_message(
        &self,
        namespace: &str,
        jid: &BareJid,
        device_id: DeviceId,
        _key: &EncryptedKey,
    ) -> Result<(), CallbackError> {
        self.dir.empties.lock().push((
            namespace.to_string(),
            jid.to_string(),
            device_id.value(),
        ));
        Ok(())
    }

    async fn evaluate_custom_trust(
        &self,
        _jid: &BareJid,
        _identity_key: &[u8],
        label: &str,
    ) -> TrustLevel {
        match label {
            "trusted" => TrustLevel::Trusted,
            "distrusted" => TrustLevel::Distrusted,
            _ => TrustLevel::Undecided,
        }
    }
}

// ── Write-failure-injecting store ────────────────────────────────────────

pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn load(&self, key: &str) -> weft_core::Result<Option<Vec<u8>>> {
        self.inner.load(key).await
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> weft_core::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(weft_core::Error::Storage("injected write failure".to_string()));
        }
        self.inner.store(key, value).await
    }

    async fn delete(&self, key: &str) -> weft_core::Result<()> {
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> weft_core::Result<Vec<String>> {
        self.inner.list_prefix(prefix).await
    }
}

// ── Harness helpers ──────────────────────────────────────────────────────

pub fn jid(s: &str) -> BareJid {
    BareJid::new(s).unwrap()
}

pub fn trusted_by_default() -> ManagerConfig {
    ManagerConfig {
        default_trust_level: "trusted".to_string(),
        signed_pre_key_rotation_secs: Some(1000),
        ..Default::default()
    }
}

pub struct Peer {
    pub manager: SessionManager<String>,
    pub callbacks: Arc<DirCallbacks>,
    pub storage: Arc<dyn KeyValueStore>,
    pub backend: Arc<MockBackend>,
}

impl Peer {
    /// Create a client on `dir`, publish its bundle, and announce its
    /// device
    pub async fn start(
        dir: &Arc<Directory>,
        jid_str: &str,
        config: ManagerConfig,
        now: i64,
    ) -> Peer {
        Self::start_with_storage(dir, jid_str, config, now, Arc::new(MemoryStore::new())).await
    }

    pub async fn start_with_storage(
        dir: &Arc<Directory>,
        jid_str: &str,
        config: ManagerConfig,
        now: i64,
        storage: Arc<dyn KeyValueStore>,
    ) -> Peer {
        let callbacks = DirCallbacks::new(dir.clone(), jid_str);
        let backend = MockBackend::new(NS, IdentityKeyFormat::Ed);
        let manager = SessionManager::<String>::create(
            jid(jid_str),
            vec![backend.clone() as Arc<dyn Backend>],
            storage.clone(),
            callbacks.clone() as Arc<dyn AppCallbacks>,
            config,
            now,
        )
        .await
        .unwrap();
        callbacks.set_own_device(manager.own_device_id());

        // Publish the fresh bundle and announce the device.
        manager.maintenance(now).await.unwrap();
        manager
            .update_device_list(&jid(jid_str), NS, &existing_list(dir, jid_str))
            .await
            .unwrap();

        Peer {
            manager,
            callbacks,
            storage,
            backend,
        }
    }

    pub fn device(&self) -> u32 {
        self.manager.own_device_id().value()
    }

    pub async fn session_keys(&self) -> Vec<String> {
        self.storage
            .list_prefix("weft/v1/sessions/")
            .await
            .unwrap()
    }
}

fn existing_list(dir: &Arc<Directory>, jid_str: &str) -> Vec<AnnouncedDevice> {
    dir.device_lists
        .lock()
        .get(&(jid_str.to_string(), NS.to_string()))
        .cloned()
        .unwrap_or_default()
}

/// Register a standalone device (a bare mock backend, no manager) on the
/// directory and return its bundle
pub async fn standalone_device(
    dir: &Arc<Directory>,
    jid_str: &str,
    device: u32,
    now: i64,
) -> Bundle {
    let backend = MockBackend::new(NS, IdentityKeyFormat::Ed);
    let pair = IdentityKeyPair::generate();
    backend
        .load(
            pair.material_ed(),
            None,
            SkippedKeyLimits {
                per_session: 1000,
                per_message: 1000,
            },
            now,
        )
        .await
        .unwrap();
    let bundle = backend.bundle().unwrap();
    dir.set_bundle(jid_str, device, NS, bundle.clone());

    let mut list = existing_list(dir, jid_str);
    list.push(AnnouncedDevice {
        device_id: DeviceId::new(device),
        label: None,
    });
    dir.set_device_list(jid_str, NS, list);
    bundle
}

/// The Curve25519 trust key bytes for a bundle published by an Ed-format
/// backend
pub fn trust_key_of(bundle: &Bundle) -> Vec<u8> {
    let ed: [u8; 32] = bundle.identity_key.as_slice().try_into().unwrap();
    weft_crypto::ed_public_to_mont(&ed).unwrap().to_vec()
}
