//! The long-lived identity key shared across OMEMO backends
//!
//! The identity key is generated once per installation as an Ed25519 seed.
//! Backends that speak the Ed25519 form receive the seed; backends that
//! speak the Curve25519 (Montgomery) form receive the converted scalar.
//! The secret scalar conversion hashes the seed with SHA-512 and clamps
//! (the libsodium `crypto_sign_ed25519_sk_to_curve25519` construction); the
//! public conversion is the Edwards→Montgomery birational map.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, Result};

/// The persisted form of the identity key: the secret bytes plus a format
/// tag. Historical installations may hold a Curve25519-only scalar; new
/// installations always hold an Ed25519 seed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum StoredIdentityKey {
    /// Ed25519 seed; both key forms derivable
    Seed {
        /// The 32-byte seed
        #[serde(with = "hex::serde")]
        seed: [u8; 32],
    },
    /// Curve25519 secret scalar only; no Ed25519 form derivable
    MontScalar {
        /// The 32-byte clamped scalar
        #[serde(with = "hex::serde")]
        scalar: [u8; 32],
    },
}

/// Key material handed to one backend, in the form that backend speaks
#[derive(Clone, ZeroizeOnDrop)]
pub enum IdentityKeyMaterial {
    /// Ed25519 seed (for `Ed` and `Flexible` backends)
    Ed {
        /// The 32-byte seed
        seed: [u8; 32],
    },
    /// Curve25519 secret scalar (for `Mont` backends)
    Mont {
        /// The 32-byte clamped scalar
        scalar: [u8; 32],
    },
}

/// The seed-based identity key pair
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    seed: [u8; 32],
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild from a persisted seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Self { seed, signing_key }
    }

    /// The persisted form
    pub fn to_stored(&self) -> StoredIdentityKey {
        StoredIdentityKey::Seed { seed: self.seed }
    }

    /// The raw seed
    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    /// Ed25519 public key bytes
    pub fn ed_public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Curve25519 public key bytes (Edwards→Montgomery)
    pub fn mont_public_bytes(&self) -> [u8; 32] {
        self.signing_key
            .verifying_key()
            .to_montgomery()
            .to_bytes()
    }

    /// Curve25519 secret scalar (SHA-512 of the seed, clamped)
    pub fn mont_scalar_bytes(&self) -> [u8; 32] {
        derive_mont_scalar(&self.seed)
    }

    /// Key material in the form a backend requires
    pub fn material_ed(&self) -> IdentityKeyMaterial {
        IdentityKeyMaterial::Ed { seed: self.seed }
    }

    /// Curve25519-form key material
    pub fn material_mont(&self) -> IdentityKeyMaterial {
        IdentityKeyMaterial::Mont {
            scalar: self.mont_scalar_bytes(),
        }
    }

    /// Sign a message with the Ed25519 key
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Fingerprint: lowercase hex of the Curve25519 public key
    pub fn fingerprint(&self) -> String {
        hex::encode(self.mont_public_bytes())
    }

    /// Diffie-Hellman with a Curve25519 public key
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = X25519StaticSecret::from(self.mont_scalar_bytes());
        *secret
            .diffie_hellman(&X25519PublicKey::from(*their_public))
            .as_bytes()
    }
}

impl Clone for IdentityKeyPair {
    fn clone(&self) -> Self {
        Self::from_seed(self.seed)
    }
}

/// A historical Curve25519-only identity key
#[derive(ZeroizeOnDrop)]
pub struct MontIdentityKey {
    scalar: [u8; 32],
}

impl MontIdentityKey {
    /// Rebuild from a persisted scalar
    pub fn from_scalar(scalar: [u8; 32]) -> Self {
        Self { scalar }
    }

    /// The persisted form
    pub fn to_stored(&self) -> StoredIdentityKey {
        StoredIdentityKey::MontScalar {
            scalar: self.scalar,
        }
    }

    /// Curve25519 public key bytes
    pub fn mont_public_bytes(&self) -> [u8; 32] {
        let secret = X25519StaticSecret::from(self.scalar);
        *X25519PublicKey::from(&secret).as_bytes()
    }

    /// Curve25519-form key material
    pub fn material_mont(&self) -> IdentityKeyMaterial {
        IdentityKeyMaterial::Mont {
            scalar: self.scalar,
        }
    }

    /// Fingerprint: lowercase hex of the Curve25519 public key
    pub fn fingerprint(&self) -> String {
        hex::encode(self.mont_public_bytes())
    }
}

/// Verify a detached Ed25519 signature
pub fn verify_detached(
    ed_public: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(ed_public)
        .map_err(|_| CryptoError::InvalidPublicKey("bad Ed25519 point".to_string()))?;
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Convert an Ed25519 public key to its Curve25519 form
pub fn ed_public_to_mont(ed_public: &[u8; 32]) -> Result<[u8; 32]> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(ed_public)
        .map_err(|_| CryptoError::InvalidPublicKey("bad compressed point".to_string()))?;
    let edwards = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidPublicKey("point does not decompress".to_string()))?;
    Ok(edwards.to_montgomery().to_bytes())
}

fn derive_mont_scalar(seed: &[u8; 32]) -> [u8; 32] {
    use sha2::{Digest, Sha512};

    let mut hasher = Sha512::new();
    hasher.update(seed);
    let hash = hasher.finalize();

    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);

    // Clamp (X25519 requirement)
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;

    scalar
}
