//! Deterministic signing identities.
//!
//! The signature primitive is opaque to the engine; this module ships the
//! deterministic HMAC-SHA256 suite used in-process and in tests. A signer
//! is derived from a short name (alice, bob, ...) so test identities are
//! stable across runs. The keyring holds the signers whose material is
//! known locally and verifies events on their behalf.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use cv_domain::error::{Error, Result};
use cv_domain::event::{Event, Signer};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer with material derived from a name.
pub struct HmacSigner {
    name: String,
    secret: [u8; 32],
    pubkey: String,
}

impl HmacSigner {
    /// Derive a signer deterministically from a short name.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"conclave-signer:");
        hasher.update(name.as_bytes());
        let secret: [u8; 32] = hasher.finalize().into();
        Self::from_secret(name, secret)
    }

    /// Build a signer from raw secret material (e.g. a loaded secret file).
    pub fn from_secret(name: &str, secret: [u8; 32]) -> Self {
        let pubkey = hex::encode(Sha256::digest(secret));
        Self {
            name: name.to_owned(),
            secret,
            pubkey,
        }
    }

    /// Parse secret material from its hex serialization.
    pub fn from_secret_hex(name: &str, secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| Error::Signature(format!("bad secret material for '{name}': {e}")))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Signature(format!("secret for '{name}' is not 32 bytes")))?;
        Ok(Self::from_secret(name, secret))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex serialization of the secret, for persisting to a secret file.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    fn mac(&self, event_id: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(event_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl Signer for HmacSigner {
    fn pubkey(&self) -> String {
        self.pubkey.clone()
    }

    fn sign(&self, event_id: &str) -> String {
        hex::encode(self.mac(event_id))
    }
}

/// Registry of locally-known signing material, keyed by pubkey.
///
/// Verification policy: an event whose id does not match its content is
/// always rejected. An event from a known pubkey must carry the exact
/// signature that pubkey's material produces. Events from unknown pubkeys
/// (humans, remote agents) are accepted; the opaque primitive cannot be
/// checked without their material.
#[derive(Default)]
pub struct Keyring {
    signers: RwLock<HashMap<String, Arc<HmacSigner>>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, signer: Arc<HmacSigner>) {
        self.signers
            .write()
            .insert(Signer::pubkey(signer.as_ref()), signer);
    }

    pub fn get(&self, pubkey: &str) -> Option<Arc<HmacSigner>> {
        self.signers.read().get(pubkey).cloned()
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.signers.read().contains_key(pubkey)
    }

    /// Verify an event. `Ok(())` means routable; `Err(Signature)` means
    /// the event must be dropped.
    pub fn verify(&self, event: &Event) -> Result<()> {
        if !event.id_is_valid() {
            return Err(Error::Signature(format!(
                "event {} fails content addressing",
                event.id
            )));
        }

        let Some(signer) = self.get(&event.author) else {
            return Ok(());
        };

        let expected = signer.mac(&event.id);
        let got = hex::decode(&event.sig)
            .map_err(|e| Error::Signature(format!("event {} has malformed sig: {e}", event.id)))?;

        if expected.ct_eq(&got).into() {
            Ok(())
        } else {
            Err(Error::Signature(format!(
                "event {} signature does not verify for {}",
                event.id, event.author
            )))
        }
    }
}
