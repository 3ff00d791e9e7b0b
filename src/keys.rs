use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use base64::{Engine, engine::general_purpose::STANDARD};
use crypto_box::{PublicKey as BoxPublicKey, SecretKey as BoxSecretKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checker::Context;
use crate::crypto::random_bytes;
use crate::macaroon::Version;
use crate::{BakeryError, Result};

/// Length in bytes of a Curve25519 key.
pub const KEY_LEN: usize = 32;

/// A Curve25519 public key. Marshals as base64 text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

/// A Curve25519 private key. Marshals as base64 text; its debug
/// representation is redacted.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_LEN]);

/// A Curve25519 keypair used to encrypt third-party caveat ids.
#[derive(Debug, Clone, Serialize)]
pub struct KeyPair {
    pub public: PublicKey,
    private: PrivateKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The first four bytes, used as the key hint in packed caveat ids.
    pub(crate) fn hint(&self) -> &[u8] {
        &self.0[..4]
    }

    pub(crate) fn as_box(&self) -> BoxPublicKey {
        BoxPublicKey::from(self.0)
    }
}

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl KeyPair {
    /// Generates a fresh keypair from the system CSPRNG.
    pub fn generate() -> Self {
        let bytes = random_bytes::<KEY_LEN>();
        let secret = BoxSecretKey::from(bytes);
        Self {
            public: PublicKey(*secret.public_key().as_bytes()),
            private: PrivateKey(bytes),
        }
    }

    pub fn new(public: PublicKey, private: PrivateKey) -> Self {
        Self { public, private }
    }

    pub(crate) fn box_secret(&self) -> BoxSecretKey {
        BoxSecretKey::from(self.private.0)
    }
}

fn key_from_base64(s: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|e| BakeryError::InvalidKey(format!("cannot decode base64 key: {e}")))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        BakeryError::InvalidKey(format!(
            "wrong length for key, got {} want {KEY_LEN}",
            bytes.len()
        ))
    })
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<Self> {
        key_from_base64(s).map(Self)
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(redacted)")
    }
}

impl FromStr for PrivateKey {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<Self> {
        key_from_base64(s).map(Self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            public: Option<PublicKey>,
            private: Option<PrivateKey>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let public = raw
            .public
            .ok_or_else(|| D::Error::custom("missing public key"))?;
        let private = raw
            .private
            .ok_or_else(|| D::Error::custom("missing private key"))?;
        Ok(KeyPair { public, private })
    }
}

/// What a first party needs to know about a third party to encrypt
/// caveats to it: its public key and the bakery version it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThirdPartyInfo {
    pub public_key: PublicKey,
    pub version: Version,
}

/// Resolves a third-party location to its [`ThirdPartyInfo`].
pub trait ThirdPartyLocator: Send + Sync {
    fn third_party_info(&self, ctx: &Context, location: &str) -> Result<ThirdPartyInfo>;
}

/// An in-memory third-party locator.
///
/// By default only `https` locations resolve, so that keys cannot be
/// associated with locations an attacker could impersonate; tests and
/// closed deployments can opt out.
pub struct ThirdPartyStore {
    allow_insecure: bool,
    infos: RwLock<HashMap<String, ThirdPartyInfo>>,
}

impl ThirdPartyStore {
    pub fn new() -> Self {
        Self {
            allow_insecure: false,
            infos: RwLock::new(HashMap::new()),
        }
    }

    /// A store that resolves non-HTTPS locations too.
    pub fn allowing_insecure() -> Self {
        Self {
            allow_insecure: true,
            ..Self::new()
        }
    }

    pub fn add_info(&self, location: &str, info: ThirdPartyInfo) {
        self.infos
            .write()
            .expect("third party store lock poisoned")
            .insert(location.trim_end_matches('/').to_string(), info);
    }
}

impl Default for ThirdPartyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThirdPartyLocator for ThirdPartyStore {
    fn third_party_info(&self, _ctx: &Context, location: &str) -> Result<ThirdPartyInfo> {
        if !self.allow_insecure && !location.starts_with("https://") {
            return Err(BakeryError::NotFound(format!(
                "third party information for {location}"
            )));
        }
        self.infos
            .read()
            .expect("third party store lock poisoned")
            .get(location.trim_end_matches('/'))
            .copied()
            .ok_or_else(|| {
                BakeryError::NotFound(format!("third party information for {location}"))
            })
    }
}
