use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::caveat::{COND_TIME_BEFORE, Caveat, parse_caveat};
use crate::checker::Context;
use crate::codec::encode_caveat_id;
use crate::crypto::random_bytes;
use crate::keys::{KeyPair, ThirdPartyLocator};
use crate::namespace::{Namespace, STD_NAMESPACE, condition_with_prefix};
use crate::raw::RawMacaroon;
use crate::{BakeryError, Result};

/// Length of the root key minted for each discharge macaroon.
const DISCHARGE_ROOT_KEY_LEN: usize = 24;

/// Wire-level format version of a macaroon.
///
/// V1 uses legacy JSON caveat ids; V2 packed binary ids; V3 adds the
/// bakery envelope carrying the minting namespace and the external
/// caveat-payload sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl Version {
    pub const LATEST: Version = Version::V3;
}

impl From<Version> for u16 {
    fn from(v: Version) -> u16 {
        v as u16
    }
}

impl TryFrom<u16> for Version {
    type Error = BakeryError;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            _ => Err(BakeryError::InvalidFormat(format!(
                "unsupported macaroon version {v}"
            ))),
        }
    }
}

/// A macaroon together with the bakery metadata needed to use it: the
/// wire version, the namespace it was minted with, and for compact
/// third-party caveat ids the encrypted payloads keyed by caveat id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    raw: RawMacaroon,
    version: Version,
    ns: Namespace,
    caveat_data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Macaroon {
    pub fn new(
        root_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: Option<impl Into<String>>,
        version: Version,
        ns: Namespace,
    ) -> Self {
        Self {
            raw: RawMacaroon::new(root_key, id, location),
            version,
            ns,
            caveat_data: BTreeMap::new(),
        }
    }

    pub fn raw(&self) -> &RawMacaroon {
        &self.raw
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Encrypted third-party caveat payloads keyed by (compact) caveat
    /// id, transported out-of-band in the V3 envelope.
    pub fn caveat_data(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.caveat_data
    }

    /// Binds this discharge macaroon to a primary's signature.
    pub fn bind_to(&mut self, primary_signature: &[u8]) {
        self.raw.bind_to(primary_signature);
    }

    /// Adds a caveat.
    ///
    /// First-party caveats resolve their condition in the minting
    /// namespace. Third-party caveats mint a fresh discharge root key,
    /// encrypt it together with the condition to the recipient located
    /// via `locator` using the local `key`, and append the result; for
    /// V3 recipients the macaroon carries a compact caveat id with the
    /// payload in the sidecar.
    pub fn add_caveat(
        &mut self,
        ctx: &Context,
        cav: &Caveat,
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<()> {
        let Some(location) = &cav.location else {
            let resolved = self.ns.resolve_caveat(cav);
            self.raw.add_first_party_caveat(resolved.condition.into_bytes());
            return Ok(());
        };

        let key = key.ok_or_else(|| {
            BakeryError::InvalidFormat("no private key to encrypt third party caveat".into())
        })?;
        let locator = locator.ok_or_else(|| {
            BakeryError::InvalidFormat("no locator when adding third party caveat".into())
        })?;
        let info = locator.third_party_info(ctx, location)?;

        let root_key = random_bytes::<DISCHARGE_ROOT_KEY_LEN>();
        let full_id = encode_caveat_id(&cav.condition, &root_key, &info, key)?;

        if self.version >= Version::V3 && info.version >= Version::V3 {
            let short_id = self.new_caveat_id();
            self.raw
                .add_third_party_caveat(&root_key, short_id.clone(), location.clone())?;
            self.caveat_data.insert(short_id, full_id);
        } else {
            self.raw
                .add_third_party_caveat(&root_key, full_id, location.clone())?;
        }
        Ok(())
    }

    pub fn add_caveats(
        &mut self,
        ctx: &Context,
        cavs: &[Caveat],
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<()> {
        for cav in cavs {
            self.add_caveat(ctx, cav, key, locator)?;
        }
        Ok(())
    }

    // Compact caveat ids are uvarint counters, unique within the
    // macaroon.
    fn new_caveat_id(&self) -> Vec<u8> {
        let mut counter = self.caveat_data.len() as u64;
        loop {
            let mut id = Vec::with_capacity(10);
            let mut v = counter;
            while v >= 0x80 {
                id.push((v as u8) | 0x80);
                v >>= 7;
            }
            id.push(v as u8);
            if !self.caveat_data.contains_key(&id) {
                return id;
            }
            counter += 1;
        }
    }

    /// The earliest `time-before` restriction on this macaroon, if any.
    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        let prefix = self.ns.resolve(STD_NAMESPACE).unwrap_or("");
        let time_before = condition_with_prefix(prefix, COND_TIME_BEFORE);
        let mut earliest: Option<DateTime<Utc>> = None;
        for cav in self.raw.caveats() {
            if cav.is_third_party() {
                continue;
            }
            let Ok(cond) = std::str::from_utf8(&cav.id) else {
                continue;
            };
            let Ok((name, arg)) = parse_caveat(cond) else {
                continue;
            };
            if name != time_before {
                continue;
            }
            if let Ok(t) = DateTime::parse_from_rfc3339(arg) {
                let t = t.with_timezone(&Utc);
                if earliest.is_none_or(|e| t < e) {
                    earliest = Some(t);
                }
            }
        }
        earliest
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| BakeryError::InvalidFormat(format!("cannot marshal macaroon: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BakeryError::InvalidFormat(format!("cannot unmarshal macaroon: {e}")))
    }

    /// URL-safe base64 text form of the packed binary encoding,
    /// suitable for cookies and headers.
    pub fn to_base64(&self) -> Result<String> {
        let packed = rmp_serde::to_vec_named(self)
            .map_err(|e| BakeryError::InvalidFormat(format!("cannot marshal macaroon: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    pub fn from_base64(b64: &str) -> Result<Self> {
        let packed = URL_SAFE_NO_PAD
            .decode(b64.as_bytes())
            .map_err(|e| BakeryError::InvalidFormat(format!("cannot decode macaroon: {e}")))?;
        rmp_serde::from_slice(&packed)
            .map_err(|e| BakeryError::InvalidFormat(format!("cannot unmarshal macaroon: {e}")))
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    m: &'a RawMacaroon,
    v: u16,
    ns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cdata: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MacaroonDe {
    Envelope {
        m: RawMacaroon,
        v: u16,
        #[serde(default)]
        ns: Option<String>,
        #[serde(default)]
        cdata: Option<BTreeMap<String, String>>,
    },
    Raw(RawMacaroon),
}

impl Serialize for Macaroon {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.version >= Version::V3 {
            let cdata = if self.caveat_data.is_empty() {
                None
            } else {
                Some(
                    self.caveat_data
                        .iter()
                        .map(|(id, payload)| (STANDARD.encode(id), STANDARD.encode(payload)))
                        .collect(),
                )
            };
            Envelope {
                m: &self.raw,
                v: self.version.into(),
                ns: self.ns.to_string(),
                cdata,
            }
            .serialize(serializer)
        } else {
            self.raw.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Macaroon {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match MacaroonDe::deserialize(deserializer)? {
            MacaroonDe::Envelope { m, v, ns, cdata } => {
                let version = Version::try_from(v).map_err(D::Error::custom)?;
                let ns = match ns {
                    Some(s) => s.parse().map_err(D::Error::custom)?,
                    None => Namespace::std(),
                };
                let mut caveat_data = BTreeMap::new();
                for (id, payload) in cdata.unwrap_or_default() {
                    let id = STANDARD.decode(&id).map_err(D::Error::custom)?;
                    let payload = STANDARD.decode(&payload).map_err(D::Error::custom)?;
                    caveat_data.insert(id, payload);
                }
                Ok(Macaroon {
                    raw: m,
                    version,
                    ns,
                    caveat_data,
                })
            }
            MacaroonDe::Raw(raw) => Ok(Macaroon {
                raw,
                version: Version::V2,
                ns: Namespace::std(),
                caveat_data: BTreeMap::new(),
            }),
        }
    }
}

/// A primary macaroon (index 0) followed by the discharge macaroons
/// bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slice(pub Vec<Macaroon>);

impl Slice {
    pub fn new(macaroons: Vec<Macaroon>) -> Self {
        Self(macaroons)
    }

    pub fn primary(&self) -> Option<&Macaroon> {
        self.0.first()
    }

    /// The earliest expiry over every macaroon in the slice.
    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.0.iter().filter_map(Macaroon::expiry_time).min()
    }

    /// Drops discharges whose own `time-before` caveats have expired;
    /// drops everything when the primary has expired. A cached bundle
    /// purged this way can be incrementally re-discharged.
    pub fn purge(&self, now: DateTime<Utc>) -> Slice {
        let Some(primary) = self.primary() else {
            return Slice::default();
        };
        if primary.expiry_time().is_some_and(|t| t <= now) {
            return Slice::default();
        }
        let mut out = vec![primary.clone()];
        out.extend(
            self.0[1..]
                .iter()
                .filter(|m| !m.expiry_time().is_some_and(|t| t <= now))
                .cloned(),
        );
        Slice(out)
    }
}

impl Deref for Slice {
    type Target = Vec<Macaroon>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Slice {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Macaroon>> for Slice {
    fn from(v: Vec<Macaroon>) -> Self {
        Slice(v)
    }
}

impl FromIterator<Macaroon> for Slice {
    fn from_iter<T: IntoIterator<Item = Macaroon>>(iter: T) -> Self {
        Slice(iter.into_iter().collect())
    }
}

impl IntoIterator for Slice {
    type Item = Macaroon;
    type IntoIter = std::vec::IntoIter<Macaroon>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
