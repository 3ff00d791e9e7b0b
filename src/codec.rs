use base64::{Engine, engine::general_purpose::STANDARD};
use crypto_box::SalsaBox;
use crypto_box::aead::Aead;
use crypto_box::aead::generic_array::GenericArray;
use serde::{Deserialize, Serialize};

use crate::crypto::{NONCE_SIZE, random_bytes};
use crate::keys::{KEY_LEN, KeyPair, PublicKey, ThirdPartyInfo};
use crate::macaroon::Version;
use crate::{BakeryError, Result};

/// The decoded payload of a third-party caveat: everything the third
/// party needs to check the condition and mint a discharge.
#[derive(Debug, Clone)]
pub struct ThirdPartyCaveatInfo {
    /// The predicate the third party must check before discharging.
    pub condition: String,

    /// Public key of the first party that encoded the caveat.
    pub first_party_public_key: PublicKey,

    /// The third party's own keypair, as used for decryption.
    pub third_party_key_pair: KeyPair,

    /// Root key for the discharge macaroon.
    pub root_key: Vec<u8>,

    /// The caveat id as it appears in the macaroon.
    pub caveat_id: Vec<u8>,

    /// The id the discharge macaroon will be minted with.
    pub macaroon_id: Vec<u8>,

    /// The caveat-id format version.
    pub version: Version,
}

const V2_TAG: u8 = 2;
const V2_SECRET_TAG: u8 = 2;
// base64(`{`) starts with 'e': a V1 id is a base64-wrapped JSON object.
const V1_TAG: u8 = b'e';

// version ‖ key hint ‖ sender public key ‖ nonce
const V2_HINT_LEN: usize = 4;
const V2_HEADER_LEN: usize = 1 + V2_HINT_LEN + KEY_LEN + NONCE_SIZE;

/// Encrypts a third-party caveat payload (root key + condition) from
/// the first party `key` to the third party described by `info`,
/// selecting the id format from the third party's version.
pub fn encode_caveat_id(
    condition: &str,
    root_key: &[u8],
    info: &ThirdPartyInfo,
    key: &KeyPair,
) -> Result<Vec<u8>> {
    if info.version == Version::V1 {
        encode_caveat_id_v1(condition, root_key, info, key)
    } else {
        encode_caveat_id_v2(condition, root_key, info, key)
    }
}

/// Decodes a third-party caveat id addressed to `key`, dispatching on
/// the format tag in the first byte.
pub fn decode_caveat_id(key: &KeyPair, id: &[u8]) -> Result<ThirdPartyCaveatInfo> {
    match id.first() {
        None => Err(BakeryError::InvalidCaveatId("caveat id empty".into())),
        Some(&V2_TAG) => decode_caveat_id_v2(key, id),
        Some(&V1_TAG) => decode_caveat_id_v1(key, id),
        Some(&tag) => Err(BakeryError::InvalidCaveatId(format!(
            "caveat id has unsupported version {tag}"
        ))),
    }
}

fn seal(recipient: &PublicKey, sender: &KeyPair, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    SalsaBox::new(&recipient.as_box(), &sender.box_secret())
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| BakeryError::Crypto("cannot encrypt caveat id".into()))
}

fn open(sender: &PublicKey, recipient: &KeyPair, nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    SalsaBox::new(&sender.as_box(), &recipient.box_secret())
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| BakeryError::InvalidCaveatId("cannot decrypt caveat id".into()))
}

fn encode_caveat_id_v2(
    condition: &str,
    root_key: &[u8],
    info: &ThirdPartyInfo,
    key: &KeyPair,
) -> Result<Vec<u8>> {
    let mut secret = Vec::with_capacity(1 + 10 + root_key.len() + condition.len());
    secret.push(V2_SECRET_TAG);
    put_uvarint(&mut secret, root_key.len() as u64);
    secret.extend_from_slice(root_key);
    secret.extend_from_slice(condition.as_bytes());

    let nonce = random_bytes::<NONCE_SIZE>();
    let sealed = seal(&info.public_key, key, &nonce, &secret)?;

    let mut id = Vec::with_capacity(V2_HEADER_LEN + sealed.len());
    id.push(V2_TAG);
    id.extend_from_slice(info.public_key.hint());
    id.extend_from_slice(key.public.as_bytes());
    id.extend_from_slice(&nonce);
    id.extend_from_slice(&sealed);
    Ok(id)
}

fn decode_caveat_id_v2(key: &KeyPair, id: &[u8]) -> Result<ThirdPartyCaveatInfo> {
    if id.len() <= V2_HEADER_LEN {
        return Err(BakeryError::InvalidCaveatId("caveat id too short".into()));
    }
    let (hint, rest) = id[1..].split_at(V2_HINT_LEN);
    if hint != key.public.hint() {
        return Err(BakeryError::InvalidCaveatId("public key mismatch".into()));
    }
    let (sender_bytes, rest) = rest.split_at(KEY_LEN);
    let sender = PublicKey::from_bytes(sender_bytes.try_into().expect("split length"));
    let (nonce, sealed) = rest.split_at(NONCE_SIZE);

    let secret = open(&sender, key, nonce, sealed)?;
    let (root_key, condition) = parse_secret_v2(&secret)?;

    Ok(ThirdPartyCaveatInfo {
        condition,
        first_party_public_key: sender,
        third_party_key_pair: key.clone(),
        root_key,
        caveat_id: id.to_vec(),
        macaroon_id: id.to_vec(),
        version: Version::V2,
    })
}

fn parse_secret_v2(secret: &[u8]) -> Result<(Vec<u8>, String)> {
    let invalid = || BakeryError::InvalidCaveatId("invalid secret part".into());
    match secret.first() {
        Some(&V2_SECRET_TAG) => {}
        _ => return Err(invalid()),
    }
    let (len, n) = get_uvarint(&secret[1..]).ok_or_else(invalid)?;
    let body = &secret[1 + n..];
    if (body.len() as u64) < len {
        return Err(invalid());
    }
    let (root_key, condition) = body.split_at(len as usize);
    let condition = std::str::from_utf8(condition).map_err(|_| invalid())?;
    Ok((root_key.to_vec(), condition.to_string()))
}

#[derive(Serialize, Deserialize)]
struct CaveatIdV1 {
    #[serde(rename = "ThirdPartyPublicKey")]
    third_party_public_key: String,
    #[serde(rename = "FirstPartyPublicKey")]
    first_party_public_key: String,
    #[serde(rename = "Nonce")]
    nonce: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Serialize, Deserialize)]
struct CaveatRecordV1 {
    #[serde(rename = "RootKey")]
    root_key: String,
    #[serde(rename = "Condition")]
    condition: String,
}

fn encode_caveat_id_v1(
    condition: &str,
    root_key: &[u8],
    info: &ThirdPartyInfo,
    key: &KeyPair,
) -> Result<Vec<u8>> {
    let record = serde_json::to_vec(&CaveatRecordV1 {
        root_key: STANDARD.encode(root_key),
        condition: condition.to_string(),
    })
    .map_err(|e| BakeryError::InvalidFormat(format!("cannot marshal caveat record: {e}")))?;

    let nonce = random_bytes::<NONCE_SIZE>();
    let sealed = seal(&info.public_key, key, &nonce, &record)?;

    let wrapper = serde_json::to_vec(&CaveatIdV1 {
        third_party_public_key: info.public_key.to_string(),
        first_party_public_key: key.public.to_string(),
        nonce: STANDARD.encode(nonce),
        id: STANDARD.encode(sealed),
    })
    .map_err(|e| BakeryError::InvalidFormat(format!("cannot marshal caveat id: {e}")))?;
    Ok(STANDARD.encode(wrapper).into_bytes())
}

fn decode_caveat_id_v1(key: &KeyPair, id: &[u8]) -> Result<ThirdPartyCaveatInfo> {
    let invalid = |what: &str| BakeryError::InvalidCaveatId(what.to_string());
    let raw = STANDARD
        .decode(id)
        .map_err(|_| invalid("cannot base64-decode caveat id"))?;
    let wrapper: CaveatIdV1 =
        serde_json::from_slice(&raw).map_err(|_| invalid("cannot unmarshal caveat id"))?;

    let third_party: PublicKey = wrapper.third_party_public_key.parse()?;
    if third_party != key.public {
        return Err(invalid("public key mismatch"));
    }
    let sender: PublicKey = wrapper.first_party_public_key.parse()?;
    let nonce = STANDARD
        .decode(&wrapper.nonce)
        .map_err(|_| invalid("cannot base64-decode nonce"))?;
    if nonce.len() != NONCE_SIZE {
        return Err(invalid("bad nonce length"));
    }
    let sealed = STANDARD
        .decode(&wrapper.id)
        .map_err(|_| invalid("cannot base64-decode sealed payload"))?;

    let record_bytes = open(&sender, key, &nonce, &sealed)?;
    let record: CaveatRecordV1 = serde_json::from_slice(&record_bytes)
        .map_err(|_| invalid("invalid secret part"))?;
    let root_key = STANDARD
        .decode(&record.root_key)
        .map_err(|_| invalid("invalid secret part"))?;

    Ok(ThirdPartyCaveatInfo {
        condition: record.condition,
        first_party_public_key: sender,
        third_party_key_pair: key.clone(),
        root_key,
        caveat_id: id.to_vec(),
        macaroon_id: id.to_vec(),
        version: Version::V1,
    })
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}
