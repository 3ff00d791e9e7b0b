use serde::{Deserialize, Serialize};

use crate::crypto::{SIGNATURE_SIZE, keyed_hash, keyed_hash2, secretbox_open, secretbox_seal, sigs_equal};
use crate::{BakeryError, Result};

/// A single caveat of a raw macaroon.
///
/// A first-party caveat carries the condition bytes in `id`; a
/// third-party caveat additionally carries the verification id (the
/// discharge root key sealed under the signature at append time) and
/// the discharger's location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCaveat {
    pub id: Vec<u8>,
    pub verification_id: Option<Vec<u8>>,
    pub location: Option<String>,
}

impl RawCaveat {
    pub fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }
}

/// The macaroon primitive: a bearer token whose caveats are chained
/// into an HMAC-SHA3-256 signature.
///
/// Immutable once minted except for appending caveats; binding a
/// discharge rewrites only its signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMacaroon {
    location: Option<String>,
    id: Vec<u8>,
    caveats: Vec<RawCaveat>,
    signature: [u8; SIGNATURE_SIZE],
}

impl RawMacaroon {
    /// Mints a new macaroon with `sig = HMAC(root_key, id)`.
    pub fn new(
        root_key: &[u8],
        id: impl Into<Vec<u8>>,
        location: Option<impl Into<String>>,
    ) -> Self {
        let id = id.into();
        let signature = keyed_hash(root_key, &id);
        Self {
            location: location.map(Into::into),
            id,
            caveats: Vec::new(),
            signature,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn caveats(&self) -> &[RawCaveat] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    /// Appends a first-party caveat, folding the condition into the
    /// signature chain.
    pub fn add_first_party_caveat(&mut self, condition: impl Into<Vec<u8>>) {
        let id = condition.into();
        self.signature = keyed_hash(&self.signature, &id);
        self.caveats.push(RawCaveat {
            id,
            verification_id: None,
            location: None,
        });
    }

    /// Appends a third-party caveat. The discharge root key is sealed
    /// under the current signature to form the verification id, so
    /// only a holder of the chain up to this point can recover it.
    pub fn add_third_party_caveat(
        &mut self,
        discharge_root_key: &[u8],
        caveat_id: impl Into<Vec<u8>>,
        location: impl Into<String>,
    ) -> Result<()> {
        let caveat_id = caveat_id.into();
        let verification_id = secretbox_seal(&self.signature, discharge_root_key)?;
        self.signature = keyed_hash2(&self.signature, &verification_id, &caveat_id);
        self.caveats.push(RawCaveat {
            id: caveat_id,
            verification_id: Some(verification_id),
            location: Some(location.into()),
        });
        Ok(())
    }

    /// Binds this (discharge) macaroon to a primary's signature so it
    /// cannot be replayed against another primary.
    pub fn bind_to(&mut self, primary_signature: &[u8]) {
        self.signature = keyed_hash(&self.signature, primary_signature);
    }

    /// Verifies the signature chain rooted at `root_key`, resolving
    /// third-party caveats against `discharges` (each of which must be
    /// bound to this macaroon's signature and is used at most once).
    ///
    /// Every first-party condition encountered, in this macaroon and
    /// in every discharge, is handed to `check`; condition evaluation
    /// is the caller's concern.
    pub fn verify<F>(&self, root_key: &[u8], discharges: &[RawMacaroon], check: &mut F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut used = vec![false; discharges.len()];
        self.verify_part(root_key, None, self, discharges, &mut used, check)?;
        if let Some(idx) = used.iter().position(|u| !u) {
            return Err(BakeryError::VerificationFailed(format!(
                "discharge macaroon {:?} was not used",
                String::from_utf8_lossy(&discharges[idx].id)
            )));
        }
        Ok(())
    }

    fn verify_part<F>(
        &self,
        root_key: &[u8],
        bind_sig: Option<&[u8; SIGNATURE_SIZE]>,
        primary: &RawMacaroon,
        discharges: &[RawMacaroon],
        used: &mut [bool],
        check: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut sig = keyed_hash(root_key, &self.id);
        for cav in &self.caveats {
            match &cav.verification_id {
                None => {
                    check(&cav.id)?;
                    sig = keyed_hash(&sig, &cav.id);
                }
                Some(vid) => {
                    let discharge_key = secretbox_open(&sig, vid).map_err(|_| {
                        BakeryError::VerificationFailed(format!(
                            "cannot decrypt discharge key for caveat {:?}",
                            String::from_utf8_lossy(&cav.id)
                        ))
                    })?;
                    let idx = discharges
                        .iter()
                        .position(|d| d.id == cav.id)
                        .ok_or_else(|| {
                            BakeryError::VerificationFailed(format!(
                                "cannot find discharge macaroon for caveat {:?}",
                                String::from_utf8_lossy(&cav.id)
                            ))
                        })?;
                    if used[idx] {
                        return Err(BakeryError::VerificationFailed(format!(
                            "discharge macaroon {:?} used more than once",
                            String::from_utf8_lossy(&cav.id)
                        )));
                    }
                    used[idx] = true;
                    discharges[idx].verify_part(
                        &discharge_key,
                        Some(&primary.signature),
                        primary,
                        discharges,
                        used,
                        check,
                    )?;
                    sig = keyed_hash2(&sig, vid, &cav.id);
                }
            }
        }
        let final_sig = match bind_sig {
            Some(bind) => keyed_hash(&sig, bind),
            None => sig,
        };
        if !sigs_equal(&final_sig, &self.signature) {
            return Err(BakeryError::VerificationFailed(
                "signature mismatch after caveat verification".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all() -> impl FnMut(&[u8]) -> Result<()> {
        |_| Ok(())
    }

    #[test]
    fn test_new_macaroon_deterministic() {
        let m1 = RawMacaroon::new(b"root", b"id", Some("loc"));
        let m2 = RawMacaroon::new(b"root", b"id", Some("loc"));
        assert_eq!(m1.signature(), m2.signature());
        assert_eq!(m1.id(), b"id");
        assert_eq!(m1.location(), Some("loc"));
        assert!(m1.caveats().is_empty());
    }

    #[test]
    fn test_add_first_party_caveat_changes_signature() {
        let mut m = RawMacaroon::new(b"root", b"id", None::<String>);
        let sig0 = *m.signature();
        m.add_first_party_caveat(b"str something".to_vec());
        assert_ne!(*m.signature(), sig0);
        assert_eq!(m.caveats().len(), 1);
        assert!(!m.caveats()[0].is_third_party());
    }

    #[test]
    fn test_caveat_order_matters() {
        let mut m1 = RawMacaroon::new(b"root", b"id", None::<String>);
        m1.add_first_party_caveat(b"a".to_vec());
        m1.add_first_party_caveat(b"b".to_vec());

        let mut m2 = RawMacaroon::new(b"root", b"id", None::<String>);
        m2.add_first_party_caveat(b"b".to_vec());
        m2.add_first_party_caveat(b"a".to_vec());

        assert_ne!(m1.signature(), m2.signature());
    }

    #[test]
    fn test_verify_collects_conditions() {
        let mut m = RawMacaroon::new(b"root", b"id", None::<String>);
        m.add_first_party_caveat(b"cond one".to_vec());
        m.add_first_party_caveat(b"cond two".to_vec());

        let mut seen = Vec::new();
        m.verify(b"root", &[], &mut |cond| {
            seen.push(String::from_utf8_lossy(cond).to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, ["cond one", "cond two"]);
    }

    #[test]
    fn test_verify_wrong_root_key() {
        let m = RawMacaroon::new(b"root", b"id", None::<String>);
        let err = m.verify(b"other", &[], &mut accept_all()).unwrap_err();
        assert!(err.to_string().contains("signature mismatch"));
    }

    #[test]
    fn test_verify_tampered_caveat() {
        let mut m = RawMacaroon::new(b"root", b"id", None::<String>);
        m.add_first_party_caveat(b"cond".to_vec());
        m.caveats[0].id = b"tampered".to_vec();
        let err = m.verify(b"root", &[], &mut accept_all()).unwrap_err();
        assert!(err.to_string().contains("signature mismatch"));
    }

    #[test]
    fn test_third_party_discharge_roundtrip() {
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary.add_first_party_caveat(b"cond".to_vec());
        primary
            .add_third_party_caveat(b"discharge-key", b"tp-caveat-id", "as-loc")
            .unwrap();

        let mut discharge = RawMacaroon::new(b"discharge-key", b"tp-caveat-id", Some("as-loc"));
        discharge.add_first_party_caveat(b"extra cond".to_vec());
        discharge.bind_to(primary.signature());

        let mut seen = Vec::new();
        primary
            .verify(b"root", &[discharge], &mut |cond| {
                seen.push(String::from_utf8_lossy(cond).to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, ["cond", "extra cond"]);
    }

    #[test]
    fn test_missing_discharge() {
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary
            .add_third_party_caveat(b"discharge-key", b"tp-caveat-id", "as-loc")
            .unwrap();
        let err = primary.verify(b"root", &[], &mut accept_all()).unwrap_err();
        assert!(err.to_string().contains("cannot find discharge macaroon"));
    }

    #[test]
    fn test_unbound_discharge_rejected() {
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary
            .add_third_party_caveat(b"discharge-key", b"tp-caveat-id", "as-loc")
            .unwrap();

        let discharge = RawMacaroon::new(b"discharge-key", b"tp-caveat-id", Some("as-loc"));
        let err = primary
            .verify(b"root", &[discharge], &mut accept_all())
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("signature mismatch after caveat verification")
        );
    }

    #[test]
    fn test_discharge_bound_to_other_primary_rejected() {
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary
            .add_third_party_caveat(b"discharge-key", b"tp-caveat-id", "as-loc")
            .unwrap();

        let mut discharge = RawMacaroon::new(b"discharge-key", b"tp-caveat-id", Some("as-loc"));
        discharge.bind_to(b"tampered");
        let err = primary
            .verify(b"root", &[discharge], &mut accept_all())
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("signature mismatch after caveat verification")
        );
    }

    #[test]
    fn test_unused_discharge_rejected() {
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary
            .add_third_party_caveat(b"discharge-key", b"tp-caveat-id", "as-loc")
            .unwrap();

        let mut discharge = RawMacaroon::new(b"discharge-key", b"tp-caveat-id", Some("as-loc"));
        discharge.bind_to(primary.signature());
        let mut stray = RawMacaroon::new(b"other-key", b"stray-id", None::<String>);
        stray.bind_to(primary.signature());

        let err = primary
            .verify(b"root", &[discharge, stray], &mut accept_all())
            .unwrap_err();
        assert!(err.to_string().contains("was not used"));
    }

    #[test]
    fn test_nested_third_party_caveats() {
        // The discharge itself carries a third-party caveat discharged
        // by another member of the slice.
        let mut primary = RawMacaroon::new(b"root", b"primary-id", None::<String>);
        primary
            .add_third_party_caveat(b"key-one", b"caveat-one", "first-loc")
            .unwrap();

        let mut mid = RawMacaroon::new(b"key-one", b"caveat-one", Some("first-loc"));
        mid.add_third_party_caveat(b"key-two", b"caveat-two", "second-loc")
            .unwrap();

        let mut leaf = RawMacaroon::new(b"key-two", b"caveat-two", Some("second-loc"));
        leaf.bind_to(primary.signature());
        mid.bind_to(primary.signature());

        primary
            .verify(b"root", &[mid, leaf], &mut accept_all())
            .unwrap();
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut m = RawMacaroon::new(b"root", b"id", Some("loc"));
        m.add_first_party_caveat(b"cond".to_vec());
        m.add_third_party_caveat(b"key", b"tp-id", "as-loc").unwrap();

        let json = serde_json::to_string(&m).unwrap();
        let back: RawMacaroon = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);

        let packed = rmp_serde::to_vec(&m).unwrap();
        let back: RawMacaroon = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, m);
    }
}
