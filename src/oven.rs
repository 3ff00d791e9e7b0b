use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::debug;

use crate::auth::MacaroonVerifier;
use crate::caveat::Caveat;
use crate::checker::Context;
use crate::keys::{KeyPair, ThirdPartyLocator};
use crate::macaroon::{Macaroon, Slice, Version};
use crate::namespace::Namespace;
use crate::op::{Op, canonical_ops};
use crate::raw::RawMacaroon;
use crate::store::{OpsStore, RootKeyStore};
use crate::{BakeryError, Result};

// First byte of a structured macaroon id. Legacy ids carry the root
// key storage id verbatim and are recognized by exclusion.
const ID_VERSION: u8 = 3;

/// Selects the root-key store to mint with for a given operation set,
/// letting different operations use different root-key scopes.
pub type RootKeyStoreForOps = Box<dyn Fn(&[Op]) -> Arc<dyn RootKeyStore> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct MacaroonIdRecord {
    root_key_id: Vec<u8>,
    ops: Vec<Op>,
    ops_key: Option<String>,
}

/// Mints macaroons that authorize sets of operations, and verifies
/// them back to the operations and first-party caveat conditions they
/// carry.
///
/// The oven is long-lived, shared across requests, and safe for
/// concurrent use.
pub struct Oven {
    key: Option<KeyPair>,
    location: String,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    ns: Namespace,
    root_key_store: Arc<dyn RootKeyStore>,
    root_key_store_for_ops: Option<RootKeyStoreForOps>,
    ops_store: Option<Arc<dyn OpsStore>>,
    legacy_op: Option<Op>,
}

impl Oven {
    pub fn new(root_key_store: Arc<dyn RootKeyStore>) -> Self {
        Self {
            key: None,
            location: String::new(),
            locator: None,
            ns: Namespace::std(),
            root_key_store,
            root_key_store_for_ops: None,
            ops_store: None,
            legacy_op: None,
        }
    }

    /// The keypair used to encrypt third-party caveats. Without one,
    /// adding a third-party caveat fails.
    pub fn with_key(mut self, key: KeyPair) -> Self {
        self.key = Some(key);
        self
    }

    /// The location stamped on minted macaroons.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn ThirdPartyLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// The namespace minted macaroons resolve their caveats in.
    pub fn with_namespace(mut self, ns: Namespace) -> Self {
        self.ns = ns;
        self
    }

    /// Externalizes multi-operation sets to `store`, keeping macaroon
    /// ids small.
    pub fn with_ops_store(mut self, store: Arc<dyn OpsStore>) -> Self {
        self.ops_store = Some(store);
        self
    }

    /// Selects a root-key store per operation set instead of always
    /// using the default store.
    pub fn with_root_key_store_for_ops(mut self, f: RootKeyStoreForOps) -> Self {
        self.root_key_store_for_ops = Some(f);
        self
    }

    /// Accepts pre-bakery macaroons whose id is the bare root-key
    /// storage id, treating them as authorizing the single given
    /// operation. Macaroons minted for exactly that operation use the
    /// bare id form too.
    pub fn with_legacy_op(mut self, op: Op) -> Self {
        self.legacy_op = Some(op);
        self
    }

    pub fn key(&self) -> Option<&KeyPair> {
        self.key.as_ref()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn locator(&self) -> Option<&Arc<dyn ThirdPartyLocator>> {
        self.locator.as_ref()
    }

    fn store_for_ops(&self, ops: &[Op]) -> Arc<dyn RootKeyStore> {
        match &self.root_key_store_for_ops {
            Some(select) => select(ops),
            None => Arc::clone(&self.root_key_store),
        }
    }

    /// Mints a new macaroon authorizing `ops`, carrying `caveats`.
    ///
    /// The operation set is canonicalized (sorted, deduped) before the
    /// id is built, so equal sets mint macaroons with equal op
    /// encodings.
    pub fn new_macaroon(
        &self,
        ctx: &Context,
        version: Version,
        caveats: &[Caveat],
        ops: &[Op],
    ) -> Result<Macaroon> {
        if ops.is_empty() {
            return Err(BakeryError::InvalidFormat(
                "cannot mint a macaroon associated with no operations".into(),
            ));
        }
        for op in ops {
            if op.entity.is_empty() || op.action.is_empty() {
                return Err(BakeryError::InvalidFormat(format!(
                    "invalid operation {:?}",
                    op
                )));
            }
        }
        let ops = canonical_ops(ops);
        let store = self.store_for_ops(&ops);
        let (root_key, root_key_id) = store.root_key(ctx)?;

        let id = if self.legacy_op.as_ref() == Some(&ops[0]) && ops.len() == 1 {
            root_key_id
        } else {
            let record = match (&self.ops_store, ops.len() > 1) {
                (Some(ops_store), true) => {
                    let ops_key = ops_entity(&ops);
                    ops_store.put_ops(ctx, &ops_key, &ops, None)?;
                    MacaroonIdRecord {
                        root_key_id,
                        ops: Vec::new(),
                        ops_key: Some(ops_key),
                    }
                }
                _ => MacaroonIdRecord {
                    root_key_id,
                    ops: ops.clone(),
                    ops_key: None,
                },
            };
            let mut id = vec![ID_VERSION];
            id.extend(
                rmp_serde::to_vec(&record).map_err(|e| {
                    BakeryError::InvalidFormat(format!("cannot encode macaroon id: {e}"))
                })?,
            );
            id
        };

        let mut m = Macaroon::new(
            &root_key,
            id,
            Some(self.location.clone()),
            version,
            self.ns.clone(),
        );
        m.add_caveats(ctx, caveats, self.key.as_ref(), self.locator.as_deref())?;
        Ok(m)
    }

    /// Verifies a macaroon chain (primary plus discharges) and returns
    /// the operations it authorizes together with every first-party
    /// caveat condition it carries. Conditions come back unchecked;
    /// evaluating them in a request context is the caller's concern.
    pub fn verify_macaroon(&self, ctx: &Context, ms: &Slice) -> Result<(Vec<Op>, Vec<String>)> {
        let Some(primary) = ms.primary() else {
            return Err(BakeryError::VerificationFailed("no macaroons in slice".into()));
        };
        let (ops, root_key_id) = self.decode_macaroon_id(ctx, primary.raw().id())?;

        let store = self.store_for_ops(&ops);
        let root_key = match store.get(ctx, &root_key_id) {
            Ok(key) => key,
            Err(BakeryError::NotFound(_)) => {
                debug!(target: "bakkerij::oven", "root key not found for presented macaroon");
                return Err(BakeryError::VerificationFailed(
                    "macaroon root key not found in storage".into(),
                ));
            }
            Err(e) => return Err(e),
        };

        let discharges: Vec<RawMacaroon> = ms[1..].iter().map(|m| m.raw().clone()).collect();
        let mut conditions = Vec::new();
        primary.raw().verify(&root_key, &discharges, &mut |cond| {
            let cond = std::str::from_utf8(cond).map_err(|_| {
                BakeryError::VerificationFailed("first-party caveat is not valid utf-8".into())
            })?;
            conditions.push(cond.to_string());
            Ok(())
        })?;
        Ok((ops, conditions))
    }

    fn decode_macaroon_id(&self, ctx: &Context, id: &[u8]) -> Result<(Vec<Op>, Vec<u8>)> {
        if id.first() == Some(&ID_VERSION) {
            let record: MacaroonIdRecord = rmp_serde::from_slice(&id[1..]).map_err(|e| {
                BakeryError::VerificationFailed(format!("cannot decode macaroon id: {e}"))
            })?;
            let ops = match record.ops_key {
                Some(key) => {
                    let ops_store = self.ops_store.as_ref().ok_or_else(|| {
                        BakeryError::VerificationFailed(
                            "no operations store to resolve macaroon id".into(),
                        )
                    })?;
                    match ops_store.get_ops(ctx, &key) {
                        Ok(ops) => ops,
                        Err(BakeryError::NotFound(_)) => {
                            return Err(BakeryError::VerificationFailed(format!(
                                "operations not found for key {key}"
                            )));
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => record.ops,
            };
            if ops.is_empty() {
                return Err(BakeryError::VerificationFailed(
                    "macaroon associated with no operations".into(),
                ));
            }
            return Ok((ops, record.root_key_id));
        }
        if let Some(op) = &self.legacy_op {
            return Ok((vec![op.clone()], id.to_vec()));
        }
        Err(BakeryError::VerificationFailed(
            "invalid macaroon id; cannot determine root key".into(),
        ))
    }
}

impl MacaroonVerifier for Oven {
    fn verify_macaroon(&self, ctx: &Context, ms: &Slice) -> Result<(Vec<Op>, Vec<String>)> {
        Oven::verify_macaroon(self, ctx, ms)
    }
}

/// Storage key for an externalized operation set, derived from the
/// canonical set so equal sets share an entry.
fn ops_entity(ops: &[Op]) -> String {
    let mut hasher = Sha3_256::new();
    for op in ops {
        hasher.update(op.entity.as_bytes());
        hasher.update([0]);
        hasher.update(op.action.as_bytes());
        hasher.update([0]);
    }
    format!("multi-{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
}
