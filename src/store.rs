use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::checker::Context;
use crate::crypto::random_bytes;
use crate::op::Op;
use crate::{BakeryError, Result};

const ROOT_KEY_LEN: usize = 24;

/// Storage for macaroon root keys.
///
/// Implementations must be safe for concurrent use, and must keep a
/// key retrievable for at least the maximum expected lifetime of any
/// macaroon minted with it. Blocking implementations are responsible
/// for honoring their own deadlines.
pub trait RootKeyStore: Send + Sync {
    /// Returns a key to mint with, together with its storage id.
    /// Implementations may reuse keys, typically rotating them on an
    /// age policy.
    fn root_key(&self, ctx: &Context) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Returns the key stored under `id`, or
    /// [`BakeryError::NotFound`].
    fn get(&self, ctx: &Context, id: &[u8]) -> Result<Vec<u8>>;
}

/// The in-memory reference root-key store: a single key under the id
/// `"0"`, generated on first use and kept forever.
pub struct MemoryKeyStore {
    key: Mutex<Option<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            key: Mutex::new(None),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RootKeyStore for MemoryKeyStore {
    fn root_key(&self, _ctx: &Context) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut guard = self.key.lock().expect("root key store lock poisoned");
        let key = guard
            .get_or_insert_with(|| random_bytes::<ROOT_KEY_LEN>().to_vec())
            .clone();
        Ok((key, b"0".to_vec()))
    }

    fn get(&self, _ctx: &Context, id: &[u8]) -> Result<Vec<u8>> {
        if id != b"0" {
            return Err(BakeryError::NotFound("root key".into()));
        }
        self.key
            .lock()
            .expect("root key store lock poisoned")
            .clone()
            .ok_or_else(|| BakeryError::NotFound("root key".into()))
    }
}

/// Storage for operation sets referenced by macaroon ids, keeping
/// macaroons small when they cover many operations.
///
/// `put_ops` is idempotent: the key is derived from the canonical
/// operation set, so the same set always stores under the same key.
/// Entry lifetime is the caller's concern; `expiry` is a hint.
pub trait OpsStore: Send + Sync {
    fn put_ops(
        &self,
        ctx: &Context,
        key: &str,
        ops: &[Op],
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns the operations stored under `key`, or
    /// [`BakeryError::NotFound`].
    fn get_ops(&self, ctx: &Context, key: &str) -> Result<Vec<Op>>;
}

/// The in-memory reference ops store. Entries never expire.
pub struct MemoryOpsStore {
    ops: Mutex<HashMap<String, Vec<Op>>>,
}

impl MemoryOpsStore {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryOpsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsStore for MemoryOpsStore {
    fn put_ops(
        &self,
        _ctx: &Context,
        key: &str,
        ops: &[Op],
        _expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.ops
            .lock()
            .expect("ops store lock poisoned")
            .insert(key.to_string(), ops.to_vec());
        Ok(())
    }

    fn get_ops(&self, _ctx: &Context, key: &str) -> Result<Vec<Op>> {
        self.ops
            .lock()
            .expect("ops store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| BakeryError::NotFound(format!("operations for key {key}")))
    }
}
