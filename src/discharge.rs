use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

use crate::caveat::Caveat;
use crate::checker::Context;
use crate::codec::{ThirdPartyCaveatInfo, decode_caveat_id};
use crate::keys::{KeyPair, ThirdPartyLocator};
use crate::macaroon::{Macaroon, Slice};
use crate::namespace::Namespace;
use crate::raw::RawCaveat;
use crate::{BakeryError, Result};

/// Location naming a caveat dischargeable by the client itself with
/// its own keypair, proving possession of the key.
pub const LOCAL_LOCATION: &str = "local";

/// Checks the predicate of a third-party caveat before it is
/// discharged, optionally imposing further caveats on the discharge
/// macaroon.
pub trait ThirdPartyCaveatChecker: Send + Sync {
    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>>;
}

/// Closure adapter for [`ThirdPartyCaveatChecker`].
pub struct ThirdPartyCaveatCheckerFunc<F>(F);

impl<F> ThirdPartyCaveatCheckerFunc<F>
where
    F: Fn(&Context, &ThirdPartyCaveatInfo) -> Result<Vec<Caveat>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ThirdPartyCaveatChecker for ThirdPartyCaveatCheckerFunc<F>
where
    F: Fn(&Context, &ThirdPartyCaveatInfo) -> Result<Vec<Caveat>> + Send + Sync,
{
    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>> {
        (self.0)(ctx, info)
    }
}

// Accepts any condition; used for local discharges, where holding the
// key is the whole proof.
struct AcceptAnyChecker;

impl ThirdPartyCaveatChecker for AcceptAnyChecker {
    fn check_third_party_caveat(
        &self,
        _ctx: &Context,
        _info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>> {
        Ok(Vec::new())
    }
}

/// What a third party needs to discharge one caveat.
pub struct DischargeParams<'a> {
    /// The caveat id from the macaroon.
    pub id: &'a [u8],

    /// The encrypted payload, when the id is a compact reference and
    /// the payload travelled out-of-band.
    pub caveat: Option<&'a [u8]>,

    /// The third party's keypair.
    pub key: &'a KeyPair,

    /// Checks the decoded predicate.
    pub checker: &'a dyn ThirdPartyCaveatChecker,

    /// Locates recipients of any further third-party caveats the
    /// checker imposes.
    pub locator: Option<&'a dyn ThirdPartyLocator>,
}

/// Discharges a third-party caveat: decrypts the payload, checks the
/// predicate, and mints a discharge macaroon bound by the recovered
/// root key. The caller binds the result to its primary.
pub fn discharge(ctx: &Context, p: DischargeParams<'_>) -> Result<Macaroon> {
    let encoded = p.caveat.unwrap_or(p.id);
    let mut info = decode_caveat_id(p.key, encoded)?;
    info.caveat_id = p.id.to_vec();
    info.macaroon_id = p.id.to_vec();

    let caveats = p.checker.check_third_party_caveat(ctx, &info)?;

    let mut m = Macaroon::new(
        &info.root_key,
        info.macaroon_id.clone(),
        None::<String>,
        info.version,
        Namespace::std(),
    );
    for cav in &caveats {
        m.add_caveat(ctx, cav, Some(p.key), p.locator)?;
    }
    Ok(m)
}

/// Failure to acquire every discharge. Carries the discharges that
/// were acquired (primary first, already bound), so a client can
/// retry just the rest after resolving the cause.
#[derive(Debug, Error)]
#[error("cannot acquire discharge: {cause}")]
pub struct DischargeAllError {
    pub discharges: Slice,
    #[source]
    pub cause: BakeryError,
}

/// Acquires a discharge macaroon for one third-party caveat, given its
/// raw caveat and, for compact ids, its encrypted payload.
pub type GetDischarge<'a> =
    dyn FnMut(&Context, &RawCaveat, Option<&[u8]>) -> Result<Macaroon> + 'a;

/// Recursively acquires discharge macaroons for every third-party
/// caveat of `m`, including caveats imposed by the discharges
/// themselves, and binds them all to `m`'s signature.
///
/// Returns the slice holding `m` first, followed by the bound
/// discharges. On failure, pending caveats are still attempted and the
/// partial slice is returned inside the error so the client can retry
/// later.
pub fn discharge_all(
    ctx: &Context,
    m: &Macaroon,
    get_discharge: &mut GetDischarge<'_>,
) -> std::result::Result<Slice, DischargeAllError> {
    discharge_all_with_key(ctx, m, get_discharge, None)
}

/// As [`discharge_all`], additionally discharging caveats addressed to
/// the `"local"` location with the client's own key.
pub fn discharge_all_with_key(
    ctx: &Context,
    m: &Macaroon,
    get_discharge: &mut GetDischarge<'_>,
    local_key: Option<&KeyPair>,
) -> std::result::Result<Slice, DischargeAllError> {
    let primary = m.clone();
    let primary_sig = *primary.raw().signature();

    let mut need: VecDeque<(RawCaveat, Option<Vec<u8>>)> = VecDeque::new();
    enqueue_third_party_caveats(&primary, &mut need);

    let mut discharges: Vec<Macaroon> = Vec::new();
    let mut first_err: Option<BakeryError> = None;

    while let Some((cav, payload)) = need.pop_front() {
        let result = match (cav.location.as_deref(), local_key) {
            (Some(LOCAL_LOCATION), Some(key)) => discharge(
                ctx,
                DischargeParams {
                    id: &cav.id,
                    caveat: payload.as_deref(),
                    key,
                    checker: &AcceptAnyChecker,
                    locator: None,
                },
            ),
            _ => get_discharge(ctx, &cav, payload.as_deref()),
        };
        match result {
            Ok(dm) => {
                enqueue_third_party_caveats(&dm, &mut need);
                discharges.push(dm);
            }
            Err(e) => {
                debug!(
                    target: "bakkerij::discharge",
                    location = cav.location.as_deref().unwrap_or(""),
                    error = %e,
                    "cannot acquire discharge",
                );
                first_err.get_or_insert(e);
            }
        }
    }

    let mut slice = vec![primary];
    for mut d in discharges {
        d.bind_to(&primary_sig);
        slice.push(d);
    }
    match first_err {
        None => Ok(Slice::new(slice)),
        Some(cause) => Err(DischargeAllError {
            discharges: Slice::new(slice),
            cause,
        }),
    }
}

fn enqueue_third_party_caveats(m: &Macaroon, need: &mut VecDeque<(RawCaveat, Option<Vec<u8>>)>) {
    for cav in m.raw().caveats() {
        if cav.is_third_party() {
            let payload = m.caveat_data().get(&cav.id).cloned();
            need.push_back((cav.clone(), payload));
        }
    }
}
