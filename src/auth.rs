use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::caveat::{COND_DECLARED, Caveat, parse_caveat, squash_conditions};
use crate::checker::{Context, FirstPartyCaveatChecker, infer_declared_from_conditions};
use crate::error::DischargeRequiredError;
use crate::identity::{Identity, IdentityClient};
use crate::macaroon::Slice;
use crate::namespace::{STD_NAMESPACE, condition_with_prefix};
use crate::op::Op;
use crate::{BakeryError, Result};

/// Verifies a macaroon chain back to the operations it authorizes and
/// the first-party conditions it carries. Implemented by
/// [`crate::oven::Oven`].
pub trait MacaroonVerifier: Send + Sync {
    fn verify_macaroon(&self, ctx: &Context, ms: &Slice) -> Result<(Vec<Op>, Vec<String>)>;
}

/// Decides operations that no presented macaroon authorized directly.
pub trait Authorizer: Send + Sync {
    /// Returns, for each of `ops`, whether the (optionally
    /// authenticated) client may perform it, along with caveats that
    /// must be discharged before any conditional grant takes effect.
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&Arc<dyn Identity>>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)>;
}

/// Denies everything; the default authorizer.
pub struct ClosedAuthorizer;

impl Authorizer for ClosedAuthorizer {
    fn authorize(
        &self,
        _ctx: &Context,
        _identity: Option<&Arc<dyn Identity>>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)> {
        Ok((vec![false; ops.len()], Vec::new()))
    }
}

/// Allows everything. Useful when macaroon possession alone conveys
/// authority.
pub struct OpenAuthorizer;

impl Authorizer for OpenAuthorizer {
    fn authorize(
        &self,
        _ctx: &Context,
        _identity: Option<&Arc<dyn Identity>>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)> {
        Ok((vec![true; ops.len()], Vec::new()))
    }
}

/// Per-operation closure adapter for [`Authorizer`].
pub struct AuthorizerFunc<F>(F);

impl<F> AuthorizerFunc<F>
where
    F: Fn(&Context, Option<&Arc<dyn Identity>>, &Op) -> Result<(bool, Vec<Caveat>)> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Authorizer for AuthorizerFunc<F>
where
    F: Fn(&Context, Option<&Arc<dyn Identity>>, &Op) -> Result<(bool, Vec<Caveat>)> + Send + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&Arc<dyn Identity>>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)> {
        let mut allowed = Vec::with_capacity(ops.len());
        let mut caveats = Vec::new();
        for op in ops {
            let (ok, cavs) = (self.0)(ctx, identity, op)?;
            allowed.push(ok);
            caveats.extend(cavs);
        }
        Ok((allowed, caveats))
    }
}

/// Decides whether an operation a macaroon asserts implies other
/// operations (for example, a grant on a parent path implying grants
/// on its children).
pub trait OpsAuthorizer: Send + Sync {
    /// Returns, for each of `queried`, whether `authorized_op` implies
    /// it. The engine also queries with [`Op::no_op`], letting the
    /// authorizer grant operations no macaroon matched directly.
    fn authorize_ops(
        &self,
        ctx: &Context,
        authorized_op: &Op,
        queried: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)>;
}

/// Configuration of an [`Authority`].
pub struct AuthorityParams {
    /// Evaluates first-party caveat conditions.
    pub checker: Arc<dyn FirstPartyCaveatChecker>,

    /// Recovers operations and conditions from presented chains.
    pub macaroon_verifier: Arc<dyn MacaroonVerifier>,

    /// Decides operations not covered by any macaroon. Defaults to
    /// [`ClosedAuthorizer`].
    pub authorizer: Arc<dyn Authorizer>,

    /// Optional implication relation between operations.
    pub ops_authorizer: Option<Arc<dyn OpsAuthorizer>>,

    /// Optional identity semantics: login macaroons, ambient
    /// authentication, declared identities.
    pub identity_client: Option<Arc<dyn IdentityClient>>,
}

impl AuthorityParams {
    pub fn new(
        checker: Arc<dyn FirstPartyCaveatChecker>,
        macaroon_verifier: Arc<dyn MacaroonVerifier>,
    ) -> Self {
        Self {
            checker,
            macaroon_verifier,
            authorizer: Arc::new(ClosedAuthorizer),
            ops_authorizer: None,
            identity_client: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_ops_authorizer(mut self, ops_authorizer: Arc<dyn OpsAuthorizer>) -> Self {
        self.ops_authorizer = Some(ops_authorizer);
        self
    }

    pub fn with_identity_client(mut self, identity_client: Arc<dyn IdentityClient>) -> Self {
        self.identity_client = Some(identity_client);
        self
    }
}

/// The authorization engine. Long-lived and shared across requests;
/// [`Authority::auth`] starts one authorization decision over a set of
/// presented macaroon chains.
pub struct Authority {
    p: AuthorityParams,
}

impl Authority {
    pub fn new(p: AuthorityParams) -> Self {
        Self { p }
    }

    /// Begins an authorization with the given presented chains. Chain
    /// order is significant: earlier chains win ties, so callers
    /// should present them in a deterministic order.
    pub fn auth(&self, macaroons: Vec<Slice>) -> AuthChecker<'_> {
        AuthChecker {
            authority: self,
            macaroons,
            init: OnceCell::new(),
        }
    }
}

#[derive(Default)]
struct InitState {
    conditions: Vec<Vec<String>>,
    auth_indexes: BTreeMap<Op, Vec<usize>>,
    init_errors: Vec<BakeryError>,
    login_chains: Vec<bool>,
    identity: Option<Arc<dyn Identity>>,
    identity_index: Option<usize>,
    identity_caveats: Vec<Caveat>,
}

struct Outcome {
    allowed: Vec<bool>,
    used: Vec<bool>,
    op_indexes: BTreeMap<Op, usize>,
    first_error: Option<BakeryError>,
}

/// A single authorization decision: holds the presented chains and the
/// per-chain state computed once on first use.
pub struct AuthChecker<'a> {
    authority: &'a Authority,
    macaroons: Vec<Slice>,
    init: OnceCell<InitState>,
}

impl AuthChecker<'_> {
    fn init(&self, ctx: &Context) -> Result<&InitState> {
        self.init.get_or_try_init(|| self.compute_init(ctx))
    }

    fn compute_init(&self, ctx: &Context) -> Result<InitState> {
        let mut st = InitState::default();
        for (i, ms) in self.macaroons.iter().enumerate() {
            st.login_chains.push(false);
            match self.authority.p.macaroon_verifier.verify_macaroon(ctx, ms) {
                Err(e) if e.is_verification_error() => {
                    debug!(target: "bakkerij::auth", chain = i, error = %e, "chain failed verification");
                    st.init_errors.push(e);
                    st.conditions.push(Vec::new());
                }
                Err(e) => return Err(e),
                Ok((ops, conds)) => {
                    let mut is_login = false;
                    for op in ops {
                        if op.is_login() {
                            is_login = true;
                        } else {
                            st.auth_indexes.entry(op).or_default().push(i);
                        }
                    }
                    if is_login {
                        st.login_chains[i] = true;
                        // The first login chain that checks out wins.
                        if st.identity.is_none() {
                            if let Some(ic) = &self.authority.p.identity_client {
                                match self.login_identity(ctx, ic.as_ref(), &conds) {
                                    Ok(identity) => {
                                        st.identity = Some(identity);
                                        st.identity_index = Some(i);
                                    }
                                    Err(e) => {
                                        debug!(target: "bakkerij::auth", chain = i, error = %e, "login macaroon rejected");
                                        st.init_errors.push(e);
                                    }
                                }
                            }
                        }
                    }
                    st.conditions.push(conds);
                }
            }
        }
        if st.identity.is_none() {
            if let Some(ic) = &self.authority.p.identity_client {
                let (identity, caveats) = ic.identity_from_context(ctx)?;
                st.identity = identity;
                st.identity_caveats = caveats;
            }
        }
        Ok(st)
    }

    fn login_identity(
        &self,
        ctx: &Context,
        ic: &dyn IdentityClient,
        conditions: &[String],
    ) -> Result<Arc<dyn Identity>> {
        let ns = self.authority.p.checker.namespace();
        let declared =
            infer_declared_from_conditions(ns, conditions.iter().map(String::as_str));
        let login_ctx = ctx
            .clone()
            .with_operations([Op::login().action])
            .with_declared(declared.clone());
        for cond in conditions {
            self.authority
                .p
                .checker
                .check_first_party_caveat(&login_ctx, cond)?;
        }
        ic.declared_identity(ctx, &declared)
    }

    fn check_conditions(&self, ctx: &Context, op: &Op, conditions: &[String]) -> Result<()> {
        let ns = self.authority.p.checker.namespace();
        let declared =
            infer_declared_from_conditions(ns, conditions.iter().map(String::as_str));
        let ctx = ctx
            .clone()
            .with_operations([op.action.clone()])
            .with_declared(declared);
        for cond in conditions {
            self.authority.p.checker.check_first_party_caveat(&ctx, cond)?;
        }
        Ok(())
    }

    fn check_ops(&self, ctx: &Context, ops: &[Op]) -> Result<(Outcome, &InitState)> {
        let st = self.init(ctx)?;
        let mut allowed = vec![false; ops.len()];
        let mut used = vec![false; self.macaroons.len()];
        let mut op_indexes = BTreeMap::new();
        let mut errors: Vec<BakeryError> = Vec::new();
        let mut caveats: Vec<Caveat> = Vec::new();

        // Direct phase: the first chain asserting the op whose
        // conditions all check wins, in chain presentation order.
        for (i, op) in ops.iter().enumerate() {
            if op.is_login() {
                if st.identity.is_some() {
                    allowed[i] = true;
                    if let Some(ix) = st.identity_index {
                        used[ix] = true;
                    }
                }
                continue;
            }
            let Some(mindexes) = st.auth_indexes.get(op) else {
                continue;
            };
            for &mi in mindexes {
                match self.check_conditions(ctx, op, &st.conditions[mi]) {
                    Ok(()) => {
                        allowed[i] = true;
                        used[mi] = true;
                        op_indexes.insert(op.clone(), mi);
                        break;
                    }
                    Err(e) => {
                        trace!(target: "bakkerij::auth", chain = mi, op = %op, error = %e, "condition check failed");
                        errors.push(e);
                    }
                }
            }
        }

        if allowed.contains(&false) && st.identity.is_none() && !st.identity_caveats.is_empty() {
            return Err(DischargeRequiredError {
                message: "authentication required".into(),
                ops: vec![Op::login()],
                caveats: st.identity_caveats.clone(),
                for_authentication: true,
            }
            .into());
        }

        // Later phases see the authenticated identity through the
        // context as well as through the authorizer's parameter.
        let auth_ctx = match &st.identity {
            Some(id) => ctx.clone().with_identity(id.clone()),
            None => ctx.clone(),
        };

        // Indirect phase: ask the ops authorizer whether any asserted
        // op implies a still-needed one. Iteration over the asserted
        // ops is in sorted order, so behaviour is reproducible; NoOp
        // is queried first to allow post-hoc grants with no macaroon.
        if let Some(ops_auth) = &self.authority.p.ops_authorizer {
            let no_op = Op::no_op();
            for auth_op in std::iter::once(&no_op).chain(st.auth_indexes.keys()) {
                let still: Vec<usize> = (0..ops.len()).filter(|&i| !allowed[i]).collect();
                if still.is_empty() {
                    break;
                }
                let queried: Vec<Op> = still.iter().map(|&i| ops[i].clone()).collect();
                let (oks, cavs) = ops_auth.authorize_ops(&auth_ctx, auth_op, &queried)?;
                caveats.extend(cavs);
                for (j, ok) in oks.iter().enumerate() {
                    if !ok {
                        continue;
                    }
                    let i = still[j];
                    if auth_op.is_no_op() {
                        allowed[i] = true;
                        continue;
                    }
                    for &mi in &st.auth_indexes[auth_op] {
                        match self.check_conditions(ctx, &ops[i], &st.conditions[mi]) {
                            Ok(()) => {
                                allowed[i] = true;
                                used[mi] = true;
                                op_indexes.insert(ops[i].clone(), mi);
                                break;
                            }
                            Err(e) => errors.push(e),
                        }
                    }
                }
            }
        }

        // Authorizer phase: whatever remains goes to the external
        // authorizer, identity or not.
        let still: Vec<usize> = (0..ops.len()).filter(|&i| !allowed[i]).collect();
        if !still.is_empty() {
            let queried: Vec<Op> = still.iter().map(|&i| ops[i].clone()).collect();
            let (oks, cavs) =
                self.authority
                    .p
                    .authorizer
                    .authorize(&auth_ctx, st.identity.as_ref(), &queried)?;
            caveats.extend(cavs);
            let mut granted = false;
            for (j, ok) in oks.iter().enumerate() {
                if *ok {
                    allowed[still[j]] = true;
                    granted = true;
                }
            }
            // A grant that relied on a macaroon-provided identity
            // marks the login chain as used.
            if granted && st.identity.is_some() {
                if let Some(ix) = st.identity_index {
                    used[ix] = true;
                }
            }
        }

        if !caveats.is_empty() {
            return Err(DischargeRequiredError::new(
                "some operations have extra caveats",
                ops.to_vec(),
                caveats,
            )
            .into());
        }

        let first_error = st
            .init_errors
            .first()
            .cloned()
            .or_else(|| errors.into_iter().next());
        Ok((
            Outcome {
                allowed,
                used,
                op_indexes,
                first_error,
            },
            st,
        ))
    }

    fn auth_info(&self, st: &InitState, used: Vec<bool>, op_indexes: BTreeMap<Op, usize>) -> AuthInfo {
        let ns = self.authority.p.checker.namespace();
        let prefix = ns.resolve(STD_NAMESPACE).unwrap_or("");
        AuthInfo {
            identity: st.identity.clone(),
            macaroons: self.macaroons.clone(),
            used,
            op_indexes,
            conditions: st.conditions.clone(),
            login_chains: st.login_chains.clone(),
            declared_condition: condition_with_prefix(prefix, COND_DECLARED),
        }
    }

    /// Authorizes all of `ops`, or fails. The returned [`AuthInfo`]
    /// records which chains were used and which chain authorized each
    /// op.
    pub fn allow(&self, ctx: &Context, ops: &[Op]) -> Result<AuthInfo> {
        let (outcome, st) = self.check_ops(ctx, ops)?;
        if let Some(i) = outcome.allowed.iter().position(|&a| !a) {
            let cause = match outcome.first_error {
                Some(e) => e.to_string(),
                None => format!("no authorization for operation {}", ops[i]),
            };
            debug!(target: "bakkerij::auth", op = %ops[i], cause = %cause, "permission denied");
            return Err(BakeryError::PermissionDenied(cause));
        }
        Ok(self.auth_info(st, outcome.used, outcome.op_indexes))
    }

    /// Authorizes as many of `ops` as possible, returning per-op
    /// results alongside the [`AuthInfo`] for the authorized subset.
    /// Only fatal failures and discharge-required conditions error.
    pub fn allow_any(&self, ctx: &Context, ops: &[Op]) -> Result<(AuthInfo, Vec<bool>)> {
        let (outcome, st) = self.check_ops(ctx, ops)?;
        Ok((
            self.auth_info(st, outcome.used, outcome.op_indexes),
            outcome.allowed,
        ))
    }

    /// Enumerates every operation the presented chains authorize in
    /// this context, without a requested list. Iteration over asserted
    /// ops is sorted, so the result is reproducible.
    pub fn allowed(&self, ctx: &Context) -> Result<AuthInfo> {
        let st = self.init(ctx)?;
        let mut used = vec![false; self.macaroons.len()];
        let mut op_indexes = BTreeMap::new();
        for (op, mindexes) in &st.auth_indexes {
            for &mi in mindexes {
                if self.check_conditions(ctx, op, &st.conditions[mi]).is_ok() {
                    used[mi] = true;
                    op_indexes.insert(op.clone(), mi);
                    break;
                }
            }
        }
        Ok(self.auth_info(st, used, op_indexes))
    }

    /// Authorizes all of `ops` and returns the minimal first-party
    /// condition set a fresh capability macaroon for those ops must
    /// carry.
    pub fn allow_capability(&self, ctx: &Context, ops: &[Op]) -> Result<Vec<String>> {
        if ops.is_empty() {
            return Err(BakeryError::InvalidFormat(
                "no operations required in capability".into(),
            ));
        }
        let info = self.allow(ctx, ops)?;
        Ok(info.conditions())
    }
}

/// The result of a successful authorization.
pub struct AuthInfo {
    /// The authenticated identity, if any.
    pub identity: Option<Arc<dyn Identity>>,

    /// All presented chains.
    pub macaroons: Vec<Slice>,

    /// Which chains contributed to the decision, parallel to
    /// `macaroons`.
    pub used: Vec<bool>,

    /// For each authorized op, the index of the chain that authorized
    /// it directly.
    pub op_indexes: BTreeMap<Op, usize>,

    conditions: Vec<Vec<String>>,
    login_chains: Vec<bool>,
    declared_condition: String,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("identity", &self.identity.as_ref().map(|i| i.id().to_string()))
            .field("macaroons_len", &self.macaroons.len())
            .field("used", &self.used)
            .field("op_indexes", &self.op_indexes)
            .field("conditions", &self.conditions)
            .field("login_chains", &self.login_chains)
            .field("declared_condition", &self.declared_condition)
            .finish()
    }
}

impl AuthInfo {
    /// The squashed first-party conditions of the used chains,
    /// suitable for minting a forwarded capability. Identity
    /// declarations are stripped from login chains only; other chains
    /// keep their `declared` restrictions verbatim.
    pub fn conditions(&self) -> Vec<String> {
        let mut conds: Vec<String> = Vec::new();
        for (i, used) in self.used.iter().enumerate() {
            if !used {
                continue;
            }
            for cond in &self.conditions[i] {
                if self.login_chains[i] {
                    if let Ok((name, _)) = parse_caveat(cond) {
                        if name == self.declared_condition {
                            continue;
                        }
                    }
                }
                conds.push(cond.clone());
            }
        }
        squash_conditions(&conds)
    }
}
