use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::caveat::{
    COND_ALLOW, COND_DECLARED, COND_DENY, COND_ERROR, COND_TIME_BEFORE, parse_caveat,
};
use crate::identity::Identity;
use crate::macaroon::Slice;
use crate::namespace::{Namespace, STD_NAMESPACE, condition_with_prefix};
use crate::{BakeryError, Result};

/// A source of the current time, injectable for testing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock; the default when none is injected.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Ambient per-request state consulted by caveat checkers: the clock,
/// the declared-attribute map, the actions of the operations being
/// authorized and the authenticated identity, if any.
#[derive(Clone, Default)]
pub struct Context {
    clock: Option<Arc<dyn Clock>>,
    declared: BTreeMap<String, String>,
    operations: Vec<String>,
    identity: Option<Arc<dyn Identity>>,
    values: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_declared(mut self, declared: BTreeMap<String, String>) -> Self {
        self.declared = declared;
        self
    }

    pub fn with_operations<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attaches an arbitrary named value for custom condition checkers
    /// to consult.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock.now(),
            None => Utc::now(),
        }
    }

    pub fn declared(&self) -> &BTreeMap<String, String> {
        &self.declared
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn identity(&self) -> Option<&Arc<dyn Identity>> {
        self.identity.as_ref()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Checks a single first-party caveat condition against a request
/// context.
pub trait FirstPartyCaveatChecker: Send + Sync {
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<()>;

    /// The namespace conditions are resolved in.
    fn namespace(&self) -> &Namespace;
}

type CheckFn = Box<dyn Fn(&Context, &str, &str) -> std::result::Result<(), String> + Send + Sync>;

struct CheckerEntry {
    ns_uri: String,
    name: String,
    prefix: String,
    check: CheckFn,
}

/// Identifies a registered condition checker, for discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckerInfo {
    pub namespace: String,
    pub name: String,
    pub prefix: String,
}

/// A registry of first-party condition checkers keyed by prefixed
/// condition name, with the namespace binding schema URIs to prefixes.
///
/// All registration must happen during setup, before the checker is
/// shared across requests.
pub struct Checker {
    ns: Namespace,
    checkers: HashMap<String, CheckerEntry>,
    fallback: Option<Arc<dyn FirstPartyCaveatChecker>>,
}

impl Checker {
    /// A checker with the standard namespace and the standard
    /// conditions (`time-before`, `declared`, `allow`, `deny`,
    /// `error`) registered.
    pub fn new() -> Self {
        let mut c = Self {
            ns: Namespace::std(),
            checkers: HashMap::new(),
            fallback: None,
        };
        c.register_std();
        c
    }

    /// Delegates conditions this checker does not recognize to
    /// `fallback` instead of failing them.
    pub fn with_fallback(mut self, fallback: Arc<dyn FirstPartyCaveatChecker>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Registers a schema URI under a prefix so conditions can be
    /// registered against it.
    pub fn register_namespace(&mut self, uri: &str, prefix: &str) {
        self.ns.register(uri, prefix);
    }

    /// Registers a condition checker for `name` in the schema `ns_uri`.
    ///
    /// The check function receives the context, the full (prefixed)
    /// condition name and the argument, and reports failure as a
    /// human-readable reason.
    ///
    /// # Panics
    /// Panics when the namespace has no registered prefix or the
    /// prefixed condition is already registered; both are setup bugs.
    pub fn register<F>(&mut self, name: &str, ns_uri: &str, check: F)
    where
        F: Fn(&Context, &str, &str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let Some(prefix) = self.ns.resolve(ns_uri) else {
            panic!("no prefix registered for namespace {ns_uri:?} when registering {name:?}");
        };
        let prefix = prefix.to_string();
        let full_name = condition_with_prefix(&prefix, name);
        if let Some(old) = self.checkers.get(&full_name) {
            panic!(
                "checker for {full_name:?} already registered in namespace {:?}",
                old.ns_uri
            );
        }
        self.checkers.insert(
            full_name,
            CheckerEntry {
                ns_uri: ns_uri.to_string(),
                name: name.to_string(),
                prefix,
                check: Box::new(check),
            },
        );
    }

    /// Enumerates registered checkers sorted by `(namespace, name)`.
    pub fn info(&self) -> Vec<CheckerInfo> {
        let mut infos: Vec<CheckerInfo> = self
            .checkers
            .values()
            .map(|e| CheckerInfo {
                namespace: e.ns_uri.clone(),
                name: e.name.clone(),
                prefix: e.prefix.clone(),
            })
            .collect();
        infos.sort();
        infos
    }

    fn register_std(&mut self) {
        self.register(COND_TIME_BEFORE, STD_NAMESPACE, check_time_before);
        self.register(COND_DECLARED, STD_NAMESPACE, check_declared);
        self.register(COND_ALLOW, STD_NAMESPACE, |ctx, _, arg| {
            check_operations(ctx, true, arg)
        });
        self.register(COND_DENY, STD_NAMESPACE, |ctx, _, arg| {
            check_operations(ctx, false, arg)
        });
        self.register(COND_ERROR, STD_NAMESPACE, |_, _, arg| Err(arg.to_string()));
    }
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl FirstPartyCaveatChecker for Checker {
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<()> {
        let (name, arg) = parse_caveat(caveat).map_err(|e| BakeryError::CaveatNotSatisfied {
            caveat: caveat.to_string(),
            reason: e.to_string(),
        })?;
        match self.checkers.get(name) {
            Some(entry) => {
                (entry.check)(ctx, name, arg).map_err(|reason| BakeryError::CaveatNotSatisfied {
                    caveat: caveat.to_string(),
                    reason,
                })
            }
            None => match &self.fallback {
                Some(fallback) => fallback.check_first_party_caveat(ctx, caveat),
                None => Err(BakeryError::CaveatNotRecognized(caveat.to_string())),
            },
        }
    }

    fn namespace(&self) -> &Namespace {
        &self.ns
    }
}

fn check_time_before(ctx: &Context, _name: &str, arg: &str) -> std::result::Result<(), String> {
    let t = DateTime::parse_from_rfc3339(arg)
        .map_err(|e| format!("cannot parse time: {e}"))?
        .with_timezone(&Utc);
    if ctx.now() < t {
        Ok(())
    } else {
        Err("macaroon has expired".to_string())
    }
}

fn check_declared(ctx: &Context, _name: &str, arg: &str) -> std::result::Result<(), String> {
    let (attr, want) = arg
        .split_once(' ')
        .ok_or_else(|| format!("{COND_DECLARED} caveat has no value"))?;
    match ctx.declared().get(attr) {
        Some(got) if got == want => Ok(()),
        Some(got) => Err(format!("got {attr}={got:?}, expected {want:?}")),
        None => Err(format!("got {attr}=null, expected {want:?}")),
    }
}

fn check_operations(ctx: &Context, allow: bool, arg: &str) -> std::result::Result<(), String> {
    let listed: Vec<&str> = arg.split_whitespace().collect();
    if listed.is_empty() {
        return Err("no operations allowed".to_string());
    }
    // Vacuously true when the context carries no operations.
    for action in ctx.operations() {
        let found = listed.iter().any(|l| l == action);
        if found != allow {
            return Err(format!("{action} not allowed"));
        }
    }
    Ok(())
}

/// Walks every resolved first-party caveat in the presented chains and
/// collects `declared` attributes whose value is unique across all of
/// them. An attribute declared with two different values is discarded
/// entirely, so extra caveats cannot smuggle in declarations.
pub fn infer_declared(ns: &Namespace, slices: &[Slice]) -> BTreeMap<String, String> {
    let conditions = slices
        .iter()
        .flat_map(|s| s.iter())
        .flat_map(|m| m.raw().caveats())
        .filter(|cav| !cav.is_third_party())
        .filter_map(|cav| std::str::from_utf8(&cav.id).ok());
    infer_declared_from_conditions(ns, conditions)
}

/// As [`infer_declared`], over an explicit list of resolved conditions.
pub fn infer_declared_from_conditions<'a, I>(ns: &Namespace, conditions: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = ns.resolve(STD_NAMESPACE).unwrap_or("");
    let declared_name = condition_with_prefix(prefix, COND_DECLARED);

    let mut out = BTreeMap::new();
    let mut conflicted = BTreeSet::new();
    for cond in conditions {
        let Ok((name, arg)) = parse_caveat(cond) else {
            continue;
        };
        if name != declared_name {
            continue;
        }
        let Some((attr, value)) = arg.split_once(' ') else {
            continue;
        };
        if conflicted.contains(attr) {
            continue;
        }
        match out.get(attr) {
            None => {
                out.insert(attr.to_string(), value.to_string());
            }
            Some(existing) if existing != value => {
                out.remove(attr);
                conflicted.insert(attr.to_string());
            }
            Some(_) => {}
        }
    }
    out
}
