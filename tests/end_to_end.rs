//! Full service-to-service scenarios: minting, delegation, discharge,
//! authentication and capability forwarding across first, third and
//! forwarding parties.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use bakkerij::auth::{Authority, AuthorityParams, OpsAuthorizer};
use bakkerij::caveat::{declared_caveat, time_before_caveat};
use bakkerij::checker::{Checker, Context, FixedClock, infer_declared_from_conditions};
use bakkerij::codec::ThirdPartyCaveatInfo;
use bakkerij::discharge::{
    DischargeParams, ThirdPartyCaveatChecker, ThirdPartyCaveatCheckerFunc, discharge,
    discharge_all,
};
use bakkerij::identity::{ACLAuthorizer, Identity, IdentityClient, SimpleIdentity};
use bakkerij::keys::{ThirdPartyInfo, ThirdPartyStore};
use bakkerij::op::Op;
use bakkerij::store::MemoryKeyStore;
use bakkerij::{BakeryError, Caveat, KeyPair, Oven, Result, Slice, Version};

/// One service: an oven, a condition checker and the authority built
/// over them.
struct Service {
    oven: Arc<Oven>,
    checker: Arc<Checker>,
    locator: Arc<ThirdPartyStore>,
}

impl Service {
    fn new(location: &str) -> Self {
        let mut checker = Checker::new();
        checker.register_namespace("testns", "");
        checker.register("str", "testns", |ctx: &Context, _: &str, arg: &str| {
            match ctx.value("str") {
                Some(v) if v == arg => Ok(()),
                Some(v) => Err(format!("got {v:?}, expected {arg:?}")),
                None => Err("no str in context".to_string()),
            }
        });
        checker.register("true", "testns", |_: &Context, _: &str, _: &str| Ok(()));

        let locator = Arc::new(ThirdPartyStore::allowing_insecure());
        let oven = Oven::new(Arc::new(MemoryKeyStore::new()))
            .with_location(location)
            .with_key(KeyPair::generate())
            .with_locator(locator.clone())
            .with_namespace(checker.namespace().clone());
        Service {
            oven: Arc::new(oven),
            checker: Arc::new(checker),
            locator,
        }
    }

    fn authority(&self) -> Authority {
        Authority::new(AuthorityParams::new(self.checker.clone(), self.oven.clone()))
    }

    fn trust(&self, location: &str, key: &KeyPair, version: Version) {
        self.locator.add_info(
            location,
            ThirdPartyInfo {
                public_key: key.public,
                version,
            },
        );
    }
}

fn simple_discharger<'a>(
    key: &'a KeyPair,
    checker: &'a dyn ThirdPartyCaveatChecker,
) -> impl FnMut(&Context, &bakkerij::raw::RawCaveat, Option<&[u8]>) -> Result<bakkerij::Macaroon> + 'a
{
    move |ctx, cav, payload| {
        discharge(
            ctx,
            DischargeParams {
                id: &cav.id,
                caveat: payload,
                key,
                checker,
                locator: None,
            },
        )
    }
}

// Single-service authorization on a first-party caveat checked against
// request context.
#[test]
fn test_single_service_first_party() {
    let ts = Service::new("https://ts.example.com");
    let authority = ts.authority();

    let m = ts
        .oven
        .new_macaroon(
            &Context::new(),
            Version::LATEST,
            &[Caveat::first_party("testns", "str something")],
            &[Op::new("doc", "read")],
        )
        .unwrap();
    let ms = Slice::new(vec![m]);

    let ok_ctx = Context::new().with_value("str", "something");
    let info = authority
        .auth(vec![ms.clone()])
        .allow(&ok_ctx, &[Op::new("doc", "read")])
        .unwrap();
    assert_eq!(info.used, vec![true]);

    let bad_ctx = Context::new().with_value("str", "other");
    let err = authority
        .auth(vec![ms])
        .allow(&bad_ctx, &[Op::new("doc", "read")])
        .unwrap_err();
    assert!(matches!(err, BakeryError::PermissionDenied(_)));
}

// The fig. 6 delegation scenario from the macaroons paper: a target
// service's macaroon is attenuated by a forwarding service with a
// third-party authentication caveat, discharged at the auth service.
#[test]
fn test_delegated_third_party_discharge() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);

    // ts mints for the client; fs attenuates before handing it on.
    let ctx = Context::new();
    let mut m = ts
        .oven
        .new_macaroon(&ctx, Version::LATEST, &[], &[Op::new("basic", "basic")])
        .unwrap();
    let fs_key = KeyPair::generate();
    m.add_caveat(
        &ctx,
        &Caveat::third_party("as-loc", "user == bob"),
        Some(&fs_key),
        Some(ts.locator.as_ref()),
    )
    .unwrap();

    let checker = ThirdPartyCaveatCheckerFunc::new(|_: &Context, info: &ThirdPartyCaveatInfo| {
        if info.condition == "user == bob" {
            Ok(Vec::new())
        } else {
            Err(BakeryError::PermissionDenied(format!(
                "unknown condition {:?}",
                info.condition
            )))
        }
    });
    let slice = discharge_all(&ctx, &m, &mut simple_discharger(&as_key, &checker)).unwrap();
    assert_eq!(slice.len(), 2);

    let info = ts
        .authority()
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("basic", "basic")])
        .unwrap();
    assert_eq!(info.used, vec![true]);
}

// Rebinding the discharges against a different signature must surface
// as a binding failure.
#[test]
fn test_tampered_binding_detected() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);

    let ctx = Context::new();
    let m = ts
        .oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[Caveat::third_party("as-loc", "user == bob")],
            &[Op::new("basic", "basic")],
        )
        .unwrap();

    let checker =
        ThirdPartyCaveatCheckerFunc::new(|_: &Context, _: &ThirdPartyCaveatInfo| Ok(Vec::new()));
    let mut slice = discharge_all(&ctx, &m, &mut simple_discharger(&as_key, &checker)).unwrap();

    for d in &mut slice[1..] {
        d.bind_to(b"tampered");
    }

    let err = ts
        .authority()
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("basic", "basic")])
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("signature mismatch after caveat verification")
    );
}

// Capability squashing: the earliest time-before wins and other
// conditions are preserved.
#[test]
fn test_capability_squashing_earliest_time_wins() {
    let ts = Service::new("https://ts.example.com");
    let authority = ts.authority();

    let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let ctx = Context::new().with_clock(Arc::new(FixedClock(now)));

    let m = ts
        .oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[
                time_before_caveat(now + Duration::hours(24)),
                Caveat::first_party("testns", "true 1"),
                time_before_caveat(now + Duration::hours(1)),
                time_before_caveat(now + Duration::minutes(5)),
            ],
            &[Op::new("doc", "read")],
        )
        .unwrap();

    let conds = authority
        .auth(vec![Slice::new(vec![m])])
        .allow_capability(&ctx, &[Op::new("doc", "read")])
        .unwrap();
    assert_eq!(
        conds,
        vec![
            "time-before 2030-01-01T00:05:00.000000000Z".to_string(),
            "true 1".to_string(),
        ]
    );
}

struct HierarchicalOpsAuthorizer;

impl OpsAuthorizer for HierarchicalOpsAuthorizer {
    fn authorize_ops(
        &self,
        _ctx: &Context,
        authorized_op: &Op,
        queried: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)> {
        let allowed = queried
            .iter()
            .map(|q| {
                !authorized_op.is_no_op()
                    && q.entity.starts_with(&format!("{}/", authorized_op.entity))
                    && (authorized_op.action == "*" || authorized_op.action == q.action)
            })
            .collect();
        Ok((allowed, Vec::new()))
    }
}

// A grant on a parent path implies grants on its children.
#[test]
fn test_hierarchical_ops_authorizer() {
    let ts = Service::new("https://ts.example.com");
    let authority = Authority::new(
        AuthorityParams::new(ts.checker.clone(), ts.oven.clone())
            .with_ops_authorizer(Arc::new(HierarchicalOpsAuthorizer)),
    );

    let ctx = Context::new();
    let ms = Slice::new(vec![
        ts.oven
            .new_macaroon(&ctx, Version::LATEST, &[], &[Op::new("path-/user/bob", "*")])
            .unwrap(),
    ]);

    let info = authority
        .auth(vec![ms.clone()])
        .allow(&ctx, &[Op::new("path-/user/bob/foo", "write")])
        .unwrap();
    assert_eq!(info.used, vec![true]);

    let err = authority
        .auth(vec![ms])
        .allow(&ctx, &[Op::new("path-/user/alice", "write")])
        .unwrap_err();
    assert!(matches!(err, BakeryError::PermissionDenied(_)));
}

/// Test identity plumbing: identities are declared `username`
/// attributes, authentication is delegated to `as-loc`.
struct TestIdentityClient;

impl IdentityClient for TestIdentityClient {
    fn identity_from_context(
        &self,
        _ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>)> {
        Ok((
            None,
            vec![Caveat::third_party("as-loc", "is-authenticated-user")],
        ))
    }

    fn declared_identity(
        &self,
        _ctx: &Context,
        declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>> {
        let username = declared.get("username").ok_or_else(|| {
            BakeryError::PermissionDenied("no username declared".to_string())
        })?;
        Ok(Arc::new(SimpleIdentity::new(username.clone())))
    }
}

fn identity_authority(ts: &Service, acl: &'static [&'static str]) -> Authority {
    Authority::new(
        AuthorityParams::new(ts.checker.clone(), ts.oven.clone())
            .with_identity_client(Arc::new(TestIdentityClient))
            .with_authorizer(Arc::new(ACLAuthorizer::new(|_, _| {
                Ok((acl.iter().map(|s| s.to_string()).collect(), false))
            }))),
    )
}

fn login_discharger(username: &'static str) -> impl ThirdPartyCaveatChecker {
    ThirdPartyCaveatCheckerFunc::new(move |_: &Context, info: &ThirdPartyCaveatInfo| {
        if info.condition == "is-authenticated-user" {
            Ok(vec![declared_caveat("username", username)])
        } else {
            Err(BakeryError::PermissionDenied(format!(
                "unknown condition {:?}",
                info.condition
            )))
        }
    })
}

// The full authentication loop: discharge-required, login-macaroon
// minting, identity discharge, authenticated retry through the ACL.
#[test]
fn test_authentication_flow() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);
    let authority = identity_authority(&ts, &["bob"]);

    let ctx = Context::new();

    // No macaroons: the engine demands authentication.
    let err = authority
        .auth(vec![])
        .allow(&ctx, &[Op::new("doc", "read")])
        .unwrap_err();
    let BakeryError::DischargeRequired(dr) = err else {
        panic!("expected discharge-required, got something else");
    };
    assert!(dr.for_authentication);
    assert_eq!(dr.ops, vec![Op::login()]);
    assert_eq!(dr.caveats.len(), 1);

    // The server mints a login macaroon carrying the identity caveats.
    let login_m = ts
        .oven
        .new_macaroon(&ctx, Version::LATEST, &dr.caveats, &[Op::login()])
        .unwrap();

    // The client discharges at the authentication service.
    let checker = login_discharger("bob");
    let slice = discharge_all(&ctx, &login_m, &mut simple_discharger(&as_key, &checker)).unwrap();

    // The retry authenticates and passes the ACL.
    let info = authority
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("doc", "read")])
        .unwrap();
    assert_eq!(info.identity.as_ref().unwrap().id(), "bob");
    assert_eq!(info.used, vec![true]);

    // A different user fails the same ACL.
    let authority_alice_only = identity_authority(&ts, &["alice"]);
    let checker = login_discharger("carol");
    let slice =
        discharge_all(&ctx, &login_m, &mut simple_discharger(&as_key, &checker)).unwrap();
    let err = authority_alice_only
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("doc", "read")])
        .unwrap_err();
    assert!(matches!(err, BakeryError::PermissionDenied(_)));
}

// Duplicate login macaroons: the first presented chain that
// authenticates wins, and exactly one macaroon is marked used.
#[test]
fn test_duplicate_login_macaroons() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);
    let authority = identity_authority(&ts, &["bob", "alice"]);

    let ctx = Context::new();
    let login_for = |username: &'static str| -> Slice {
        let m = ts
            .oven
            .new_macaroon(
                &ctx,
                Version::LATEST,
                &[declared_caveat("username", username)],
                &[Op::login()],
            )
            .unwrap();
        Slice::new(vec![m])
    };

    // Presented in cookie order 1.bob, 2.alice: bob wins.
    let info = authority
        .auth(vec![login_for("bob"), login_for("alice")])
        .allow(&ctx, &[Op::login()])
        .unwrap();
    assert_eq!(info.identity.as_ref().unwrap().id(), "bob");
    assert_eq!(info.used, vec![true, false]);

    // Swapped order: alice wins.
    let info = authority
        .auth(vec![login_for("alice"), login_for("bob")])
        .allow(&ctx, &[Op::login()])
        .unwrap();
    assert_eq!(info.identity.as_ref().unwrap().id(), "alice");
    assert_eq!(info.used, vec![true, false]);
}

// Conditions stripped for capabilities: declared comes off login
// chains but stays on plain chains.
#[test]
fn test_capability_strips_login_declarations_only() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);
    let authority = identity_authority(&ts, &["bob"]);

    let ctx = Context::new();
    let login_m = ts
        .oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[declared_caveat("username", "bob")],
            &[Op::login()],
        )
        .unwrap();

    let conds = authority
        .auth(vec![Slice::new(vec![login_m])])
        .allow_capability(&ctx, &[Op::new("doc", "read"), Op::login()])
        .unwrap();
    assert!(conds.is_empty(), "login declarations must be stripped, got {conds:?}");
}

// Declarations inferred across chains: a conflict between two
// presented macaroons removes the attribute.
#[test]
fn test_infer_declared_across_chains() {
    let ts = Service::new("https://ts.example.com");
    let ctx = Context::new();
    let mint = |cavs: &[Caveat]| -> Slice {
        Slice::new(vec![
            ts.oven
                .new_macaroon(&ctx, Version::LATEST, cavs, &[Op::new("doc", "read")])
                .unwrap(),
        ])
    };
    let a = mint(&[declared_caveat("user", "bob"), declared_caveat("group", "dev")]);
    let b = mint(&[declared_caveat("user", "alice")]);

    let conditions: Vec<String> = [&a, &b]
        .iter()
        .flat_map(|s| s.iter())
        .flat_map(|m| m.raw().caveats())
        .filter_map(|cav| std::str::from_utf8(&cav.id).ok().map(str::to_string))
        .collect();
    let declared = infer_declared_from_conditions(
        ts.checker.namespace(),
        conditions.iter().map(String::as_str),
    );
    assert!(!declared.contains_key("user"));
    assert_eq!(declared.get("group").map(String::as_str), Some("dev"));
}

// Wire transport: a V3 slice survives the JSON envelope, and the
// authorization still passes afterwards.
#[test]
fn test_slice_survives_wire_roundtrip() {
    let ts = Service::new("https://ts.example.com");
    let as_key = KeyPair::generate();
    ts.trust("as-loc", &as_key, Version::V3);

    let ctx = Context::new();
    let m = ts
        .oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[Caveat::third_party("as-loc", "user == bob")],
            &[Op::new("doc", "read")],
        )
        .unwrap();

    let checker =
        ThirdPartyCaveatCheckerFunc::new(|_: &Context, _: &ThirdPartyCaveatInfo| Ok(Vec::new()));
    let slice = discharge_all(&ctx, &m, &mut simple_discharger(&as_key, &checker)).unwrap();

    let json = serde_json::to_string(&slice).unwrap();
    let slice: Slice = serde_json::from_str(&json).unwrap();

    ts.authority()
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("doc", "read")])
        .unwrap();
}
