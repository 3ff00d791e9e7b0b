use std::sync::Arc;

use bakkerij::auth::{Authority, AuthorityParams};
use bakkerij::checker::{Checker, Context};
use bakkerij::codec::ThirdPartyCaveatInfo;
use bakkerij::discharge::{
    DischargeParams, ThirdPartyCaveatCheckerFunc, discharge, discharge_all,
};
use bakkerij::keys::{ThirdPartyInfo, ThirdPartyStore};
use bakkerij::op::Op;
use bakkerij::store::MemoryKeyStore;
use bakkerij::{BakeryError, Caveat, KeyPair, Oven, Slice, Version};

fn main() {
    println!("=== Third-Party Caveats and Discharge Macaroons ===\n");

    // The target service trusts an external authentication service.
    let as_key = KeyPair::generate();
    let locator = Arc::new(ThirdPartyStore::new());
    locator.add_info(
        "https://auth.example.com",
        ThirdPartyInfo {
            public_key: as_key.public,
            version: Version::V3,
        },
    );

    let checker = Arc::new(Checker::new());
    let oven = Arc::new(
        Oven::new(Arc::new(MemoryKeyStore::new()))
            .with_location("https://api.example.com")
            .with_key(KeyPair::generate())
            .with_locator(locator)
            .with_namespace(checker.namespace().clone()),
    );
    let authority = Authority::new(AuthorityParams::new(checker, oven.clone()));

    // Step 1: mint with a third-party caveat naming the auth service.
    let ctx = Context::new();
    let m = oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[Caveat::third_party(
                "https://auth.example.com",
                "user == bob",
            )],
            &[Op::new("doc-report", "read")],
        )
        .unwrap();
    println!("1. Minted macaroon with third-party caveat at auth.example.com");

    // Step 2: presenting it without a discharge fails.
    match authority
        .auth(vec![Slice::new(vec![m.clone()])])
        .allow(&ctx, &[Op::new("doc-report", "read")])
    {
        Err(e) => println!("\n2. Without discharge, correctly rejected: {e}"),
        Ok(_) => println!("\n2. Unexpectedly authorized!"),
    }

    // Step 3: the auth service only discharges the bob predicate.
    let as_checker =
        ThirdPartyCaveatCheckerFunc::new(|_: &Context, info: &ThirdPartyCaveatInfo| {
            if info.condition == "user == bob" {
                Ok(Vec::new())
            } else {
                Err(BakeryError::PermissionDenied(format!(
                    "will not discharge {:?}",
                    info.condition
                )))
            }
        });
    let slice = discharge_all(&ctx, &m, &mut |ctx, cav, payload| {
        println!(
            "   auth service asked to discharge caveat at {:?}",
            cav.location.as_deref().unwrap_or("")
        );
        discharge(
            ctx,
            DischargeParams {
                id: &cav.id,
                caveat: payload,
                key: &as_key,
                checker: &as_checker,
                locator: None,
            },
        )
    })
    .unwrap();
    println!("\n3. Acquired and bound {} discharge(s)", slice.len() - 1);

    // Step 4: the bundle authorizes.
    let info = authority
        .auth(vec![slice])
        .allow(&ctx, &[Op::new("doc-report", "read")])
        .unwrap();
    println!("\n4. Authorized doc-report:read, used = {:?}", info.used);
}
