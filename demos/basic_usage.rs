use std::sync::Arc;

use bakkerij::auth::{Authority, AuthorityParams};
use bakkerij::caveat::time_before_caveat;
use bakkerij::checker::{Checker, Context};
use bakkerij::op::Op;
use bakkerij::store::MemoryKeyStore;
use bakkerij::{BakeryError, Slice, Version};
use chrono::{Duration, Utc};

fn main() {
    println!("=== Bakkerij Basic Usage ===\n");

    // Step 1: set up the service: a condition checker and an oven
    // sharing its namespace.
    let checker = Arc::new(Checker::new());
    let oven = Arc::new(
        bakkerij::Oven::new(Arc::new(MemoryKeyStore::new()))
            .with_location("https://api.example.com")
            .with_namespace(checker.namespace().clone()),
    );
    let authority = Authority::new(AuthorityParams::new(checker, oven.clone()));

    // Step 2: mint a macaroon authorizing two operations, valid for an
    // hour.
    let ctx = Context::new();
    let ops = [Op::new("doc-trip", "read"), Op::new("doc-trip", "write")];
    let m = oven
        .new_macaroon(
            &ctx,
            Version::LATEST,
            &[time_before_caveat(Utc::now() + Duration::hours(1))],
            &ops,
        )
        .unwrap();
    println!("1. Minted macaroon for {} operations", ops.len());

    // Step 3: serialize for transport.
    let wire = m.to_base64().unwrap();
    println!("\n2. Wire form ({} bytes): {}...", wire.len(), &wire[..40]);

    // Step 4: the client presents it back; the authority decides.
    let presented = bakkerij::Macaroon::from_base64(&wire).unwrap();
    let info = authority
        .auth(vec![Slice::new(vec![presented.clone()])])
        .allow(&ctx, &[Op::new("doc-trip", "read")])
        .unwrap();
    println!("\n3. Authorized doc-trip:read, used = {:?}", info.used);

    // Step 5: an operation the macaroon does not assert is denied.
    match authority
        .auth(vec![Slice::new(vec![presented])])
        .allow(&ctx, &[Op::new("doc-trip", "delete")])
    {
        Err(BakeryError::PermissionDenied(cause)) => {
            println!("\n4. doc-trip:delete correctly denied: {cause}")
        }
        other => println!("\n4. unexpected outcome: {other:?}"),
    }
}
