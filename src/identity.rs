use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::auth::Authorizer;
use crate::caveat::Caveat;
use crate::checker::Context;
use crate::op::Op;

/// ACL entry granting access to any client, authenticated or not.
pub const EVERYONE: &str = "everyone";

/// An authenticated client.
pub trait Identity: Send + Sync {
    /// The identity's name, unique within its domain.
    fn id(&self) -> &str;

    /// The domain the identity was authenticated in; empty when
    /// domains are not in use.
    fn domain(&self) -> &str {
        ""
    }

    /// Whether this identity is a member of any ACL entry. The default
    /// grants only the [`EVERYONE`] entry; identities with richer
    /// membership (users in groups) override this.
    fn allow(&self, _ctx: &Context, acl: &[String]) -> Result<bool> {
        Ok(acl.iter().any(|a| a == EVERYONE))
    }
}

/// An identity that is just a name: a member of its own ACL entry and
/// of [`EVERYONE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleIdentity {
    user: String,
}

impl SimpleIdentity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Identity for SimpleIdentity {
    fn id(&self) -> &str {
        &self.user
    }

    fn allow(&self, _ctx: &Context, acl: &[String]) -> Result<bool> {
        Ok(acl.iter().any(|a| a == &self.user || a == EVERYONE))
    }
}

/// Bridges the authorization engine to an identity provider.
pub trait IdentityClient: Send + Sync {
    /// Derives an identity from ambient request state (for example
    /// basic-auth credentials), or returns the third-party caveats
    /// that, once discharged, will authenticate the client.
    fn identity_from_context(
        &self,
        ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>)>;

    /// Builds an identity from the attributes declared by a verified
    /// login macaroon.
    fn declared_identity(
        &self,
        ctx: &Context,
        declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>>;
}

/// Grants an operation when the identity is a member of the
/// operation's ACL, or, for unauthenticated clients, when the ACL is
/// explicitly public.
pub struct ACLAuthorizer {
    #[allow(clippy::type_complexity)]
    get_acl: Box<dyn Fn(&Context, &Op) -> Result<(Vec<String>, bool)> + Send + Sync>,
}

impl ACLAuthorizer {
    /// `get_acl` returns the ACL for an operation and whether
    /// unauthenticated public access is acceptable for it.
    pub fn new<F>(get_acl: F) -> Self
    where
        F: Fn(&Context, &Op) -> Result<(Vec<String>, bool)> + Send + Sync + 'static,
    {
        Self {
            get_acl: Box::new(get_acl),
        }
    }
}

impl Authorizer for ACLAuthorizer {
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&Arc<dyn Identity>>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>)> {
        let mut allowed = Vec::with_capacity(ops.len());
        for op in ops {
            let (acl, allow_public) = (self.get_acl)(ctx, op)?;
            let ok = match identity {
                Some(id) => id.allow(ctx, &acl)?,
                None => allow_public && acl.iter().any(|a| a == EVERYONE),
            };
            allowed.push(ok);
        }
        Ok((allowed, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_identity_membership() {
        let bob = SimpleIdentity::new("bob");
        let ctx = Context::new();
        assert_eq!(bob.id(), "bob");
        assert_eq!(bob.domain(), "");
        assert!(bob.allow(&ctx, &acl(&["bob", "alice"])).unwrap());
        assert!(bob.allow(&ctx, &acl(&[EVERYONE])).unwrap());
        assert!(!bob.allow(&ctx, &acl(&["alice"])).unwrap());
    }

    #[test]
    fn test_acl_authorizer_with_identity() {
        let authorizer = ACLAuthorizer::new(|_, op| {
            if op.entity == "doc" {
                Ok((acl(&["bob"]), false))
            } else {
                Ok((acl(&["alice"]), false))
            }
        });
        let bob: Arc<dyn Identity> = Arc::new(SimpleIdentity::new("bob"));
        let ctx = Context::new();
        let (allowed, caveats) = authorizer
            .authorize(
                &ctx,
                Some(&bob),
                &[Op::new("doc", "read"), Op::new("blog", "read")],
            )
            .unwrap();
        assert_eq!(allowed, vec![true, false]);
        assert!(caveats.is_empty());
    }

    #[test]
    fn test_acl_authorizer_public_access() {
        let authorizer =
            ACLAuthorizer::new(|_, _| Ok((acl(&[EVERYONE]), true)));
        let ctx = Context::new();
        let (allowed, _) = authorizer
            .authorize(&ctx, None, &[Op::new("doc", "read")])
            .unwrap();
        assert_eq!(allowed, vec![true]);

        // An everyone ACL without allow-public stays closed to
        // unauthenticated clients.
        let authorizer =
            ACLAuthorizer::new(|_, _| Ok((acl(&[EVERYONE]), false)));
        let (allowed, _) = authorizer
            .authorize(&ctx, None, &[Op::new("doc", "read")])
            .unwrap();
        assert_eq!(allowed, vec![false]);
    }
}
