pub mod auth;
pub mod caveat;
pub mod checker;
pub mod codec;
mod crypto;
pub mod discharge;
pub mod error;
pub mod identity;
pub mod keys;
pub mod macaroon;
pub mod namespace;
pub mod op;
pub mod oven;
pub mod raw;
pub mod store;

pub use auth::{AuthChecker, AuthInfo, Authority, AuthorityParams};
pub use caveat::Caveat;
pub use checker::{Checker, Context};
pub use error::{BakeryError, DischargeRequiredError};
pub use keys::KeyPair;
pub use macaroon::{Macaroon, Slice, Version};
pub use namespace::Namespace;
pub use op::Op;
pub use oven::Oven;

/// Result type for bakery operations
pub type Result<T> = std::result::Result<T, BakeryError>;
