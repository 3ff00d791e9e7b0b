use thiserror::Error;

use crate::caveat::Caveat;
use crate::op::Op;

/// Errors produced while minting, discharging or authorizing macaroons.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BakeryError {
    /// The request is not authorized. Carries the most specific
    /// underlying failure as its message.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A macaroon failed signature verification or its root key is gone.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The caveat condition is not handled by any registered checker.
    #[error("caveat {0:?} not recognized")]
    CaveatNotRecognized(String),

    /// A recognized caveat condition did not hold.
    #[error("caveat {caveat:?} not satisfied: {reason}")]
    CaveatNotSatisfied { caveat: String, reason: String },

    /// A store lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// More discharges are needed before the request can be authorized.
    /// This is a control signal rather than a failure; clients discharge
    /// the carried caveats and retry.
    #[error(transparent)]
    DischargeRequired(#[from] DischargeRequiredError),

    /// A third-party caveat id could not be decoded.
    #[error("cannot decode caveat id: {0}")]
    InvalidCaveatId(String),

    /// A key could not be parsed or has the wrong shape.
    #[error("{0}")]
    InvalidKey(String),

    /// Malformed input outside the caveat-id codec.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A cryptographic operation failed.
    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl BakeryError {
    /// True for failures caused by the presented macaroons themselves
    /// (bad signature, missing root key). During authorization these are
    /// recorded per chain instead of aborting the whole request.
    pub fn is_verification_error(&self) -> bool {
        matches!(self, BakeryError::VerificationFailed(_))
    }

    pub fn is_discharge_required(&self) -> bool {
        matches!(self, BakeryError::DischargeRequired(_))
    }
}

/// Returned when one or more third-party caveats must be discharged
/// before the requested operations can be authorized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DischargeRequiredError {
    pub message: String,

    /// The operations the client was trying to perform.
    pub ops: Vec<Op>,

    /// The caveats that must be discharged and presented on retry.
    pub caveats: Vec<Caveat>,

    /// True when the discharge would authenticate the client rather
    /// than satisfy an operation caveat.
    pub for_authentication: bool,
}

impl DischargeRequiredError {
    pub fn new(message: impl Into<String>, ops: Vec<Op>, caveats: Vec<Caveat>) -> Self {
        Self {
            message: message.into(),
            ops,
            caveats,
            for_authentication: false,
        }
    }
}
