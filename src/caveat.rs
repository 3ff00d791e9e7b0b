use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::namespace::STD_NAMESPACE;
use crate::{BakeryError, Result};

/// Standard condition names.
pub const COND_TIME_BEFORE: &str = "time-before";
pub const COND_DECLARED: &str = "declared";
pub const COND_ALLOW: &str = "allow";
pub const COND_DENY: &str = "deny";
pub const COND_ERROR: &str = "error";

/// A restriction to be added to a macaroon.
///
/// A first-party caveat carries a condition checked by the minting
/// service itself; a third-party caveat names the location of an
/// external service that must discharge its condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    /// The condition, `name[ arg]`.
    pub condition: String,

    /// Schema URI the condition's name lives in. Ignored for
    /// third-party caveats, whose conditions travel encrypted.
    pub namespace: String,

    /// Discharging service location; present only on third-party
    /// caveats.
    pub location: Option<String>,
}

impl Caveat {
    pub fn first_party(namespace: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            namespace: namespace.into(),
            location: None,
        }
    }

    pub fn third_party(location: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            namespace: String::new(),
            location: Some(location.into()),
        }
    }

    pub fn is_third_party(&self) -> bool {
        self.location.is_some()
    }
}

/// A caveat that holds before the given time and fails afterwards.
pub fn time_before_caveat(t: DateTime<Utc>) -> Caveat {
    Caveat::first_party(
        STD_NAMESPACE,
        format!(
            "{COND_TIME_BEFORE} {}",
            t.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ),
    )
}

/// A caveat asserting that `key` has been declared to hold `value`.
pub fn declared_caveat(key: &str, value: &str) -> Caveat {
    if key.contains(' ') || key.is_empty() {
        return error_caveat(format!("invalid caveat {COND_DECLARED} key {key:?}"));
    }
    Caveat::first_party(STD_NAMESPACE, format!("{COND_DECLARED} {key} {value}"))
}

/// A caveat permitting only the listed operation actions.
pub fn allow_caveat(actions: &[&str]) -> Caveat {
    operation_caveat(COND_ALLOW, actions)
}

/// A caveat forbidding the listed operation actions.
pub fn deny_caveat(actions: &[&str]) -> Caveat {
    operation_caveat(COND_DENY, actions)
}

fn operation_caveat(name: &str, actions: &[&str]) -> Caveat {
    if actions.is_empty() {
        return error_caveat(format!("no operations allowed in {name:?} caveat"));
    }
    for action in actions {
        if action.contains(' ') || action.is_empty() {
            return error_caveat(format!("invalid operation name {action:?} in {name:?} caveat"));
        }
    }
    Caveat::first_party(STD_NAMESPACE, format!("{name} {}", actions.join(" ")))
}

/// A caveat that always fails with the given message. Produced when a
/// caveat cannot be minted correctly, so the failure surfaces at
/// verification time rather than being silently dropped.
pub fn error_caveat(msg: impl Into<String>) -> Caveat {
    Caveat::first_party(STD_NAMESPACE, format!("{COND_ERROR} {}", msg.into()))
}

/// Splits a resolved condition `[prefix:]name[ arg]` into its
/// (possibly prefixed) name and argument.
pub fn parse_caveat(cav: &str) -> Result<(&str, &str)> {
    if cav.is_empty() {
        return Err(BakeryError::InvalidFormat("empty caveat".into()));
    }
    match cav.split_once(' ') {
        Some((name, arg)) => Ok((name, arg)),
        None => Ok((cav, "")),
    }
}

/// Reduces a set of first-party conditions to a minimal canonical list
/// suitable for minting a fresh capability macaroon.
///
/// `allow` and `deny` conditions are dropped (the new macaroon's
/// operation set carries them directly), all `time-before` conditions
/// collapse to the earliest, and the remainder is sorted and deduped.
/// Unparseable `time-before` arguments are preserved verbatim so a
/// malformed restriction can never be squashed away. `declared`
/// conditions are kept; stripping identity declarations is the
/// caller's per-macaroon decision.
pub fn squash_conditions<S: AsRef<str>>(conditions: &[S]) -> Vec<String> {
    let mut out = Vec::with_capacity(conditions.len());
    let mut earliest: Option<DateTime<Utc>> = None;

    for cond in conditions {
        let cond = cond.as_ref();
        let Ok((name, arg)) = parse_caveat(cond) else {
            out.push(cond.to_string());
            continue;
        };
        match name {
            COND_ALLOW | COND_DENY => {}
            COND_TIME_BEFORE => match DateTime::parse_from_rfc3339(arg) {
                Ok(t) => {
                    let t = t.with_timezone(&Utc);
                    if earliest.is_none_or(|e| t < e) {
                        earliest = Some(t);
                    }
                }
                Err(_) => out.push(cond.to_string()),
            },
            _ => out.push(cond.to_string()),
        }
    }
    if let Some(t) = earliest {
        out.push(format!(
            "{COND_TIME_BEFORE} {}",
            t.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
    }
    out.sort();
    out.dedup();
    out
}
