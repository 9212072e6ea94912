//! IP access policy for origin destinations
//!
//! An ordered list of allow/deny rules evaluated against a destination
//! (address, port). Used by the SOCKS proxy origin to decide which hosts on
//! the private network a tunnel client may reach.
//!
//! Policies are immutable after construction and are shared between
//! connections behind an `Arc`.

pub mod policy;
pub mod rule;

pub use policy::{Policy, PolicyConfig, RuleConfig};
pub use rule::Rule;

use thiserror::Error;

/// Errors raised while building rules
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid CIDR prefix '{0}': {1}")]
    InvalidPrefix(String, String),

    #[error("Invalid port {0}: ports must be between 1 and 65535")]
    InvalidPort(u16),
}
