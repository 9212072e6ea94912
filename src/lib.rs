//! Ingress agent: serves origin connections for configured ingress rules
//!
//! The binary wires a YAML configuration ([`config`]) to a local edge
//! listener ([`edge`]) that hands every accepted connection to an origin
//! connection from `ingress-origin`.

pub mod config;
pub mod edge;

pub use config::{load_config_file, select_rule, ConfigFile};
pub use edge::EdgeServer;
