//! Drift HTTP - control-plane adapters
//!
//! `reqwest` implementations of the drift-core seams:
//! - [`HttpRemoteConfigClient`]: settings, image, restart and liveness
//! - [`HttpRegistryCredentials`]: registry username/password
//! - [`HttpDatabaseEndpoints`]: managed database hostnames
//!
//! All control-plane requests carry the operator's bearer token.

#![warn(unreachable_pub)]

pub mod client;
pub mod error;
pub mod plane;
pub mod secrets;
mod wire;

pub use client::{HttpRemoteConfigClient, LivenessProbe};
pub use error::HttpError;
pub use plane::ControlPlane;
pub use secrets::{HttpDatabaseEndpoints, HttpRegistryCredentials};
