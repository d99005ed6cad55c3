//! Identity and session security core for the ChainGuard platform.
//!
//! Everything here is transport-agnostic: the surrounding application
//! owns HTTP routing, the relational schema, and the analysis
//! pipeline, and consumes this crate for credential verification,
//! TOTP two-factor authentication, signed-token issuance and
//! verification, login/registration rate limiting, and
//! permission-based authorization.
//!
//! The entry point for the full flows is [`service::IdentityService`];
//! the leaf modules are usable on their own.

pub mod authz;
pub mod clock;
pub mod config;
pub mod error;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod token;
pub mod totp;

mod audit;

pub use config::IdentityConfig;
pub use error::AuthError;
pub use service::IdentityService;
