//! websocketd core - Shared domain types for the Accent WebSocket gateway
//!
//! This crate provides the types shared between the wire protocol, the
//! daemon library and the binary:
//! - `token` - auth service tokens and their identifiers
//! - `acl` - access-control list matching for event authorization
//! - `tenant` - tenant identifiers and the process-wide master tenant cell
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod acl;
pub mod error;
pub mod tenant;
pub mod token;

// Re-exports for convenience
pub use acl::AccessCheck;
pub use error::{DomainError, DomainResult};
pub use tenant::{MasterTenantProxy, TenantUuid};
pub use token::{Token, TokenId, TokenMetadata};
