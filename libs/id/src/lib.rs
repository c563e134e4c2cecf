//! # poolkeeper-id
//!
//! Naming and identity for pool-managed resources.
//!
//! ## Slot names
//!
//! A pool of capacity `N` owns exactly the names `{prefix}-1` through
//! `{prefix}-N`. [`SlotNamer`] is the only place that knows this pattern:
//! everything else asks it whether a name belongs to the pool and which
//! index it maps to. Names created in the same external system by anyone
//! else (`{prefix}-01`, `{prefix}-x`, `other-1`) never match.
//!
//! ## Typed IDs
//!
//! Short-lived identities issued by the pool use a prefixed ULID format:
//! `{prefix}_{ulid}`.
//!
//! - `lease_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `res_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod slot;
mod types;

pub use error::NameError;
pub use slot::{SlotNamer, DEFAULT_SLOT_PREFIX};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
