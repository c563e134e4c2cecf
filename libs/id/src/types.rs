//! Typed IDs issued by the pool.

use crate::define_id;

// Claim on a slot name between allocation and launch/relinquish.
define_id!(LeaseId, "lease");

// External resource identity handed out by the simulated cluster.
define_id!(ResourceId, "res");
