//! Big-segment synchronization.
//!
//! Big segments are segments whose membership lives out-of-band in a
//! persistent store. Each environment that uses them runs one
//! [`BigSegmentSynchronizer`], which reconciles the store against the
//! upstream service: poll until caught up, then hold an SSE stream open for
//! incremental patches, with strict version chaining throughout.

mod patch;
mod store;
mod sync;

pub use patch::{BigSegmentPatch, MembershipChanges, PatchBuilder, PatchChanges};
pub use store::{BigSegmentStore, InMemoryBigSegmentStore, unix_millis_now};
pub use sync::{BigSegmentSynchronizer, SyncError};
