use crate::patch::BigSegmentPatch;
use crate::sync::SyncError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub type UnixMillis = u64;

pub fn unix_millis_now() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The only persisted state in the relay: big-segment memberships, the
/// version cursor, and the time the dataset was last known synchronized.
/// Layout is backend-defined; the synchronizer depends only on this surface.
pub trait BigSegmentStore: Send + Sync {
    /// Applies the patch if its `previous_version` matches the current
    /// cursor, advancing the cursor to the patch version atomically with the
    /// membership mutation. Returns whether the patch was applied.
    fn apply_patch(&self, patch: &BigSegmentPatch) -> Result<bool, SyncError>;

    /// Version of the last applied patch; empty before any patch applies.
    fn cursor(&self) -> Result<String, SyncError>;

    fn set_synchronized_on(&self, time: UnixMillis) -> Result<(), SyncError>;

    fn synchronized_on(&self) -> Result<Option<UnixMillis>, SyncError>;

    fn close(&self) {}
}

#[derive(Default)]
struct Membership {
    included: HashSet<String>,
    excluded: HashSet<String>,
}

#[derive(Default)]
struct StoreState {
    cursor: String,
    segments: HashMap<String, Membership>,
    synchronized_on: Option<UnixMillis>,
}

#[derive(Default)]
pub struct InMemoryBigSegmentStore {
    state: Mutex<StoreState>,
}

impl InMemoryBigSegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_included(&self, segment_id: &str, user_key: &str) -> bool {
        self.state
            .lock()
            .segments
            .get(segment_id)
            .is_some_and(|m| m.included.contains(user_key))
    }

    pub fn is_excluded(&self, segment_id: &str, user_key: &str) -> bool {
        self.state
            .lock()
            .segments
            .get(segment_id)
            .is_some_and(|m| m.excluded.contains(user_key))
    }
}

impl BigSegmentStore for InMemoryBigSegmentStore {
    fn apply_patch(&self, patch: &BigSegmentPatch) -> Result<bool, SyncError> {
        let mut state = self.state.lock();
        if state.cursor != patch.previous_version {
            return Ok(false);
        }

        let membership = state.segments.entry(patch.segment_id.clone()).or_default();
        for key in &patch.changes.included.add {
            membership.included.insert(key.clone());
        }
        for key in &patch.changes.included.remove {
            membership.included.remove(key);
        }
        for key in &patch.changes.excluded.add {
            membership.excluded.insert(key.clone());
        }
        for key in &patch.changes.excluded.remove {
            membership.excluded.remove(key);
        }

        state.cursor = patch.version.clone();
        Ok(true)
    }

    fn cursor(&self) -> Result<String, SyncError> {
        Ok(self.state.lock().cursor.clone())
    }

    fn set_synchronized_on(&self, time: UnixMillis) -> Result<(), SyncError> {
        self.state.lock().synchronized_on = Some(time);
        Ok(())
    }

    fn synchronized_on(&self) -> Result<Option<UnixMillis>, SyncError> {
        Ok(self.state.lock().synchronized_on)
    }
}
