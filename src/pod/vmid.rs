//! Guest id allocation.
//!
//! Ids come from a configured range. Within a session an id is handed out at
//! most once while in use, and the cursor only moves forward, so a released id
//! is not reissued to a new container in the same session. A floor (the
//! cluster's `nextid`) can push the cursor past ids created outside this
//! process.

use crate::constants::MIN_VMID;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Session-local vmid allocator over `start..=end`.
#[derive(Debug)]
pub struct VmidAllocator {
    start: u32,
    end: u32,
    state: Mutex<AllocState>,
}

#[derive(Debug)]
struct AllocState {
    next: u32,
    in_use: BTreeSet<u32>,
}

impl VmidAllocator {
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start < MIN_VMID || start > end {
            return Err(Error::Configuration(format!(
                "invalid vmid range {start}..={end} (ids start at {MIN_VMID})"
            )));
        }
        Ok(Self {
            start,
            end,
            state: Mutex::new(AllocState {
                next: start,
                in_use: BTreeSet::new(),
            }),
        })
    }

    /// Allocates the lowest free id at or above both the cursor and `floor`.
    pub fn allocate(&self, floor: Option<u32>) -> Result<u32> {
        let mut state = self.state.lock().map_err(|_| Error::lock_poisoned())?;
        let mut candidate = state.next.max(floor.unwrap_or(self.start));

        while candidate <= self.end {
            if state.in_use.insert(candidate) {
                state.next = candidate.saturating_add(1);
                return Ok(candidate);
            }
            candidate += 1;
        }

        Err(Error::Configuration(format!(
            "vmid range {}..={} exhausted",
            self.start, self.end
        )))
    }

    /// Marks an id as free. The cursor does not move back.
    pub fn release(&self, vmid: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.in_use.remove(&vmid);
        }
    }

    /// Ids currently allocated.
    pub fn in_use(&self) -> Vec<u32> {
        self.state
            .lock()
            .map(|s| s.in_use.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn range(&self) -> (u32, u32) {
        (self.start, self.end)
    }
}
