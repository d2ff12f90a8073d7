use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;

/// Ids of the checks this process is currently executing
#[derive(Default)]
pub struct RunningChecks {
    ids: DashSet<i64>,
}

impl fmt::Debug for RunningChecks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningChecks")
            .field("count", &self.ids.len())
            .finish()
    }
}

impl RunningChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as running. Returns `None` if it already is.
    ///
    /// The mark is cleared when the returned guard is dropped.
    pub fn try_claim(self: &Arc<Self>, id: i64) -> Option<RunningCheckGuard> {
        if !self.ids.insert(id) {
            return None;
        }
        Some(RunningCheckGuard {
            running: Arc::clone(self),
            id,
        })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug)]
pub struct RunningCheckGuard {
    running: Arc<RunningChecks>,
    id: i64,
}

impl RunningCheckGuard {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for RunningCheckGuard {
    fn drop(&mut self) {
        self.running.ids.remove(&self.id);
    }
}
