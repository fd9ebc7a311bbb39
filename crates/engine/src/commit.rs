use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out strictly increasing commit ids.
///
/// Seeded at open with the largest commit id found on disk, so ids are
/// never reused across restarts.
#[derive(Debug, Default)]
pub struct CommitIdAllocator {
    last: AtomicI64,
}

impl CommitIdAllocator {
    #[must_use]
    pub fn new(last: i64) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    /// Allocates the next id.
    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently allocated id.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Makes sure future ids are above `id`.
    pub fn observe(&self, id: i64) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }
}
