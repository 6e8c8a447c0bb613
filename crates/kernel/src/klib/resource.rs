// Resource ID arenas. Vends unique IDs out of a [min, max] range with
// reuse of freed IDs.

use alloc::vec::Vec;
use spin::Mutex;

pub type ResId = u32;

struct ArenaState {
    next: ResId,
    free: Vec<ResId>,
}

/// An ID arena. IDs are recycled LIFO once freed.
pub struct ResArena {
    name: &'static str,
    min_id: ResId,
    max_id: ResId,
    state: Mutex<ArenaState>,
}

impl ResArena {
    pub fn new(name: &'static str, min_id: ResId, max_id: ResId) -> Self {
        Self {
            name,
            min_id,
            max_id,
            state: Mutex::new(ArenaState {
                next: min_id,
                free: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocates an ID, or `None` if the arena is exhausted.
    pub fn alloc(&self) -> Option<ResId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Some(id);
        }
        if state.next > self.max_id {
            return None;
        }
        let id = state.next;
        state.next += 1;
        Some(id)
    }

    /// Returns an ID to the arena.
    ///
    /// # Panics
    /// If the ID is outside the arena's range.
    pub fn free(&self, id: ResId) {
        assert!(
            id >= self.min_id && id <= self.max_id,
            "resource id {} outside arena {}",
            id,
            self.name
        );
        self.state.lock().free.push(id);
    }
}
