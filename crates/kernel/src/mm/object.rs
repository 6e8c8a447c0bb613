// Memory objects: a pageable extent of logical pages with a backend that
// supplies and reclaims them. References are counted through `Arc`; the
// last drop runs the backend destroy hook.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use super::mul::{self, MulPerm};
use super::page::Page;

static NEXT_OBJ_ID: AtomicU64 = AtomicU64::new(1);

/// Backend kinds. The backend decides how pages come in and whether they
/// may be stolen back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBackend {
    /// Anonymous zero-fill memory
    Anon,
    /// Kernel backing: zero-fill, never evicted
    Kernel,
}

/// How the object crosses into a child context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritPolicy {
    None,
    Shared,
    Copy,
}

struct ObjectState {
    resident: usize,
    perm: MulPerm,
    inherit: InheritPolicy,
    pages: Vec<Arc<Page>>,
}

pub struct MemObject {
    id: u64,
    count: usize,
    backend: MemBackend,
    pageable: AtomicBool,
    state: Mutex<ObjectState>,
}

impl MemObject {
    /// Creates an object spanning `count` pages and runs the backend init
    /// hook.
    pub fn create(count: usize, backend: MemBackend, perm: MulPerm) -> Arc<MemObject> {
        let obj = Arc::new(MemObject {
            id: NEXT_OBJ_ID.fetch_add(1, Ordering::Relaxed),
            count,
            backend,
            pageable: AtomicBool::new(true),
            state: Mutex::new(ObjectState {
                resident: 0,
                perm,
                inherit: InheritPolicy::None,
                pages: Vec::new(),
            }),
        });
        match backend {
            MemBackend::Anon => {}
            MemBackend::Kernel => obj.pageable.store(false, Ordering::Relaxed),
        }
        obj
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn backend(&self) -> MemBackend {
        self.backend
    }

    pub fn pageable(&self) -> bool {
        self.pageable.load(Ordering::Relaxed)
    }

    pub fn resident(&self) -> usize {
        self.state.lock().resident
    }

    pub fn perm(&self) -> MulPerm {
        self.state.lock().perm
    }

    pub fn inherit(&self) -> InheritPolicy {
        self.state.lock().inherit
    }

    pub fn set_inherit(&self, policy: InheritPolicy) {
        self.state.lock().inherit = policy;
    }

    /// Applies new permissions to the object and every current mapping of
    /// its resident pages.
    pub fn protect(&self, new_perm: MulPerm) {
        let pages: Vec<Arc<Page>> = {
            let mut state = self.state.lock();
            state.perm = new_perm;
            state.pages.clone()
        };
        for page in pages {
            mul::protect_page(&page, new_perm);
        }
    }

    /// Links a page into the object's page list. Called by the page hash
    /// when a page is added under this object.
    pub(super) fn attach_page(&self, page: &Arc<Page>) {
        let mut state = self.state.lock();
        state.pages.push(page.clone());
        state.resident += 1;
        debug_assert!(state.resident <= self.count);
    }

    pub(super) fn detach_page(&self, page: &Arc<Page>) {
        let mut state = self.state.lock();
        let before = state.pages.len();
        state.pages.retain(|p| !Arc::ptr_eq(p, page));
        if state.pages.len() != before {
            state.resident -= 1;
        }
    }

    /// Backend page-in: prepare the freshly bound page. Both backends
    /// zero-fill.
    pub fn page_in(&self, _offset: usize, page: &Page) -> bool {
        match self.backend {
            MemBackend::Anon | MemBackend::Kernel => {
                mul::zero_page(page);
                true
            }
        }
    }

    /// Backend page-out: ask the backend to release a page. Kernel-backed
    /// pages are never evicted; anonymous pages have no pager yet.
    pub fn page_out(&self, _offset: usize) -> bool {
        match self.backend {
            MemBackend::Anon => false,
            MemBackend::Kernel => false,
        }
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        // Backend destroy hook. Pages still attached at this point would
        // be a caller bug; they hold weak object refs so nothing dangles.
        let state = self.state.get_mut();
        if !state.pages.is_empty() {
            crate::warn!(
                "mm: object {} destroyed with {} resident pages",
                self.id,
                state.resident
            );
        }
    }
}
