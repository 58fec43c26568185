//! Per-client page cache: what permission, if any, this node holds on each
//! page.

use std::collections::{BTreeMap, HashMap};

use crate::message::{PageId, Permission};

/// Cached pages and their permission. A page not in the map is Absent.
#[derive(Debug, Default)]
pub struct PageCache {
    entries: HashMap<PageId, Permission>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current permission on `page`, `None` if Absent.
    pub fn get(&self, page: PageId) -> Option<Permission> {
        self.entries.get(&page).copied()
    }

    /// Whether an access of kind `wanted` can be served locally.
    pub fn hits(&self, page: PageId, wanted: Permission) -> bool {
        self.get(page).is_some_and(|held| held.satisfies(wanted))
    }

    /// Caches `page` at `perm`, as granted by a RECEIVE_PAGE. Returns the
    /// permission held before.
    pub fn grant(&mut self, page: PageId, perm: Permission) -> Option<Permission> {
        self.entries.insert(page, perm)
    }

    /// Downgrades `page` to Read. Returns the permission held before; an
    /// Absent page stays Absent.
    pub fn demote(&mut self, page: PageId) -> Option<Permission> {
        let entry = self.entries.get_mut(&page)?;
        let old = *entry;
        *entry = Permission::Read;
        Some(old)
    }

    /// Drops `page`. Returns the permission held before.
    pub fn evict(&mut self, page: PageId) -> Option<Permission> {
        self.entries.remove(&page)
    }

    /// Sorted copy of all entries, for display.
    pub fn entries(&self) -> BTreeMap<PageId, Permission> {
        self.entries.iter().map(|(&p, &perm)| (p, perm)).collect()
    }
}
