//! Central manager page directory: per-page ownership records, per-page
//! write serialization queues, and the coherence state machine driving them.
//!
//! The directory performs no I/O. Every transition returns the list of
//! `Effect`s (messages to send) that the caller must carry out after
//! releasing the lock guarding the directory. Delivery failures are fed back
//! through `read_failed()` and `invalidate_confirmed()`.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::message::{NodeId, NodePtr, PageId};
use crate::utils::DsmError;

use serde::{Deserialize, Serialize};

/// Ownership record of a page that has been written at least once.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Node holding write-or-sole-read authority over the page.
    pub owner: NodePtr,

    /// Nodes holding a read-only copy. Never contains `owner`.
    pub copies: HashSet<NodePtr>,
}

impl Record {
    fn new(owner: NodePtr) -> Self {
        Record {
            owner,
            copies: HashSet::new(),
        }
    }
}

/// Point-in-time copy of the directory pushed between primary and backup.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub records: BTreeMap<PageId, Record>,
    pub queues: BTreeMap<PageId, Vec<NodePtr>>,
}

/// Message the manager must send as a consequence of a transition.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Effect {
    /// READ_FORWARD to `owner` on behalf of `requester`.
    ReadForward {
        page: PageId,
        owner: NodePtr,
        requester: NodePtr,
    },

    /// INVALIDATE_CACHE to a copy holder.
    Invalidate { page: PageId, holder: NodePtr },

    /// WRITE_FORWARD to `owner` on behalf of `requester`.
    WriteForward {
        page: PageId,
        owner: NodePtr,
        requester: NodePtr,
    },

    /// RECEIVE_PAGE with write permission straight from the manager.
    GrantWrite { page: PageId, requester: NodePtr },
}

/// Progress of the write at the head of a page's queue.
#[derive(Debug, PartialEq, Eq, Clone)]
enum WriteStage {
    /// Waiting for in-flight read grants on the page to be confirmed.
    DrainingReads,

    /// Invalidations sent; waiting on these copy holders.
    Invalidating { waiting: HashSet<NodeId> },

    /// Page handed towards the writer; waiting for its WRITE_CONFIRMATION.
    Transferring,
}

/// Everything the directory tracks about one page.
#[derive(Debug, Default)]
struct PageState {
    record: Option<Record>,

    /// Pending writers; the head is the one being serviced.
    queue: VecDeque<NodePtr>,

    /// `Some` iff the head's write has been launched.
    stage: Option<WriteStage>,

    /// Readers forwarded to the owner but not yet confirmed.
    reads_in_flight: HashSet<NodeId>,

    /// Readers that arrived while a write was active.
    parked_reads: VecDeque<NodePtr>,
}

/// The central manager's directory.
#[derive(Debug)]
pub struct Directory {
    /// Logging identity of the owning manager.
    me: String,

    pages: BTreeMap<PageId, PageState>,
}

impl Directory {
    pub fn new(me: impl ToString) -> Self {
        Directory {
            me: me.to_string(),
            pages: BTreeMap::new(),
        }
    }

    /// Handles a READ. Fails with `PageNotFound` if the page has never been
    /// written; parks the reader if a write on the page is in progress.
    pub fn read(
        &mut self,
        page: PageId,
        from: NodePtr,
    ) -> Result<Vec<Effect>, DsmError> {
        let state = match self.pages.get_mut(&page) {
            Some(state) if state.record.is_some() => state,
            _ => return Err(DsmError::PageNotFound(page)),
        };

        if state.stage.is_some() {
            if !state.parked_reads.contains(&from) {
                pf_debug!(self.me; "page {} busy writing, parked READ from {}",
                          page, from);
                state.parked_reads.push_back(from);
            }
            return Ok(vec![]);
        }

        Ok(Self::forward_read(&self.me, page, state, from)
            .into_iter()
            .collect())
    }

    /// Handles a WRITE. Duplicates of an already queued writer are dropped.
    pub fn write(&mut self, page: PageId, from: NodePtr) -> Vec<Effect> {
        let state = self.pages.entry(page).or_default();
        if state.queue.contains(&from) {
            pf_debug!(self.me; "duplicate WRITE page {} from {} ignored",
                      page, from);
            return vec![];
        }

        state.queue.push_back(from);
        pf_debug!(self.me;
            "queued WRITE page {} from {} at position {}",
            page,
            from,
            state.queue.len() - 1
        );
        if state.queue.len() == 1 {
            Self::launch_head(&self.me, page, state)
        } else {
            vec![]
        }
    }

    /// Handles a WRITE_CONFIRMATION: `from` now exclusively owns the page.
    /// Pops the head if it is `from`, serves parked readers other than the
    /// new owner, and launches the next queued writer.
    pub fn write_confirmed(&mut self, page: PageId, from: NodePtr) -> Vec<Effect> {
        let state = self.pages.entry(page).or_default();
        if state.queue.front() == Some(&from) {
            state.queue.pop_front();
            state.stage = None;
        } else {
            pf_warn!(self.me;
                "WRITE_CONFIRMATION page {} from {} who is not queue head",
                page,
                from
            );
        }
        state.record = Some(Record::new(from));

        let mut effects = vec![];
        if state.stage.is_none() {
            while let Some(reader) = state.parked_reads.pop_front() {
                if reader == from {
                    // the writable copy already satisfies the read
                    continue;
                }
                effects.extend(Self::forward_read(&self.me, page, state, reader));
            }
            if !state.queue.is_empty() {
                effects.extend(Self::launch_head(&self.me, page, state));
            }
        }
        effects
    }

    /// Handles a READ_CONFIRMATION. The last outstanding one lets a writer
    /// waiting on reads proceed.
    pub fn read_confirmed(&mut self, page: PageId, from: NodeId) -> Vec<Effect> {
        let Some(state) = self.pages.get_mut(&page) else {
            pf_warn!(self.me; "READ_CONFIRMATION for unknown page {}", page);
            return vec![];
        };
        state.reads_in_flight.remove(&from);

        if state.reads_in_flight.is_empty()
            && state.stage == Some(WriteStage::DrainingReads)
        {
            Self::begin_invalidation(&self.me, page, state)
        } else {
            vec![]
        }
    }

    /// A READ_FORWARD on behalf of `reader` failed. The relay may still
    /// have landed before the call errored, so `reader` stays in the copy
    /// set for the next write to invalidate; only its in-flight mark ends.
    pub fn read_failed(&mut self, page: PageId, reader: NodePtr) -> Vec<Effect> {
        pf_debug!(self.me; "READ page {} for {} ends unconfirmed", page, reader);
        self.read_confirmed(page, reader.id)
    }

    /// Handles an INVALIDATE_CONFIRMATION, also used when an invalidation
    /// could not be delivered. The last one releases the page to the writer.
    pub fn invalidate_confirmed(
        &mut self,
        page: PageId,
        from: NodeId,
    ) -> Vec<Effect> {
        let Some(state) = self.pages.get_mut(&page) else {
            pf_warn!(self.me; "INVALIDATE_CONFIRMATION for unknown page {}",
                     page);
            return vec![];
        };

        let all_done = match state.stage {
            Some(WriteStage::Invalidating { ref mut waiting }) => {
                waiting.remove(&from);
                waiting.is_empty()
            }
            _ => {
                pf_debug!(self.me;
                    "stray INVALIDATE_CONFIRMATION page {} from {}",
                    page,
                    from
                );
                false
            }
        };

        if all_done {
            Self::transfer(page, state).into_iter().collect()
        } else {
            vec![]
        }
    }

    /// Forgets the progress of every launched write and launches each
    /// queue head again. Used when this manager takes over authority, since
    /// in-flight progress is not part of a snapshot.
    pub fn restart_heads(&mut self) -> Vec<Effect> {
        let mut effects = vec![];
        for (&page, state) in self.pages.iter_mut() {
            state.reads_in_flight.clear();
            state.stage = None;
            while let Some(reader) = state.parked_reads.pop_front() {
                effects.extend(Self::forward_read(&self.me, page, state, reader));
            }
            if !state.queue.is_empty() {
                effects.extend(Self::launch_head(&self.me, page, state));
            }
        }
        effects
    }

    /// Takes a snapshot of records and queues.
    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            records: self.records(),
            queues: self.write_queues(),
        }
    }

    /// Replaces all state with the given snapshot. Launched-write progress
    /// is reset; call `restart_heads()` to relaunch.
    pub fn restore(&mut self, snapshot: DirectorySnapshot) {
        let DirectorySnapshot { records, queues } = snapshot;
        self.pages.clear();
        for (page, record) in records {
            self.pages.entry(page).or_default().record = Some(record);
        }
        for (page, queue) in queues {
            if !queue.is_empty() {
                self.pages.entry(page).or_default().queue = queue.into();
            }
        }
    }

    /// Record of a page, if any.
    pub fn record(&self, page: PageId) -> Option<&Record> {
        self.pages.get(&page).and_then(|s| s.record.as_ref())
    }

    /// Copy of all records.
    pub fn records(&self) -> BTreeMap<PageId, Record> {
        self.pages
            .iter()
            .filter_map(|(&page, s)| s.record.clone().map(|r| (page, r)))
            .collect()
    }

    /// Copy of all non-empty write queues, head first.
    pub fn write_queues(&self) -> BTreeMap<PageId, Vec<NodePtr>> {
        self.pages
            .iter()
            .filter(|(_, s)| !s.queue.is_empty())
            .map(|(&page, s)| (page, s.queue.iter().copied().collect()))
            .collect()
    }
}

// Directory per-page transition helpers
impl Directory {
    /// Adds `reader` to the copy set (unless it is the owner) and forwards
    /// it to the owner. Returns `None` if the page has no record or the
    /// reader already has a grant on its way.
    fn forward_read(
        me: &str,
        page: PageId,
        state: &mut PageState,
        reader: NodePtr,
    ) -> Option<Effect> {
        if state.reads_in_flight.contains(&reader.id) {
            pf_debug!(me; "READ page {} from {} already in flight", page, reader);
            return None;
        }
        let record = state.record.as_mut()?;
        if record.owner != reader {
            record.copies.insert(reader);
        }
        state.reads_in_flight.insert(reader.id);
        Some(Effect::ReadForward {
            page,
            owner: record.owner,
            requester: reader,
        })
    }

    /// Launches the write of the queue head.
    fn launch_head(me: &str, page: PageId, state: &mut PageState) -> Vec<Effect> {
        debug_assert!(state.stage.is_none());
        if state.queue.is_empty() {
            return vec![];
        }

        if state.reads_in_flight.is_empty() {
            Self::begin_invalidation(me, page, state)
        } else {
            pf_debug!(me;
                "page {} write waits on {} read grants",
                page,
                state.reads_in_flight.len()
            );
            state.stage = Some(WriteStage::DrainingReads);
            vec![]
        }
    }

    /// Invalidates every copy holder other than the writer, or transfers
    /// right away if there is none. A never-written page gets its record
    /// here, owned by the writer.
    fn begin_invalidation(
        me: &str,
        page: PageId,
        state: &mut PageState,
    ) -> Vec<Effect> {
        let Some(&writer) = state.queue.front() else {
            return vec![];
        };

        let holders: Vec<NodePtr> = match state.record {
            None => {
                state.record = Some(Record::new(writer));
                state.stage = Some(WriteStage::Transferring);
                return vec![Effect::GrantWrite {
                    page,
                    requester: writer,
                }];
            }
            Some(ref record) => record
                .copies
                .iter()
                .filter(|&&holder| holder != writer)
                .copied()
                .collect(),
        };

        if holders.is_empty() {
            return Self::transfer(page, state).into_iter().collect();
        }

        pf_debug!(me; "page {} invalidating {} copy holders", page, holders.len());
        state.stage = Some(WriteStage::Invalidating {
            waiting: holders.iter().map(|h| h.id).collect(),
        });
        holders
            .into_iter()
            .map(|holder| Effect::Invalidate { page, holder })
            .collect()
    }

    /// Hands the page to the writer: forwarded from the owner, or granted
    /// directly if the writer already owns it.
    fn transfer(page: PageId, state: &mut PageState) -> Option<Effect> {
        let writer = *state.queue.front()?;
        let owner = state.record.as_ref()?.owner;
        state.stage = Some(WriteStage::Transferring);

        if owner == writer {
            Some(Effect::GrantWrite {
                page,
                requester: writer,
            })
        } else {
            Some(Effect::WriteForward {
                page,
                owner,
                requester: writer,
            })
        }
    }
}

#[cfg(test)]
mod directory_tests {
    use super::*;

    fn node(id: NodeId) -> NodePtr {
        NodePtr::new(id, format!("127.0.0.1:{}", 8002 + id).parse().unwrap())
    }

    fn copies(ids: &[NodeId]) -> HashSet<NodePtr> {
        ids.iter().map(|&id| node(id)).collect()
    }

    #[test]
    fn first_write_creates_record() {
        let mut dir = Directory::new("cm");
        let effects = dir.write(2, node(3));
        assert_eq!(
            effects,
            vec![Effect::GrantWrite {
                page: 2,
                requester: node(3)
            }]
        );
        assert_eq!(dir.record(2), Some(&Record::new(node(3))));

        assert!(dir.write_confirmed(2, node(3)).is_empty());
        assert!(dir.write_queues().is_empty());
        assert_eq!(dir.record(2).map(|r| r.owner), Some(node(3)));
    }

    #[test]
    fn read_unknown_page_fails() {
        let mut dir = Directory::new("cm");
        assert_eq!(dir.read(4, node(1)), Err(DsmError::PageNotFound(4)));
        assert!(dir.records().is_empty());
    }

    #[test]
    fn read_forwards_to_owner() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));

        let effects = dir.read(2, node(5))?;
        assert_eq!(
            effects,
            vec![Effect::ReadForward {
                page: 2,
                owner: node(3),
                requester: node(5)
            }]
        );
        let record = dir.record(2).unwrap();
        assert_eq!(record.owner, node(3));
        assert_eq!(record.copies, copies(&[5]));
        Ok(())
    }

    #[test]
    fn repeated_read_forwarded_once() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        assert_eq!(dir.read(2, node(5))?.len(), 1);
        assert!(dir.read(2, node(5))?.is_empty());
        dir.read_confirmed(2, 5);
        assert_eq!(dir.read(2, node(5))?.len(), 1);
        Ok(())
    }

    #[test]
    fn owner_reading_is_not_a_copy() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(3))?;
        assert!(dir.record(2).unwrap().copies.is_empty());
        Ok(())
    }

    #[test]
    fn write_invalidates_then_forwards() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(5))?;
        dir.read_confirmed(2, 5);

        let effects = dir.write(2, node(7));
        assert_eq!(
            effects,
            vec![Effect::Invalidate {
                page: 2,
                holder: node(5)
            }]
        );

        // owner is not asked to give the page away before 5 confirms
        assert!(dir.invalidate_confirmed(2, 9).is_empty());
        let effects = dir.invalidate_confirmed(2, 5);
        assert_eq!(
            effects,
            vec![Effect::WriteForward {
                page: 2,
                owner: node(3),
                requester: node(7)
            }]
        );

        assert!(dir.write_confirmed(2, node(7)).is_empty());
        let record = dir.record(2).unwrap();
        assert_eq!(record.owner, node(7));
        assert!(record.copies.is_empty());
        Ok(())
    }

    #[test]
    fn writers_served_in_fifo_order() {
        let mut dir = Directory::new("cm");
        assert_eq!(dir.write(1, node(2)).len(), 1);
        assert!(dir.write(1, node(4)).is_empty());
        assert!(dir.write(1, node(6)).is_empty());
        assert!(dir.write(1, node(4)).is_empty()); // duplicate dropped
        assert_eq!(
            dir.write_queues().get(&1),
            Some(&vec![node(2), node(4), node(6)])
        );

        // 4 is not serviced before 2 confirms
        let effects = dir.write_confirmed(1, node(2));
        assert_eq!(
            effects,
            vec![Effect::WriteForward {
                page: 1,
                owner: node(2),
                requester: node(4)
            }]
        );
        let effects = dir.write_confirmed(1, node(4));
        assert_eq!(
            effects,
            vec![Effect::WriteForward {
                page: 1,
                owner: node(4),
                requester: node(6)
            }]
        );
        assert!(dir.write_confirmed(1, node(6)).is_empty());
        assert!(dir.write_queues().is_empty());
    }

    #[test]
    fn queues_are_per_page() {
        let mut dir = Directory::new("cm");
        assert_eq!(dir.write(1, node(2)).len(), 1);
        // an unrelated page is not blocked by page 1's pending write
        assert_eq!(
            dir.write(3, node(4)),
            vec![Effect::GrantWrite {
                page: 3,
                requester: node(4)
            }]
        );
    }

    #[test]
    fn write_waits_for_read_grants() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(5))?;

        // 5's read copy is still on its way: nothing sent yet
        assert!(dir.write(2, node(7)).is_empty());
        let effects = dir.read_confirmed(2, 5);
        assert_eq!(
            effects,
            vec![Effect::Invalidate {
                page: 2,
                holder: node(5)
            }]
        );
        Ok(())
    }

    #[test]
    fn read_parked_during_write() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.write(2, node(7)); // forwarded from 3, unconfirmed

        assert!(dir.read(2, node(5))?.is_empty());
        assert!(dir.read(2, node(5))?.is_empty());
        let effects = dir.write_confirmed(2, node(7));
        assert_eq!(
            effects,
            vec![Effect::ReadForward {
                page: 2,
                owner: node(7),
                requester: node(5)
            }]
        );
        assert_eq!(dir.record(2).unwrap().copies, copies(&[5]));
        Ok(())
    }

    #[test]
    fn reader_upgrading_to_writer() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(5))?;
        dir.read(2, node(6))?;
        dir.read_confirmed(2, 5);
        dir.read_confirmed(2, 6);

        // 5 is not invalidated, it is about to get the writable copy
        let effects = dir.write(2, node(5));
        assert_eq!(
            effects,
            vec![Effect::Invalidate {
                page: 2,
                holder: node(6)
            }]
        );
        Ok(())
    }

    #[test]
    fn owner_upgrading_gets_direct_grant() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(5))?;
        dir.read_confirmed(2, 5);

        dir.write(2, node(3));
        let effects = dir.invalidate_confirmed(2, 5);
        assert_eq!(
            effects,
            vec![Effect::GrantWrite {
                page: 2,
                requester: node(3)
            }]
        );
        Ok(())
    }

    #[test]
    fn failed_read_forward_keeps_copy_for_invalidation() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.read(2, node(5))?;
        assert!(dir.write(2, node(7)).is_empty());

        // 5 may hold a copy after all: the waiting writer invalidates it
        let effects = dir.read_failed(2, node(5));
        assert_eq!(dir.record(2).unwrap().copies, copies(&[5]));
        assert_eq!(
            effects,
            vec![Effect::Invalidate {
                page: 2,
                holder: node(5)
            }]
        );
        assert_eq!(
            dir.invalidate_confirmed(2, 5),
            vec![Effect::WriteForward {
                page: 2,
                owner: node(3),
                requester: node(7)
            }]
        );
        Ok(())
    }

    #[test]
    fn parked_read_of_new_owner_not_replayed() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.write(2, node(7));

        assert!(dir.read(2, node(7))?.is_empty());
        assert!(dir.read(2, node(5))?.is_empty());
        let effects = dir.write_confirmed(2, node(7));
        assert_eq!(
            effects,
            vec![Effect::ReadForward {
                page: 2,
                owner: node(7),
                requester: node(5)
            }]
        );
        assert_eq!(dir.record(2).unwrap().copies, copies(&[5]));
        Ok(())
    }

    #[test]
    fn snapshot_restore_and_restart() -> Result<(), DsmError> {
        let mut dir = Directory::new("cm");
        dir.write(2, node(3));
        dir.write_confirmed(2, node(3));
        dir.write(2, node(7));
        dir.write(2, node(8));
        let snapshot = dir.snapshot();
        assert_eq!(snapshot.queues.get(&2), Some(&vec![node(7), node(8)]));

        let mut backup = Directory::new("cm");
        backup.restore(snapshot.clone());
        assert_eq!(backup.snapshot(), snapshot);

        // the head's write starts over on the new authority
        let effects = backup.restart_heads();
        assert_eq!(
            effects,
            vec![Effect::WriteForward {
                page: 2,
                owner: node(3),
                requester: node(7)
            }]
        );
        Ok(())
    }
}
