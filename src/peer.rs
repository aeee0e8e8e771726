//! the feed's side of the replication contract
//!
//! The feed never creates peers; the replication collaborator registers them
//! and listens for the notification hooks below. Selections record which
//! ranges the local side wants downloaded; peers consult them (plus the
//! pending-read set) to decide what to request.
use std::sync::Arc;

/// blocks that became available locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Have {
    pub start: u64,
    pub length: u64,
}

/// hooks a replication peer receives from the feed
pub trait Peer: Send + Sync {
    /// selections, waiters or the bitfield changed; re-evaluate requests
    fn update(&self);
    /// new verified blocks are readable locally
    fn have(&self, have: &Have);
    /// the verified byte length grew
    fn have_bytes(&self, byte_length: u64);
}

pub type ArcPeer = Arc<dyn Peer>;

pub type SelectionId = u64;

/// a declared interest in a range of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub id: SelectionId,
    pub start: u64,
    /// `None` means open ended, i.e. follow the live tail
    pub end: Option<u64>,
    /// request strictly in order instead of rarest-first
    pub linear: bool,
    /// fetch hashes only, no block data
    pub hash: bool,
}

impl Selection {
    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && self.end.map_or(true, |end| block < end)
    }
}

/// requested range as passed to `Feed::download`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadRange {
    pub start: u64,
    pub end: Option<u64>,
    pub linear: bool,
    pub hash: bool,
}

impl DownloadRange {
    pub fn blocks(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn tail(start: u64) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }
}

/// insertion-ordered selection set with swap removal
#[derive(Debug, Default)]
pub(crate) struct Selections {
    items: Vec<Selection>,
    next_id: SelectionId,
}

impl Selections {
    pub fn add(&mut self, range: DownloadRange) -> SelectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(Selection {
            id,
            start: range.start,
            end: range.end,
            linear: range.linear,
            hash: range.hash,
        });
        id
    }

    pub fn remove(&mut self, id: SelectionId) -> Option<Selection> {
        let pos = self.items.iter().position(|s| s.id == id)?;
        Some(self.items.swap_remove(pos))
    }

    /// remove the first selection matching the range keys
    pub fn remove_range(&mut self, range: DownloadRange) -> Option<Selection> {
        let pos = self
            .items
            .iter()
            .position(|s| s.start == range.start && s.end == range.end)?;
        Some(self.items.swap_remove(pos))
    }

    pub fn as_slice(&self) -> &[Selection] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
