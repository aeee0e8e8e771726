//! # Canopy feeds
//!
//! A *feed* is a cryptographically verifiable, append-only log. Blocks are
//! the leaves of an in-order binary merkle tree; the evolving set of tree
//! roots is signed by the writer (or, for finalized feeds, *is* the feed
//! key), so a reader can verify any block against the feed's public key
//! without trusting the storage that holds it or the peer that served it.
//!
//! Feeds are optimized for *appending* on the writer side and for
//! *verify-and-absorb* on the reader side. They do **not** support random
//! writes, deletion or compaction; a feed only ever grows.
//!
//! ## Persistence
//!
//! All state lives in a handful of logical streams behind the
//! [storage::RandomAccess] abstraction: the raw block data, fixed-size tree
//! node and signature records, the paged bitfield, and the key material.
//! Writes are ordered so that a crash can at worst lose the tail of an
//! append, never corrupt what was committed.
//!
//! ## Replication
//!
//! The wire protocol is not part of this crate. The feed exposes the pieces
//! a replication layer needs: proof generation ([feed::Feed::proof_with]),
//! proof verification ([feed::Feed::put]), download selections, parked
//! reads, and peer notification hooks ([peer::Peer]).
pub mod bitfield;
pub mod codec;
pub mod error;
pub mod feed;
pub mod flat_tree;
pub mod hash;
pub mod merkle;
pub mod peer;
pub mod storage;
pub mod stream;
pub mod tree_index;

mod batch;

pub use codec::{Binary, Codec, Json, Utf8};
pub use error::{Error, Result};
pub use feed::{
    AuditReport, Feed, Options, PeerHandle, PendingGet, PendingSeek, Proof, ProofRequest,
};
pub use peer::{ArcPeer, DownloadRange, Have, Peer, Selection, SelectionId};
pub use storage::{MemoryStorage, Node, RandomAccess, Storage, StreamKind};
pub use stream::{ReadOptions, ReadStream, StreamState, WriteStream};
pub use tree_index::Digest;
