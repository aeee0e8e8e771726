//! the feed: an append-only log whose blocks verify against a public key
//!
//! A feed orchestrates the merkle generator, the bitfield and the storage
//! binding. The writer side appends blocks and signs the evolving root set;
//! the reader side absorbs `(block, proof)` pairs from untrusted peers and
//! only commits what checks out against the feed key. All verified state is
//! persisted through the storage binding before it becomes observable.
use crate::batch::{AtomicBatcher, FlushLatch};
use crate::bitfield::Bitfield;
use crate::codec::{Binary, Codec};
use crate::error::{Error, Result};
use crate::flat_tree as flat;
use crate::hash;
use crate::merkle::MerkleGenerator;
use crate::peer::{ArcPeer, DownloadRange, Have, Selection, SelectionId, Selections};
use crate::storage::{FeedStorage, Node, OpenState, Storage};
use crate::tree_index::{self, Digest};
use ed25519_dalek::SigningKey;
use futures::channel::oneshot;
use smallvec::SmallVec;
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// options recognized when opening a feed
#[derive(Debug, Clone)]
pub struct Options {
    /// generate a key pair when storage holds none
    pub create_if_missing: bool,
    /// discard any existing state on open
    pub overwrite: bool,
    /// sign appended blocks; a non-live feed verifies by root equality
    pub live: bool,
    /// skip the everything-from-the-start download selection
    pub sparse: bool,
    /// do not persist block data, only tree and signatures
    pub indexing: bool,
    /// expected public key; mismatch with stored state fails the open
    pub key: Option<[u8; 32]>,
    /// key pair in Ed25519 keypair-bytes format (secret then public)
    pub secret_key: Option<[u8; 64]>,
    /// local identity used by replication for peer dedup, random if omitted
    pub id: Option<[u8; 32]>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            overwrite: false,
            live: true,
            sparse: false,
            indexing: false,
            key: None,
            secret_key: None,
            id: None,
        }
    }
}

impl Options {
    pub fn key(mut self, key: [u8; 32]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn indexing(mut self, indexing: bool) -> Self {
        self.indexing = indexing;
        self
    }
}

/// sibling hashes plus an optional signature, everything needed to verify
/// one block against the feed key
#[derive(Debug, Clone, Default)]
pub struct Proof {
    pub nodes: Vec<Node>,
    pub signature: Option<[u8; 64]>,
}

/// what a peer asks for when requesting a proof
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofRequest {
    /// what the requester already holds, see [Digest]
    pub digest: Digest,
    /// include the leaf hash itself (hash-only request)
    pub hash: bool,
}

/// outcome of [Feed::audit]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub valid: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Closed,
}

enum WaiterKind {
    Block {
        index: u64,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    Seek {
        offset: u64,
        tx: oneshot::Sender<Result<(u64, u64)>>,
    },
}

struct Waiter {
    deadline: Option<Instant>,
    kind: WaiterKind,
}

enum SeekOutcome {
    Found(u64, u64),
    OutOfRange,
    MissingNodes,
}

/// handle returned by [Feed::register_peer], removal is O(1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandle(usize);

pub struct Feed<C: Codec = Binary> {
    codec: C,
    storage: FeedStorage,
    bitfield: Bitfield,
    merkle: MerkleGenerator,
    key: [u8; 32],
    discovery_key: [u8; 32],
    secret: Option<SigningKey>,
    id: [u8; 32],
    length: u64,
    byte_length: u64,
    live: bool,
    sparse: bool,
    indexing: bool,
    writable: bool,
    state: State,
    poisoned: Option<u64>,
    selections: Selections,
    waiters: Vec<Waiter>,
    peers: Vec<Option<ArcPeer>>,
    batcher: AtomicBatcher<Vec<u8>>,
    flush: FlushLatch,
    uploading: bool,
    downloading: bool,
}

impl Feed<Binary> {
    /// writable feed over fresh storage, raw byte blocks
    pub fn create(storage: &dyn Storage) -> Result<Self> {
        Self::open(storage, Options::default())
    }

    pub fn open(storage: &dyn Storage, options: Options) -> Result<Self> {
        Self::with_codec(storage, options, Binary)
    }
}

impl<C: Codec> Feed<C> {
    pub fn with_codec(provider: &dyn Storage, options: Options, codec: C) -> Result<Self> {
        let (storage, mut state) = FeedStorage::open(provider)?;

        let has_bits = state
            .bitfield_pages
            .iter()
            .any(|page| page.iter().any(|b| *b != 0));
        let mut overwrite = options.overwrite;
        if has_bits && state.key.is_none() && options.key.is_none() {
            // stored blocks we can never verify again
            warn!("bitfield without a key, forcing overwrite");
            overwrite = true;
        }
        if overwrite {
            storage.clear()?;
            state = OpenState::default();
        }

        if let (Some(stored), Some(wanted)) = (state.key, options.key) {
            if stored != wanted {
                return Err(Error::AlreadyExists);
            }
        }

        // resolve key material
        let stored_key = state.key;
        let mut key = state.key.or(options.key);
        let mut secret = match state.secret_key.or(options.secret_key) {
            Some(bytes) => Some(SigningKey::from_keypair_bytes(&bytes).map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "malformed secret key",
                ))
            })?),
            None => None,
        };
        if key.is_none() {
            if !options.create_if_missing {
                return Err(Error::NotFound);
            }
            let (public, signing) = hash::generate_keypair();
            key = Some(public);
            secret = Some(signing);
        }
        let key = key.expect("key resolved above");
        if let Some(signing) = &secret {
            if signing.verifying_key().to_bytes() != key {
                return Err(Error::AlreadyExists);
            }
        }
        if stored_key.is_none() {
            storage.put_key(&key)?;
        }
        if state.secret_key.is_none() {
            if let Some(signing) = &secret {
                storage.put_secret_key(&signing.to_keypair_bytes())?;
            }
        }

        // recover length from the committed tree
        let bitfield = Bitfield::from_pages(state.bitfield_pages);
        let mut length = tree_index::blocks(&bitfield);
        if secret.is_some() {
            // a crashed append may have left a frontier without its leaf
            while length > 0 && !bitfield.tree_get(2 * (length - 1)) {
                length -= 1;
            }
        }
        let live = if length > 0 {
            storage.get_signature(length - 1).is_ok()
        } else {
            options.live
        };

        let mut roots = Vec::new();
        for index in flat::full_roots(2 * length) {
            roots.push(storage.get_node(index)?);
        }
        let byte_length = roots.iter().map(|r| r.size).sum();

        let mut feed = Self {
            codec,
            storage,
            bitfield,
            merkle: MerkleGenerator::from_roots(roots),
            key,
            discovery_key: hash::discovery_key(&key),
            writable: secret.is_some(),
            secret,
            id: options.id.unwrap_or_else(rand::random),
            length,
            byte_length,
            live,
            sparse: options.sparse,
            indexing: options.indexing,
            state: State::Ready,
            poisoned: None,
            selections: Selections::default(),
            waiters: Vec::new(),
            peers: Vec::new(),
            batcher: AtomicBatcher::default(),
            flush: FlushLatch::default(),
            uploading: true,
            downloading: true,
        };
        if !feed.sparse {
            feed.selections.add(DownloadRange::tail(0));
        }
        debug!(
            discovery = %hex::encode(feed.discovery_key),
            length = feed.length,
            byte_length = feed.byte_length,
            writable = feed.writable,
            live = feed.live,
            "feed ready"
        );
        Ok(feed)
    }

    // accessors

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn discovery_key(&self) -> &[u8; 32] {
        &self.discovery_key
    }

    pub fn id(&self) -> &[u8; 32] {
        &self.id
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_length
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_readable(&self) -> bool {
        self.state == State::Ready
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn selections(&self) -> &[Selection] {
        self.selections.as_slice()
    }

    /// block indices some caller is parked on
    pub fn waiting_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.waiters.iter().filter_map(|w| match &w.kind {
            WaiterKind::Block { index, .. } => Some(*index),
            WaiterKind::Seek { .. } => None,
        })
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading
    }

    pub fn set_uploading(&mut self, uploading: bool) {
        self.uploading = uploading;
        self.update_peers();
    }

    pub fn set_downloading(&mut self, downloading: bool) {
        self.downloading = downloading;
        self.update_peers();
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            State::Closed => Err(Error::Closed),
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        self.ensure_open()?;
        if let Some(index) = self.poisoned {
            return Err(Error::Critical { index });
        }
        Ok(())
    }

    // append path

    /// append one value, returning its block index
    pub fn append(&mut self, value: &C::Value) -> Result<u64> {
        self.append_batch(std::slice::from_ref(value))
    }

    /// Append a batch of values, returning the index of the first one.
    ///
    /// The whole batch is sequenced through the atomic batcher: callers see
    /// FIFO ordering and at most one batch is in flight at a time.
    pub fn append_batch(&mut self, values: &[C::Value]) -> Result<u64> {
        self.ensure_mutable()?;
        if !self.writable {
            return Err(Error::NotWritable);
        }
        if values.is_empty() {
            return Ok(self.length);
        }
        let mut encoded = Vec::with_capacity(values.len());
        for value in values {
            encoded.push(self.codec.encode(value)?);
        }
        let first = self.length;
        let mut batcher = mem::take(&mut self.batcher);
        let result = batcher.run(encoded, |batch| self.append_blocks(batch));
        self.batcher = batcher;
        result?;
        Ok(first)
    }

    fn append_blocks(&mut self, blocks: Vec<Vec<u8>>) -> Result<()> {
        let start_length = self.length;
        let start_bytes = self.byte_length;
        let result = self.write_blocks(&blocks, start_length, start_bytes);
        if result.is_err() {
            // storage may hold partial records; the generator must fall back
            // to the committed frontier
            self.reseed_merkle();
        }
        result
    }

    fn write_blocks(&mut self, blocks: &[Vec<u8>], start_length: u64, start_bytes: u64) -> Result<()> {
        let mut offset = 0u64;
        let mut produced: Vec<Node> = Vec::new();
        for (k, data) in blocks.iter().enumerate() {
            let nodes = self.merkle.next(data);
            if !self.indexing {
                self.storage.put_data(start_bytes + offset, data)?;
            }
            offset += data.len() as u64;
            for node in &nodes {
                self.storage.put_node(node)?;
            }
            produced.extend(nodes);
            if self.live {
                let secret = self.secret.as_ref().expect("writable feeds carry a secret");
                let message = hash::tree_root(self.merkle.roots());
                let signature = hash::sign(secret, &message);
                self.storage.put_signature(start_length + k as u64, &signature)?;
            }
        }
        // all records durable, flip the bits and go observable
        for node in &produced {
            tree_index::set(&mut self.bitfield, node.index);
        }
        for k in 0..blocks.len() as u64 {
            self.bitfield.set(start_length + k, true);
        }
        self.length = start_length + blocks.len() as u64;
        self.byte_length = start_bytes + offset;
        debug!(start = start_length, count = blocks.len(), "appended");
        self.after_growth(start_length, blocks.len() as u64)
    }

    fn reseed_merkle(&mut self) {
        let mut roots = Vec::new();
        for index in flat::full_roots(2 * self.length) {
            match self.storage.get_node(index) {
                Ok(node) => roots.push(node),
                Err(_) => return, // unrecoverable here; next open rebuilds
            }
        }
        self.merkle = MerkleGenerator::from_roots(roots);
    }

    /// flush first, then make the growth observable to waiters and peers
    fn after_growth(&mut self, start: u64, count: u64) -> Result<()> {
        let flush = self.sync_bitfield();
        self.resolve_waiters();
        let have = Have {
            start,
            length: count,
        };
        let byte_length = self.byte_length;
        for peer in self.peer_snapshot() {
            peer.have(&have);
            peer.have_bytes(byte_length);
        }
        flush
    }

    // put path

    /// absorb a block received from a peer, verifying it against the key
    pub fn put(&mut self, index: u64, data: &[u8], proof: &Proof) -> Result<()> {
        self.ensure_mutable()?;
        if self.bitfield.get(index) {
            return Ok(());
        }
        self.put_inner(index, Some(data), proof)
    }

    /// absorb just a leaf hash; `proof.nodes[0]` must be the leaf node
    pub fn put_hash(&mut self, index: u64, proof: &Proof) -> Result<()> {
        self.ensure_mutable()?;
        if self.bitfield.tree_get(2 * index) {
            return Ok(());
        }
        self.put_inner(index, None, proof)
    }

    fn put_inner(&mut self, index: u64, data: Option<&[u8]>, proof: &Proof) -> Result<()> {
        let leaf = 2 * index;
        let mut cursor = 0usize;
        let top = match data {
            Some(data) => Node::new(leaf, hash::leaf(data), data.len() as u64),
            None => {
                let node = proof
                    .nodes
                    .first()
                    .ok_or(Error::InvalidProof("missing leaf node"))?;
                if node.index != leaf {
                    return Err(Error::InvalidProof("unexpected leaf index"));
                }
                cursor = 1;
                *node
            }
        };

        // trust frontier: find the committed ancestor this proof can anchor
        // on, collecting which siblings come from the proof and which are
        // already local
        let mut trusted = None;
        let mut local_siblings: SmallVec<[u64; 8]> = SmallVec::new();
        let mut next = leaf;
        let mut i = cursor;
        loop {
            if self.bitfield.tree_get(next) {
                trusted = Some(next);
                break;
            }
            let sib = flat::sibling(next);
            if i < proof.nodes.len() && proof.nodes[i].index == sib {
                i += 1;
            } else if self.bitfield.tree_get(sib) {
                local_siblings.push(sib);
            } else {
                break;
            }
            next = flat::parent(next);
        }
        let trusted_node = match trusted {
            Some(idx) => Some(self.storage.get_node(idx)?),
            None => None,
        };
        let mut local_nodes = Vec::with_capacity(local_siblings.len());
        for idx in local_siblings {
            local_nodes.push(self.storage.get_node(idx)?);
        }

        // hash upward until we either reach the anchor or run out of siblings
        let mut valid: Vec<Node> = vec![top];
        let mut top = top;
        let mut p = cursor;
        loop {
            if let Some(anchor) = &trusted_node {
                if anchor.index == top.index {
                    if anchor.hash != top.hash {
                        warn!(index, "proof disagrees with trusted ancestor");
                        return Err(Error::InvalidProof("hash mismatch at trusted node"));
                    }
                    return self.commit(index, data, valid, None, None);
                }
            }
            let sib_index = flat::sibling(top.index);
            let sibling = if p < proof.nodes.len() && proof.nodes[p].index == sib_index {
                let node = proof.nodes[p];
                p += 1;
                valid.push(node);
                node
            } else if let Some(pos) = local_nodes.iter().position(|n| n.index == sib_index) {
                local_nodes.remove(pos)
            } else {
                // no anchor reached: the candidate top must check out against
                // the signed (or finalized) root set
                return self.verify_roots(index, data, proof, top, p, valid);
            };
            let parent = Node::new(
                flat::parent(top.index),
                hash::parent(&top, &sibling),
                top.size + sibling.size,
            );
            valid.push(parent);
            top = parent;
        }
    }

    fn verify_roots(
        &mut self,
        index: u64,
        data: Option<&[u8]>,
        proof: &Proof,
        top: Node,
        consumed: usize,
        mut valid: Vec<Node>,
    ) -> Result<()> {
        let last_index = proof
            .nodes
            .last()
            .map(|n| n.index)
            .unwrap_or(top.index);
        let verified_by =
            flat::right_span(top.index).max(flat::right_span(last_index)) + 2;
        let mut roots = Vec::new();
        for root_index in flat::full_roots(verified_by) {
            if root_index == top.index {
                roots.push(top);
            } else if let Some(node) = proof.nodes[consumed..]
                .iter()
                .find(|n| n.index == root_index)
            {
                roots.push(*node);
                valid.push(*node);
            } else {
                match self.storage.get_node(root_index) {
                    Ok(node) => roots.push(node),
                    Err(Error::NotFound) => {
                        return Err(Error::InvalidProof("missing root node"))
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let checksum = hash::tree_root(&roots);
        let signature = match &proof.signature {
            Some(signature) => {
                hash::verify(&self.key, &checksum, signature)?;
                Some((verified_by / 2 - 1, *signature))
            }
            None => {
                if self.live {
                    return Err(Error::MissingSignature);
                }
                if checksum != self.key {
                    return Err(Error::InvalidProof("root hash does not match key"));
                }
                None
            }
        };
        let byte_length = roots.iter().map(|r| r.size).sum();
        self.commit(
            index,
            data,
            valid,
            signature,
            Some((verified_by / 2, byte_length)),
        )?;
        if proof.signature.is_some() && !self.live {
            // signed growth promotes a finalized feed back to live
            self.live = true;
        }
        Ok(())
    }

    fn commit(
        &mut self,
        index: u64,
        data: Option<&[u8]>,
        nodes: Vec<Node>,
        signature: Option<(u64, [u8; 64])>,
        growth: Option<(u64, u64)>,
    ) -> Result<()> {
        // a proof that verified but contradicts committed nodes poisons the
        // feed: collision, bug or storage corruption
        for node in &nodes {
            if self.bitfield.tree_get(node.index) {
                let existing = self.storage.get_node(node.index)?;
                if existing.hash != node.hash {
                    warn!(node = node.index, "verified proof conflicts with committed tree");
                    self.poisoned = Some(node.index);
                    return Err(Error::Critical { index: node.index });
                }
            }
        }
        for node in &nodes {
            self.storage.put_node(node)?;
        }
        if let Some((slot, signature)) = signature {
            self.storage.put_signature(slot, &signature)?;
        }
        if let Some(data) = data {
            if !self.indexing {
                let offset = self.byte_offset_of(index)?;
                self.storage.put_data(offset, data)?;
            }
        }
        for node in &nodes {
            tree_index::set(&mut self.bitfield, node.index);
        }
        if data.is_some() {
            self.bitfield.set(index, true);
        }
        let grew = match growth {
            Some((length, bytes)) if length > self.length => {
                self.length = length;
                self.byte_length = bytes;
                true
            }
            _ => false,
        };
        debug!(index, grew, "verified block committed");
        if data.is_some() {
            self.after_growth(index, 1)?;
        } else {
            // hash-only: no block became readable, but seeks may resolve now
            let flush = self.sync_bitfield();
            self.resolve_waiters();
            flush?;
        }
        if grew {
            self.update_peers();
        }
        Ok(())
    }

    // read path

    /// Local read; `Ok(None)` when the block is not here.
    pub fn get(&self, index: u64) -> Result<Option<C::Value>> {
        self.ensure_open()?;
        if !self.bitfield.get(index) {
            return Ok(None);
        }
        let data = self.read_block(index)?;
        Ok(Some(self.codec.decode(&data)?))
    }

    /// last block of the feed
    pub fn head(&self) -> Result<Option<C::Value>> {
        self.ensure_open()?;
        if self.length == 0 {
            return Err(Error::OutOfBounds {
                length: 0,
                tried: 0,
            });
        }
        self.get(self.length - 1)
    }

    /// Read that parks until the block arrives. Resolve the returned handle
    /// after feeding puts into the feed; a deadline turns into
    /// [Error::Timeout] once [Feed::expire_waiters] runs past it.
    pub fn get_wait(&mut self, index: u64, timeout: Option<Duration>) -> Result<PendingGet<C>> {
        self.ensure_open()?;
        if self.bitfield.get(index) {
            let data = self.read_block(index)?;
            let value = self.codec.decode(&data)?;
            return Ok(PendingGet::ready(value));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            deadline: timeout.map(|t| Instant::now() + t),
            kind: WaiterKind::Block { index, tx },
        });
        self.update_peers();
        Ok(PendingGet::waiting(rx, self.codec.clone()))
    }

    pub fn has(&self, index: u64) -> bool {
        self.bitfield.get(index)
    }

    pub fn has_range(&self, start: u64, end: u64) -> bool {
        self.bitfield.count_ones(start, end) == end - start
    }

    /// number of locally available blocks in `[start, end)`
    pub fn downloaded(&self, start: u64, end: u64) -> u64 {
        self.bitfield.count_ones(start, end)
    }

    fn read_block(&self, index: u64) -> Result<Vec<u8>> {
        let node = self.storage.get_node(2 * index)?;
        let offset = self.byte_offset_of(index)?;
        let data = self.storage.get_data(offset, node.size)?;
        if hash::leaf(&data) != node.hash {
            return Err(Error::ChecksumFailed { index });
        }
        Ok(data)
    }

    /// byte position of block `index` in the data stream
    fn byte_offset_of(&self, index: u64) -> Result<u64> {
        let mut offset = 0;
        for root in flat::full_roots(2 * index) {
            offset += self.storage.get_node(root)?.size;
        }
        Ok(offset)
    }

    // seek path

    /// map a byte offset to `(block, offset within block)`
    pub fn seek(&self, offset: u64) -> Result<(u64, u64)> {
        self.ensure_open()?;
        match self.seek_local(offset)? {
            SeekOutcome::Found(block, rest) => Ok((block, rest)),
            SeekOutcome::OutOfRange => Err(Error::OutOfBounds {
                length: self.byte_length,
                tried: offset,
            }),
            SeekOutcome::MissingNodes => Err(Error::NotFound),
        }
    }

    /// seek that parks until peers supply the missing subtree
    pub fn seek_wait(&mut self, offset: u64, timeout: Option<Duration>) -> Result<PendingSeek> {
        self.ensure_open()?;
        if let SeekOutcome::Found(block, rest) = self.seek_local(offset)? {
            return Ok(PendingSeek::ready((block, rest)));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            deadline: timeout.map(|t| Instant::now() + t),
            kind: WaiterKind::Seek { offset, tx },
        });
        self.update_peers();
        Ok(PendingSeek::waiting(rx))
    }

    fn seek_local(&self, mut offset: u64) -> Result<SeekOutcome> {
        if offset == 0 {
            return Ok(SeekOutcome::Found(0, 0));
        }
        for root_index in flat::full_roots(2 * self.length) {
            let root = match self.storage.get_node(root_index) {
                Ok(node) => node,
                Err(Error::NotFound) => return Ok(SeekOutcome::MissingNodes),
                Err(e) => return Err(e),
            };
            if offset >= root.size {
                offset -= root.size;
                continue;
            }
            // descend towards the leaf holding the offset
            let mut current = root;
            loop {
                if current.index & 1 == 0 {
                    return Ok(SeekOutcome::Found(current.index / 2, offset));
                }
                let left = match self.storage.get_node(flat::left_child(current.index)) {
                    Ok(node) => node,
                    Err(Error::NotFound) => return Ok(SeekOutcome::MissingNodes),
                    Err(e) => return Err(e),
                };
                if offset < left.size {
                    current = left;
                } else {
                    offset -= left.size;
                    current = match self.storage.get_node(flat::right_child(current.index)) {
                        Ok(node) => node,
                        Err(Error::NotFound) => return Ok(SeekOutcome::MissingNodes),
                        Err(e) => return Err(e),
                    };
                }
            }
        }
        Ok(SeekOutcome::OutOfRange)
    }

    // proof generation

    /// full proof for `block` against a peer that has nothing yet
    pub fn proof(&self, block: u64) -> Result<Proof> {
        self.proof_with(block, ProofRequest::default())
    }

    /// proof tailored to what the requester already holds
    pub fn proof_with(&self, block: u64, request: ProofRequest) -> Result<Proof> {
        self.ensure_open()?;
        let plan = tree_index::proof(&self.bitfield, block, request.digest, request.hash)
            .ok_or(Error::NotFound)?;
        let mut nodes = Vec::with_capacity(plan.nodes.len());
        for index in plan.nodes {
            nodes.push(self.storage.get_node(index)?);
        }
        let signature = match plan.verified_by {
            Some(boundary) if self.live => {
                match self.storage.get_signature(boundary / 2 - 1) {
                    Ok(signature) => Some(signature),
                    Err(Error::NotFound) => return Err(Error::MissingSignature),
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };
        Ok(Proof { nodes, signature })
    }

    /// what this side already holds around `block`, for proof dedup
    pub fn digest(&self, block: u64) -> Digest {
        tree_index::digest(&self.bitfield, block)
    }

    // signatures

    /// first stored signature at or after `index`
    pub fn signature(&self, index: u64) -> Result<[u8; 64]> {
        if index >= self.length {
            return Err(Error::OutOfBounds {
                length: self.length,
                tried: index,
            });
        }
        for slot in index..self.length {
            match self.storage.get_signature(slot) {
                Ok(signature) => return Ok(signature),
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::MissingSignature)
    }

    /// check a detached signature covering the first `index + 1` blocks
    pub fn verify_signature(&self, index: u64, signature: &[u8]) -> Result<()> {
        let mut roots = Vec::new();
        for root in flat::full_roots(2 * (index + 1)) {
            roots.push(self.storage.get_node(root)?);
        }
        hash::verify(&self.key, &hash::tree_root(&roots), signature)
    }

    /// the full roots anchoring block `index`
    pub fn root_hashes(&self, index: u64) -> Result<Vec<Node>> {
        if index >= self.length {
            return Err(Error::OutOfBounds {
                length: self.length,
                tried: index,
            });
        }
        let mut roots = Vec::new();
        for root in flat::full_roots(2 * (index + 1)) {
            roots.push(self.storage.get_node(root)?);
        }
        Ok(roots)
    }

    // selections

    /// declare interest in a range; replication drives the actual requests
    pub fn download(&mut self, range: DownloadRange) -> SelectionId {
        let id = self.selections.add(range);
        self.update_peers();
        id
    }

    /// drop a selection by id
    pub fn undownload(&mut self, id: SelectionId) -> bool {
        let removed = self.selections.remove(id).is_some();
        if removed {
            self.update_peers();
        }
        removed
    }

    /// drop the first selection matching the range and cancel reads parked
    /// inside it
    pub fn undownload_range(&mut self, range: DownloadRange) -> bool {
        let removed = match self.selections.remove_range(range) {
            Some(selection) => selection,
            None => return false,
        };
        let mut i = 0;
        while i < self.waiters.len() {
            let cancel = match &self.waiters[i].kind {
                WaiterKind::Block { index, .. } => removed.contains(*index),
                WaiterKind::Seek { .. } => false,
            };
            if cancel {
                match self.waiters.swap_remove(i).kind {
                    WaiterKind::Block { tx, .. } => {
                        let _ = tx.send(Err(Error::Cancelled));
                    }
                    WaiterKind::Seek { .. } => unreachable!(),
                }
            } else {
                i += 1;
            }
        }
        self.update_peers();
        true
    }

    // peers

    pub fn register_peer(&mut self, peer: ArcPeer) -> PeerHandle {
        if let Some(slot) = self.peers.iter().position(|p| p.is_none()) {
            self.peers[slot] = Some(peer);
            PeerHandle(slot)
        } else {
            self.peers.push(Some(peer));
            PeerHandle(self.peers.len() - 1)
        }
    }

    pub fn remove_peer(&mut self, handle: PeerHandle) -> bool {
        match self.peers.get_mut(handle.0) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_some()).count()
    }

    fn peer_snapshot(&self) -> SmallVec<[ArcPeer; 4]> {
        self.peers.iter().flatten().cloned().collect()
    }

    fn update_peers(&self) {
        for peer in self.peer_snapshot() {
            peer.update();
        }
    }

    // waiters

    fn resolve_waiters(&mut self) {
        enum Ready {
            No,
            Block,
            Seek(u64, u64),
        }
        let mut i = 0;
        while i < self.waiters.len() {
            let ready = match &self.waiters[i].kind {
                WaiterKind::Block { index, .. } if self.bitfield.get(*index) => Ready::Block,
                WaiterKind::Seek { offset, .. } => match self.seek_local(*offset) {
                    Ok(SeekOutcome::Found(block, rest)) => Ready::Seek(block, rest),
                    _ => Ready::No,
                },
                _ => Ready::No,
            };
            if matches!(ready, Ready::No) {
                i += 1;
                continue;
            }
            match (self.waiters.swap_remove(i).kind, ready) {
                (WaiterKind::Block { index, tx }, _) => {
                    let _ = tx.send(self.read_block(index));
                }
                (WaiterKind::Seek { tx, .. }, Ready::Seek(block, rest)) => {
                    let _ = tx.send(Ok((block, rest)));
                }
                _ => unreachable!("ready kind matches waiter kind"),
            }
        }
    }

    /// fail waiters whose deadline has passed
    pub fn expire_waiters(&mut self) {
        self.expire_waiters_at(Instant::now())
    }

    pub fn expire_waiters_at(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.waiters.len() {
            let expired = matches!(self.waiters[i].deadline, Some(deadline) if deadline <= now);
            if !expired {
                i += 1;
                continue;
            }
            match self.waiters.swap_remove(i).kind {
                WaiterKind::Block { tx, .. } => {
                    let _ = tx.send(Err(Error::Timeout));
                }
                WaiterKind::Seek { tx, .. } => {
                    let _ = tx.send(Err(Error::Timeout));
                }
            }
        }
    }

    // maintenance

    /// re-hash every local block against its leaf node, clearing the bit of
    /// anything that fails
    pub fn audit(&mut self) -> Result<AuditReport> {
        self.ensure_open()?;
        let mut report = AuditReport::default();
        for index in 0..self.length {
            if !self.bitfield.get(index) {
                continue;
            }
            match self.read_block(index) {
                Ok(_) => report.valid += 1,
                Err(Error::ChecksumFailed { .. }) => {
                    warn!(index, "audit found a corrupt block");
                    report.invalid += 1;
                    self.bitfield.set(index, false);
                }
                Err(e) => return Err(e),
            }
        }
        if report.invalid > 0 {
            self.sync_bitfield()?;
            self.update_peers();
        }
        Ok(report)
    }

    /// Freeze the feed: the key becomes the root hash of the current tree
    /// and verification switches to key equality. The feed stops being
    /// writable.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        if !self.writable {
            return Err(Error::NotWritable);
        }
        let key = hash::tree_root(self.merkle.roots());
        self.storage.put_key(&key)?;
        self.key = key;
        self.discovery_key = hash::discovery_key(&key);
        self.secret = None;
        self.writable = false;
        self.live = false;
        debug!(length = self.length, "feed finalized");
        Ok(())
    }

    /// Flush dirty bitfield pages. Coalesces if a flush is already running;
    /// on failure the pages stay dirty and the error surfaces here and on
    /// the next flush.
    pub fn flush(&mut self) -> Result<()> {
        self.sync_bitfield()
    }

    fn sync_bitfield(&mut self) -> Result<()> {
        if !self.flush.begin() {
            return Ok(());
        }
        let mut result = Ok(());
        loop {
            while let Some((page, record)) = self.bitfield.last_update() {
                if let Err(e) = self.storage.put_bitfield_page(page, &record) {
                    self.bitfield.retain_dirty(page);
                    result = Err(e);
                    break;
                }
            }
            if !self.flush.finish() || result.is_err() {
                break;
            }
        }
        result
    }

    /// Stop serving reads and writes, cancel parked waiters, close storage.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;
        self.writable = false;
        for waiter in self.waiters.drain(..) {
            match waiter.kind {
                WaiterKind::Block { tx, .. } => {
                    let _ = tx.send(Err(Error::Cancelled));
                }
                WaiterKind::Seek { tx, .. } => {
                    let _ = tx.send(Err(Error::Cancelled));
                }
            }
        }
        self.selections.clear();
        self.storage.close()
    }
}

/// a read that may still be in flight, see [Feed::get_wait]
pub struct PendingGet<C: Codec> {
    state: PendingGetState<C>,
}

enum PendingGetState<C: Codec> {
    Ready(Option<C::Value>),
    Waiting {
        rx: oneshot::Receiver<Result<Vec<u8>>>,
        codec: C,
    },
}

impl<C: Codec> PendingGet<C> {
    fn ready(value: C::Value) -> Self {
        Self {
            state: PendingGetState::Ready(Some(value)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<Vec<u8>>>, codec: C) -> Self {
        Self {
            state: PendingGetState::Waiting { rx, codec },
        }
    }

    /// `Ok(None)` while the block has not arrived yet; yields the value once
    pub fn try_resolve(&mut self) -> Result<Option<C::Value>> {
        match &mut self.state {
            PendingGetState::Ready(value) => Ok(value.take()),
            PendingGetState::Waiting { rx, codec } => match rx.try_recv() {
                Ok(Some(Ok(data))) => Ok(Some(codec.decode(&data)?)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) => Ok(None),
                Err(_) => Err(Error::Cancelled),
            },
        }
    }
}

/// a byte seek that may still be in flight, see [Feed::seek_wait]
pub struct PendingSeek {
    state: PendingSeekState,
}

enum PendingSeekState {
    Ready(Option<(u64, u64)>),
    Waiting(oneshot::Receiver<Result<(u64, u64)>>),
}

impl PendingSeek {
    fn ready(result: (u64, u64)) -> Self {
        Self {
            state: PendingSeekState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(u64, u64)>>) -> Self {
        Self {
            state: PendingSeekState::Waiting(rx),
        }
    }

    pub fn try_resolve(&mut self) -> Result<Option<(u64, u64)>> {
        match &mut self.state {
            PendingSeekState::Ready(result) => Ok(result.take()),
            PendingSeekState::Waiting(rx) => match rx.try_recv() {
                Ok(Some(Ok(result))) => Ok(Some(result)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) => Ok(None),
                Err(_) => Err(Error::Cancelled),
            },
        }
    }
}
