//! binding between feed records and a set of random-access stores
//!
//! A feed persists itself into six logical streams. Four of them are fixed
//! record files addressed by index, `data` is a raw concatenation of blocks,
//! and `key`/`secret_key` hold a single record each. The streams themselves
//! are abstracted behind [RandomAccess] so a feed can live in memory, on
//! disk, or anywhere else that can serve byte ranges.
use crate::error::{Error, Result};
use crate::hash::Hash;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// size of a stored tree node record: hash followed by a big-endian size
pub const NODE_SIZE: u64 = 40;
/// size of a stored signature record
pub const SIGNATURE_SIZE: u64 = 64;
/// size of the header prefixed to the record streams
pub const HEADER_SIZE: u64 = 32;
/// size of one bitfield page record, see the bitfield module for the layout
pub const BITFIELD_PAGE_SIZE: u64 = 3328;

const MAGIC: [u8; 3] = [0x05, 0x02, 0x57];

/// the logical streams a feed is persisted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Data,
    Tree,
    Bitfield,
    Signatures,
    Key,
    SecretKey,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Data => "data",
            StreamKind::Tree => "tree",
            StreamKind::Bitfield => "bitfield",
            StreamKind::Signatures => "signatures",
            StreamKind::Key => "key",
            StreamKind::SecretKey => "secret_key",
        }
    }
}

/// a single tree node as stored in the `tree` stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    /// flat-tree index
    pub index: u64,
    pub hash: Hash,
    /// total byte length of the blocks below this node
    pub size: u64,
}

impl Node {
    pub fn new(index: u64, hash: Hash, size: u64) -> Self {
        Self { index, hash, size }
    }

    pub fn to_bytes(&self) -> [u8; NODE_SIZE as usize] {
        let mut buf = [0u8; NODE_SIZE as usize];
        buf[..32].copy_from_slice(&self.hash);
        buf[32..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn from_bytes(index: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() != NODE_SIZE as usize {
            return Err(Error::NotFound);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[32..]);
        Ok(Self {
            index,
            hash,
            size: u64::from_be_bytes(size),
        })
    }

    fn is_blank(buf: &[u8]) -> bool {
        buf.iter().all(|b| *b == 0)
    }
}

/// Byte-range access to one logical stream.
///
/// Reads past the end of the stream must report [Error::NotFound] so callers
/// can tell a missing record from an I/O failure. Writes extend the stream
/// with zeroes as needed.
pub trait RandomAccess: Send {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn truncate(&self, length: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn close(&self) -> Result<()>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// factory producing the stream behind each [StreamKind]
pub trait Storage {
    fn open(&self, kind: StreamKind) -> Result<Box<dyn RandomAccess>>;
}

impl<F> Storage for F
where
    F: Fn(StreamKind) -> Result<Box<dyn RandomAccess>>,
{
    fn open(&self, kind: StreamKind) -> Result<Box<dyn RandomAccess>> {
        self(kind)
    }
}

/// In-memory storage, the reference implementation.
///
/// Cloning shares the underlying buffers, so a feed can be closed and
/// reopened against the same `MemoryStorage` to exercise recovery paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<FnvHashMap<&'static str, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn open(&self, kind: StreamKind) -> Result<Box<dyn RandomAccess>> {
        let buf = self
            .files
            .lock()
            .entry(kind.name())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Box::new(RandomAccessMemory { buf }))
    }
}

pub struct RandomAccessMemory {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl RandomAccess for RandomAccessMemory {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let buf = self.buf.lock();
        let start = offset as usize;
        let end = start + length as usize;
        if end > buf.len() {
            return Err(Error::NotFound);
        }
        Ok(buf[start..end].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&self, length: u64) -> Result<()> {
        let mut buf = self.buf.lock();
        buf.truncate(length as usize);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.buf.lock().len() as u64)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// snapshot of persisted state taken when the binding is opened
#[derive(Debug, Default)]
pub struct OpenState {
    pub key: Option<[u8; 32]>,
    pub secret_key: Option<[u8; 64]>,
    /// bitfield page records in page order
    pub bitfield_pages: Vec<Vec<u8>>,
}

/// the feed's view of its six streams
pub struct FeedStorage {
    data: Box<dyn RandomAccess>,
    tree: Box<dyn RandomAccess>,
    bitfield: Box<dyn RandomAccess>,
    signatures: Box<dyn RandomAccess>,
    key: Box<dyn RandomAccess>,
    secret_key: Box<dyn RandomAccess>,
}

fn header(kind: u8, entry_size: u16, algorithm: &str) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[..3].copy_from_slice(&MAGIC);
    buf[3] = kind;
    buf[4] = 0; // version
    buf[5..7].copy_from_slice(&entry_size.to_be_bytes());
    buf[7] = algorithm.len() as u8;
    buf[8..8 + algorithm.len()].copy_from_slice(algorithm.as_bytes());
    buf
}

fn ensure_header(stream: &dyn RandomAccess, hdr: &[u8; HEADER_SIZE as usize]) -> Result<()> {
    if stream.is_empty()? {
        stream.write(0, hdr)?;
        return Ok(());
    }
    match stream.read(0, 4) {
        Ok(prefix) if prefix[..3] == MAGIC && prefix[3] == hdr[3] => Ok(()),
        // short or foreign file, a later record write will sort it out
        Err(Error::NotFound) => Ok(()),
        Ok(_) => Err(Error::AlreadyExists),
        Err(e) => Err(e),
    }
}

impl FeedStorage {
    pub fn open(storage: &dyn Storage) -> Result<(Self, OpenState)> {
        let this = Self {
            data: storage.open(StreamKind::Data)?,
            tree: storage.open(StreamKind::Tree)?,
            bitfield: storage.open(StreamKind::Bitfield)?,
            signatures: storage.open(StreamKind::Signatures)?,
            key: storage.open(StreamKind::Key)?,
            secret_key: storage.open(StreamKind::SecretKey)?,
        };
        ensure_header(&*this.tree, &header(2, NODE_SIZE as u16, "Sha256"))?;
        ensure_header(&*this.signatures, &header(1, SIGNATURE_SIZE as u16, "Ed25519"))?;
        ensure_header(&*this.bitfield, &header(0, BITFIELD_PAGE_SIZE as u16, ""))?;

        let mut state = OpenState {
            key: match this.key.read(0, 32) {
                Ok(buf) => Some(buf.try_into().expect("read returned 32 bytes")),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            },
            secret_key: match this.secret_key.read(0, 64) {
                Ok(buf) => Some(buf.try_into().expect("read returned 64 bytes")),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            },
            bitfield_pages: Vec::new(),
        };
        let bitfield_len = this.bitfield.len()?;
        if bitfield_len > HEADER_SIZE {
            let pages = (bitfield_len - HEADER_SIZE) / BITFIELD_PAGE_SIZE;
            for page in 0..pages {
                state.bitfield_pages.push(this.bitfield.read(
                    HEADER_SIZE + page * BITFIELD_PAGE_SIZE,
                    BITFIELD_PAGE_SIZE,
                )?);
            }
        }
        Ok((this, state))
    }

    pub fn get_node(&self, index: u64) -> Result<Node> {
        let buf = self.tree.read(HEADER_SIZE + index * NODE_SIZE, NODE_SIZE)?;
        if Node::is_blank(&buf) {
            return Err(Error::NotFound);
        }
        Node::from_bytes(index, &buf)
    }

    pub fn put_node(&self, node: &Node) -> Result<()> {
        self.tree
            .write(HEADER_SIZE + node.index * NODE_SIZE, &node.to_bytes())
    }

    pub fn get_data(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.data.read(offset, length)
    }

    pub fn put_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.data.write(offset, data)
    }

    pub fn get_signature(&self, index: u64) -> Result<[u8; 64]> {
        let buf = self
            .signatures
            .read(HEADER_SIZE + index * SIGNATURE_SIZE, SIGNATURE_SIZE)?;
        if buf.iter().all(|b| *b == 0) {
            return Err(Error::NotFound);
        }
        Ok(buf.try_into().expect("read returned 64 bytes"))
    }

    pub fn put_signature(&self, index: u64, signature: &[u8; 64]) -> Result<()> {
        self.signatures
            .write(HEADER_SIZE + index * SIGNATURE_SIZE, signature)
    }

    pub fn put_bitfield_page(&self, page: u64, record: &[u8]) -> Result<()> {
        debug_assert_eq!(record.len() as u64, BITFIELD_PAGE_SIZE);
        self.bitfield
            .write(HEADER_SIZE + page * BITFIELD_PAGE_SIZE, record)
    }

    pub fn put_key(&self, key: &[u8; 32]) -> Result<()> {
        self.key.write(0, key)
    }

    pub fn put_secret_key(&self, secret: &[u8; 64]) -> Result<()> {
        self.secret_key.write(0, secret)
    }

    /// wipe everything, used by the `overwrite` open mode
    pub fn clear(&self) -> Result<()> {
        self.key.truncate(0)?;
        self.secret_key.truncate(0)?;
        self.bitfield.truncate(HEADER_SIZE)?;
        self.tree.truncate(HEADER_SIZE)?;
        self.signatures.truncate(HEADER_SIZE)?;
        self.data.truncate(0)
    }

    pub fn close(&self) -> Result<()> {
        self.data.close()?;
        self.tree.close()?;
        self.bitfield.close()?;
        self.signatures.close()?;
        self.key.close()?;
        self.secret_key.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_read_past_end_is_not_found() {
        let storage = MemoryStorage::new();
        let file = storage.open(StreamKind::Data).unwrap();
        file.write(0, b"hello").unwrap();
        assert!(matches!(file.read(0, 5), Ok(b) if b == b"hello"));
        assert!(matches!(file.read(3, 5), Err(Error::NotFound)));
    }

    #[test]
    fn node_records_round_trip_at_fixed_offsets() {
        let storage = MemoryStorage::new();
        let (feed, _) = FeedStorage::open(&storage).unwrap();
        let node = Node::new(5, [7u8; 32], 1234);
        feed.put_node(&node).unwrap();
        assert_eq!(feed.get_node(5).unwrap(), node);
        // record 5 sits exactly at header + 5 * 40
        let raw = storage.open(StreamKind::Tree).unwrap();
        let buf = raw.read(HEADER_SIZE + 5 * NODE_SIZE, NODE_SIZE).unwrap();
        assert_eq!(&buf[..32], &[7u8; 32]);
        assert_eq!(buf[32..], 1234u64.to_be_bytes());
    }

    #[test]
    fn blank_records_are_not_found() {
        let storage = MemoryStorage::new();
        let (feed, _) = FeedStorage::open(&storage).unwrap();
        feed.put_node(&Node::new(4, [1u8; 32], 1)).unwrap();
        // record 2 is all zeroes now
        assert!(matches!(feed.get_node(2), Err(Error::NotFound)));
        assert!(matches!(feed.get_signature(0), Err(Error::NotFound)));
    }

    #[test]
    fn reopen_sees_key_and_pages() {
        let storage = MemoryStorage::new();
        {
            let (feed, state) = FeedStorage::open(&storage).unwrap();
            assert!(state.key.is_none());
            feed.put_key(&[9u8; 32]).unwrap();
            feed.put_bitfield_page(0, &[0xffu8; BITFIELD_PAGE_SIZE as usize])
                .unwrap();
        }
        let (_, state) = FeedStorage::open(&storage).unwrap();
        assert_eq!(state.key, Some([9u8; 32]));
        assert_eq!(state.bitfield_pages.len(), 1);
        assert!(state.bitfield_pages[0].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let storage = MemoryStorage::new();
        storage
            .open(StreamKind::Tree)
            .unwrap()
            .write(0, b"something else entirely, 32 bytes")
            .unwrap();
        assert!(matches!(FeedStorage::open(&storage), Err(Error::AlreadyExists)));
    }
}
