#![allow(dead_code)]
//! helper methods for the tests
use canopy::feed::{Feed, Options};
use canopy::peer::{Have, Peer};
use canopy::storage::{MemoryStorage, RandomAccess, Storage, StreamKind};
use canopy::{Error, Result, Utf8};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// fresh writable utf-8 feed over shared memory storage
pub fn writable_feed(options: Options) -> (Feed<Utf8>, MemoryStorage) {
    let storage = MemoryStorage::new();
    let feed = Feed::with_codec(&storage, options, Utf8).unwrap();
    (feed, storage)
}

/// reader feed for the given writer's key
pub fn reader_for(writer: &Feed<Utf8>, live: bool) -> (Feed<Utf8>, MemoryStorage) {
    let storage = MemoryStorage::new();
    let options = Options::default().key(*writer.key()).live(live);
    let feed = Feed::with_codec(&storage, options, Utf8).unwrap();
    (feed, storage)
}

/// writer with `count` single-letter blocks starting at 'a'
pub fn lettered_writer(count: usize) -> (Feed<Utf8>, MemoryStorage) {
    let (mut feed, storage) = writable_feed(Options::default());
    let values: Vec<String> = (0..count)
        .map(|i| ((b'a' + i as u8) as char).to_string())
        .collect();
    feed.append_batch(&values).unwrap();
    (feed, storage)
}

/// copy one block from the writer into the reader via a fresh proof
pub fn replicate_block(writer: &Feed<Utf8>, reader: &mut Feed<Utf8>, index: u64) -> Result<()> {
    let data = writer
        .get(index)?
        .expect("writer holds all of its own blocks");
    let proof = writer.proof(index)?;
    reader.put(index, data.as_bytes(), &proof)
}

/// peer stub recording every hook invocation
#[derive(Default)]
pub struct RecordingPeer {
    pub updates: AtomicUsize,
    pub haves: Mutex<Vec<Have>>,
    pub bytes: AtomicUsize,
}

impl Peer for RecordingPeer {
    fn update(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn have(&self, have: &Have) {
        self.haves.lock().unwrap().push(*have);
    }

    fn have_bytes(&self, byte_length: u64) {
        self.bytes.store(byte_length as usize, Ordering::SeqCst);
    }
}

/// storage wrapper that fails writes to selected streams once armed
#[derive(Clone, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, kind: StreamKind) {
        self.failing.lock().unwrap().insert(kind.name());
    }

    pub fn heal(&self, kind: StreamKind) {
        self.failing.lock().unwrap().remove(kind.name());
    }
}

impl Storage for FailingStorage {
    fn open(&self, kind: StreamKind) -> Result<Box<dyn RandomAccess>> {
        Ok(Box::new(FailingFile {
            inner: self.inner.open(kind)?,
            kind,
            failing: self.failing.clone(),
        }))
    }
}

struct FailingFile {
    inner: Box<dyn RandomAccess>,
    kind: StreamKind,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

impl RandomAccess for FailingFile {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner.read(offset, length)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.failing.lock().unwrap().contains(self.kind.name()) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.write(offset, data)
    }

    fn truncate(&self, length: u64) -> Result<()> {
        self.inner.truncate(length)
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
