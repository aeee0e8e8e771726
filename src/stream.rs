//! read and write stream adapters over a feed
//!
//! Streams do not hold a borrow of the feed; each call hands the feed back
//! in. A read stream keeps at most one outstanding parked read and follows
//! the live tail when asked to, with the same wait and timeout semantics as
//! [Feed::get_wait].
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::feed::{Feed, PendingGet};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub start: u64,
    /// `None` reads to the feed length, or forever when `live`
    pub end: Option<u64>,
    /// follow the tail instead of ending at the current length
    pub live: bool,
    /// start at the feed length at creation time
    pub tail: bool,
    /// park on missing blocks instead of failing
    pub wait: bool,
    pub timeout: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            live: false,
            tail: false,
            wait: true,
            timeout: None,
        }
    }
}

/// one step of a read stream
pub enum StreamState<V> {
    Item(V),
    /// a read is parked; feed more puts or appends, then call again
    Waiting,
    End,
}

pub struct ReadStream<C: Codec> {
    pos: u64,
    end: Option<u64>,
    live: bool,
    wait: bool,
    timeout: Option<Duration>,
    pending: Option<PendingGet<C>>,
}

impl<C: Codec> ReadStream<C> {
    pub fn new(feed: &Feed<C>, options: ReadOptions) -> Self {
        let pos = if options.tail {
            feed.len()
        } else {
            options.start
        };
        let end = match (options.live, options.end) {
            (true, end) => end,
            (false, Some(end)) => Some(end),
            (false, None) => Some(feed.len()),
        };
        Self {
            pos,
            end,
            live: options.live,
            wait: options.wait,
            timeout: options.timeout,
            pending: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// advance by one block if possible
    pub fn read(&mut self, feed: &mut Feed<C>) -> Result<StreamState<C::Value>> {
        if let Some(pending) = &mut self.pending {
            return match pending.try_resolve()? {
                Some(value) => {
                    self.pending = None;
                    self.pos += 1;
                    Ok(StreamState::Item(value))
                }
                None => Ok(StreamState::Waiting),
            };
        }
        if let Some(end) = self.end {
            if self.pos >= end {
                return Ok(StreamState::End);
            }
        }
        if feed.has(self.pos) {
            let value = feed
                .get(self.pos)?
                .expect("bitfield bit is set, block is readable");
            self.pos += 1;
            return Ok(StreamState::Item(value));
        }
        if !self.wait && !self.live {
            return Err(Error::NotFound);
        }
        self.pending = Some(feed.get_wait(self.pos, self.timeout)?);
        Ok(StreamState::Waiting)
    }

    /// drain everything currently readable
    pub fn collect(&mut self, feed: &mut Feed<C>) -> Result<Vec<C::Value>> {
        let mut items = Vec::new();
        loop {
            match self.read(feed)? {
                StreamState::Item(value) => items.push(value),
                StreamState::Waiting | StreamState::End => return Ok(items),
            }
        }
    }
}

/// buffered writer that submits whole batches through the append pipeline
#[derive(Debug)]
pub struct WriteStream<C: Codec> {
    buffer: Vec<C::Value>,
}

impl<C: Codec> Default for WriteStream<C> {
    fn default() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl<C: Codec> WriteStream<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: C::Value) {
        self.buffer.push(value);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append everything buffered as one batch; returns the index of the
    /// first block written. The batch is durable when this returns.
    pub fn flush(&mut self, feed: &mut Feed<C>) -> Result<u64> {
        let first = feed.append_batch(&self.buffer)?;
        self.buffer.clear();
        Ok(first)
    }
}

impl<C: Codec> Feed<C> {
    pub fn read_stream(&self, options: ReadOptions) -> ReadStream<C> {
        ReadStream::new(self, options)
    }

    pub fn write_stream(&self) -> WriteStream<C> {
        WriteStream::new()
    }
}
