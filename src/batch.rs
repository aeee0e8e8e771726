//! sequencing primitives for the mutation pipeline
//!
//! [AtomicBatcher] serializes batches of work: submissions are queued in FIFO
//! order and drained by whichever call currently holds the worker role, so a
//! reentrant submission can never interleave with a running batch.
//! [FlushLatch] coalesces redundant flush requests into a single re-run,
//! last one wins.
use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct AtomicBatcher<T> {
    queue: VecDeque<Vec<T>>,
    running: bool,
}

impl<T> Default for AtomicBatcher<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            running: false,
        }
    }
}

impl<T> AtomicBatcher<T> {
    /// Submit a batch and drain the queue unless a drain is already running.
    ///
    /// A reentrant submission returns `Ok(())` immediately; the outer drain
    /// picks the batch up and its result is reported to the outer caller.
    pub fn run<E>(
        &mut self,
        batch: Vec<T>,
        mut worker: impl FnMut(Vec<T>) -> Result<(), E>,
    ) -> Result<(), E> {
        self.queue.push_back(batch);
        if self.running {
            return Ok(());
        }
        self.running = true;
        let mut result = Ok(());
        while let Some(next) = self.queue.pop_front() {
            result = worker(next);
            if result.is_err() {
                break;
            }
        }
        self.running = false;
        result
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// last-one-wins flush coalescing
#[derive(Debug, Default)]
pub(crate) struct FlushLatch {
    active: bool,
    pending: bool,
}

impl FlushLatch {
    /// true when the caller should perform the flush itself
    pub fn begin(&mut self) -> bool {
        if self.active {
            self.pending = true;
            false
        } else {
            self.active = true;
            true
        }
    }

    /// true when a request arrived mid-flush and the flush must re-run
    pub fn finish(&mut self) -> bool {
        if self.pending {
            self.pending = false;
            true
        } else {
            self.active = false;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_complete_in_submission_order() {
        let mut batcher = AtomicBatcher::default();
        let mut seen = Vec::new();
        batcher
            .run(vec![1, 2], |b| -> Result<(), ()> {
                seen.extend(b);
                Ok(())
            })
            .unwrap();
        batcher
            .run(vec![3], |b| -> Result<(), ()> {
                seen.extend(b);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn a_failed_batch_leaves_the_queue_usable() {
        let mut batcher = AtomicBatcher::default();
        assert!(batcher.run(vec![1], |_| Err("boom")).is_err());
        let mut seen = Vec::new();
        batcher
            .run(vec![2], |b| -> Result<(), ()> {
                seen.extend(b);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn latch_coalesces_requests_while_active() {
        let mut latch = FlushLatch::default();
        assert!(latch.begin());
        // two requests while the flush runs fold into one re-run
        assert!(!latch.begin());
        assert!(!latch.begin());
        assert!(latch.finish());
        assert!(!latch.finish());
        // idle again
        assert!(latch.begin());
        assert!(!latch.finish());
    }
}
