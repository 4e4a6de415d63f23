//! Per-worker write side of the dedup queue

use crate::error::{DedupError, Result};
use crate::hub::Hub;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Write cursor for one marking worker.
///
/// At most one queue is attached per worker id. The queue can move to the
/// worker's thread but cannot be shared. Dropping it flushes the partially
/// filled chunk to the consumer and detaches the worker id.
pub struct WorkerQueue<T: Send> {
    hub: Arc<Hub<T>>,
    worker_id: usize,
    /// Send but not Sync
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send> WorkerQueue<T> {
    /// Attach the writer for `worker_id`
    pub fn attach(hub: Arc<Hub<T>>, worker_id: usize) -> Result<Self> {
        let worker_count = hub.worker_count();
        if worker_id >= worker_count {
            return Err(DedupError::WorkerOutOfRange {
                worker_id,
                worker_count,
            });
        }
        if !hub.try_attach(worker_id) {
            return Err(DedupError::WorkerAttached(worker_id));
        }
        Ok(Self {
            hub,
            worker_id,
            _not_sync: PhantomData,
        })
    }

    /// Worker id this queue writes for
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Enqueue a candidate.
    ///
    /// When the current chunk is full it is published to the consumer and
    /// writing continues in a fresh chunk.
    pub fn push(&mut self, candidate: T) {
        let hub = &*self.hub;
        // SAFETY: this queue is the only one attached to `worker_id`, and
        // `&mut self` rules out a concurrent safepoint visit from this side.
        let current = unsafe { &mut *hub.current_chunk(self.worker_id) };
        let chunk = match current.take() {
            Some(chunk) if chunk.is_full() => hub.publish(chunk, self.worker_id),
            Some(chunk) => chunk,
            None => hub.allocate(),
        };
        current.insert(chunk).push(candidate);
    }

    /// Publish the partially filled chunk without taking a replacement.
    ///
    /// An empty current chunk goes back to the pool instead.
    pub fn flush(&mut self) {
        // SAFETY: see `push`
        let current = unsafe { &mut *self.hub.current_chunk(self.worker_id) };
        match current.take() {
            Some(chunk) if chunk.is_empty() => self.hub.release(chunk),
            Some(chunk) => self.hub.publish_last(chunk, self.worker_id),
            None => {}
        }
    }

    /// Number of entries in the current (unpublished) chunk
    pub fn pending(&self) -> usize {
        // SAFETY: see `push`
        let current = unsafe { &*self.hub.current_chunk(self.worker_id) };
        current.as_ref().map_or(0, |chunk| chunk.len())
    }

    /// Visit the entries of the current chunk
    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut T)) {
        // SAFETY: see `push`
        let current = unsafe { &mut *self.hub.current_chunk(self.worker_id) };
        if let Some(chunk) = current.as_mut() {
            chunk.visit(visitor);
        }
    }

    /// The hub this queue publishes to
    pub fn hub(&self) -> &Arc<Hub<T>> {
        &self.hub
    }
}

impl<T: Send> Drop for WorkerQueue<T> {
    fn drop(&mut self) {
        self.flush();
        self.hub.detach(self.worker_id);
    }
}

impl<T: Send> std::fmt::Debug for WorkerQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("worker_id", &self.worker_id)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_CAPACITY;

    #[test]
    fn test_attach_rejects_out_of_range() {
        let hub: Arc<Hub<u32>> = Hub::new(2);
        let err = WorkerQueue::attach(hub, 2).unwrap_err();
        assert!(matches!(
            err,
            DedupError::WorkerOutOfRange {
                worker_id: 2,
                worker_count: 2
            }
        ));
    }

    #[test]
    fn test_attach_is_exclusive_until_drop() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        let queue = WorkerQueue::attach(hub.clone(), 0).unwrap();
        assert!(matches!(
            WorkerQueue::attach(hub.clone(), 0),
            Err(DedupError::WorkerAttached(0))
        ));
        drop(queue);
        assert!(WorkerQueue::attach(hub, 0).is_ok());
    }

    #[test]
    fn test_push_publishes_when_full() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        let mut queue = WorkerQueue::attach(hub.clone(), 0).unwrap();

        for i in 0..CHUNK_CAPACITY as u32 {
            queue.push(i);
        }
        // The full chunk is published lazily, on the next push
        assert!(!hub.has_published(0));
        assert_eq!(queue.pending(), CHUNK_CAPACITY);

        queue.push(999);
        assert!(hub.has_published(0));
        assert_eq!(queue.pending(), 1);

        let chain = hub.drain(0).unwrap();
        assert!(chain.is_full());
        assert!(!chain.has_next());
    }

    #[test]
    fn test_flush_publishes_partial_chunk() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        let mut queue = WorkerQueue::attach(hub.clone(), 0).unwrap();
        queue.push(1);
        queue.push(2);
        queue.flush();

        assert_eq!(queue.pending(), 0);
        let mut chain = hub.drain(0).unwrap();
        assert_eq!(chain.pop(), Some(2));
        assert_eq!(chain.pop(), Some(1));
    }

    #[test]
    fn test_flush_without_chunk_is_noop() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        let mut queue = WorkerQueue::attach(hub.clone(), 0).unwrap();
        queue.push(1);
        queue.flush();
        let _ = hub.drain(0);

        queue.flush();
        assert!(!hub.has_published(0));
        assert_eq!(hub.pool_stats().created, 1);
    }

    #[test]
    fn test_drop_flushes() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        {
            let mut queue = WorkerQueue::attach(hub.clone(), 0).unwrap();
            queue.push(7);
        }
        let mut chain = hub.drain(0).unwrap();
        assert_eq!(chain.pop(), Some(7));
    }

    #[test]
    fn test_visit_current_chunk() {
        let hub: Arc<Hub<u32>> = Hub::new(1);
        let mut queue = WorkerQueue::attach(hub, 0).unwrap();
        queue.push(1);
        queue.push(2);

        queue.visit(&mut |v| *v *= 10);
        let mut seen = Vec::new();
        queue.visit(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![10, 20]);
    }
}
