//! Per-server FIFO queues
//!
//! Each server's queue is split into lanes. Items pushed to one lane come
//! out of it in order; lanes are drained independently.

use hfetch_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// `lanes` FIFO queues per server
pub struct DistributedQueue<T> {
    lanes: usize,
    queues: Vec<Mutex<VecDeque<T>>>,
}

impl<T> DistributedQueue<T> {
    #[must_use]
    pub fn new(num_servers: u16, lanes: usize) -> Self {
        let lanes = lanes.max(1);
        let queues = (0..usize::from(num_servers.max(1)) * lanes)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Self { lanes, queues }
    }

    #[must_use]
    pub const fn lanes(&self) -> usize {
        self.lanes
    }

    fn server_queues(&self, server: u16) -> Result<&[Mutex<VecDeque<T>>]> {
        let first = usize::from(server) * self.lanes;
        self.queues
            .get(first..first + self.lanes)
            .ok_or_else(|| Error::remote(server, "no such server"))
    }

    fn queue(&self, server: u16, lane: usize) -> Result<&Mutex<VecDeque<T>>> {
        self.server_queues(server)?
            .get(lane)
            .ok_or_else(|| Error::internal(format!("server {server} has no lane {lane}")))
    }

    /// Append to the tail of `lane` on `server`
    pub fn push(&self, server: u16, lane: usize, item: T) -> Result<()> {
        self.queue(server, lane)?.lock().push_back(item);
        Ok(())
    }

    /// Take the head of `lane` on `server`
    pub fn pop(&self, server: u16, lane: usize) -> Result<Option<T>> {
        Ok(self.queue(server, lane)?.lock().pop_front())
    }

    /// Take up to `max` items from the head of `lane` on `server`
    pub fn pop_batch(&self, server: u16, lane: usize, max: usize) -> Result<Vec<T>> {
        let mut queue = self.queue(server, lane)?.lock();
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    /// Items queued on all lanes of `server`
    pub fn len(&self, server: u16) -> Result<usize> {
        Ok(self
            .server_queues(server)?
            .iter()
            .map(|queue| queue.lock().len())
            .sum())
    }

    pub fn is_empty(&self, server: u16) -> Result<bool> {
        Ok(self.len(server)? == 0)
    }
}
