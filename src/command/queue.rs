// Queue store: one fixed-capacity byte arena per queue
//
// Queue 0 is the live queue interpreted every tick; the remaining queues are
// macro storage. Every arena holds a sequence of complete encoded commands:
// appends are all-or-nothing and consumption always removes whole entries.

use crate::error::{Error, Result};

/// Index of the live queue
pub const LIVE: usize = 0;

#[derive(Debug, Clone)]
pub struct Queue {
    bytes: Vec<u8>,
    capacity: usize,
}

impl Queue {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Remove `n` bytes from the front, sliding the rest down
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }

    /// Overwrite bytes in place without changing the length
    pub fn overwrite(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if end <= self.bytes.len() {
            self.bytes[offset..end].copy_from_slice(data);
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// All queues of the board, addressed by index
#[derive(Debug, Clone)]
pub struct QueueSet {
    queues: Vec<Queue>,
}

impl QueueSet {
    /// Live queue of `live_capacity` plus `named` macro queues of `named_capacity`
    pub fn new(live_capacity: usize, named: usize, named_capacity: usize) -> Self {
        let mut queues = Vec::with_capacity(named + 1);
        queues.push(Queue::new(live_capacity));
        queues.extend((0..named).map(|_| Queue::new(named_capacity)));
        Self { queues }
    }

    /// Number of queues including the live queue
    pub fn count(&self) -> usize {
        self.queues.len()
    }

    pub fn get(&self, queue: usize) -> Result<&Queue> {
        self.queues.get(queue).ok_or(Error::NoSuchQueue { queue })
    }

    pub fn get_mut(&mut self, queue: usize) -> Result<&mut Queue> {
        self.queues.get_mut(queue).ok_or(Error::NoSuchQueue { queue })
    }

    pub fn live(&self) -> &Queue {
        &self.queues[LIVE]
    }

    pub fn live_mut(&mut self) -> &mut Queue {
        &mut self.queues[LIVE]
    }

    /// Append `data` in one piece, or leave the queue untouched
    pub fn append(&mut self, queue: usize, data: &[u8]) -> Result<()> {
        let q = self.get_mut(queue)?;
        if data.len() > q.available() {
            return Err(Error::QueueCapacityExceeded {
                queue,
                required: data.len(),
                available: q.available(),
            });
        }
        q.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Append the whole of `src` to `dst`
    pub fn copy(&mut self, dst: usize, src: usize) -> Result<()> {
        self.get(dst)?;
        let data = self.get(src)?.bytes.clone();
        self.append(dst, &data)
    }

    /// Replace the contents of a queue; the data must fit its capacity
    pub fn replace(&mut self, queue: usize, data: &[u8]) -> Result<()> {
        let q = self.get_mut(queue)?;
        if data.len() > q.capacity {
            return Err(Error::QueueCapacityExceeded {
                queue,
                required: data.len(),
                available: q.capacity,
            });
        }
        q.bytes.clear();
        q.bytes.extend_from_slice(data);
        Ok(())
    }
}
