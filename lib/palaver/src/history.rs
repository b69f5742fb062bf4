use crate::net::frame::Message;
use std::sync::Mutex;

struct Ring {
    msgs: Vec<Option<Message>>,
    head: usize,
    size: usize,
}

/// Bounded ring of messages owned by one user, guarded by its own mutex.
///
/// Once full, inserting destroys the oldest message and overwrites its
/// slot; draining moves every message out in logical order and resets the
/// ring.
pub struct History {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> History {
        History {
            ring: Mutex::new(Ring {
                msgs: (0..capacity).map(|_| None).collect(),
                head: 0,
                size: 0,
            }),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("history poisoned").size
    }

    /// Appends a message. At capacity, the message at `head` is dropped and
    /// replaced, and `head` advances. A zero-capacity history discards
    /// everything.
    pub fn insert(&self, msg: Message) {
        if self.capacity == 0 {
            return;
        }

        let mut ring = self.ring.lock().expect("history poisoned");
        if ring.size == self.capacity {
            let head = ring.head;
            ring.msgs[head] = Some(msg);
            ring.head = (head + 1) % self.capacity;
        } else {
            let slot = (ring.head + ring.size) % self.capacity;
            ring.msgs[slot] = Some(msg);
            ring.size += 1;
        }
    }

    /// Moves all messages out in logical order, oldest first, and resets
    /// the ring to empty.
    pub fn drain(&self) -> Vec<Message> {
        let mut ring = self.ring.lock().expect("history poisoned");

        let mut drained = Vec::with_capacity(ring.size);
        for i in 0..ring.size {
            let slot = (ring.head + i) % self.capacity.max(1);
            drained.push(ring.msgs[slot].take().expect("occupied history slot"));
        }

        ring.head = 0;
        ring.size = 0;
        drained
    }
}
