use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard};

/// Number of lock shards per direction.
pub const NSECTIONS: usize = 4;

/// Serializes frame-granular I/O on shared descriptors.
///
/// Workers may push messages to the same recipient descriptor concurrently,
/// so a complete frame write must be atomic against other writes on that
/// descriptor. A fixed fan of locks is sharded by `fd % NSECTIONS`; reads
/// and writes use separate fans so a worker's outbound push never contends
/// with an inbound read on an unrelated descriptor that happens to share a
/// shard index.
///
/// Byte-level helpers inside a composite operation never re-lock: the guard
/// is taken once per frame. The serializer can be constructed disabled so
/// the codec is usable bare in unit tests.
pub struct IoSerializer {
    enabled: bool,
    read_shards: Vec<Mutex<()>>,
    write_shards: Vec<Mutex<()>>,
}

/// Shard guard held for the duration of one frame operation.
#[must_use]
pub struct IoGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl IoSerializer {
    pub fn new(enabled: bool) -> IoSerializer {
        IoSerializer {
            enabled,
            read_shards: (0..NSECTIONS).map(|_| Mutex::new(())).collect(),
            write_shards: (0..NSECTIONS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquires the read shard for `fd`.
    #[inline]
    pub fn read_lock(&self, fd: RawFd) -> IoGuard {
        Self::lock(&self.read_shards, self.enabled, fd)
    }

    /// Acquires the write shard for `fd`.
    #[inline]
    pub fn write_lock(&self, fd: RawFd) -> IoGuard {
        Self::lock(&self.write_shards, self.enabled, fd)
    }

    #[inline]
    fn lock(shards: &[Mutex<()>], enabled: bool, fd: RawFd) -> IoGuard {
        if !enabled {
            return IoGuard { _guard: None };
        }

        let shard = fd as usize % NSECTIONS;
        IoGuard {
            _guard: Some(shards[shard].lock().expect("i/o shard poisoned")),
        }
    }
}
