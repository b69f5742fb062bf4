use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Server-wide counters. Signed: delivered/undelivered reclassification
/// decrements counts that may transiently pass through zero.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Counters {
    /// Registered users.
    pub nusers: i64,
    /// Users currently online.
    pub nonline: i64,
    /// Text messages delivered to a connected recipient.
    pub ndelivered: i64,
    /// Text messages parked in a history, not yet delivered.
    pub nnotdelivered: i64,
    /// File notifications delivered to a connected recipient.
    pub nfiledelivered: i64,
    /// File notifications parked in a history.
    pub nfilenotdelivered: i64,
    /// Handler-visible failures.
    pub nerrors: i64,
}

/// One mutex guarding the whole counter block. Handlers mutate it through
/// `update`, which scopes the critical section to the closure.
pub struct Stats {
    counters: Mutex<Counters>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Runs `apply` with the counter block locked.
    #[inline]
    pub fn update<F: FnOnce(&mut Counters)>(&self, apply: F) {
        let mut counters = self.counters.lock().expect("stats poisoned");
        apply(&mut counters);
    }

    pub fn snapshot(&self) -> Counters {
        self.counters.lock().expect("stats poisoned").clone()
    }

    /// Appends one stats line to `path`:
    /// `<unix-time> - <nusers> <nonline> <ndelivered> <nnotdelivered>
    /// <nfiledelivered> <nfilenotdelivered> <nerrors>`.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let counters = self.snapshot();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            file,
            "{} - {} {} {} {} {} {} {}",
            now,
            counters.nusers,
            counters.nonline,
            counters.ndelivered,
            counters.nnotdelivered,
            counters.nfiledelivered,
            counters.nfilenotdelivered,
            counters.nerrors
        )
    }
}
