use crate::history::History;
use crate::logging;
use crate::net::frame::{Nickname, NAME_SIZE};
use crate::table::SectionTable;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

pub type DirResult<T> = Result<T, DirError>;

/// Outcomes of directory operations, surfaced to clients as reply opcodes.
#[derive(Debug, Eq, PartialEq)]
pub enum DirError {
    AlreadyRegistered,
    NotFound,
    AlreadyOnline,
    AlreadyOffline,
    Full,
}

/// A registered user: current descriptor (if online) and the history it
/// exclusively owns. The `Arc` lets handlers append to the history after
/// the owning section lock has been released; the history carries its own
/// mutex.
pub struct User {
    fd: Option<RawFd>,
    history: Arc<History>,
}

impl User {
    #[inline]
    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    #[inline]
    pub fn history(&self) -> &Arc<History> {
        &self.history
    }
}

/// Snapshot of a user taken under the section lock. The descriptor may go
/// stale as soon as the snapshot is returned; callers either tolerate that
/// or re-check under the lock.
pub struct UserView {
    pub fd: Option<RawFd>,
    pub history: Arc<History>,
}

struct OnlineSlot {
    name: Nickname,
    fd: RawFd,
}

/// Preallocated online set: one slot per permitted connection, claimed by
/// first-fit scan. The occupancy count kept here is the single source of
/// truth for "how many users are online".
struct OnlineSlots {
    slots: Vec<OnlineSlot>,
    count: usize,
}

impl OnlineSlots {
    fn new(max_connections: usize) -> OnlineSlots {
        OnlineSlots {
            slots: (0..max_connections)
                .map(|_| OnlineSlot {
                    name: Nickname::EMPTY,
                    fd: -1,
                })
                .collect(),
            count: 0,
        }
    }

    /// Claims the first empty slot. Returns false when every slot is taken.
    fn claim(&mut self, name: Nickname, fd: RawFd) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.name.is_empty() {
                slot.name = name;
                slot.fd = fd;
                self.count += 1;
                return true;
            }
        }
        false
    }

    fn release_by_name(&mut self, name: &Nickname) -> bool {
        for slot in self.slots.iter_mut() {
            if !slot.name.is_empty() && slot.name == *name {
                slot.name = Nickname::EMPTY;
                slot.fd = -1;
                self.count -= 1;
                return true;
            }
        }
        false
    }

    fn take_by_fd(&mut self, fd: RawFd) -> Option<Nickname> {
        for slot in self.slots.iter_mut() {
            if slot.fd == fd {
                let name = slot.name;
                slot.name = Nickname::EMPTY;
                slot.fd = -1;
                self.count -= 1;
                return Some(name);
            }
        }
        None
    }

    /// Packs every occupied slot into a contiguous buffer of fixed-width
    /// name records, ready for transmission.
    fn snapshot(&self) -> (Vec<u8>, usize) {
        let mut buf = Vec::with_capacity(self.count * NAME_SIZE);
        for slot in &self.slots {
            if !slot.name.is_empty() {
                buf.extend_from_slice(slot.name.as_bytes());
            }
        }
        (buf, self.count)
    }
}

/// Registered-user store: a sharded table of user records plus the online
/// slot array.
///
/// Lock order is two-level: `connect` and `unregister` take the section
/// lock first and the online mutex second; `disconnect_by_fd` takes the
/// online mutex, releases it, and only then takes the section lock. No
/// path holds both in the conflicting order.
pub struct UserDirectory {
    table: SectionTable<User>,
    online: Mutex<OnlineSlots>,
    hist_size: usize,
    log: logging::Logger,
}

impl UserDirectory {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        nbuckets: usize,
        max_connections: usize,
        hist_size: usize,
        log: L,
    ) -> UserDirectory {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        UserDirectory {
            table: SectionTable::new(nbuckets),
            online: Mutex::new(OnlineSlots::new(max_connections)),
            hist_size,
            log,
        }
    }

    /// Creates a user with an empty history and no descriptor.
    pub fn register(&self, name: &Nickname) -> DirResult<()> {
        let user = User {
            fd: None,
            history: Arc::new(History::new(self.hist_size)),
        };

        let mut section = self.table.section(name);
        match section.insert(*name, user) {
            Ok(()) => {
                logging::debug!(self.log, "user registered"; "context" => "register", "name" => %name);
                Ok(())
            }
            Err(_) => Err(DirError::AlreadyRegistered),
        }
    }

    /// Removes a user, releasing its online slot (if any) and dropping its
    /// history. Returns whether the user was online.
    pub fn unregister(&self, name: &Nickname) -> DirResult<bool> {
        let mut section = self.table.section(name);

        if section.find(name).is_none() {
            return Err(DirError::NotFound);
        }

        let was_online = self.online.lock().expect("online slots poisoned").release_by_name(name);
        section.remove(name);

        logging::debug!(self.log, "user unregistered";
                        "context" => "unregister",
                        "name" => %name,
                        "was_online" => was_online);
        Ok(was_online)
    }

    /// Marks a registered user online on `fd` and claims an online slot.
    pub fn connect(&self, name: &Nickname, fd: RawFd) -> DirResult<()> {
        let mut section = self.table.section(name);

        let user = match section.find_mut(name) {
            Some(user) => user,
            None => return Err(DirError::NotFound),
        };
        if user.fd.is_some() {
            return Err(DirError::AlreadyOnline);
        }

        if !self.online.lock().expect("online slots poisoned").claim(*name, fd) {
            return Err(DirError::Full);
        }
        user.fd = Some(fd);

        logging::debug!(self.log, "user connected"; "context" => "connect", "name" => %name, "fd" => fd);
        Ok(())
    }

    /// Marks a user offline by name.
    pub fn disconnect(&self, name: &Nickname) -> DirResult<()> {
        let mut section = self.table.section(name);

        let user = match section.find_mut(name) {
            Some(user) => user,
            None => return Err(DirError::NotFound),
        };
        if user.fd.is_none() {
            return Err(DirError::AlreadyOffline);
        }

        user.fd = None;
        self.online.lock().expect("online slots poisoned").release_by_name(name);

        logging::debug!(self.log, "user disconnected"; "context" => "disconnect", "name" => %name);
        Ok(())
    }

    /// Marks a user offline by descriptor: scans the online slots to
    /// recover the nickname, releases the slot, then clears the user's
    /// descriptor under the section lock.
    pub fn disconnect_by_fd(&self, fd: RawFd) -> DirResult<Nickname> {
        let name = {
            let mut online = self.online.lock().expect("online slots poisoned");
            match online.take_by_fd(fd) {
                Some(name) => name,
                None => return Err(DirError::NotFound),
            }
        };

        let mut section = self.table.section(&name);
        match section.find_mut(&name) {
            Some(user) if user.fd.is_some() => {
                user.fd = None;
                logging::debug!(self.log, "user disconnected";
                                "context" => "disconnect_by_fd",
                                "name" => %name,
                                "fd" => fd);
                Ok(name)
            }
            Some(_) => Err(DirError::AlreadyOffline),
            // Unregistered between the slot scan and the section lock; the
            // slot is already released, nothing left to clear.
            None => Err(DirError::NotFound),
        }
    }

    /// Packed online-name records and their count.
    pub fn users_online_snapshot(&self) -> (Vec<u8>, usize) {
        self.online.lock().expect("online slots poisoned").snapshot()
    }

    pub fn online_count(&self) -> usize {
        self.online.lock().expect("online slots poisoned").count
    }

    /// Descriptor snapshot and history handle for a registered user.
    pub fn get_user(&self, name: &Nickname) -> Option<UserView> {
        let section = self.table.section(name);
        section.find(name).map(|user| UserView {
            fd: user.fd,
            history: Arc::clone(&user.history),
        })
    }

    /// History handle for a registered user.
    pub fn history_of(&self, name: &Nickname) -> Option<Arc<History>> {
        let section = self.table.section(name);
        section.find(name).map(|user| Arc::clone(&user.history))
    }

    /// Visits every registered user, one table section locked at a time.
    pub fn for_each_registered<F: FnMut(&Nickname, &User)>(&self, visit: F) {
        self.table.for_each_locked(visit);
    }

    /// Number of registered users, counted under the whole-table lock.
    pub fn registered_count(&self) -> usize {
        self.table.lock_all().len()
    }
}
