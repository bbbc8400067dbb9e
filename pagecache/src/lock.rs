//! Lock and pin transitions of a single block.
//!
//! A transition names both the state the caller is in and the state it asks for,
//! so the cache can validate the former before applying the latter.

use std::collections::VecDeque;
use std::thread::{self, ThreadId};

/// Requested lock transition, `<current> -> <next>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTransition {
    /// `UNLOCKED -> UNLOCKED`: no locking at all.
    LeftUnlocked,
    /// `READ_LOCKED -> READ_LOCKED`: caller keeps its read lock.
    LeftReadLocked,
    /// `WRITE_LOCKED -> WRITE_LOCKED`: caller keeps its write lock.
    LeftWriteLocked,
    /// `UNLOCKED -> READ_LOCKED`.
    Read,
    /// `UNLOCKED -> WRITE_LOCKED`.
    Write,
    /// `READ_LOCKED -> UNLOCKED`.
    ReadUnlock,
    /// `WRITE_LOCKED -> UNLOCKED`.
    WriteUnlock,
    /// `WRITE_LOCKED -> READ_LOCKED`, without letting anybody in between.
    WriteToRead,
}

/// Requested pin transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinTransition {
    /// Caller holds a pin and keeps it.
    LeftPinned,
    /// Caller holds no pin and takes none.
    LeftUnpinned,
    Pin,
    Unpin,
}

/// Lock mode a thread may have to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

impl LockTransition {
    /// Lock that has to be acquired (possibly waiting) to perform the transition.
    pub(crate) fn acquires(self) -> Option<LockMode> {
        match self {
            LockTransition::Read => Some(LockMode::Read),
            LockTransition::Write => Some(LockMode::Write),
            _ => None,
        }
    }

    /// Pin transition that goes along with this lock transition when the caller
    /// does not name one: taking a lock pins, dropping it unpins.
    pub fn implied_pin(self) -> PinTransition {
        match self {
            LockTransition::LeftUnlocked => PinTransition::LeftUnpinned,
            LockTransition::LeftReadLocked
            | LockTransition::LeftWriteLocked
            | LockTransition::WriteToRead => PinTransition::LeftPinned,
            LockTransition::Read | LockTransition::Write => PinTransition::Pin,
            LockTransition::ReadUnlock | LockTransition::WriteUnlock => PinTransition::Unpin,
        }
    }

    /// Splits the lock transition of a write into the part applied before the
    /// buffer is overwritten and the part applied after it. Returns `None` for
    /// transitions under which the caller cannot write.
    pub(crate) fn split_for_write(self) -> Option<(LockTransition, LockTransition)> {
        match self {
            LockTransition::LeftUnlocked => {
                Some((LockTransition::Write, LockTransition::WriteUnlock))
            }
            LockTransition::LeftWriteLocked => Some((
                LockTransition::LeftWriteLocked,
                LockTransition::LeftWriteLocked,
            )),
            LockTransition::Write => Some((LockTransition::Write, LockTransition::LeftWriteLocked)),
            LockTransition::WriteUnlock => Some((
                LockTransition::LeftWriteLocked,
                LockTransition::WriteUnlock,
            )),
            LockTransition::WriteToRead => Some((
                LockTransition::LeftWriteLocked,
                LockTransition::WriteToRead,
            )),
            LockTransition::LeftReadLocked | LockTransition::Read | LockTransition::ReadUnlock => {
                None
            }
        }
    }

    /// Returns true if the caller is expected to hold the write lock when requesting this transition.
    pub(crate) fn holds_write(self) -> bool {
        matches!(
            self,
            LockTransition::LeftWriteLocked
                | LockTransition::WriteUnlock
                | LockTransition::WriteToRead
        )
    }
}

/// Reader/writer state of a block.
///
/// Holders are identified by thread. Writers queue up with tickets and are
/// served in ticket order; while any writer is queued no new reader is admitted,
/// except a thread that already holds a read lock on the block.
#[derive(Debug, Default)]
pub(crate) struct LockState {
    readers: Vec<ThreadId>,
    writer: Option<ThreadId>,
    write_queue: VecDeque<u64>,
    next_ticket: u64,
}

impl LockState {
    /// Returns true if nobody holds or waits for the lock.
    pub(crate) fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.write_queue.is_empty()
    }

    pub(crate) fn is_unlocked(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    #[cfg(test)]
    pub(crate) fn readers(&self) -> usize {
        self.readers.len()
    }

    #[cfg(test)]
    pub(crate) fn is_write_locked(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn writer_is_current(&self) -> bool {
        self.writer == Some(thread::current().id())
    }

    pub(crate) fn reader_is_current(&self) -> bool {
        self.readers.contains(&thread::current().id())
    }

    /// Returns true if the current thread holds the lock in any mode.
    pub(crate) fn held_by_current(&self) -> bool {
        self.writer_is_current() || self.reader_is_current()
    }

    /// Takes a read lock if it can be granted right away.
    pub(crate) fn try_read(&mut self) -> bool {
        let me = thread::current().id();
        let admitted = self.writer.is_none()
            && (self.write_queue.is_empty() || self.readers.contains(&me));
        if admitted {
            self.readers.push(me);
        }
        admitted
    }

    /// Takes the write lock if nobody holds it and no other writer is queued.
    pub(crate) fn try_write(&mut self) -> bool {
        if self.is_unlocked() && self.write_queue.is_empty() {
            self.writer = Some(thread::current().id());
            return true;
        }
        false
    }

    /// Queues the current thread for the write lock and returns its ticket.
    pub(crate) fn enqueue_writer(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.write_queue.push_back(ticket);
        ticket
    }

    /// Withdraws a queued writer that gave up waiting.
    pub(crate) fn cancel_writer(&mut self, ticket: u64) {
        self.write_queue.retain(|queued| *queued != ticket);
    }

    /// Takes the write lock for a queued writer if it is its turn.
    pub(crate) fn try_write_with_ticket(&mut self, ticket: u64) -> bool {
        if self.is_unlocked() && self.write_queue.front() == Some(&ticket) {
            self.write_queue.pop_front();
            self.writer = Some(thread::current().id());
            return true;
        }
        false
    }

    /// Releases one read lock of the current thread. Returns `false` if it holds none.
    pub(crate) fn release_read(&mut self) -> bool {
        let me = thread::current().id();
        match self.readers.iter().position(|reader| *reader == me) {
            Some(position) => {
                self.readers.swap_remove(position);
                true
            }
            None => false,
        }
    }

    /// Releases the write lock of the current thread. Returns `false` if it does not hold it.
    pub(crate) fn release_write(&mut self) -> bool {
        if self.writer_is_current() {
            self.writer = None;
            return true;
        }
        false
    }

    /// Turns the current thread's write lock into a read lock.
    pub(crate) fn downgrade(&mut self) -> bool {
        if self.writer_is_current() {
            self.writer = None;
            self.readers.push(thread::current().id());
            return true;
        }
        false
    }
}
