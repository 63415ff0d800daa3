//! Reentrant dataset read/write lock
//!
//! One [`DatasetLock`] serializes access to a dataset's bands. It differs
//! from a plain reader/writer lock in three ways:
//!
//! - it is reentrant per thread, in either mode, so an I/O request may call
//!   back into the same dataset (overviews, band-by-band fan-out)
//! - a thread holding only read locks may upgrade to write once every other
//!   holder has left; a second thread attempting the same upgrade gets
//!   [`Error::LockConflict`] instead of deadlocking
//! - a thread can give up everything it holds for a while and take the same
//!   depth back later ([`DatasetLock::temporarily_drop`])
//!
//! Waiting writers block new readers so a stream of readers cannot starve
//! them.

use parking_lot::{Condvar, Mutex};
use rastercache_common::{Error, Result, RwFlag};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use tracing::{error, trace};

/// Lock mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl From<RwFlag> for LockMode {
    fn from(flag: RwFlag) -> Self {
        match flag {
            RwFlag::Read => Self::Read,
            RwFlag::Write => Self::Write,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Depth {
    reads: usize,
    writes: usize,
}

impl Depth {
    const fn is_empty(self) -> bool {
        self.reads == 0 && self.writes == 0
    }
}

#[derive(Default)]
struct LockState {
    holders: HashMap<ThreadId, Depth>,
    writer: Option<ThreadId>,
    waiting_writers: usize,
    upgrader: Option<ThreadId>,
}

/// Reentrant reader/writer lock keyed by thread
#[derive(Default)]
pub struct DatasetLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl DatasetLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the lock in `mode`
    ///
    /// Reentrant in both modes. Returns [`Error::LockConflict`] if this
    /// thread must upgrade from read to write while another thread is
    /// already waiting to do the same.
    pub fn enter_read_write(&self, mode: LockMode) -> Result<DatasetLockGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        match mode {
            LockMode::Read => {
                if !state.holders.contains_key(&me) {
                    while state.writer.is_some() || state.waiting_writers > 0 {
                        self.cond.wait(&mut state);
                    }
                }
                state.holders.entry(me).or_default().reads += 1;
            }
            LockMode::Write => {
                if state.writer != Some(me) {
                    if state.holders.contains_key(&me) {
                        if state.upgrader.is_some_and(|t| t != me) {
                            return Err(Error::LockConflict(
                                "another thread is already upgrading to write".to_string(),
                            ));
                        }
                        state.upgrader = Some(me);
                        while state.writer.is_some() || state.holders.len() > 1 {
                            self.cond.wait(&mut state);
                        }
                        state.upgrader = None;
                    } else {
                        state.waiting_writers += 1;
                        while state.writer.is_some() || !state.holders.is_empty() {
                            self.cond.wait(&mut state);
                        }
                        state.waiting_writers -= 1;
                    }
                    state.writer = Some(me);
                }
                state.holders.entry(me).or_default().writes += 1;
            }
        }

        trace!(?mode, "entered dataset lock");
        Ok(DatasetLockGuard {
            lock: self,
            mode,
            _not_send: PhantomData,
        })
    }

    fn leave_read_write(&self, mode: LockMode) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let Some(depth) = state.holders.get_mut(&me) else {
            error!(?mode, "leaving dataset lock that this thread does not hold");
            return;
        };
        match mode {
            LockMode::Read => depth.reads = depth.reads.saturating_sub(1),
            LockMode::Write => depth.writes = depth.writes.saturating_sub(1),
        }
        let depth = *depth;
        if depth.writes == 0 && state.writer == Some(me) {
            state.writer = None;
        }
        if depth.is_empty() {
            state.holders.remove(&me);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Release everything this thread holds until [`DatasetLock::reacquire`]
    ///
    /// Guards taken before the drop stay alive and must only be released
    /// after the matching `reacquire`.
    #[must_use = "the dropped depth must be handed back to reacquire"]
    pub fn temporarily_drop(&self) -> DroppedLock {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let depth = state.holders.remove(&me).unwrap_or_default();
        if state.writer == Some(me) {
            state.writer = None;
        }
        drop(state);
        self.cond.notify_all();
        trace!(reads = depth.reads, writes = depth.writes, "temporarily dropped dataset lock");
        DroppedLock {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Take back the depth released by [`DatasetLock::temporarily_drop`]
    pub fn reacquire(&self, dropped: DroppedLock) {
        let depth = dropped.depth;
        if depth.is_empty() {
            return;
        }
        let me = thread::current().id();
        let mut state = self.state.lock();
        if depth.writes > 0 {
            state.waiting_writers += 1;
            while state.writer.is_some() || !state.holders.is_empty() {
                self.cond.wait(&mut state);
            }
            state.waiting_writers -= 1;
            state.writer = Some(me);
        } else {
            while state.writer.is_some() {
                self.cond.wait(&mut state);
            }
        }
        state.holders.insert(me, depth);
    }

    /// Check if the calling thread holds the lock in any mode
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state
            .lock()
            .holders
            .contains_key(&thread::current().id())
    }

    /// Check if the calling thread holds the write lock
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }
}

impl std::fmt::Debug for DatasetLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DatasetLock")
            .field("holders", &state.holders.len())
            .field("writer", &state.writer)
            .field("waiting_writers", &state.waiting_writers)
            .finish()
    }
}

/// One level of a held [`DatasetLock`]; released on drop
#[must_use = "the lock is released when the guard is dropped"]
pub struct DatasetLockGuard<'a> {
    lock: &'a DatasetLock,
    mode: LockMode,
    _not_send: PhantomData<*const ()>,
}

impl DatasetLockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for DatasetLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.leave_read_write(self.mode);
    }
}

/// Lock depth handed from [`DatasetLock::temporarily_drop`] to
/// [`DatasetLock::reacquire`]
#[derive(Debug)]
pub struct DroppedLock {
    depth: Depth,
    _not_send: PhantomData<*const ()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_reentrant_read_and_write() {
        let lock = DatasetLock::new();
        let w = lock.enter_read_write(LockMode::Write).unwrap();
        let r = lock.enter_read_write(LockMode::Read).unwrap();
        let w2 = lock.enter_read_write(LockMode::Write).unwrap();
        assert!(lock.is_write_locked_by_current_thread());
        drop(w2);
        drop(r);
        assert!(lock.is_write_locked_by_current_thread());
        drop(w);
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_upgrade_as_sole_reader() {
        let lock = DatasetLock::new();
        let r = lock.enter_read_write(LockMode::Read).unwrap();
        let w = lock.enter_read_write(LockMode::Write).unwrap();
        assert!(lock.is_write_locked_by_current_thread());
        drop(w);
        assert!(!lock.is_write_locked_by_current_thread());
        assert!(lock.is_held_by_current_thread());
        drop(r);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(DatasetLock::new());
        let inside = Arc::new(AtomicBool::new(false));
        let guard = lock.enter_read_write(LockMode::Write).unwrap();

        let handle = {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let _r = lock.enter_read_write(LockMode::Read).unwrap();
                inside.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!inside.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(inside.load(Ordering::SeqCst));
    }

    #[test]
    fn test_readers_share() {
        let lock = DatasetLock::new();
        let barrier = Barrier::new(4);
        let concurrent = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _r = lock.enter_read_write(LockMode::Read).unwrap();
                    concurrent.fetch_add(1, Ordering::SeqCst);
                    // Every reader is inside at the same time
                    barrier.wait();
                });
            }
        });
        assert_eq!(concurrent.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_upgrade_conflicts() {
        let lock = DatasetLock::new();
        let both_reading = Barrier::new(2);
        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let lock = &lock;
                    let both_reading = &both_reading;
                    s.spawn(move || {
                        let r = lock.enter_read_write(LockMode::Read).unwrap();
                        both_reading.wait();
                        if i == 1 {
                            thread::sleep(Duration::from_millis(50));
                        }
                        match lock.enter_read_write(LockMode::Write) {
                            Ok(w) => {
                                drop(w);
                                drop(r);
                                true
                            }
                            Err(e) => {
                                assert!(matches!(e, Error::LockConflict(_)));
                                drop(r);
                                false
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![true, false]);
    }

    #[test]
    fn test_temporarily_drop_lets_others_in() {
        let lock = DatasetLock::new();
        let outer = lock.enter_read_write(LockMode::Write).unwrap();
        let inner = lock.enter_read_write(LockMode::Read).unwrap();

        let dropped = lock.temporarily_drop();
        assert!(!lock.is_held_by_current_thread());
        thread::scope(|s| {
            s.spawn(|| {
                let _w = lock.enter_read_write(LockMode::Write).unwrap();
            });
        });
        lock.reacquire(dropped);

        assert!(lock.is_write_locked_by_current_thread());
        drop(inner);
        drop(outer);
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_rw_flag_maps_to_mode() {
        assert_eq!(LockMode::from(RwFlag::Read), LockMode::Read);
        assert_eq!(LockMode::from(RwFlag::Write), LockMode::Write);
    }
}
