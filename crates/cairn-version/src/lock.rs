//! The versioning lock.
//!
//! A reentrant read/write lock guarding the version storage. Any number of
//! threads may read; a writer excludes everyone else. Writers are preferred:
//! once a writer waits, new readers queue behind it. The thread holding the
//! write lock may take it again and may also read. A thread that only holds
//! the read lock must not ask for the write lock, since two such threads
//! would wait on each other forever; that upgrade panics.
//!
//! Waiting is not cancellable. [`VersioningLock::try_acquire_write_for`] is
//! the bounded alternative.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<(ThreadId, usize)>,
    waiting_writers: usize,
}

impl LockState {
    fn is_writer(&self, me: ThreadId) -> bool {
        matches!(self.writer, Some((owner, _)) if owner == me)
    }

    fn reads_held_by(&self, me: ThreadId) -> usize {
        self.readers.get(&me).copied().unwrap_or(0)
    }

    fn can_write(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Reentrant read/write lock with writer preference.
#[derive(Debug, Default)]
pub struct VersioningLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl VersioningLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().expect("versioning lock state poisoned")
    }

    pub fn acquire_read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state();
        // A thread already inside may always re-enter, or writer preference
        // would deadlock it against a queued writer.
        if !state.is_writer(me) && state.reads_held_by(me) == 0 {
            while state.writer.is_some() || state.waiting_writers > 0 {
                trace!("waiting for versioning read lock");
                state = self
                    .changed
                    .wait(state)
                    .expect("versioning lock state poisoned");
            }
        }
        *state.readers.entry(me).or_insert(0) += 1;
        ReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Take the write lock, waiting as long as it takes.
    ///
    /// # Panics
    ///
    /// If the calling thread holds the read lock without the write lock.
    pub fn acquire_write(&self) -> WriteGuard<'_> {
        match self.write_until(None) {
            Some(guard) => guard,
            None => unreachable!("unbounded wait returned without the lock"),
        }
    }

    /// Take the write lock, giving up after `timeout`.
    ///
    /// # Panics
    ///
    /// If the calling thread holds the read lock without the write lock.
    pub fn try_acquire_write_for(&self, timeout: Duration) -> Option<WriteGuard<'_>> {
        self.write_until(Some(Instant::now() + timeout))
    }

    fn write_until(&self, deadline: Option<Instant>) -> Option<WriteGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state();
        if let Some((owner, depth)) = state.writer.as_mut() {
            if *owner == me {
                *depth += 1;
                return Some(self.write_guard());
            }
        }
        if state.reads_held_by(me) > 0 {
            panic!("versioning lock: a read lock cannot be upgraded to a write lock");
        }

        state.waiting_writers += 1;
        while !state.can_write() {
            trace!("waiting for versioning write lock");
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .expect("versioning lock state poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiting_writers -= 1;
                        drop(state);
                        // Readers queued behind this writer may go now.
                        self.changed.notify_all();
                        debug!("versioning write lock wait timed out");
                        return None;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .expect("versioning lock state poisoned")
                        .0
                }
            };
        }
        state.waiting_writers -= 1;
        state.writer = Some((me, 1));
        Some(self.write_guard())
    }

    fn write_guard(&self) -> WriteGuard<'_> {
        WriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        let remaining = match state.readers.get_mut(&me) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => unreachable!("read guard released by a thread holding no read lock"),
        };
        if remaining == 0 {
            state.readers.remove(&me);
            drop(state);
            self.changed.notify_all();
        }
    }

    fn release_write(&self) {
        let mut state = self.state();
        let released = match state.writer.as_mut() {
            Some((_, depth)) => {
                *depth -= 1;
                *depth == 0
            }
            None => unreachable!("write guard released while no writer holds the lock"),
        };
        if released {
            state.writer = None;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state().is_writer(thread::current().id())
    }
}

/// Shared access to the version storage. Released on drop.
#[must_use = "the read lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a VersioningLock,
    // Guards are bound to the thread that took them.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to the version storage. Released on drop.
#[must_use = "the write lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a VersioningLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

impl std::fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReadGuard")
    }
}

impl std::fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriteGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    #[test]
    fn readers_share() {
        let lock = Arc::new(VersioningLock::new());
        let _outer = lock.acquire_read();
        let other = lock.clone();
        let handle = thread::spawn(move || {
            let _inner = other.acquire_read();
            true
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn writer_reenters_write_and_read() {
        let lock = VersioningLock::new();
        let outer = lock.acquire_write();
        {
            let _again = lock.acquire_write();
            let _read = lock.acquire_read();
            assert!(lock.is_write_locked_by_current_thread());
        }
        assert!(lock.is_write_locked_by_current_thread());
        drop(outer);
        assert!(!lock.is_write_locked_by_current_thread());
    }

    #[test]
    #[should_panic(expected = "cannot be upgraded")]
    fn read_to_write_upgrade_panics() {
        let lock = VersioningLock::new();
        let _read = lock.acquire_read();
        let _write = lock.acquire_write();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(VersioningLock::new());
        let inside = Arc::new(AtomicBool::new(false));
        let write = lock.acquire_write();

        let (lock2, inside2) = (lock.clone(), inside.clone());
        let reader = thread::spawn(move || {
            let _read = lock2.acquire_read();
            inside2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!inside.load(Ordering::SeqCst));
        drop(write);
        reader.join().unwrap();
        assert!(inside.load(Ordering::SeqCst));
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(VersioningLock::new());
        let order = Arc::new(AtomicUsize::new(0));
        let read = lock.acquire_read();

        let (lock_w, order_w) = (lock.clone(), order.clone());
        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || {
            tx.send(()).unwrap();
            let _write = lock_w.acquire_write();
            order_w.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        });
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        let (lock_r, order_r) = (lock.clone(), order.clone());
        let reader = thread::spawn(move || {
            let _read = lock_r.acquire_read();
            order_r.compare_exchange(0, 2, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        });
        thread::sleep(Duration::from_millis(50));
        drop(read);

        assert!(writer.join().unwrap());
        assert!(!reader.join().unwrap());
    }

    #[test]
    fn bounded_write_times_out() {
        let lock = Arc::new(VersioningLock::new());
        let held = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _read = held.acquire_read();
            tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        rx.recv().unwrap();

        assert!(lock.try_acquire_write_for(Duration::from_millis(30)).is_none());
        // the abandoned wait must not keep blocking readers
        drop(lock.acquire_read());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(lock.try_acquire_write_for(Duration::from_millis(30)).is_some());
    }
}
