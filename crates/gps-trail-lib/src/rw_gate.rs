//! Reader-biased gate between one writer and many readers
//!
//! Readers run concurrently; a writer runs alone. A waiting reader blocks new writers, so
//! interactive queries are never starved by ingestion or background computation. A long
//! running writer polls [`WriteGuard::is_writing_holding_up_reading_threads`] and either
//! steps aside with [`WriteGuard::pause_for_reading_threads`] or gives up entirely.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    readers_waiting: usize,
    writing: bool,
    writers_waiting: usize,
    /// The writer stepped aside and readers may enter
    paused: bool,
}

/// Gate protecting a `T` shared by query threads and a single writer
#[derive(Debug, Default)]
pub struct ReadWriteThreadManager<T> {
    state: Mutex<GateState>,
    cond: Condvar,
    data: RwLock<T>,
}

impl<T> ReadWriteThreadManager<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            data: RwLock::new(data),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while a writer is active, then count this thread as a reader
    pub fn register_reading_thread(&self) {
        let mut state = self.state();
        state.readers_waiting += 1;
        while state.writing && !state.paused {
            state = self.wait(state);
        }
        state.readers_waiting -= 1;
        state.readers += 1;
    }

    pub fn unregister_reading_thread(&self) {
        let mut state = self.state();
        state.readers -= 1;
        self.cond.notify_all();
    }

    /// Block until no reader is active or waiting and no other writer is active
    pub fn register_writing_thread(&self) {
        let mut state = self.state();
        state.writers_waiting += 1;
        while state.writing || state.readers > 0 || state.readers_waiting > 0 {
            state = self.wait(state);
        }
        state.writers_waiting -= 1;
        state.writing = true;
    }

    pub fn unregister_writing_thread(&self) {
        let mut state = self.state();
        state.writing = false;
        state.paused = false;
        self.cond.notify_all();
    }

    /// Whether readers are queued behind the active writer
    pub fn is_writing_holding_up_reading_threads(&self) -> bool {
        self.state().readers_waiting > 0
    }

    /// Whether other writers are queued behind the active writer
    pub fn is_writing_holding_up_writing_threads(&self) -> bool {
        self.state().writers_waiting > 0
    }

    /// Let queued readers run while keeping the writer slot, returning once they are done
    fn let_readers_through(&self) {
        let mut state = self.state();
        state.paused = true;
        self.cond.notify_all();
        while state.readers > 0 || state.readers_waiting > 0 {
            state = self.wait(state);
        }
        state.paused = false;
    }

    /// Shared access, waiting for the writer if there is one
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.register_reading_thread();
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        ReadGuard {
            manager: self,
            guard: Some(guard),
        }
    }

    /// Exclusive access, waiting for readers and other writers
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.register_writing_thread();
        let guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        WriteGuard {
            manager: self,
            guard: Some(guard),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registered reader; unregisters on drop
pub struct ReadGuard<'a, T> {
    manager: &'a ReadWriteThreadManager<T>,
    guard: Option<RwLockReadGuard<'a, T>>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("read guard is only released on drop"),
        }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.manager.unregister_reading_thread();
    }
}

/// Registered writer; unregisters on drop
pub struct WriteGuard<'a, T> {
    manager: &'a ReadWriteThreadManager<T>,
    guard: Option<RwLockWriteGuard<'a, T>>,
}

impl<T> WriteGuard<'_, T> {
    pub fn is_writing_holding_up_reading_threads(&self) -> bool {
        self.manager.is_writing_holding_up_reading_threads()
    }

    pub fn is_writing_holding_up_writing_threads(&self) -> bool {
        self.manager.is_writing_holding_up_writing_threads()
    }

    /// Release the data to queued readers and take it back once they finish
    ///
    /// Other writers stay locked out for the whole pause.
    pub fn pause_for_reading_threads(&mut self) {
        drop(self.guard.take());
        self.manager.let_readers_through();
        self.guard = Some(
            self.manager
                .data
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("write guard is only released while paused"),
        }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("write guard is only released while paused"),
        }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.manager.unregister_writing_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_readers_share() {
        let gate = ReadWriteThreadManager::new(5);
        let a = gate.read();
        let b = gate.read();
        assert_eq!(*a + *b, 10);
        drop(a);
        drop(b);
        *gate.write() += 1;
        assert_eq!(gate.into_inner(), 6);
    }

    #[test]
    fn test_writer_blocks_reader_until_paused() {
        let gate = Arc::new(ReadWriteThreadManager::new(0usize));
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        let mut writer = gate.write();
        *writer = 1;

        let reader = {
            let gate = gate.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                let value = gate.read();
                seen.store(*value, Ordering::SeqCst);
            })
        };

        wait_until(|| writer.is_writing_holding_up_reading_threads());
        assert_eq!(seen.load(Ordering::SeqCst), usize::MAX);

        writer.pause_for_reading_threads();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!writer.is_writing_holding_up_reading_threads());

        // Still the writer after the pause
        *writer = 2;
        drop(writer);
        reader.join().unwrap();
        assert_eq!(*gate.read(), 2);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let gate = Arc::new(ReadWriteThreadManager::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let reader = gate.read();
        let writer = {
            let gate = gate.clone();
            let done = done.clone();
            thread::spawn(move || {
                *gate.write() = 7;
                done.store(true, Ordering::SeqCst);
            })
        };

        wait_until(|| gate.is_writing_holding_up_writing_threads());
        assert!(!done.load(Ordering::SeqCst));
        drop(reader);
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(*gate.read(), 7);
    }

    #[test]
    fn test_second_writer_is_visible() {
        let gate = Arc::new(ReadWriteThreadManager::new(Vec::<u32>::new()));
        let mut first = gate.write();

        let second = {
            let gate = gate.clone();
            thread::spawn(move || gate.write().push(2))
        };

        wait_until(|| first.is_writing_holding_up_writing_threads());
        first.push(1);
        drop(first);
        second.join().unwrap();
        assert_eq!(*gate.read(), vec![1, 2]);
    }
}
