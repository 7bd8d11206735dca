//! Round-robin pool of interchangeable model handles.
//!
//! Each handle travels along a chain of one-slot channels. A call routed to a slot
//! swaps its own channel in as the slot's tail and waits on the previous tail, so it
//! receives the handle only after every earlier call on that slot has passed it on.
//! Up to `capacity()` calls progress at once, never two on the same handle.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_channel::{Receiver, Sender, bounded};
use log::debug;

use crate::error::FaceMeshError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One handle's hand-off chain. `tail` yields the handle once the last dispatched call
/// on this slot is done with it.
struct Slot<M> {
    tail: Mutex<Receiver<M>>,
}

impl<M> Slot<M> {
    fn new(model: M) -> Self {
        let (sender, receiver) = bounded(1);
        // A fresh one-slot channel always has room.
        let _ = sender.try_send(model);
        Self {
            tail: Mutex::new(receiver),
        }
    }

    /// Append a link to the chain, returning the link to wait on and the sender the
    /// handle must be passed to afterwards.
    fn enqueue(&self) -> (Receiver<M>, Sender<M>) {
        let (sender, receiver) = bounded(1);
        let previous = mem::replace(&mut *lock(&self.tail), receiver);
        (previous, sender)
    }

    /// Detach the chain, leaving a closed link so later calls fail.
    fn detach(&self) -> Receiver<M> {
        let (_, closed) = bounded(1);
        mem::replace(&mut *lock(&self.tail), closed)
    }
}

/// Borrowed handle; passes it to the next call on the slot when dropped, including
/// on error or panic.
struct PooledHandle<M> {
    model: Option<M>,
    next: Sender<M>,
}

impl<M> Drop for PooledHandle<M> {
    fn drop(&mut self) {
        if let Some(model) = self.model.take() {
            let _ = self.next.try_send(model);
        }
    }
}

/// Fixed-size pool of model handles with per-handle serialized access.
pub struct ModelPool<M> {
    slots: Vec<Slot<M>>,
    cursor: Mutex<usize>,
    closed: AtomicBool,
}

impl<M> ModelPool<M> {
    /// Build a pool over `models`. An empty list is `PoolNotInitialized`.
    pub fn new(models: Vec<M>) -> Result<Self, FaceMeshError> {
        if models.is_empty() {
            return Err(FaceMeshError::PoolNotInitialized);
        }
        Ok(Self {
            slots: models.into_iter().map(Slot::new).collect(),
            cursor: Mutex::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Pool with a single handle.
    pub fn single(model: M) -> Self {
        Self {
            slots: vec![Slot::new(model)],
            cursor: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Total number of handles.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `task` on the next handle in round-robin order.
    ///
    /// Blocks until every earlier call routed to the same handle has finished.
    pub fn run<R, F>(&self, task: F) -> Result<R, FaceMeshError>
    where
        F: FnOnce(&mut M) -> Result<R, FaceMeshError>,
    {
        if self.is_disposed() {
            return Err(FaceMeshError::Disposed);
        }

        // Slot choice and chain position are taken together so per-slot order is
        // dispatch order.
        let (previous, next) = {
            let mut cursor = lock(&self.cursor);
            let slot = &self.slots[*cursor % self.slots.len()];
            *cursor = cursor.wrapping_add(1);
            slot.enqueue()
        };

        let model = previous
            .recv_blocking()
            .map_err(|_| FaceMeshError::Disposed)?;
        let mut handle = PooledHandle {
            model: Some(model),
            next,
        };
        if self.is_disposed() {
            return Err(FaceMeshError::Disposed);
        }
        match handle.model.as_mut() {
            Some(model) => task(model),
            None => Err(FaceMeshError::Disposed),
        }
    }

    /// Close the pool and release every handle exactly once.
    ///
    /// Waits for calls already holding or queued for a handle to pass it on. Returns
    /// the number of handles released by this call; repeated calls release nothing.
    pub fn dispose(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut released = 0;
        for slot in &self.slots {
            if let Ok(model) = slot.detach().recv_blocking() {
                drop(model);
                released += 1;
            }
        }
        if released > 0 {
            debug!("released {released} pooled model handle(s)");
        }
        released
    }
}

impl<M> fmt::Debug for ModelPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPool")
            .field("capacity", &self.capacity())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct Handle {
        id: usize,
        busy: Arc<AtomicBool>,
        released: Arc<AtomicUsize>,
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(size: usize) -> (ModelPool<Handle>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let handles = (0..size)
            .map(|id| Handle {
                id,
                busy: Arc::new(AtomicBool::new(false)),
                released: released.clone(),
            })
            .collect();
        (ModelPool::new(handles).expect("pool"), released)
    }

    #[test]
    fn sequential_submissions_round_robin() {
        let (pool, _) = pool(3);
        let visited: Vec<usize> = (0..7)
            .map(|_| pool.run(|h| Ok(h.id)).expect("run"))
            .collect();
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn calls_on_one_handle_never_overlap() {
        let (pool, _) = pool(2);
        let pool = Arc::new(pool);
        let overlaps = Arc::new(AtomicUsize::new(0));
        let per_handle = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let overlaps = overlaps.clone();
                let per_handle = per_handle.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        pool.run(|h| {
                            if h.busy.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            per_handle[h.id].fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(1));
                            h.busy.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("run");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(per_handle[0].load(Ordering::SeqCst), 20);
        assert_eq!(per_handle[1].load(Ordering::SeqCst), 20);
    }

    #[test]
    fn handle_runs_calls_in_submission_order() {
        let pool = Arc::new(ModelPool::single(Vec::<usize>::new()));
        let gate = pool.clone();
        let blocker = thread::spawn(move || {
            gate.run(|_| {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            })
        });
        thread::sleep(Duration::from_millis(10));

        let mut waiters = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            waiters.push(thread::spawn(move || {
                pool.run(|log| {
                    log.push(i);
                    Ok(())
                })
            }));
            // Queue the calls in order.
            thread::sleep(Duration::from_millis(5));
        }
        blocker.join().expect("blocker").expect("run");
        for waiter in waiters {
            waiter.join().expect("waiter").expect("run");
        }
        let log = pool.run(|log| Ok(log.clone())).expect("read log");
        assert_eq!(log, vec![0, 1, 2, 3]);
    }

    #[test]
    fn errors_and_panics_release_the_turn() {
        let (pool, _) = pool(1);
        let err = pool
            .run(|_| -> Result<(), FaceMeshError> { Err(FaceMeshError::Alignment("bad".into())) })
            .expect_err("task error");
        assert!(matches!(err, FaceMeshError::Alignment(_)));

        let pool = Arc::new(pool);
        let panicking = pool.clone();
        let result = thread::spawn(move || {
            panicking.run(|_| -> Result<(), FaceMeshError> { panic!("model crashed") })
        })
        .join();
        assert!(result.is_err());

        assert_eq!(pool.run(|h| Ok(h.id)).expect("still usable"), 0);
    }

    #[test]
    fn dispose_releases_each_handle_once() {
        let (pool, released) = pool(3);
        assert_eq!(pool.dispose(), 3);
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(pool.is_disposed());

        assert_eq!(pool.dispose(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(matches!(
            pool.run(|h| Ok(h.id)),
            Err(FaceMeshError::Disposed)
        ));
    }

    #[test]
    fn dispose_waits_for_the_running_call_and_fails_queued_ones() {
        let (pool, released) = pool(1);
        let pool = Arc::new(pool);
        let running = pool.clone();
        let holder = thread::spawn(move || {
            running.run(|h| {
                thread::sleep(Duration::from_millis(80));
                Ok(h.id)
            })
        });
        thread::sleep(Duration::from_millis(10));
        let queued = pool.clone();
        let waiter = thread::spawn(move || queued.run(|h| Ok(h.id)));
        thread::sleep(Duration::from_millis(10));

        assert_eq!(pool.dispose(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(holder.join().expect("holder").expect("run"), 0);
        assert!(matches!(
            waiter.join().expect("waiter"),
            Err(FaceMeshError::Disposed)
        ));
    }

    #[test]
    fn empty_pool_is_not_initialized() {
        assert!(matches!(
            ModelPool::<Handle>::new(Vec::new()),
            Err(FaceMeshError::PoolNotInitialized)
        ));
    }
}
