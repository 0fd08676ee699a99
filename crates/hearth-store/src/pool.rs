//! Fixed-size handle pool over a shared [`CredentialBackend`].
//!
//! The contract the server relies on: `acquire` blocks while all handles
//! are checked out, fails fast if the pool was built empty or has been
//! closed, and every acquired handle is returned on drop, including on
//! error paths.

use std::sync::{Arc, Condvar, Mutex};

use crate::backend::CredentialBackend;
use crate::error::{StoreError, StoreResult};

struct PoolState {
    free: Vec<usize>,
    closed: bool,
}

pub struct StorePool {
    backend: Arc<dyn CredentialBackend>,
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
}

impl StorePool {
    /// Build a pool of `size` handles. A zero-sized pool is a startup
    /// error: the caller is expected to abort before serving.
    pub fn new(backend: Arc<dyn CredentialBackend>, size: usize) -> StoreResult<Self> {
        if size == 0 {
            return Err(StoreError::Empty);
        }
        Ok(Self {
            backend,
            state: Mutex::new(PoolState {
                free: (0..size).collect(),
                closed: false,
            }),
            available: Condvar::new(),
            size,
        })
    }

    /// Check a handle out, blocking while none are free.
    pub fn acquire(&self) -> StoreResult<StoreConn<'_>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("pool lock poisoned".into()))?;
        loop {
            if state.closed {
                return Err(StoreError::Closed);
            }
            if let Some(handle) = state.free.pop() {
                return Ok(StoreConn { pool: self, handle });
            }
            state = self
                .available
                .wait(state)
                .map_err(|_| StoreError::Backend("pool lock poisoned".into()))?;
        }
    }

    /// Stop issuing handles; blocked acquirers fail with `Closed`.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.available.notify_all();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_handles(&self) -> usize {
        self.state.lock().map(|s| s.free.len()).unwrap_or(0)
    }

    fn release(&self, handle: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.free.push(handle);
        }
        self.available.notify_one();
    }
}

/// An acquired store handle. Released back to the pool on drop.
pub struct StoreConn<'a> {
    pool: &'a StorePool,
    handle: usize,
}

impl StoreConn<'_> {
    /// True iff the username exists and the password matches.
    pub fn verify(&self, username: &str, password: &str) -> StoreResult<bool> {
        Ok(self.pool.backend.lookup(username)?.as_deref() == Some(password))
    }

    /// Insert a new user. Returns `false` if the username is taken.
    pub fn register(&self, username: &str, password: &str) -> StoreResult<bool> {
        self.pool.backend.insert(username, password)
    }

    pub fn handle(&self) -> usize {
        self.handle
    }
}

impl Drop for StoreConn<'_> {
    fn drop(&mut self) {
        self.pool.release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::thread;
    use std::time::Duration;

    fn pool(size: usize) -> StorePool {
        StorePool::new(Arc::new(MemoryBackend::with_users([("alice", "secret")])), size).unwrap()
    }

    #[test]
    fn empty_pool_is_a_startup_error() {
        let backend: Arc<dyn CredentialBackend> = Arc::new(MemoryBackend::new());
        assert!(matches!(
            StorePool::new(backend, 0),
            Err(StoreError::Empty)
        ));
    }

    #[test]
    fn handles_cycle_through_the_pool() {
        let pool = pool(2);
        assert_eq!(pool.free_handles(), 2);
        {
            let a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.free_handles(), 0);
            assert!(a.verify("alice", "secret").unwrap());
            assert!(!a.verify("alice", "wrong").unwrap());
            assert!(!a.verify("nobody", "secret").unwrap());
        }
        // Both guards dropped: handles are back.
        assert_eq!(pool.free_handles(), 2);
    }

    #[test]
    fn acquire_blocks_until_a_handle_frees() {
        let pool = Arc::new(pool(1));
        let held = pool.acquire().unwrap();

        let contender = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let conn = pool.acquire().unwrap();
                conn.register("bob", "hunter2").unwrap()
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(contender.join().unwrap());
    }

    #[test]
    fn close_fails_pending_acquires() {
        let pool = Arc::new(pool(1));
        let held = pool.acquire().unwrap();

        let contender = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_| ()))
        };

        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(matches!(contender.join().unwrap(), Err(StoreError::Closed)));
        drop(held);
    }

    #[test]
    fn registration_conflict_is_not_an_error() {
        let pool = pool(1);
        let conn = pool.acquire().unwrap();
        assert!(!conn.register("alice", "other").unwrap());
        assert!(conn.register("carol", "pw").unwrap());
        assert!(conn.verify("carol", "pw").unwrap());
    }
}
