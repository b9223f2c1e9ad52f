use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, bail};

use crate::utils::errors::ReconstructError;

/// Allocates a zeroed vector, reporting failure instead of aborting.
pub fn allocate_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(len).is_err() {
        bail!(ReconstructError::AllocationFailure(len));
    }
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// A thread-safe pool of scratch buffers for the inverse transforms.
///
/// Reconstruction workers borrow a buffer per filter pass and hand it back
/// afterwards, so a steady stream of samples with the same geometry stops
/// allocating after the first one.
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<Vec<i32>>>>,
    max_size: usize,
}

impl BufferPool {
    /// Creates a new buffer pool.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of buffers to keep in the pool
    pub fn new(max_size: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(VecDeque::with_capacity(max_size))),
            max_size,
        }
    }

    /// Acquires a zeroed buffer of `len` elements.
    ///
    /// Reuses the first pooled buffer large enough, otherwise allocates.
    pub fn acquire(&self, len: usize) -> Result<Vec<i32>> {
        let reused = {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            pool.iter()
                .position(|buffer| buffer.capacity() >= len)
                .and_then(|index| pool.remove(index))
        };

        match reused {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(len, 0);
                Ok(buffer)
            }
            None => allocate_zeroed(len),
        }
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, mut buffer: Vec<i32>) {
        buffer.clear();

        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.max_size {
            pool.push_back(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16)
    }
}
