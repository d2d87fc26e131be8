use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Scratch buffer pool for intermediate solve calculations. Buffers are
/// reserved for the duration of a borrow and returned on drop; the pool is an
/// opt-in collaborator passed through `solve` variants, never ambient state.
#[derive(Default)]
pub struct DataPool {
    free: Mutex<Vec<Vec<f64>>>,
}

impl DataPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a zeroed buffer of at least `min_len` elements.
    pub fn reserve(&self, min_len: usize) -> PoolGuard<'_> {
        let mut buffer = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        buffer.clear();
        buffer.resize(min_len, 0.0);
        PoolGuard { pool: self, buffer }
    }
}

pub struct PoolGuard<'a> {
    pool: &'a DataPool,
    buffer: Vec<f64>,
}

impl Deref for PoolGuard<'_> {
    type Target = Vec<f64>;

    fn deref(&self) -> &Vec<f64> {
        &self.buffer
    }
}

impl DerefMut for PoolGuard<'_> {
    fn deref_mut(&mut self) -> &mut Vec<f64> {
        &mut self.buffer
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.pool
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(std::mem::take(&mut self.buffer));
    }
}
