//! Shared constant-value sample blocks.
//!
//! Any number of nodes may alias these read-only blocks concurrently; the
//! scheduler hands them out for unconnected inputs and suspended outputs
//! instead of computing or zeroing redundant buffers.

use std::sync::Arc;

use parking_lot::Mutex;

/// Maximum supported block size in samples.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Values closer than this are considered the same constant.
const CONST_EPSILON: f32 = 1e-7;

/// A cached constant block expires after going unused for this many
/// recycle passes.
const CONST_EXPIRE: u8 = 16;

static ZERO_BLOCK: [f32; MAX_BLOCK_SIZE] = [0.0; MAX_BLOCK_SIZE];

/// A read-only all-zero block of at least `n` samples.
#[inline]
pub fn const_zeros(n: usize) -> &'static [f32] {
    debug_assert!(n <= MAX_BLOCK_SIZE);
    &ZERO_BLOCK[..n]
}

#[inline]
pub(crate) fn zero_block_ptr() -> *const f32 {
    ZERO_BLOCK.as_ptr()
}

struct ConstEntry {
    value: f32,
    block: Arc<[f32]>,
    uses: u8,
}

/// Cache of constant-filled blocks, sorted by value.
///
/// Lookups refresh the use count; `recycle` decrements all counts and
/// drops entries that reach zero.
pub struct ConstPool {
    block_size: usize,
    entries: Mutex<Vec<ConstEntry>>,
}

impl ConstPool {
    pub fn new(block_size: usize) -> Self {
        debug_assert!(block_size <= MAX_BLOCK_SIZE);
        Self {
            block_size,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// A shared read-only block filled with `value`.
    pub fn const_values(&self, value: f32) -> Arc<[f32]> {
        if value.abs() < CONST_EPSILON {
            return Arc::from(const_zeros(self.block_size));
        }
        let mut entries = self.entries.lock();
        match entries.binary_search_by(|e| e.value.partial_cmp(&value).unwrap_or(std::cmp::Ordering::Less)) {
            Ok(i) => {
                entries[i].uses = CONST_EXPIRE;
                entries[i].block.clone()
            }
            Err(i) => {
                let block: Arc<[f32]> = vec![value; self.block_size].into();
                entries.insert(
                    i,
                    ConstEntry {
                        value,
                        block: block.clone(),
                        uses: CONST_EXPIRE,
                    },
                );
                block
            }
        }
    }

    /// Age the cache; entries unused for [`CONST_EXPIRE`] passes are
    /// dropped. `nuke_all` empties the cache unconditionally (used on
    /// reconfiguration, where the block size changes).
    pub fn recycle(&self, nuke_all: bool) {
        let mut entries = self.entries.lock();
        if nuke_all {
            entries.clear();
            return;
        }
        entries.retain_mut(|e| {
            e.uses -= 1;
            e.uses > 0
        });
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_zeros() {
        let z = const_zeros(64);
        assert_eq!(z.len(), 64);
        assert!(z.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_const_values_cached() {
        let pool = ConstPool::new(128);
        let a = pool.const_values(0.5);
        let b = pool.const_values(0.5);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_const_values_sorted_inserts() {
        let pool = ConstPool::new(16);
        let vals = [0.9, 0.1, 0.5, -0.3, 0.7];
        for &v in &vals {
            let block = pool.const_values(v);
            assert!(block.iter().all(|&x| x == v));
        }
        // All distinct values hit their own cache entry.
        for &v in &vals {
            let block = pool.const_values(v);
            assert_eq!(block[0], v);
        }
    }

    #[test]
    fn test_recycle_expires_unused() {
        let pool = ConstPool::new(16);
        let block = pool.const_values(0.25);
        drop(block);
        for _ in 0..CONST_EXPIRE {
            pool.recycle(false);
        }
        // Expired: a fresh lookup allocates a new block.
        let again = pool.const_values(0.25);
        assert_eq!(again[0], 0.25);
    }

    #[test]
    fn test_recycle_nuke_all() {
        let pool = ConstPool::new(16);
        pool.const_values(0.25);
        pool.recycle(true);
        let again = pool.const_values(0.25);
        assert_eq!(again[0], 0.25);
    }
}
