use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Default number of stripes for a [`KeyedLock`].
pub const DEFAULT_STRIPES: usize = 64;

/// Mutual exclusion keyed by an integer identity.
///
/// The key space is hashed onto a fixed number of stripes, each guarded by its
/// own reentrant mutex. Equal keys always exclude each other; distinct keys
/// run concurrently unless they share a stripe, in which case they are
/// serialized. A thread already holding a stripe may lock it again.
pub struct KeyedLock {
    stripes: Box<[ReentrantMutex<()>]>,
}

/// Guard returned by [`KeyedLock::lock`]; the stripe is released on drop.
pub struct KeyedLockGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(stripes: usize) -> Self {
        assert!(stripes > 0, "stripe count must be positive");
        Self {
            stripes: (0..stripes).map(|_| ReentrantMutex::new(())).collect(),
        }
    }

    /// The stripe that guards `key`.
    pub fn stripe_of(&self, key: i64) -> usize {
        // Fibonacci hashing spreads adjacent keys across stripes.
        let mixed = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 32) % self.stripes.len() as u64) as usize
    }

    /// Blocks until the stripe for `key` is free and returns a guard.
    pub fn lock(&self, key: i64) -> KeyedLockGuard<'_> {
        KeyedLockGuard {
            _guard: self.stripes[self.stripe_of(key)].lock(),
        }
    }

    /// Runs `body` while holding the stripe for `key` and returns its result.
    pub fn with_lock<T>(&self, key: i64, body: impl FnOnce() -> T) -> T {
        let _guard = self.lock(key);
        body()
    }
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new()
    }
}
