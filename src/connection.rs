use std::sync::atomic::{AtomicUsize, Ordering};

/// Global counter for tracking active client connections
pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard to ensure the connection count is properly decremented
pub struct ConnectionGuard {
    decremented: bool,
}

impl ConnectionGuard {
    /// Create a new connection guard and increment the global counter
    pub fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        Self { decremented: false }
    }

    /// Manually decrement the connection counter
    pub fn decrement(&mut self) {
        if !self.decremented {
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }

    /// Get the current active connection count
    pub fn active_count() -> usize {
        ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}
