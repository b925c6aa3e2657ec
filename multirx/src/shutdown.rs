use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// The shutdown signal shared by every thread of a recording.
///
/// Cloning gives another handle to the same flag. The flag starts cleared and
/// can only ever be set; there is no way to clear it again. Threads poll
/// [`is_stopped`][StopFlag::is_stopped] once per loop iteration.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create a new, cleared, stop flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns true if this call is the one that set it.
    pub fn request_stop(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Check if a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
