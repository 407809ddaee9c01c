use std::time::Duration;

/// A container known to the backend, addressed by its handle.
pub trait Container: Clone + Send + Sync + 'static {
    fn handle(&self) -> &str;
}

/// Source of a container's configured grace time.
pub trait GraceTime<C>: Send + Sync {
    /// Idle duration after which `container` is destroyed. Zero means never.
    fn grace_time(&self, container: &C) -> Duration;
}
