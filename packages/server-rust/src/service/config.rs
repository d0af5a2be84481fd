use std::time::Duration;

/// Settings for the stock operation middleware.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Per-call deadline in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Calls allowed to run at once before new ones are shed.
    pub max_concurrent_operations: u32,
}

impl ServiceConfig {
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_operation_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
        }
    }
}
