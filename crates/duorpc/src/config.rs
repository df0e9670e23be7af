//! Endpoint configuration.

use std::time::Duration;

/// Default ceiling for a single frame in either direction.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Tunables shared by both endpoint roles.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name attached to every log line emitted by the endpoint.
    pub name: String,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_size: usize,
    /// Deadline for a single call. `None` waits until the response, a
    /// cancellation, or a connection fault.
    pub call_timeout: Option<Duration>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            call_timeout: None,
        }
    }
}
