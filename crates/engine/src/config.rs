//! Engine configuration.
//!
//! One [`EngineConfig`] value parameterizes any of the three engines. The
//! defaults follow common servlet-container practice: 30 second socket and
//! context timeouts, 100 requests per keep-alive connection, 64 KiB header
//! ceiling and a 10 MiB body ceiling.

use std::time::Duration;

/// Configuration shared by the three engines.
///
/// Construct with [`EngineConfig::new`] and adjust with the chained
/// `with_*` setters:
///
/// ```
/// use troika_engine::EngineConfig;
///
/// let config = EngineConfig::new(8080)
///     .with_bind_address("127.0.0.1")
///     .with_max_requests_per_connection(10);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the listener binds to.
    pub bind_address: String,
    /// Port the listener binds to; 0 asks the OS for a free port.
    pub port: u16,
    /// Listen backlog handed to the OS.
    pub backlog: u32,
    /// Idle/read timeout for a connection.
    pub socket_read_timeout: Duration,
    /// Maximum requests served per keep-alive connection; 0 means unlimited.
    pub max_requests_per_connection: u32,
    /// Ceiling for the request head (request line plus headers).
    pub max_header_bytes: usize,
    /// Ceiling for an aggregated request body.
    pub max_body_bytes: usize,
    /// Core worker count of the adaptive pool.
    pub pool_core: usize,
    /// Ceiling worker count of the adaptive pool.
    pub pool_max: usize,
    /// Queue capacity once the pool is at its ceiling.
    pub pool_queue_capacity: usize,
    /// Idle lifetime of workers above the core count.
    pub pool_keep_alive: Duration,
    /// Step used by the adaptive resize sampler.
    pub pool_scale_step: usize,
    /// Enables the adaptive resize sampler (HRP).
    pub pool_adaptive: bool,
    /// Deadline for detached (suspended) requests.
    pub async_context_timeout: Duration,
    /// Interval of the async context sweeper.
    pub context_sweep_interval: Duration,
    /// Optional node id rendered into context ids for multi-node logs.
    pub node_id: Option<String>,
    /// Initial capacity of per-connection write buffers.
    pub write_buffer_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            backlog: 50,
            socket_read_timeout: Duration::from_millis(30_000),
            max_requests_per_connection: 100,
            max_header_bytes: 65_536,
            max_body_bytes: 10_485_760,
            pool_core: 8,
            pool_max: 200,
            pool_queue_capacity: 100,
            pool_keep_alive: Duration::from_millis(60_000),
            pool_scale_step: 4,
            pool_adaptive: false,
            async_context_timeout: Duration::from_millis(30_000),
            context_sweep_interval: Duration::from_millis(5_000),
            node_id: None,
            write_buffer_bytes: 8_192,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration listening on the given port with defaults.
    pub fn new(port: u16) -> Self {
        Self { port, ..Default::default() }
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_socket_read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_read_timeout = timeout;
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn with_pool_core(mut self, core: usize) -> Self {
        self.pool_core = core;
        self
    }

    pub fn with_pool_max(mut self, max: usize) -> Self {
        self.pool_max = max;
        self
    }

    pub fn with_pool_queue_capacity(mut self, capacity: usize) -> Self {
        self.pool_queue_capacity = capacity;
        self
    }

    pub fn with_pool_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.pool_keep_alive = keep_alive;
        self
    }

    pub fn with_pool_scale_step(mut self, step: usize) -> Self {
        self.pool_scale_step = step;
        self
    }

    pub fn with_pool_adaptive(mut self, adaptive: bool) -> Self {
        self.pool_adaptive = adaptive;
        self
    }

    pub fn with_async_context_timeout(mut self, timeout: Duration) -> Self {
        self.async_context_timeout = timeout;
        self
    }

    pub fn with_context_sweep_interval(mut self, interval: Duration) -> Self {
        self.context_sweep_interval = interval;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes;
        self
    }

    /// Returns true if the per-connection request counter is exhausted.
    pub(crate) fn requests_exhausted(&self, served: u32) -> bool {
        self.max_requests_per_connection != 0 && served >= self.max_requests_per_connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.backlog, 50);
        assert_eq!(config.socket_read_timeout, Duration::from_secs(30));
        assert_eq!(config.max_requests_per_connection, 100);
        assert_eq!(config.max_header_bytes, 65_536);
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.async_context_timeout, Duration::from_secs(30));
        assert_eq!(config.write_buffer_bytes, 8_192);
    }

    #[test]
    fn zero_means_unlimited_requests() {
        let config = EngineConfig::default().with_max_requests_per_connection(0);
        assert!(!config.requests_exhausted(u32::MAX));

        let config = EngineConfig::default().with_max_requests_per_connection(2);
        assert!(!config.requests_exhausted(1));
        assert!(config.requests_exhausted(2));
    }
}
