//! Server configuration types and defaults.
//!
//! [`ServerConfig`] is the flat, hosting-level view of every tunable. It
//! splits into the [`SchedulerSettings`] and [`ConnectionSettings`]
//! consumed by the pipeline itself.

use crate::connection::ConnectionSettings;
use crate::scheduler::SchedulerSettings;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the socket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Capacity of each connection's receive buffer in bytes
    pub receive_buffer_size: usize,

    /// Capacity of the global input queue
    pub input_queue_capacity: usize,

    /// Capacity of each output partition queue
    pub output_queue_capacity: usize,

    /// Number of output partitions (and worker threads)
    pub output_workers: usize,

    /// Idle wait of worker threads before they recheck cancellation
    pub dequeue_timeout_ms: u64,

    /// Upper bound for replaying one effects buffer
    pub delivery_timeout_ms: u64,

    /// Upper bound for joining each worker thread on shutdown
    pub shutdown_timeout_ms: u64,

    /// How long teardown waits for the peer's close handshake
    pub close_timeout_ms: u64,

    /// Server tick interval in milliseconds (0 disables the tick)
    pub tick_interval_ms: u64,

    /// Drop undecodable messages instead of closing the connection
    pub skip_malformed_messages: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let scheduler = SchedulerSettings::default();
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 1000,
            receive_buffer_size: 64 * 1024,
            input_queue_capacity: scheduler.input_queue_capacity,
            output_queue_capacity: scheduler.output_queue_capacity,
            output_workers: scheduler.output_workers,
            dequeue_timeout_ms: 100,
            delivery_timeout_ms: 5_000,
            shutdown_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
            tick_interval_ms: 0,
            skip_malformed_messages: false,
        }
    }
}

impl ServerConfig {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            input_queue_capacity: self.input_queue_capacity,
            output_queue_capacity: self.output_queue_capacity,
            output_workers: self.output_workers,
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            receive_buffer_size: self.receive_buffer_size,
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            skip_malformed_messages: self.skip_malformed_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_settings() {
        let config = ServerConfig::default();
        let scheduler = config.scheduler_settings();
        assert_eq!(scheduler.input_queue_capacity, 500);
        assert_eq!(scheduler.output_queue_capacity, 500);
        assert_eq!(scheduler.dequeue_timeout, Duration::from_millis(100));
        assert!(scheduler.output_workers >= 1);

        let connection = config.connection_settings();
        assert_eq!(connection.receive_buffer_size, 64 * 1024);
        assert_eq!(connection.close_timeout, Duration::from_secs(2));
        assert!(!connection.skip_malformed_messages);
    }
}
