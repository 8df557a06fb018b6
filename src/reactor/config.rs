use std::time::Duration;

/// Configuration of an [`IoReactor`](super::IoReactor).
#[derive(Debug, Clone)]
pub struct IoReactorConfig {
    /// Number of I/O threads, each running its own event loop.
    pub io_thread_count: usize,
    /// Per-connection idle timeout. `Duration::ZERO` disables it.
    pub so_timeout: Duration,
    /// Initial size of session and exchange buffers.
    pub buffer_size: usize,
    /// Enable TCP_NODELAY on all connections (accepted and outbound).
    pub tcp_nodelay: bool,
    /// Grace period for in-flight exchanges when closing gracefully.
    pub graceful_timeout: Duration,
    /// Upper bound for the TLS handshake of an accepted connection.
    pub tls_handshake_timeout: Duration,
    /// Prefix of the I/O thread names.
    pub thread_name: String,
    /// Most recent transport failures kept by the reactor. Older ones are dropped.
    pub exception_log_size: usize,
}

impl Default for IoReactorConfig {
    fn default() -> Self {
        IoReactorConfig {
            io_thread_count: 2,
            so_timeout: Duration::from_secs(60),
            buffer_size: 8192,
            tcp_nodelay: true,
            graceful_timeout: Duration::from_secs(3),
            tls_handshake_timeout: Duration::from_secs(10),
            thread_name: "hreq-io".to_string(),
            exception_log_size: 256,
        }
    }
}
