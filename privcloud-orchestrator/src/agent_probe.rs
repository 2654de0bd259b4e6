use crate::clock::{self, Clock};
use async_trait::async_trait;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_AGENT_PORT: u16 = 7002;

/// Best-effort reachability check of the agent control port. Never fails.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn probe(&self, host: &str, deadline: Instant) -> bool;
}

/// Repeated TCP connects until one succeeds or the deadline passes.
pub struct TcpAgentProbe {
    port: u16,
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
    connect_timeout: Duration,
}

impl TcpAgentProbe {
    pub fn new(port: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            clock,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Strip a CIDR suffix if present (e.g. "1.2.3.4/32" -> "1.2.3.4").
pub fn clean_host(host: &str) -> &str {
    host.split('/').next().unwrap_or(host).trim()
}

async fn try_connect(addr: String, timeout: Duration) -> bool {
    tokio::task::spawn_blocking(move || {
        let Ok(mut candidates) = addr.to_socket_addrs() else {
            return false;
        };
        candidates.any(|socket_addr| TcpStream::connect_timeout(&socket_addr, timeout).is_ok())
    })
    .await
    .unwrap_or(false)
}

#[async_trait]
impl AgentProbe for TcpAgentProbe {
    async fn probe(&self, host: &str, deadline: Instant) -> bool {
        let addr = format!("{}:{}", clean_host(host), self.port);
        let mut attempts = 0u32;

        while let Some(left) = clock::remaining(self.clock.as_ref(), deadline) {
            attempts += 1;
            if try_connect(addr.clone(), self.connect_timeout.min(left)).await {
                tracing::debug!("[probe] agent at {} reachable after {} attempt(s)", addr, attempts);
                return true;
            }
            let Some(left) = clock::remaining(self.clock.as_ref(), deadline) else {
                break;
            };
            self.clock.sleep(self.retry_interval.min(left)).await;
        }

        tracing::warn!("⚠️ [probe] agent at {} unreachable after {} attempt(s)", addr, attempts);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[test]
    fn cidr_suffix_is_ignored() {
        assert_eq!(clean_host("10.0.0.7/32"), "10.0.0.7");
        assert_eq!(clean_host(" 10.0.0.7 "), "10.0.0.7");
    }

    #[tokio::test]
    async fn listening_port_is_reachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpAgentProbe::new(port, Arc::new(TokioClock));
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(probe.probe("127.0.0.1/32", deadline).await);
    }

    #[tokio::test]
    async fn closed_port_gives_up_at_deadline() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpAgentProbe::new(port, Arc::new(TokioClock))
            .with_retry_interval(Duration::from_millis(50));
        let deadline = Instant::now() + Duration::from_millis(300);
        assert!(!probe.probe("127.0.0.1", deadline).await);
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn past_deadline_never_connects() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpAgentProbe::new(port, Arc::new(TokioClock));
        assert!(!probe.probe("127.0.0.1", Instant::now()).await);
    }
}
