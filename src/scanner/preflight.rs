//! Cheap liveness check run once per address before its ports are swept.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::ScanError;

/// Ports dialled in ascending order and the per-port timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightConfig {
    pub ports: Vec<u16>,
    pub timeout: Duration,
}

/// Opens (and immediately drops) a connection.
pub trait Dialer: Send + Sync {
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> BoxFuture<'_, io::Result<()>>;
}

/// Plain TCP connect with a deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> BoxFuture<'_, io::Result<()>> {
        async move {
            let stream = time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "preflight dial timed out"))??;
            drop(stream);
            Ok(())
        }
        .boxed()
    }
}

/// Dials each preflight port of `ip` in turn and stops at the first answer.
///
/// Refusals, timeouts and other dial errors all just move on to the next
/// port; the address is unreachable only once every port failed. Returns
/// [`ScanError::Cancelled`] if `cancel` fires first.
pub async fn run_preflight(
    ip: IpAddr,
    config: &PreflightConfig,
    dialer: &dyn Dialer,
    cancel: &CancellationToken,
) -> Result<bool, ScanError> {
    if config.ports.is_empty() {
        return Ok(true);
    }

    for &port in &config.ports {
        let addr = SocketAddr::new(ip, port);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ScanError::Cancelled),
            outcome = dialer.dial(addr, config.timeout) => outcome,
        };

        match outcome {
            Ok(()) => {
                debug!("Preflight {addr} answered");
                return Ok(true);
            }
            Err(e) => debug!("Preflight {addr} failed: {e}"),
        }
    }

    debug!("Preflight found {ip} unreachable");
    Ok(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{run_preflight, Dialer, PreflightConfig, TcpDialer};
    use crate::error::ScanError;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::io;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// Answers only on the listed ports and records every attempt.
    #[derive(Default)]
    pub(crate) struct ScriptedDialer {
        pub open: Vec<SocketAddr>,
        pub attempts: Mutex<Vec<SocketAddr>>,
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self, addr: SocketAddr, _timeout: Duration) -> BoxFuture<'_, io::Result<()>> {
            self.attempts.lock().unwrap().push(addr);
            let result = if self.open.contains(&addr) {
                Ok(())
            } else {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            };
            async move { result }.boxed()
        }
    }

    fn config(ports: &[u16]) -> PreflightConfig {
        PreflightConfig {
            ports: ports.to_vec(),
            timeout: Duration::from_millis(50),
        }
    }

    const TARGET: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 5));

    #[tokio::test]
    async fn stops_at_first_answer() {
        let dialer = ScriptedDialer {
            open: vec![SocketAddr::new(TARGET, 80)],
            ..ScriptedDialer::default()
        };
        let alive = run_preflight(TARGET, &config(&[53, 80, 443]), &dialer, &CancellationToken::new())
            .await
            .unwrap();

        assert!(alive);
        assert_eq!(dialer.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_after_every_port_fails() {
        let dialer = ScriptedDialer::default();
        let alive = run_preflight(TARGET, &config(&[53, 80, 443, 3389]), &dialer, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!alive);
        assert_eq!(dialer.attempts.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_port_list_is_alive() {
        let dialer = ScriptedDialer::default();
        assert!(run_preflight(TARGET, &config(&[]), &dialer, &CancellationToken::new())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancellation_stops_preflight() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_preflight(TARGET, &config(&[80]), &ScriptedDialer::default(), &cancel).await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
    }

    #[tokio::test]
    async fn tcp_dialer_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(TcpDialer.dial(addr, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(TcpDialer.dial(addr, Duration::from_secs(1)).await.is_err());
    }
}
