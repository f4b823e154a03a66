use std::sync::Arc;
use std::time::Duration;

use fetchd_types::network::NetworkStatus;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes reachability changes to whoever subscribed.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Returns whether the status actually changed.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(online = status.online, bearer = ?status.bearer, "Network status changed");
        }
        changed
    }

    pub fn set_online(&self, online: bool) -> bool {
        let status = NetworkStatus {
            online,
            ..self.current()
        };
        self.set_status(status)
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::ONLINE)
    }
}

/// Marks the network online while a TCP connection to `addr` succeeds.
pub async fn run_probe(
    monitor: NetworkMonitor,
    addr: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let online = matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        );
        monitor.set_online(online);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
