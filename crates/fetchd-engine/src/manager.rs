//! Entry point for clients: creates transfers, routes commands to their
//! tasks and keeps the catalog up to date.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fetchd_types::events::{Notification, TransferEvent};
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{GroupMember, Snapshot, TransferId, TransferState};
use fetchd_types::store::PersistentStore;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::factory::{GroupRequest, PathPolicy, SingleRequest, TransferFactory};
use crate::network::NetworkMonitor;
use crate::queue::{QueueEvent, TransferQueue};
use crate::task::{self, Command, EventSink, TransferHandle, TransferStatus};
use crate::transfer::{EngineContext, Transfer};

const NOTIFICATION_CAPACITY: usize = 1024;
const QUEUE_EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown transfer: {0}")]
    UnknownTransfer(TransferId),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct TransferManager {
    factory: TransferFactory,
    store: Arc<dyn PersistentStore>,
    queue: Arc<Mutex<TransferQueue>>,
    /// Transfers that are live or finished but not yet collected. Canceled
    /// and failed ones are released as soon as the queue driver sees them.
    handles: Arc<Mutex<HashMap<TransferId, TransferHandle>>>,
    sink: EventSink,
    queue_events: broadcast::Sender<QueueEvent>,
    default_throttle: Mutex<u64>,
    network: NetworkMonitor,
    shutdown: CancellationToken,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl TransferManager {
    /// Must be called from within a tokio runtime: spawns the queue driver
    /// and the persister.
    pub fn new(
        ctx: EngineContext,
        policy: Arc<dyn PathPolicy>,
        store: Arc<dyn PersistentStore>,
        network: NetworkMonitor,
        default_throttle: u64,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (queue_events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        let (snapshots, snapshots_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let queue = Arc::new(Mutex::new(TransferQueue::new(network.current())));
        let handles = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(drive_queue(
            queue.clone(),
            handles.clone(),
            notifications.subscribe(),
            network.subscribe(),
            queue_events.clone(),
            shutdown.clone(),
        ));
        let persister = tokio::spawn(persist(store.clone(), snapshots_rx, shutdown.clone()));

        Self {
            factory: TransferFactory::new(ctx, policy),
            store,
            queue,
            handles,
            sink: EventSink {
                notifications,
                snapshots,
            },
            queue_events,
            default_throttle: Mutex::new(default_throttle),
            network,
            shutdown,
            persister: Mutex::new(Some(persister)),
        }
    }

    pub fn create_download(
        &self,
        owner: &str,
        url: &str,
        metadata: TransferMetadata,
        headers: BTreeMap<String, String>,
    ) -> TransferId {
        self.create_download_with_hash(owner, url, "", "", metadata, headers)
    }

    pub fn create_download_with_hash(
        &self,
        owner: &str,
        url: &str,
        algorithm: &str,
        hash: &str,
        metadata: TransferMetadata,
        headers: BTreeMap<String, String>,
    ) -> TransferId {
        let transfer = self.factory.create_single(
            owner,
            SingleRequest {
                url: url.to_string(),
                hash: hash.to_string(),
                algorithm: algorithm.to_string(),
                metadata,
                headers,
                throttle: self.default_throttle(),
            },
        );
        info!(transfer_id = %transfer.core().id(), owner, url, "Download created");
        self.register(transfer)
    }

    pub fn create_group(
        &self,
        owner: &str,
        members: Vec<GroupMember>,
        algorithm: &str,
        allow_mobile: bool,
        metadata: TransferMetadata,
        headers: BTreeMap<String, String>,
    ) -> TransferId {
        let count = members.len();
        let transfer = self.factory.create_group(
            owner,
            GroupRequest {
                members,
                algorithm: algorithm.to_string(),
                allow_mobile,
                metadata,
                headers,
                throttle: self.default_throttle(),
            },
        );
        info!(group_id = %transfer.core().id(), owner, "Group download created with {} members", count);
        self.register(transfer)
    }

    fn register<T: Transfer + 'static>(&self, transfer: T) -> TransferId {
        if let Some(reason) = transfer.core().last_error() {
            warn!(transfer_id = %transfer.core().id(), "Transfer is invalid: {}", reason);
        }
        let _ = self.sink.snapshots.send(transfer.snapshot());

        let handle = task::spawn(transfer, self.sink.clone());
        let id = handle.id().clone();
        self.handles.lock().insert(id.clone(), handle.clone());

        let events = {
            let mut queue = self.queue.lock();
            // The driver may not have seen the latest status yet.
            let network = self.network.current();
            if queue.network() != network {
                queue.broadcast_network(network);
            }
            queue.add(handle)
        };
        self.publish(events);
        id
    }

    pub fn start(&self, id: &TransferId) -> Result<(), ManagerError> {
        self.command(id, Command::Start)
    }

    pub fn pause(&self, id: &TransferId) -> Result<(), ManagerError> {
        self.command(id, Command::Pause)
    }

    pub fn resume(&self, id: &TransferId) -> Result<(), ManagerError> {
        self.command(id, Command::Resume)
    }

    pub fn cancel(&self, id: &TransferId) -> Result<(), ManagerError> {
        self.command(id, Command::Cancel)
    }

    pub fn set_throttle(&self, id: &TransferId, throttle: u64) -> Result<(), ManagerError> {
        self.command(id, Command::SetThrottle(throttle))
    }

    pub fn allow_mobile_download(&self, id: &TransferId, allowed: bool) -> Result<(), ManagerError> {
        self.command(id, Command::AllowMobileDownload(allowed))
    }

    pub fn status(&self, id: &TransferId) -> Result<TransferStatus, ManagerError> {
        self.handle(id).map(|handle| handle.status())
    }

    /// Status receiver of a transfer, for callers that want to await a state.
    pub fn watch(&self, id: &TransferId) -> Result<watch::Receiver<TransferStatus>, ManagerError> {
        self.handle(id).map(|handle| handle.watch())
    }

    pub fn default_throttle(&self) -> u64 {
        *self.default_throttle.lock()
    }

    /// New default for future transfers, also applied to every live one.
    pub fn set_default_throttle(&self, throttle: u64) {
        *self.default_throttle.lock() = throttle;
        let queue = self.queue.lock();
        for id in queue.ids() {
            if let Some(handle) = queue.get(id) {
                handle.send(Command::SetThrottle(throttle));
            }
        }
        debug!("Default throttle set to {}", throttle);
    }

    /// Live transfers in the order they were created.
    pub fn all_downloads(&self) -> Vec<TransferId> {
        self.queue.lock().ids().to_vec()
    }

    pub fn downloads_with_metadata(&self, key: &str, value: &str) -> Vec<TransferId> {
        let queue = self.queue.lock();
        queue
            .ids()
            .iter()
            .filter(|id| {
                queue
                    .get(id)
                    .and_then(|handle| handle.metadata().get_str(key))
                    .is_some_and(|found| found == value)
            })
            .cloned()
            .collect()
    }

    pub fn current_transfer(&self, owner: &str) -> Option<TransferId> {
        self.queue.lock().current_transfer(owner).cloned()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sink.notifications.subscribe()
    }

    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_events.subscribe()
    }

    /// Finished records of `owner` nobody has collected yet.
    pub fn uncollected(&self, owner: &str) -> Result<Vec<Snapshot>, ManagerError> {
        Ok(self.store.uncollected(owner)?)
    }

    /// Marks a record as collected and releases its task.
    pub fn collect(&self, id: &TransferId) -> Result<(), ManagerError> {
        self.store.mark_collected(id)?;
        if self.handles.lock().remove(id).is_some() {
            debug!(transfer_id = %id, "Transfer collected");
        }
        Ok(())
    }

    /// Stops every task and waits for pending records to be written.
    pub async fn shutdown(&self) {
        info!("Transfer manager shutting down");
        self.shutdown.cancel();
        self.handles.lock().clear();
        let ids = self.queue.lock().ids().to_vec();
        for id in ids {
            let events = self.queue.lock().remove(&id);
            self.publish(events);
        }

        let persister = self.persister.lock().take();
        if let Some(persister) = persister {
            if let Err(e) = persister.await {
                error!("Persister task failed: {}", e);
            }
        }
    }

    fn handle(&self, id: &TransferId) -> Result<TransferHandle, ManagerError> {
        self.handles
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownTransfer(id.clone()))
    }

    fn command(&self, id: &TransferId, command: Command) -> Result<(), ManagerError> {
        let handle = self.handle(id)?;
        debug!(transfer_id = %id, "Command {:?}", command);
        if handle.send(command) {
            Ok(())
        } else {
            Err(ManagerError::UnknownTransfer(id.clone()))
        }
    }

    fn publish(&self, events: Vec<QueueEvent>) {
        for event in events {
            let _ = self.queue_events.send(event);
        }
    }
}

/// Keeps the queue in step with state changes and network status.
async fn drive_queue(
    queue: Arc<Mutex<TransferQueue>>,
    handles: Arc<Mutex<HashMap<TransferId, TransferHandle>>>,
    mut notifications: broadcast::Receiver<Notification>,
    mut network: watch::Receiver<fetchd_types::network::NetworkStatus>,
    queue_events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let events = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = notifications.recv() => match received {
                Ok(Notification { transfer_id, event: TransferEvent::StateChanged { state } }) => {
                    if is_abandoned(state) && handles.lock().remove(&transfer_id).is_some() {
                        debug!(transfer_id = %transfer_id, "Released {} transfer", state);
                    }
                    queue.lock().on_state_changed(&transfer_id, state)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Queue driver missed {} notifications", missed);
                    handles.lock().retain(|_, handle| !is_abandoned(handle.status().state));
                    queue.lock().refresh()
                }
                Err(RecvError::Closed) => break,
            },
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *network.borrow_and_update();
                debug!("Forwarding network status {:?}", status);
                queue.lock().broadcast_network(status);
                continue;
            }
        };
        for event in events {
            let _ = queue_events.send(event);
        }
    }
    debug!("Queue driver stopped");
}

/// Nobody collects canceled or failed transfers, so their tasks end here.
fn is_abandoned(state: TransferState) -> bool {
    matches!(state, TransferState::Canceled | TransferState::Error)
}

/// Writes snapshots in arrival order; drains what is left on shutdown.
async fn persist(
    store: Arc<dyn PersistentStore>,
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
    shutdown: CancellationToken,
) {
    loop {
        let snapshot = tokio::select! {
            biased;
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => snapshot,
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(snapshot) = snapshots.try_recv() {
                    save(&store, snapshot).await;
                }
                break;
            }
        };
        save(&store, snapshot).await;
    }
    debug!("Persister stopped");
}

async fn save(store: &Arc<dyn PersistentStore>, snapshot: Snapshot) {
    let id = snapshot.id().clone();
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
        Ok(Ok(())) => debug!(transfer_id = %id, "Snapshot saved"),
        Ok(Err(e)) => error!(transfer_id = %id, "Failed to save snapshot: {:#}", e),
        Err(e) => error!(transfer_id = %id, "Snapshot writer panicked: {}", e),
    }
}
