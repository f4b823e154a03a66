//! One tokio task per transfer.
//!
//! The task owns the transfer exclusively and serializes commands and
//! transport input, so a transfer never sees two callbacks at once.

use fetchd_types::events::{Notification, TransferEvent};
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{Snapshot, TransferId, TransferState};
use fetchd_types::network::NetworkStatus;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::transfer::Transfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Cancel,
    SetThrottle(u64),
    AllowMobileDownload(bool),
    Network(NetworkStatus),
}

/// Last known view of a transfer, refreshed before its events go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub state: TransferState,
    pub progress: u64,
    pub total_size: u64,
    pub throttle: u64,
    pub allow_mobile: bool,
    pub is_valid: bool,
    pub last_error: Option<String>,
}

impl TransferStatus {
    fn of<T: Transfer>(transfer: &T) -> Self {
        let core = transfer.core();
        Self {
            state: core.state(),
            progress: transfer.progress(),
            total_size: transfer.total_size(),
            throttle: core.throttle(),
            allow_mobile: core.allows_mobile(),
            is_valid: core.is_valid(),
            last_error: core.last_error().map(str::to_string),
        }
    }
}

/// Where a task publishes what its transfer reports.
#[derive(Clone)]
pub struct EventSink {
    pub notifications: broadcast::Sender<Notification>,
    pub snapshots: mpsc::UnboundedSender<Snapshot>,
}

/// Cheap, cloneable handle to a running transfer task.
#[derive(Clone)]
pub struct TransferHandle {
    id: TransferId,
    owner: String,
    metadata: TransferMetadata,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TransferStatus>,
}

impl TransferHandle {
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    /// Returns false once the task is gone.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TransferStatus> {
        self.status.clone()
    }
}

/// Spawns the task driving `transfer`. It runs until every handle is dropped.
pub fn spawn<T>(transfer: T, sink: EventSink) -> TransferHandle
where
    T: Transfer + 'static,
{
    let core = transfer.core();
    let id = core.id().clone();
    let owner = core.owner().to_string();
    let metadata = core.metadata().clone();

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(TransferStatus::of(&transfer));
    tokio::spawn(run(transfer, commands_rx, status_tx, sink));

    TransferHandle {
        id,
        owner,
        metadata,
        commands: commands_tx,
        status: status_rx,
    }
}

async fn run<T: Transfer>(
    mut transfer: T,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<TransferStatus>,
    sink: EventSink,
) {
    let id = transfer.core().id().clone();
    flush(&mut transfer, &id, &status, &sink);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply(&mut transfer, command),
                None => break,
            },
            input = transfer.next_input() => transfer.handle_input(input),
        }
        flush(&mut transfer, &id, &status, &sink);
    }
    debug!(transfer_id = %id, "Transfer task stopped");
}

fn apply<T: Transfer>(transfer: &mut T, command: Command) {
    match command {
        Command::Start => transfer.start(),
        Command::Pause => transfer.pause(),
        Command::Resume => transfer.resume(),
        Command::Cancel => transfer.cancel(),
        Command::SetThrottle(throttle) => transfer.set_throttle(throttle),
        Command::AllowMobileDownload(allowed) => transfer.allow_mobile_download(allowed),
        Command::Network(network) => transfer.update_network(network),
    }
}

fn flush<T: Transfer>(
    transfer: &mut T,
    id: &TransferId,
    status: &watch::Sender<TransferStatus>,
    sink: &EventSink,
) {
    let events = transfer.drain_events();
    // The record goes out before anyone can observe the new state.
    if events
        .iter()
        .any(|e| matches!(e, TransferEvent::StateChanged { .. }))
    {
        let _ = sink.snapshots.send(transfer.snapshot());
    }
    status.send_if_modified(|current| {
        let next = TransferStatus::of(transfer);
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
    for event in events {
        let _ = sink.notifications.send(Notification {
            transfer_id: id.clone(),
            event,
        });
    }
}
