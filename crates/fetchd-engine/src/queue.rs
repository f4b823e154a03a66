use std::collections::HashMap;

use fetchd_types::models::{TransferId, TransferState};
use fetchd_types::network::NetworkStatus;
use serde::Serialize;
use tracing::{debug, info};

use crate::task::{Command, TransferHandle};

/// Changes of the live-transfer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueEvent {
    Added(TransferId),
    Removed(TransferId),
    CurrentChanged {
        owner: String,
        current: Option<TransferId>,
    },
}

/// Live transfers in insertion order. Mutated from a single task only;
/// mutators return the events they caused.
pub struct TransferQueue {
    transfers: HashMap<TransferId, TransferHandle>,
    order: Vec<TransferId>,
    current: HashMap<String, TransferId>,
    network: NetworkStatus,
}

impl TransferQueue {
    pub fn new(network: NetworkStatus) -> Self {
        Self {
            transfers: HashMap::new(),
            order: Vec::new(),
            current: HashMap::new(),
            network,
        }
    }

    /// Registers a transfer and hands it the current network status.
    pub fn add(&mut self, handle: TransferHandle) -> Vec<QueueEvent> {
        let id = handle.id().clone();
        handle.send(Command::Network(self.network));
        if self.transfers.insert(id.clone(), handle).is_none() {
            self.order.push(id.clone());
        }
        info!(transfer_id = %id, "Transfer queued ({} live)", self.order.len());

        let mut events = vec![QueueEvent::Added(id)];
        events.extend(self.refresh());
        events
    }

    pub fn remove(&mut self, id: &TransferId) -> Vec<QueueEvent> {
        if self.transfers.remove(id).is_none() {
            return Vec::new();
        }
        self.order.retain(|other| other != id);
        info!(transfer_id = %id, "Transfer left the queue ({} live)", self.order.len());

        let mut events = vec![QueueEvent::Removed(id.clone())];
        events.extend(self.refresh());
        events
    }

    /// Terminal transfers leave the queue; anything else may move the
    /// current transfer of its owner.
    pub fn on_state_changed(&mut self, id: &TransferId, state: TransferState) -> Vec<QueueEvent> {
        if state.is_terminal() {
            self.remove(id)
        } else {
            self.refresh()
        }
    }

    pub fn current_transfer(&self, owner: &str) -> Option<&TransferId> {
        self.current.get(owner)
    }

    pub fn ids(&self) -> &[TransferId] {
        &self.order
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn get(&self, id: &TransferId) -> Option<&TransferHandle> {
        self.transfers.get(id)
    }

    pub fn network(&self) -> NetworkStatus {
        self.network
    }

    pub fn broadcast_network(&mut self, status: NetworkStatus) {
        self.network = status;
        debug!("Broadcasting {:?} to {} transfers", status, self.order.len());
        for handle in self.transfers.values() {
            handle.send(Command::Network(status));
        }
    }

    /// Drops transfers that already ended and recomputes the current
    /// transfer of every owner from the handles' status.
    pub fn refresh(&mut self) -> Vec<QueueEvent> {
        let mut events = Vec::new();

        let ended: Vec<TransferId> = self
            .order
            .iter()
            .filter(|id| {
                self.transfers
                    .get(*id)
                    .is_none_or(|h| h.status().state.is_terminal())
            })
            .cloned()
            .collect();
        for id in ended {
            self.transfers.remove(&id);
            self.order.retain(|other| *other != id);
            events.push(QueueEvent::Removed(id));
        }

        let mut current: HashMap<String, TransferId> = HashMap::new();
        for id in &self.order {
            let Some(handle) = self.transfers.get(id) else {
                continue;
            };
            if handle.status().state.is_active() && !current.contains_key(handle.owner()) {
                current.insert(handle.owner().to_string(), id.clone());
            }
        }

        let mut owners: Vec<&String> = self.current.keys().chain(current.keys()).collect();
        owners.sort();
        owners.dedup();
        for owner in owners {
            let before = self.current.get(owner);
            let after = current.get(owner);
            if before != after {
                events.push(QueueEvent::CurrentChanged {
                    owner: owner.clone(),
                    current: after.cloned(),
                });
            }
        }
        self.current = current;
        events
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::single::tests::Harness;
    use crate::task::{self, EventSink};

    fn sink() -> EventSink {
        let (notifications, _) = broadcast::channel(64);
        let (snapshots, _) = mpsc::unbounded_channel();
        EventSink {
            notifications,
            snapshots,
        }
    }

    async fn wait_state(handle: &TransferHandle, state: TransferState) {
        let mut status = handle.watch();
        status.wait_for(|s| s.state == state).await.unwrap();
    }

    #[tokio::test]
    async fn tracks_the_first_active_transfer_per_owner() {
        let h = Harness::new();
        let mut queue = TransferQueue::new(NetworkStatus::ONLINE);
        let first = task::spawn(h.transfer(h.spec("http://example.com/1", "1")), sink());
        let second = task::spawn(h.transfer(h.spec("http://example.com/2", "2")), sink());

        queue.add(first.clone());
        let events = queue.add(second.clone());
        assert_eq!(events, vec![QueueEvent::Added(second.id().clone())]);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.current_transfer("tester"), None);

        second.send(Command::Start);
        wait_state(&second, TransferState::Downloading).await;
        let events = queue.refresh();
        assert_eq!(
            events,
            vec![QueueEvent::CurrentChanged {
                owner: "tester".into(),
                current: Some(second.id().clone()),
            }]
        );

        first.send(Command::Start);
        wait_state(&first, TransferState::Downloading).await;
        queue.refresh();
        assert_eq!(queue.current_transfer("tester"), Some(first.id()));
    }

    #[tokio::test]
    async fn terminal_transfers_leave_the_queue() {
        let h = Harness::new();
        let mut queue = TransferQueue::new(NetworkStatus::ONLINE);
        let handle = task::spawn(h.transfer(h.spec("http://example.com/1", "1")), sink());
        queue.add(handle.clone());

        handle.send(Command::Cancel);
        wait_state(&handle, TransferState::Canceled).await;
        let events = queue.on_state_changed(handle.id(), TransferState::Canceled);
        assert_eq!(events, vec![QueueEvent::Removed(handle.id().clone())]);
        assert!(queue.ids().is_empty());
        assert!(queue.get(handle.id()).is_none());
    }

    #[tokio::test]
    async fn network_changes_reach_every_transfer() {
        let h = Harness::new();
        let mut queue = TransferQueue::new(NetworkStatus::ONLINE);
        let handle = task::spawn(h.transfer(h.spec("http://example.com/1", "1")), sink());
        queue.add(handle.clone());
        handle.send(Command::Start);
        wait_state(&handle, TransferState::Downloading).await;

        queue.broadcast_network(NetworkStatus::OFFLINE);
        wait_state(&handle, TransferState::DownloadingDisconnected).await;
        assert_eq!(queue.network(), NetworkStatus::OFFLINE);
    }
}
