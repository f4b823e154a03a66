use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fetchd_types::events::TransferEvent;
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{PersistedState, Snapshot, TransferId, TransferState};
use fetchd_types::network::NetworkStatus;
use tracing::{info, warn};

use crate::filename_mutex::FileNameMutex;
use crate::process::ProcessRunner;
use crate::requester::Requester;
use crate::state_machine::{Event, Transition, TransferStateMachine};

/// Collaborators shared by every transfer.
#[derive(Clone)]
pub struct EngineContext {
    pub requester: Arc<dyn Requester>,
    pub processes: Arc<dyn ProcessRunner>,
    pub file_names: Arc<FileNameMutex>,
}

/// State common to single and group transfers.
pub struct TransferCore {
    id: TransferId,
    owner: String,
    is_confined: bool,
    root_path: PathBuf,
    metadata: TransferMetadata,
    headers: BTreeMap<String, String>,
    throttle: u64,
    allow_mobile: bool,
    network: NetworkStatus,
    machine: TransferStateMachine,
    persisted: PersistedState,
    is_valid: bool,
    last_error: Option<String>,
    events: Vec<TransferEvent>,
}

impl TransferCore {
    pub fn new(
        id: TransferId,
        owner: impl Into<String>,
        is_confined: bool,
        root_path: impl Into<PathBuf>,
        metadata: TransferMetadata,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            owner: owner.into(),
            is_confined,
            root_path: root_path.into(),
            metadata,
            headers,
            throttle: 0,
            allow_mobile: true,
            network: NetworkStatus::ONLINE,
            machine: TransferStateMachine::new(),
            persisted: PersistedState::Idle,
            is_valid: true,
            last_error: None,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_confined(&self) -> bool {
        self.is_confined
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn throttle(&self) -> u64 {
        self.throttle
    }

    pub fn set_throttle(&mut self, throttle: u64) {
        self.throttle = throttle;
    }

    pub fn allows_mobile(&self) -> bool {
        self.allow_mobile
    }

    pub fn network(&self) -> NetworkStatus {
        self.network
    }

    /// Whether this transfer may use the network right now.
    pub fn connected(&self) -> bool {
        self.network.usable(self.allow_mobile)
    }

    /// Records a new network status. Returns the new connectivity if it
    /// flipped.
    pub fn set_network(&mut self, status: NetworkStatus) -> Option<bool> {
        let before = self.connected();
        self.network = status;
        let after = self.connected();
        (before != after).then_some(after)
    }

    pub fn set_allow_mobile(&mut self, allowed: bool) -> Option<bool> {
        let before = self.connected();
        self.allow_mobile = allowed;
        let after = self.connected();
        (before != after).then_some(after)
    }

    pub fn state(&self) -> TransferState {
        self.machine.state()
    }

    pub fn persisted_state(&self) -> PersistedState {
        self.persisted
    }

    pub fn accepts(&self, event: Event) -> Option<Transition> {
        self.machine.accepts(event)
    }

    /// Commits a transition whose effect already ran.
    pub fn commit(&mut self, transition: Transition) {
        if !self.machine.commit(transition) {
            return;
        }
        if let Some(persisted) = transition.persisted() {
            self.persisted = persisted;
        }
        info!(
            transfer_id = %self.id,
            "{} -> {} on {:?}",
            transition.from, transition.to, transition.event
        );
        self.emit(TransferEvent::StateChanged {
            state: transition.to,
        });
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Marks the transfer unusable. It will never touch the network.
    pub fn invalidate(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(transfer_id = %self.id, "Invalid transfer: {}", message);
        self.is_valid = false;
        self.last_error = Some(message);
    }

    pub fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Operations every transfer kind supports. Implementors report outcomes by
/// emitting events on their core; the owning task drains them.
pub trait Transfer: Send {
    /// Asynchronous input the transfer waits on (transport, process, ...).
    type Input: Send;

    fn core(&self) -> &TransferCore;

    fn core_mut(&mut self) -> &mut TransferCore;

    fn start(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    fn cancel(&mut self);

    fn progress(&self) -> u64;

    fn total_size(&self) -> u64;

    fn set_throttle(&mut self, throttle: u64);

    fn update_network(&mut self, status: NetworkStatus);

    fn allow_mobile_download(&mut self, allowed: bool);

    /// Resolves with the next input. Never resolves while nothing is in
    /// flight. Must be cancel safe.
    fn next_input(&mut self) -> impl Future<Output = Self::Input> + Send + '_;

    fn handle_input(&mut self, input: Self::Input);

    fn snapshot(&self) -> Snapshot;

    fn drain_events(&mut self) -> Vec<TransferEvent> {
        self.core_mut().take_events()
    }
}
