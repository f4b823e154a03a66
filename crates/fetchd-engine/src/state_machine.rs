//! Closed transition table for the transfer lifecycle.
//!
//! [`transition`] is pure: it names the next state and the side effect the
//! owner must perform before committing it. No I/O happens here.

use fetchd_types::models::{PersistedState, TransferState};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    HeaderCompleted,
    StartRequested,
    PauseRequested,
    ResumeRequested,
    CancelRequested,
    ConnectionLost,
    ConnectionRestored,
    NetworkError,
    SslError,
    HttpError,
    DownloadCompleted,
    HashingStarted,
    PostProcessingStarted,
    HashError,
    CommandError,
    Finished,
    /// Local failure (filesystem and the like); valid from any live state.
    Failure,
}

/// Work the owner performs when taking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Issue the request for the whole resource.
    OpenRequest,
    /// Issue a ranged request continuing after the bytes on disk.
    ResumeRequest,
    /// Abort the request, keeping what was received.
    SuspendRequest,
    /// Move the downloaded file into place and release the name.
    Commit,
    /// Drop request and process, delete produced files, release the name.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TransferState,
    pub event: Event,
    pub to: TransferState,
    pub effect: Effect,
}

impl Transition {
    /// Coarse state recorded in the catalog after this transition, if it
    /// changes it.
    pub fn persisted(&self) -> Option<PersistedState> {
        match (self.event, self.to) {
            (_, TransferState::Finished) => Some(PersistedState::Finish),
            (_, TransferState::Canceled) => Some(PersistedState::Cancel),
            (_, TransferState::Error) => Some(PersistedState::Error),
            (Event::StartRequested, _) => Some(PersistedState::Start),
            (Event::PauseRequested, _) => Some(PersistedState::Pause),
            (Event::ResumeRequested, _) => Some(PersistedState::Resume),
            _ => None,
        }
    }
}

/// Looks up the transition for `event` in `state`. `None` means the event is
/// not accepted there.
pub fn transition(state: TransferState, event: Event) -> Option<Transition> {
    use Effect as F;
    use Event as E;
    use TransferState as S;

    let (to, effect) = match (state, event) {
        (s, _) if s.is_terminal() => return None,

        (_, E::Failure) => (S::Error, F::Discard),

        (S::Idle, E::HeaderCompleted) => (S::Init, F::None),
        (S::Idle | S::Init, E::NetworkError | E::SslError) => (S::Error, F::Discard),
        (S::Idle | S::Init, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::Init, E::StartRequested) => (S::Downloading, F::OpenRequest),

        (S::Downloading, E::ConnectionLost) => (S::DownloadingDisconnected, F::SuspendRequest),
        (S::Downloading, E::PauseRequested) => (S::Paused, F::SuspendRequest),
        (S::Downloading, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::Downloading, E::NetworkError | E::SslError | E::HttpError) => (S::Error, F::Discard),
        (S::Downloading, E::DownloadCompleted) => (S::Downloaded, F::None),

        (S::DownloadingDisconnected, E::ConnectionRestored) => (S::Downloading, F::ResumeRequest),
        (S::DownloadingDisconnected, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::DownloadingDisconnected, E::PauseRequested) => (S::PausedDisconnected, F::None),

        (S::Paused, E::ResumeRequested) => (S::Downloading, F::ResumeRequest),
        (S::Paused, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::Paused, E::ConnectionLost) => (S::PausedDisconnected, F::None),

        (S::PausedDisconnected, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::PausedDisconnected, E::ResumeRequested) => (S::DownloadingDisconnected, F::None),
        (S::PausedDisconnected, E::ConnectionRestored) => (S::Paused, F::None),

        // Aggregates can complete while suspended.
        (
            S::Paused | S::DownloadingDisconnected | S::PausedDisconnected,
            E::DownloadCompleted,
        ) => (S::Downloaded, F::None),

        (S::Downloaded, E::CancelRequested) => (S::Canceled, F::Discard),
        (S::Downloaded, E::Finished) => (S::Finished, F::Commit),
        (S::Downloaded, E::HashingStarted) => (S::Hashing, F::None),
        (S::Downloaded, E::PostProcessingStarted) => (S::PostProcessing, F::None),

        (S::Hashing, E::Finished) => (S::Finished, F::Commit),
        (S::Hashing, E::HashError) => (S::Error, F::Discard),
        (S::Hashing, E::PostProcessingStarted) => (S::PostProcessing, F::None),
        (S::Hashing, E::CancelRequested) => (S::Canceled, F::Discard),

        // The command consumes the file, so finishing deletes it too.
        (S::PostProcessing, E::Finished) => (S::Finished, F::Discard),
        (S::PostProcessing, E::CommandError) => (S::Error, F::Discard),
        (S::PostProcessing, E::CancelRequested) => (S::Canceled, F::Discard),

        _ => return None,
    };

    Some(Transition {
        from: state,
        event,
        to,
        effect,
    })
}

/// Current state plus the table. Owners run the effect of a [`Transition`]
/// and only then [`commit`](TransferStateMachine::commit) it.
#[derive(Debug, Clone)]
pub struct TransferStateMachine {
    state: TransferState,
}

impl TransferStateMachine {
    pub fn new() -> Self {
        Self {
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn accepts(&self, event: Event) -> Option<Transition> {
        transition(self.state, event)
    }

    /// Applies a transition obtained from [`accepts`](Self::accepts). Stale
    /// transitions (computed from another state) are ignored.
    pub fn commit(&mut self, transition: Transition) -> bool {
        if transition.from != self.state {
            debug!(
                "Ignoring stale transition {:?} -> {:?} while in {:?}",
                transition.from, transition.to, self.state
            );
            return false;
        }
        self.state = transition.to;
        true
    }
}

impl Default for TransferStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
