/// fetchd engine: HTTP download transfers driven by tokio tasks.
///
/// Provides:
/// - Single and grouped transfers with pause/resume over HTTP Range requests
/// - A pure state machine shared by both transfer kinds
/// - Checksum verification off the async runtime
/// - Post-download commands
/// - Reachability and mobile-data aware suspension
/// - A queue tracking the current transfer of every owner

pub mod error;
pub mod factory;
pub mod filename_mutex;
pub mod group;
pub mod hash;
pub mod http;
pub mod manager;
pub mod network;
pub mod process;
pub mod queue;
pub mod requester;
pub mod single;
pub mod state_machine;
pub mod task;
pub mod transfer;

// Re-export key types for convenience.
pub use error::TransferError;
pub use factory::{DirectoryPolicy, GroupRequest, PathPolicy, SecurePath, SingleRequest, TransferFactory};
pub use filename_mutex::FileNameMutex;
pub use group::GroupTransfer;
pub use hash::{HashAlgorithm, HashVerifier};
pub use http::HttpRequester;
pub use manager::{ManagerError, TransferManager};
pub use network::{NetworkMonitor, run_probe};
pub use process::{ProcessOutcome, ProcessRunner, TokioProcessRunner};
pub use queue::{QueueEvent, TransferQueue};
pub use requester::{HttpRequest, Reply, ReplyEvent, ReplySender, Requester};
pub use single::SingleTransfer;
pub use state_machine::{Effect, Event, Transition, TransferStateMachine};
pub use task::{Command, TransferHandle, TransferStatus};
pub use transfer::{EngineContext, Transfer, TransferCore};
