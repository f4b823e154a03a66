//! Resumable download of one URL into one file.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use fetchd_types::events::{
    AuthError, AuthKind, HashError, HttpError, NetworkError, NetworkErrorKind, ProcessError,
    ProcessErrorKind, TransferEvent,
};
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{Snapshot, TransferId, TransferRecord, TransferState};
use fetchd_types::network::NetworkStatus;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::TransferError;
use crate::hash::{HashAlgorithm, HashVerifier};
use crate::process::{ProcessHandle, ProcessOutcome};
use crate::requester::{HttpRequest, Reply, ReplyEvent};
use crate::state_machine::{Effect, Event};
use crate::transfer::{EngineContext, Transfer, TransferCore};

const TEMP_SUFFIX: &str = ".tmp";

/// Where the downloaded file should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Path chosen by the daemon; renamed on collision, temp file shares the
    /// reservation.
    Managed(PathBuf),
    /// Path chosen by the client; must not exist, only the temp file is
    /// reserved.
    Explicit(PathBuf),
}

/// Everything needed to build a [`SingleTransfer`].
#[derive(Debug, Clone)]
pub struct SingleSpec {
    pub id: TransferId,
    pub owner: String,
    pub group_id: Option<TransferId>,
    pub is_confined: bool,
    pub root_path: PathBuf,
    pub url: String,
    /// Expected digest; empty disables verification.
    pub hash: String,
    pub algorithm: String,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub throttle: u64,
    pub destination: Destination,
}

pub enum SingleInput {
    Reply(Option<ReplyEvent>),
    Hash(io::Result<(bool, String)>),
    Process(ProcessOutcome),
}

pub struct SingleTransfer {
    core: TransferCore,
    ctx: EngineContext,
    group_id: Option<TransferId>,
    raw_url: String,
    url: Option<Url>,
    visited: HashSet<Url>,
    hash: String,
    algorithm_name: String,
    algorithm: Option<HashAlgorithm>,
    file_path: PathBuf,
    temp_file_path: PathBuf,
    /// Path held in the file-name registry, if any.
    lock_key: Option<PathBuf>,
    total_size: u64,
    received: u64,
    /// Bytes already on disk when the current request was issued.
    request_offset: u64,
    range_pending: bool,
    renamed: bool,
    file: Option<File>,
    reply: Option<Reply>,
    hash_job: Option<JoinHandle<io::Result<(bool, String)>>>,
    process: Option<ProcessHandle>,
}

impl SingleTransfer {
    /// Validates the inputs and reserves the destination. Invalid transfers
    /// are still constructed; they report `is_valid() == false`.
    pub fn new(spec: SingleSpec, ctx: EngineContext) -> Self {
        let mut core = TransferCore::new(
            spec.id,
            spec.owner,
            spec.is_confined,
            spec.root_path,
            spec.metadata,
            spec.headers,
        );
        core.set_throttle(spec.throttle);

        let url = match Url::parse(&spec.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
            _ => {
                core.invalidate(format!("Invalid URL: '{}'", spec.url));
                None
            }
        };

        let algorithm = if spec.hash.is_empty() {
            None
        } else {
            match spec.algorithm.parse::<HashAlgorithm>() {
                Ok(algorithm) => Some(algorithm),
                Err(_) => {
                    if core.is_valid() {
                        core.invalidate(format!("Invalid hash algorithm: '{}'", spec.algorithm));
                    }
                    None
                }
            }
        };

        let (file_path, temp_file_path, lock_key) = match spec.destination {
            Destination::Managed(desired) => {
                if core.is_valid() {
                    let locked = ctx.file_names.lock_file_name(&desired);
                    (locked.clone(), temp_path(&locked), Some(locked))
                } else {
                    let temp = temp_path(&desired);
                    (desired, temp, None)
                }
            }
            Destination::Explicit(path) => {
                if core.is_valid() && path.exists() {
                    core.invalidate(format!("File already exists at: '{}'", path.display()));
                }
                if core.is_valid() {
                    let temp = ctx.file_names.lock_file_name(&temp_path(&path));
                    (path, temp.clone(), Some(temp))
                } else {
                    let temp = temp_path(&path);
                    (path, temp, None)
                }
            }
        };

        Self {
            core,
            ctx,
            group_id: spec.group_id,
            raw_url: spec.url,
            url,
            visited: HashSet::new(),
            hash: spec.hash,
            algorithm_name: spec.algorithm,
            algorithm,
            file_path,
            temp_file_path,
            lock_key,
            total_size: 0,
            received: 0,
            request_offset: 0,
            range_pending: false,
            renamed: false,
            file: None,
            reply: None,
            hash_job: None,
            process: None,
        }
    }

    /// Current URL, after any redirects followed so far.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn temp_file_path(&self) -> &Path {
        &self.temp_file_path
    }

    pub fn group_id(&self) -> Option<&TransferId> {
        self.group_id.as_ref()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Whether [`Transfer::next_input`] can resolve.
    pub fn has_pending_input(&self) -> bool {
        self.reply.is_some() || self.hash_job.is_some() || self.process.is_some()
    }

    pub fn record(&self) -> TransferRecord {
        TransferRecord {
            id: self.core.id().clone(),
            owner: self.core.owner().to_string(),
            group_id: self.group_id.clone(),
            url: self
                .url
                .as_ref()
                .map(Url::to_string)
                .unwrap_or_else(|| self.raw_url.clone()),
            local_path: self.file_path.clone(),
            hash: self.hash.clone(),
            hash_algo: self.algorithm_name.clone(),
            state: self.core.persisted_state(),
            total_size: self.total_size,
            throttle: self.core.throttle(),
            metadata: self.core.metadata().clone(),
            headers: self.core.headers().clone(),
            is_confined: self.core.is_confined(),
            root_path: self.core.root_path().to_path_buf(),
        }
    }

    fn try_fire(&mut self, event: Event) -> Result<bool, TransferError> {
        let Some(transition) = self.core.accepts(event) else {
            debug!(
                transfer_id = %self.core.id(),
                "{:?} not accepted in {}",
                event,
                self.core.state()
            );
            return Ok(false);
        };
        self.apply(transition.effect)?;
        self.core.commit(transition);
        Ok(true)
    }

    fn fire(&mut self, event: Event) -> bool {
        match self.try_fire(event) {
            Ok(taken) => taken,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    /// Reports `err` and moves to Error through `event`, or through `Failure`
    /// when `event` is not accepted in the current state.
    fn terminate(&mut self, event: Event, err: TransferError) {
        if self.core.state().is_terminal() {
            debug!(transfer_id = %self.core.id(), "Dropping late error: {}", err);
            return;
        }
        error!(transfer_id = %self.core.id(), url = %self.raw_url, "{}", err);
        let message = err.to_string();
        self.core.set_last_error(message.clone());
        self.core.emit(TransferEvent::Error { message });

        let event = if self.core.accepts(event).is_some() {
            event
        } else {
            Event::Failure
        };
        if let Err(e) = self.try_fire(event) {
            warn!(transfer_id = %self.core.id(), "Cleanup after error failed: {}", e);
        }
    }

    fn fail(&mut self, err: TransferError) {
        self.terminate(Event::Failure, err);
    }

    fn apply(&mut self, effect: Effect) -> Result<(), TransferError> {
        match effect {
            Effect::None => Ok(()),
            Effect::OpenRequest => self.open_request(false),
            Effect::ResumeRequest => self.open_request(true),
            Effect::SuspendRequest => self.suspend(),
            Effect::Commit => {
                self.move_into_place()?;
                self.release_lock();
                Ok(())
            }
            Effect::Discard => {
                self.discard();
                Ok(())
            }
        }
    }

    fn open_temp_file(&mut self) -> io::Result<()> {
        if let Some(parent) = self.temp_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.temp_file_path)?;
        file.set_len(0)?;
        self.received = 0;
        self.file = Some(file);
        Ok(())
    }

    fn build_request(&self, url: Url) -> HttpRequest {
        let mut request = HttpRequest::new(url);
        for (name, value) in self.core.headers() {
            if name.eq_ignore_ascii_case("range") || name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            request.headers.push((name.clone(), value.clone()));
        }
        // Transparent decompression would break checksums.
        request
            .headers
            .push(("Accept-Encoding".to_string(), "identity".to_string()));
        request
    }

    fn open_request(&mut self, ranged: bool) -> Result<(), TransferError> {
        if !self.core.connected() {
            debug!(transfer_id = %self.core.id(), "Offline, request deferred");
            return Ok(());
        }
        let url = self
            .url
            .clone()
            .ok_or_else(|| TransferError::Validation(format!("Invalid URL: '{}'", self.raw_url)))?;
        let mut request = self.build_request(url);
        self.request_offset = 0;
        if ranged {
            let on_disk = self.on_disk_size()?;
            self.received = on_disk;
            self.request_offset = on_disk;
            self.range_pending = true;
            request
                .headers
                .push(("Range".to_string(), format!("bytes={on_disk}-")));
        }

        info!(transfer_id = %self.core.id(), "GET {}", request.url);
        let reply = self.ctx.requester.get(request);
        reply.set_read_buffer_size(self.core.throttle());
        self.reply = Some(reply);
        Ok(())
    }

    fn on_disk_size(&self) -> Result<u64, TransferError> {
        match &self.file {
            Some(file) => file
                .metadata()
                .map(|m| m.len())
                .map_err(TransferError::filesystem),
            None => Ok(0),
        }
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::filesystem("temporary file is not open"))?;
        if !data.is_empty() {
            file.write_all(data).map_err(TransferError::filesystem)?;
        }
        file.flush().map_err(TransferError::filesystem)?;
        self.received = file.metadata().map_err(TransferError::filesystem)?.len();
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), TransferError> {
        if let Some(file) = &self.file {
            file.set_len(0).map_err(TransferError::filesystem)?;
        }
        self.received = 0;
        self.request_offset = 0;
        Ok(())
    }

    /// A `200` to a ranged request carries the whole body again.
    fn restart_if_range_ignored(&mut self, status: Option<u16>) -> Result<(), TransferError> {
        if std::mem::take(&mut self.range_pending) && status == Some(200) {
            debug!(transfer_id = %self.core.id(), "Range ignored, restarting from zero");
            self.truncate()?;
        }
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), TransferError> {
        if let Some(reply) = self.reply.take() {
            reply.abort();
            let data = reply.read_all_available();
            self.write_chunk(&data)?;
        }
        Ok(())
    }

    fn move_into_place(&mut self) -> Result<(), TransferError> {
        if self.renamed {
            return Ok(());
        }
        self.file = None;
        fs::rename(&self.temp_file_path, &self.file_path).map_err(TransferError::filesystem)?;
        self.renamed = true;
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply.abort();
            let data = reply.read_all_available();
            if let Err(e) = self.write_chunk(&data) {
                debug!(transfer_id = %self.core.id(), "Dropping buffered bytes: {}", e);
            }
        }
        self.hash_job = None;
        self.process = None;
        self.file = None;
        remove_file(&self.temp_file_path);
        if self.renamed {
            remove_file(&self.file_path);
        }
        self.release_lock();
    }

    fn release_lock(&mut self) {
        if let Some(key) = self.lock_key.take() {
            self.ctx.file_names.unlock_file_name(&key);
        }
    }

    fn on_progress(&mut self, total: Option<u64>) {
        let Some(reply) = self.reply.as_ref() else {
            return;
        };
        let status = reply.status();
        let data = reply.read_all_available();

        if let Err(e) = self
            .restart_if_range_ignored(status)
            .and_then(|()| self.write_chunk(&data))
        {
            return self.fail(e);
        }

        let total = match total {
            None => self.received,
            Some(total) => {
                // A ranged reply announces only the bytes still missing.
                if self.total_size == 0 {
                    self.total_size = self.request_offset + total;
                }
                self.total_size
            }
        };
        debug!(transfer_id = %self.core.id(), "Progress {}/{}", self.received, total);
        self.core.emit(TransferEvent::Progress {
            received: self.received,
            total,
        });
    }

    fn on_finished(&mut self) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        let data = reply.read_all_available();
        if let Err(e) = self
            .restart_if_range_ignored(reply.status())
            .and_then(|()| self.write_chunk(&data))
        {
            return self.fail(e);
        }

        if let Some(target) = reply.redirect_target() {
            if self.url.as_ref() != Some(&target) {
                return self.follow_redirect(target);
            }
        }
        drop(reply);

        info!(transfer_id = %self.core.id(), "Downloaded {} bytes", self.received);
        if self.fire(Event::DownloadCompleted) {
            self.on_downloaded();
        }
    }

    fn follow_redirect(&mut self, target: Url) {
        if self.visited.contains(&target) {
            self.core.emit(TransferEvent::NetworkError(NetworkError {
                kind: NetworkErrorKind::ContentNotFound,
                phrase: format!("Redirect loop detected at {target}"),
            }));
            return self.terminate(Event::NetworkError, TransferError::Network);
        }

        info!(transfer_id = %self.core.id(), "Following redirect to {}", target);
        if let Some(current) = self.url.replace(target) {
            self.visited.insert(current);
        }
        self.range_pending = false;
        self.total_size = 0;
        let restarted = self.truncate().and_then(|()| self.open_request(false));
        if let Err(e) = restarted {
            self.fail(e);
        }
    }

    fn on_downloaded(&mut self) {
        let Some(algorithm) = self.algorithm else {
            return self.post_process_or_finish(false);
        };
        if !self.fire(Event::HashingStarted) {
            return;
        }
        self.core.emit(TransferEvent::Processing {
            path: self.file_path.clone(),
        });

        let path = self.temp_file_path.clone();
        let expected = self.hash.clone();
        self.file = None;
        self.hash_job = Some(tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            HashVerifier::verify(&expected, algorithm, BufReader::new(file))
        }));
    }

    fn on_hashed(&mut self, result: io::Result<(bool, String)>) {
        self.hash_job = None;
        match result {
            Err(e) => self.fail(TransferError::filesystem(e)),
            Ok((false, checksum)) => {
                self.core.emit(TransferEvent::HashError(HashError {
                    algorithm: self.algorithm_name.clone(),
                    expected: self.hash.clone(),
                    checksum,
                }));
                self.terminate(Event::HashError, TransferError::Hash);
            }
            Ok((true, _)) => {
                debug!(transfer_id = %self.core.id(), "Checksum matches");
                self.post_process_or_finish(true);
            }
        }
    }

    fn post_process_or_finish(&mut self, processing_announced: bool) {
        let path = self.file_path.to_string_lossy().into_owned();
        let Some((program, args)) = self.core.metadata().command_for(&path) else {
            if self.fire(Event::Finished) {
                self.core.emit(TransferEvent::Finished {
                    path: self.file_path.clone(),
                });
            }
            return;
        };

        if !self.fire(Event::PostProcessingStarted) {
            return;
        }
        if !processing_announced {
            self.core.emit(TransferEvent::Processing {
                path: self.file_path.clone(),
            });
        }
        // The command sees the file at its final path.
        if let Err(e) = self.move_into_place() {
            return self.fail(e);
        }
        info!(transfer_id = %self.core.id(), "Running {} {:?}", program, args);
        self.process = Some(self.ctx.processes.start(&program, &args));
    }

    fn on_process_finished(&mut self, outcome: ProcessOutcome) {
        self.process = None;
        if outcome.success() {
            if self.fire(Event::Finished) {
                self.core.emit(TransferEvent::Finished {
                    path: self.file_path.clone(),
                });
            }
            return;
        }

        let error = match outcome {
            ProcessOutcome::Exited {
                code,
                crashed,
                stdout,
                stderr,
            } => ProcessError {
                kind: if crashed {
                    ProcessErrorKind::Crashed
                } else {
                    ProcessErrorKind::NonZeroExit
                },
                phrase: match code {
                    Some(code) if !crashed => format!("Process exited with code {code}"),
                    _ => "Process crashed".to_string(),
                },
                exit_code: code,
                stdout,
                stderr,
            },
            ProcessOutcome::FailedToStart { message } => ProcessError {
                kind: ProcessErrorKind::FailedToStart,
                phrase: message,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
            },
        };
        self.core.emit(TransferEvent::ProcessError(error));
        self.terminate(Event::CommandError, TransferError::Command);
    }

    fn on_error(&mut self, kind: NetworkErrorKind) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        reply.abort();
        let status = reply.status();
        let phrase = reply
            .error_string()
            .or_else(|| reply.reason())
            .unwrap_or_else(|| format!("{kind:?}"));

        let (event, err) = if status == Some(401) || kind == NetworkErrorKind::AuthenticationRequired {
            self.core.emit(TransferEvent::AuthError(AuthError {
                kind: AuthKind::Server,
                phrase,
            }));
            (Event::HttpError, TransferError::Auth)
        } else if status == Some(407) || kind == NetworkErrorKind::ProxyAuthenticationRequired {
            self.core.emit(TransferEvent::AuthError(AuthError {
                kind: AuthKind::Proxy,
                phrase,
            }));
            (Event::HttpError, TransferError::ProxyAuth)
        } else if let Some(code) = status.filter(|code| *code >= 300) {
            let phrase = reply.reason().unwrap_or_default();
            self.core.emit(TransferEvent::HttpError(HttpError {
                code,
                phrase: phrase.clone(),
            }));
            (Event::HttpError, TransferError::Http { code, phrase })
        } else {
            self.core
                .emit(TransferEvent::NetworkError(NetworkError { kind, phrase }));
            (Event::NetworkError, TransferError::Network)
        };
        self.terminate(event, err);
    }

    fn on_ssl_errors(&mut self, errors: Vec<String>, ignorable: bool) {
        if ignorable {
            warn!(transfer_id = %self.core.id(), "Ignoring SSL errors: {:?}", errors);
            return;
        }
        warn!(transfer_id = %self.core.id(), "SSL errors: {:?}", errors);
        self.terminate(Event::SslError, TransferError::Ssl);
    }

    fn on_reply_closed(&mut self) {
        self.reply = None;
        self.core.emit(TransferEvent::NetworkError(NetworkError {
            kind: NetworkErrorKind::RemoteHostClosed,
            phrase: "Connection closed before the reply finished".to_string(),
        }));
        self.terminate(Event::NetworkError, TransferError::Network);
    }

    fn on_connectivity(&mut self, connected: bool) {
        let event = if connected {
            Event::ConnectionRestored
        } else {
            Event::ConnectionLost
        };
        self.fire(event);
    }
}

impl Transfer for SingleTransfer {
    type Input = SingleInput;

    fn core(&self) -> &TransferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn start(&mut self) {
        if self.reply.is_some() {
            self.core.emit(TransferEvent::Started(true));
            return;
        }
        if !self.core.is_valid() || self.core.state() != TransferState::Idle {
            self.core.emit(TransferEvent::Started(false));
            return;
        }
        if let Err(e) = self.open_temp_file() {
            self.core.emit(TransferEvent::Started(false));
            return self.fail(TransferError::filesystem(e));
        }
        if !self.fire(Event::HeaderCompleted) || !self.fire(Event::StartRequested) {
            self.core.emit(TransferEvent::Started(false));
            return;
        }
        if !self.core.connected() {
            self.fire(Event::ConnectionLost);
        }
        self.core.emit(TransferEvent::Started(true));
    }

    fn pause(&mut self) {
        match self.try_fire(Event::PauseRequested) {
            Ok(paused) => self.core.emit(TransferEvent::Paused(paused)),
            Err(err) => {
                self.core.emit(TransferEvent::Paused(false));
                self.fail(err);
            }
        }
    }

    fn resume(&mut self) {
        match self.try_fire(Event::ResumeRequested) {
            Ok(resumed) => self.core.emit(TransferEvent::Resumed(resumed)),
            Err(err) => {
                self.core.emit(TransferEvent::Resumed(false));
                self.fail(err);
            }
        }
    }

    fn cancel(&mut self) {
        if self.core.state().is_terminal() {
            self.core.emit(TransferEvent::Canceled(false));
            return;
        }
        let canceled = self.fire(Event::CancelRequested);
        self.core.emit(TransferEvent::Canceled(canceled));
    }

    fn progress(&self) -> u64 {
        self.received
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn set_throttle(&mut self, throttle: u64) {
        self.core.set_throttle(throttle);
        if let Some(reply) = &self.reply {
            reply.set_read_buffer_size(throttle);
        }
    }

    fn update_network(&mut self, status: NetworkStatus) {
        if let Some(connected) = self.core.set_network(status) {
            self.on_connectivity(connected);
        }
    }

    fn allow_mobile_download(&mut self, allowed: bool) {
        if let Some(connected) = self.core.set_allow_mobile(allowed) {
            self.on_connectivity(connected);
        }
    }

    fn next_input(&mut self) -> impl Future<Output = SingleInput> + Send + '_ {
        async move {
            if let Some(reply) = self.reply.as_mut() {
                return SingleInput::Reply(reply.next_event().await);
            }
            if let Some(job) = self.hash_job.as_mut() {
                return SingleInput::Hash(job.await.unwrap_or_else(|e| Err(io::Error::other(e))));
            }
            if let Some(process) = self.process.as_mut() {
                return SingleInput::Process(process.wait().await);
            }
            std::future::pending().await
        }
    }

    fn handle_input(&mut self, input: SingleInput) {
        match input {
            SingleInput::Reply(Some(ReplyEvent::Progress { total, .. })) => self.on_progress(total),
            SingleInput::Reply(Some(ReplyEvent::Finished)) => self.on_finished(),
            SingleInput::Reply(Some(ReplyEvent::Error(kind))) => self.on_error(kind),
            SingleInput::Reply(Some(ReplyEvent::SslErrors { errors, ignorable })) => {
                self.on_ssl_errors(errors, ignorable)
            }
            SingleInput::Reply(None) => self.on_reply_closed(),
            SingleInput::Hash(result) => self.on_hashed(result),
            SingleInput::Process(outcome) => self.on_process_finished(outcome),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::Single(self.record())
    }
}

impl Drop for SingleTransfer {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use fetchd_types::metadata::TransferMetadata;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    use super::*;
    use crate::filename_mutex::FileNameMutex;
    use crate::process::testing::FakeProcessRunner;
    use crate::requester::testing::{FakeRequester, FakeResponse, respond};

    pub(crate) struct Harness {
        pub requester: Arc<FakeRequester>,
        pub processes: Arc<FakeProcessRunner>,
        pub names: Arc<FileNameMutex>,
        pub dir: TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_processes(FakeProcessRunner::exiting(0))
        }

        pub fn with_processes(processes: FakeProcessRunner) -> Self {
            Self {
                requester: Arc::new(FakeRequester::new()),
                processes: Arc::new(processes),
                names: Arc::new(FileNameMutex::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        pub fn ctx(&self) -> EngineContext {
            EngineContext {
                requester: self.requester.clone(),
                processes: self.processes.clone(),
                file_names: self.names.clone(),
            }
        }

        pub fn spec(&self, url: &str, file: &str) -> SingleSpec {
            SingleSpec {
                id: TransferId::new(),
                owner: "tester".to_string(),
                group_id: None,
                is_confined: false,
                root_path: self.dir.path().to_path_buf(),
                url: url.to_string(),
                hash: String::new(),
                algorithm: String::new(),
                metadata: TransferMetadata::default(),
                headers: BTreeMap::new(),
                throttle: 0,
                destination: Destination::Managed(self.dir.path().join(file)),
            }
        }

        pub fn transfer(&self, spec: SingleSpec) -> SingleTransfer {
            SingleTransfer::new(spec, self.ctx())
        }
    }

    /// Feeds queued inputs until nothing is in flight.
    pub(crate) async fn settle(transfer: &mut SingleTransfer) {
        while transfer.has_pending_input() {
            let input = transfer.next_input().await;
            transfer.handle_input(input);
        }
    }

    fn sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    const URL: &str = "http://example.com/file.bin";

    #[tokio::test]
    async fn verified_download_lands_at_destination() {
        let h = Harness::new();
        let data = Bytes::from_static(b"the quick brown fox");
        h.requester.route(URL, FakeResponse::Body(data.clone()));

        let mut spec = h.spec(URL, "file.bin");
        spec.hash = sha256(&data);
        spec.algorithm = "SHA256".to_string();
        let mut t = h.transfer(spec);
        assert!(t.core().is_valid());

        t.start();
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Finished);
        assert_eq!(fs::read(h.dir.path().join("file.bin")).unwrap(), data);
        assert!(!t.temp_file_path().exists());
        assert!(!h.names.is_locked(t.file_path()));

        let events = t.drain_events();
        assert!(events.contains(&TransferEvent::Started(true)));
        assert!(events.contains(&TransferEvent::Processing {
            path: h.dir.path().join("file.bin")
        }));
        assert!(events.contains(&TransferEvent::Finished {
            path: h.dir.path().join("file.bin")
        }));
        assert_eq!(t.progress(), t.total_size());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_hash_error() {
        let h = Harness::new();
        let data = b"the quick brown fox".to_vec();
        let mut corrupted = data.clone();
        *corrupted.last_mut().unwrap() ^= 0xff;
        h.requester.route(URL, FakeResponse::Body(Bytes::from(corrupted)));

        let mut spec = h.spec(URL, "file.bin");
        spec.hash = sha256(&data);
        spec.algorithm = "sha256".to_string();
        let mut t = h.transfer(spec);
        t.start();
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Error);
        let events = t.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, TransferEvent::HashError(HashError { expected, .. }) if *expected == sha256(&data))));
        assert!(events.contains(&TransferEvent::Error {
            message: "HASH ERROR".to_string()
        }));
        assert!(!t.file_path().exists());
        assert!(!t.temp_file_path().exists());
    }

    #[tokio::test]
    async fn pause_and_resume_continue_from_bytes_on_disk() {
        let h = Harness::new();
        let data = Bytes::from_static(b"0123456789abcdef");
        let mut t = h.transfer(h.spec(URL, "file.bin"));

        t.start();
        let sender = h.requester.take_reply().unwrap();
        sender.set_status(200, "OK");
        sender.push(data.slice(..6), Some(data.len() as u64));
        let input = t.next_input().await;
        t.handle_input(input);
        assert_eq!(t.progress(), 6);

        t.pause();
        assert_eq!(t.core().state(), TransferState::Paused);
        assert!(sender.is_aborted());
        assert_eq!(fs::metadata(t.temp_file_path()).unwrap().len(), 6);

        t.resume();
        let resumed = h.requester.requests();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[1].request.header("Range"), Some("bytes=6-"));

        let sender = h.requester.take_reply().unwrap();
        respond(&resumed[1].request, &sender, &FakeResponse::Body(data.clone()));
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Finished);
        assert_eq!(t.total_size(), data.len() as u64);
        assert_eq!(t.progress(), data.len() as u64);
        assert_eq!(fs::read(t.file_path()).unwrap(), data);

        let events = t.drain_events();
        assert!(events.contains(&TransferEvent::Paused(true)));
        assert!(events.contains(&TransferEvent::Resumed(true)));
    }

    #[tokio::test]
    async fn pause_before_the_first_chunk_is_seen_keeps_the_full_total() {
        let h = Harness::new();
        let data = Bytes::from_static(b"0123456789abcdef");
        let mut t = h.transfer(h.spec(URL, "file.bin"));

        t.start();
        let sender = h.requester.take_reply().unwrap();
        sender.set_status(200, "OK");
        sender.push(data.slice(..6), Some(data.len() as u64));
        // The buffered bytes reach the disk on pause, unreported.
        t.pause();
        assert_eq!(t.total_size(), 0);
        assert_eq!(fs::metadata(t.temp_file_path()).unwrap().len(), 6);

        t.resume();
        let request = h.requester.requests().remove(1).request;
        assert_eq!(request.header("Range"), Some("bytes=6-"));
        let sender = h.requester.take_reply().unwrap();
        respond(&request, &sender, &FakeResponse::Body(data.clone()));
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Finished);
        assert_eq!(t.total_size(), 16);
        assert_eq!(t.progress(), 16);
        assert!(t.drain_events().contains(&TransferEvent::Progress {
            received: 16,
            total: 16
        }));
        assert_eq!(fs::read(t.file_path()).unwrap(), data);
    }

    #[tokio::test]
    async fn empty_full_reply_to_a_range_discards_the_old_prefix() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));

        t.start();
        let sender = h.requester.take_reply().unwrap();
        sender.set_status(200, "OK");
        sender.push(Bytes::from_static(b"stale"), None);
        let input = t.next_input().await;
        t.handle_input(input);
        t.pause();
        t.resume();
        assert_eq!(
            h.requester.requests()[1].request.header("Range"),
            Some("bytes=5-")
        );

        let sender = h.requester.take_reply().unwrap();
        sender.set_status(200, "OK");
        sender.finish(None);
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Finished);
        assert_eq!(t.progress(), 0);
        assert!(fs::read(t.file_path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn pausing_twice_reports_false() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.pause();
        t.start();
        t.pause();
        t.pause();
        let pauses: Vec<_> = t
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::Paused(_)))
            .collect();
        assert_eq!(
            pauses,
            vec![
                TransferEvent::Paused(false),
                TransferEvent::Paused(true),
                TransferEvent::Paused(false)
            ]
        );
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let h = Harness::new();
        let target = "http://mirror.example.com/file.bin";
        h.requester
            .route(URL, FakeResponse::Redirect(Url::parse(target).unwrap()));
        h.requester
            .route(target, FakeResponse::Body(Bytes::from_static(b"payload")));

        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Finished);
        assert_eq!(t.url().map(Url::as_str), Some(target));
        assert_eq!(h.requester.requests().len(), 2);
        assert_eq!(fs::read(t.file_path()).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn redirect_loop_is_a_network_error() {
        let h = Harness::new();
        let other = "http://example.com/other";
        h.requester
            .route(URL, FakeResponse::Redirect(Url::parse(other).unwrap()));
        h.requester
            .route(other, FakeResponse::Redirect(Url::parse(URL).unwrap()));

        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Error);
        assert_eq!(h.requester.requests().len(), 2);
        let events = t.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::NetworkError(NetworkError {
                kind: NetworkErrorKind::ContentNotFound,
                ..
            })
        )));
        assert!(events.contains(&TransferEvent::Error {
            message: "NETWORK ERROR".to_string()
        }));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        let sender = h.requester.take_reply().unwrap();
        sender.push(Bytes::from_static(b"abc"), None);
        assert!(t.temp_file_path().exists());

        t.cancel();
        assert!(sender.is_aborted());
        assert!(!t.temp_file_path().exists());
        assert!(!h.names.is_locked(t.file_path()));
        t.cancel();

        let cancels: Vec<_> = t
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::Canceled(_)))
            .collect();
        assert_eq!(
            cancels,
            vec![TransferEvent::Canceled(true), TransferEvent::Canceled(false)]
        );
        assert_eq!(t.core().state(), TransferState::Canceled);
    }

    #[tokio::test]
    async fn reachability_loss_suspends_silently_and_resumes() {
        let h = Harness::new();
        let data = Bytes::from_static(b"0123456789");
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        let sender = h.requester.take_reply().unwrap();
        sender.push(data.slice(..4), Some(10));
        let input = t.next_input().await;
        t.handle_input(input);
        t.drain_events();

        t.update_network(NetworkStatus::OFFLINE);
        assert_eq!(t.core().state(), TransferState::DownloadingDisconnected);
        assert!(sender.is_aborted());

        t.update_network(NetworkStatus::ONLINE);
        assert_eq!(t.core().state(), TransferState::Downloading);
        let requests = h.requester.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].request.header("Range"), Some("bytes=4-"));

        let events = t.drain_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::Paused(_) | TransferEvent::Resumed(_))));
    }

    #[tokio::test]
    async fn user_pause_survives_reconnection() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        t.pause();
        t.update_network(NetworkStatus::OFFLINE);
        assert_eq!(t.core().state(), TransferState::PausedDisconnected);
        t.update_network(NetworkStatus::ONLINE);
        assert_eq!(t.core().state(), TransferState::Paused);
        assert_eq!(h.requester.requests().len(), 1);
    }

    #[tokio::test]
    async fn offline_start_waits_for_the_network() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.update_network(NetworkStatus::OFFLINE);
        t.start();
        assert_eq!(t.core().state(), TransferState::DownloadingDisconnected);
        assert!(h.requester.requests().is_empty());
        assert!(t.drain_events().contains(&TransferEvent::Started(true)));

        t.update_network(NetworkStatus::ONLINE);
        assert_eq!(t.core().state(), TransferState::Downloading);
        assert_eq!(h.requester.requests().len(), 1);
    }

    #[tokio::test]
    async fn mobile_policy_gates_the_transfer() {
        use fetchd_types::network::Bearer;

        let h = Harness::new();
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        t.allow_mobile_download(false);
        t.update_network(NetworkStatus {
            online: true,
            bearer: Bearer::Mobile,
        });
        assert_eq!(t.core().state(), TransferState::DownloadingDisconnected);

        t.allow_mobile_download(true);
        assert_eq!(t.core().state(), TransferState::Downloading);
    }

    #[tokio::test]
    async fn reserved_headers_are_replaced() {
        let h = Harness::new();
        let mut spec = h.spec(URL, "file.bin");
        spec.headers.insert("range".into(), "bytes=100-".into());
        spec.headers.insert("ACCEPT-ENCODING".into(), "gzip".into());
        spec.headers.insert("X-Token".into(), "secret".into());
        let mut t = h.transfer(spec);
        t.start();

        let request = h.requester.requests().remove(0).request;
        assert_eq!(request.header("Range"), None);
        assert_eq!(request.header("Accept-Encoding"), Some("identity"));
        assert_eq!(request.header("x-token"), Some("secret"));
        assert_eq!(
            request
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("accept-encoding"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn invalid_inputs_never_touch_the_network() {
        let h = Harness::new();
        let mut t = h.transfer(h.spec("not a url", "file.bin"));
        assert!(!t.core().is_valid());
        assert_eq!(t.core().last_error(), Some("Invalid URL: 'not a url'"));
        t.start();
        assert!(t.drain_events().contains(&TransferEvent::Started(false)));
        assert!(h.requester.requests().is_empty());

        let mut spec = h.spec(URL, "file.bin");
        spec.hash = "abcd".into();
        spec.algorithm = "crc32".into();
        let t = h.transfer(spec);
        assert_eq!(t.core().last_error(), Some("Invalid hash algorithm: 'crc32'"));
    }

    #[tokio::test]
    async fn explicit_destination_must_not_exist() {
        let h = Harness::new();
        let existing = h.dir.path().join("taken.bin");
        fs::write(&existing, b"mine").unwrap();

        let mut spec = h.spec(URL, "file.bin");
        spec.destination = Destination::Explicit(existing.clone());
        let t = h.transfer(spec);
        assert!(!t.core().is_valid());
        assert_eq!(
            t.core().last_error(),
            Some(format!("File already exists at: '{}'", existing.display()).as_str())
        );
    }

    #[tokio::test]
    async fn same_destination_gets_distinct_paths() {
        let h = Harness::new();
        let a = h.transfer(h.spec(URL, "file.bin"));
        let b = h.transfer(h.spec(URL, "file.bin"));
        assert_ne!(a.file_path(), b.file_path());
        assert_ne!(a.temp_file_path(), b.temp_file_path());

        let a_path = a.file_path().to_path_buf();
        let b_path = b.file_path().to_path_buf();
        drop(a);
        assert!(!h.names.is_locked(&a_path));
        assert!(h.names.is_locked(&b_path));
        drop(b);
        assert!(!h.names.is_locked(&b_path));
    }

    #[tokio::test]
    async fn http_status_errors_are_classified() {
        let h = Harness::new();
        h.requester
            .route(URL, FakeResponse::Status(404, "Not Found".into()));
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        settle(&mut t).await;
        let events = t.drain_events();
        assert!(events.contains(&TransferEvent::HttpError(HttpError {
            code: 404,
            phrase: "Not Found".into()
        })));
        assert!(events.contains(&TransferEvent::Error {
            message: "NETWORK ERROR".into()
        }));

        let auth = "http://example.com/private";
        h.requester
            .route(auth, FakeResponse::Status(401, "Unauthorized".into()));
        let mut t = h.transfer(h.spec(auth, "private"));
        t.start();
        settle(&mut t).await;
        let events = t.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::AuthError(AuthError {
                kind: AuthKind::Server,
                ..
            })
        )));
        assert_eq!(t.core().state(), TransferState::Error);
    }

    #[tokio::test]
    async fn unwaivable_tls_error_is_terminal() {
        let h = Harness::new();
        h.requester.route(URL, FakeResponse::Ssl { ignorable: false });
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        let input = t.next_input().await;
        t.handle_input(input);
        assert_eq!(t.core().state(), TransferState::Error);
        assert!(t.drain_events().contains(&TransferEvent::Error {
            message: "SSL ERROR".into()
        }));
    }

    #[tokio::test]
    async fn unknown_length_reports_received_as_total() {
        let h = Harness::new();
        h.requester
            .route(URL, FakeResponse::UnsizedBody(Bytes::from_static(b"12345")));
        let mut t = h.transfer(h.spec(URL, "file.bin"));
        t.start();
        settle(&mut t).await;
        assert!(t.drain_events().contains(&TransferEvent::Progress {
            received: 5,
            total: 5
        }));
    }

    #[tokio::test]
    async fn post_download_command_consumes_the_file() {
        let h = Harness::new();
        h.requester
            .route(URL, FakeResponse::Body(Bytes::from_static(b"archive")));
        let mut spec = h.spec(URL, "file.bin");
        spec.metadata = TransferMetadata::default().with_command(["unpack", "-q", "$file"]);
        let mut t = h.transfer(spec);
        t.start();
        settle(&mut t).await;

        let dest = h.dir.path().join("file.bin");
        assert_eq!(
            h.processes.calls(),
            vec![(
                "unpack".to_string(),
                vec!["-q".to_string(), dest.to_string_lossy().into_owned()]
            )]
        );
        assert_eq!(t.core().state(), TransferState::Finished);
        assert!(!dest.exists());
        assert!(!t.temp_file_path().exists());
        assert!(t.drain_events().contains(&TransferEvent::Finished { path: dest }));
    }

    #[tokio::test]
    async fn failing_command_is_a_process_error() {
        let h = Harness::with_processes(FakeProcessRunner::exiting(2));
        h.requester
            .route(URL, FakeResponse::Body(Bytes::from_static(b"archive")));
        let mut spec = h.spec(URL, "file.bin");
        spec.metadata = TransferMetadata::default().with_command(["unpack", "$file"]);
        let mut t = h.transfer(spec);
        t.start();
        settle(&mut t).await;

        assert_eq!(t.core().state(), TransferState::Error);
        let events = t.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::ProcessError(ProcessError {
                kind: ProcessErrorKind::NonZeroExit,
                exit_code: Some(2),
                ..
            })
        )));
        assert!(events.contains(&TransferEvent::Error {
            message: "COMMAND ERROR".into()
        }));
        assert!(!t.file_path().exists());
    }

    #[tokio::test]
    async fn throttle_reaches_the_active_reply() {
        let h = Harness::new();
        let mut spec = h.spec(URL, "file.bin");
        spec.throttle = 4;
        let mut t = h.transfer(spec);
        t.start();
        t.set_throttle(8);
        assert_eq!(t.core().throttle(), 8);
        assert_eq!(t.record().throttle, 8);
    }
}
