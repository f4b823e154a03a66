//! Several single transfers reported as one.
//!
//! The group's own state machine only tracks the aggregate lifecycle. Work is
//! forwarded to the children by operation; child events are folded into
//! group progress, completion and error.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use fetchd_types::events::TransferEvent;
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{GroupRecord, Snapshot, TransferId, TransferState};
use fetchd_types::network::NetworkStatus;
use futures_util::future::select_all;
use tracing::{debug, error, warn};

use crate::single::{SingleInput, SingleTransfer};
use crate::state_machine::Event;
use crate::transfer::{Transfer, TransferCore};

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: TransferId,
    pub owner: String,
    pub is_confined: bool,
    pub root_path: PathBuf,
    pub algorithm: String,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub throttle: u64,
    pub allow_mobile: bool,
}

/// Input of the child at `index`.
pub struct GroupInput {
    pub index: usize,
    pub input: SingleInput,
}

pub struct GroupTransfer {
    core: TransferCore,
    algorithm: String,
    children: Vec<SingleTransfer>,
    per_child_progress: HashMap<TransferId, (u64, u64)>,
    finished_paths: Vec<PathBuf>,
}

impl GroupTransfer {
    pub fn new(spec: GroupSpec, children: Vec<SingleTransfer>) -> Self {
        let mut core = TransferCore::new(
            spec.id,
            spec.owner,
            spec.is_confined,
            spec.root_path,
            spec.metadata,
            spec.headers,
        );
        core.set_throttle(spec.throttle);
        core.set_allow_mobile(spec.allow_mobile);

        if children.is_empty() {
            core.invalidate("No files to download");
        } else if let Some(invalid) = children.iter().find(|c| !c.core().is_valid()) {
            let message = invalid.core().last_error().unwrap_or("Invalid member").to_string();
            core.invalidate(message);
        }

        let mut group = Self {
            core,
            algorithm: spec.algorithm,
            children,
            per_child_progress: HashMap::new(),
            finished_paths: Vec::new(),
        };
        for child in &mut group.children {
            child.set_throttle(spec.throttle);
            child.allow_mobile_download(spec.allow_mobile);
            child.drain_events();
        }
        group
    }

    pub fn children(&self) -> &[SingleTransfer] {
        &self.children
    }

    pub fn finished_paths(&self) -> &[PathBuf] {
        &self.finished_paths
    }

    pub fn has_pending_input(&self) -> bool {
        self.children.iter().any(SingleTransfer::has_pending_input)
    }

    pub fn record(&self) -> GroupRecord {
        GroupRecord {
            id: self.core.id().clone(),
            owner: self.core.owner().to_string(),
            state: self.core.persisted_state(),
            total_size: self.total_size(),
            hash_algo: self.algorithm.clone(),
            throttle: self.core.throttle(),
            metadata: self.core.metadata().clone(),
            headers: self.core.headers().clone(),
            is_confined: self.core.is_confined(),
            root_path: self.core.root_path().to_path_buf(),
        }
    }

    fn fire(&mut self, event: Event) -> bool {
        match self.core.accepts(event) {
            Some(transition) => {
                self.core.commit(transition);
                true
            }
            None => false,
        }
    }

    fn totals(&self) -> (u64, u64) {
        self.per_child_progress
            .values()
            .fold((0, 0), |(received, total), (r, t)| (received + r, total + t))
    }

    fn absorb_all(&mut self) {
        for index in 0..self.children.len() {
            self.absorb(index);
        }
    }

    fn absorb(&mut self, index: usize) {
        for event in self.children[index].drain_events() {
            self.on_child_event(index, event);
        }
    }

    fn on_child_event(&mut self, index: usize, event: TransferEvent) {
        match event {
            TransferEvent::Progress { received, total } => {
                let id = self.children[index].core().id().clone();
                self.per_child_progress.insert(id, (received, total));
                if !self.core.state().is_terminal() {
                    let (received, total) = self.totals();
                    self.core.emit(TransferEvent::Progress { received, total });
                }
            }
            TransferEvent::Finished { path } => self.on_child_finished(index, path),
            TransferEvent::Error { message } => self.on_child_error(index, message),
            TransferEvent::Processing { .. }
            | TransferEvent::AuthError(_)
            | TransferEvent::HttpError(_)
            | TransferEvent::NetworkError(_)
            | TransferEvent::HashError(_)
            | TransferEvent::ProcessError(_) => {
                if !self.core.state().is_terminal() {
                    self.core.emit(event);
                }
            }
            TransferEvent::StateChanged { state } => {
                let child = &self.children[index];
                debug!(
                    group_id = %self.core.id(),
                    transfer_id = %child.core().id(),
                    "Member is now {}",
                    state
                );
            }
            TransferEvent::Started(_)
            | TransferEvent::Paused(_)
            | TransferEvent::Resumed(_)
            | TransferEvent::Canceled(_)
            | TransferEvent::GroupFinished { .. } => {}
        }
    }

    fn on_child_finished(&mut self, index: usize, path: PathBuf) {
        if self.core.state().is_terminal() {
            // Nobody will collect it once the group failed or was canceled.
            remove_file(&path);
            return;
        }
        let child = &self.children[index];
        let size = child.total_size().max(child.progress());
        let id = child.core().id().clone();
        self.per_child_progress.insert(id, (size, size));
        self.finished_paths.push(path);

        if self.finished_paths.len() == self.children.len() {
            self.fire(Event::DownloadCompleted);
            if self.fire(Event::Finished) {
                self.core.emit(TransferEvent::GroupFinished {
                    paths: self.finished_paths.clone(),
                });
            }
        }
    }

    fn on_child_error(&mut self, index: usize, message: String) {
        if self.core.state().is_terminal() {
            debug!(group_id = %self.core.id(), "Ignoring member error: {}", message);
            return;
        }
        for path in &self.finished_paths {
            remove_file(path);
        }
        let message = format!("{}: {}", self.children[index].raw_url(), message);
        error!(group_id = %self.core.id(), "{}", message);
        self.core.set_last_error(message.clone());
        self.core.emit(TransferEvent::Error { message });
        self.fire(Event::Failure);
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

impl Transfer for GroupTransfer {
    type Input = GroupInput;

    fn core(&self) -> &TransferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn start(&mut self) {
        if !self.core.is_valid() || self.core.state() != TransferState::Idle {
            self.core.emit(TransferEvent::Started(false));
            return;
        }
        self.fire(Event::HeaderCompleted);
        self.fire(Event::StartRequested);
        for child in &mut self.children {
            if child.core().state() == TransferState::Idle {
                child.start();
            }
        }
        self.absorb_all();
        if !self.core.connected() {
            self.fire(Event::ConnectionLost);
        }
        self.core.emit(TransferEvent::Started(true));
    }

    fn pause(&mut self) {
        if !self.fire(Event::PauseRequested) {
            self.core.emit(TransferEvent::Paused(false));
            return;
        }
        for child in self.children.iter_mut().rev() {
            if matches!(
                child.core().state(),
                TransferState::Downloading | TransferState::DownloadingDisconnected
            ) {
                child.pause();
            }
        }
        self.absorb_all();
        self.core.emit(TransferEvent::Paused(true));
    }

    fn resume(&mut self) {
        if !self.fire(Event::ResumeRequested) {
            self.core.emit(TransferEvent::Resumed(false));
            return;
        }
        for child in &mut self.children {
            if matches!(
                child.core().state(),
                TransferState::Paused | TransferState::PausedDisconnected
            ) {
                child.resume();
            }
        }
        self.absorb_all();
        self.core.emit(TransferEvent::Resumed(true));
    }

    fn cancel(&mut self) {
        if self.core.state().is_terminal() {
            self.core.emit(TransferEvent::Canceled(false));
            return;
        }
        for child in self.children.iter_mut().rev() {
            if !child.core().state().is_terminal() {
                child.cancel();
            }
        }
        for path in &self.finished_paths {
            remove_file(path);
        }
        self.fire(Event::CancelRequested);
        self.absorb_all();
        self.core.emit(TransferEvent::Canceled(true));
    }

    fn progress(&self) -> u64 {
        self.totals().0
    }

    fn total_size(&self) -> u64 {
        self.totals().1
    }

    fn set_throttle(&mut self, throttle: u64) {
        self.core.set_throttle(throttle);
        for child in &mut self.children {
            child.set_throttle(throttle);
        }
    }

    fn update_network(&mut self, status: NetworkStatus) {
        if let Some(connected) = self.core.set_network(status) {
            self.on_connectivity(connected);
        }
        for child in &mut self.children {
            child.update_network(status);
        }
        self.absorb_all();
    }

    fn allow_mobile_download(&mut self, allowed: bool) {
        if let Some(connected) = self.core.set_allow_mobile(allowed) {
            self.on_connectivity(connected);
        }
        for child in &mut self.children {
            child.allow_mobile_download(allowed);
        }
        self.absorb_all();
    }

    fn next_input(&mut self) -> impl Future<Output = GroupInput> + Send + '_ {
        async move {
            let pending: Vec<_> = self
                .children
                .iter_mut()
                .enumerate()
                .filter(|(_, child)| child.has_pending_input())
                .map(|(index, child)| Box::pin(async move { (index, child.next_input().await) }))
                .collect();
            if pending.is_empty() {
                return std::future::pending().await;
            }
            let ((index, input), _, _) = select_all(pending).await;
            GroupInput { index, input }
        }
    }

    fn handle_input(&mut self, input: GroupInput) {
        let Some(child) = self.children.get_mut(input.index) else {
            return;
        };
        child.handle_input(input.input);
        self.absorb(input.index);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::Group {
            group: self.record(),
            members: self.children.iter().map(SingleTransfer::record).collect(),
        }
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use fetchd_types::models::PersistedState;

    use super::*;
    use crate::requester::testing::FakeResponse;
    use crate::single::tests::Harness;

    fn group(h: &Harness, urls: &[&str]) -> GroupTransfer {
        let id = TransferId::new();
        let children = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut spec = h.spec(url, &format!("part{i}"));
                spec.group_id = Some(id.clone());
                h.transfer(spec)
            })
            .collect();
        GroupTransfer::new(
            GroupSpec {
                id,
                owner: "tester".into(),
                is_confined: false,
                root_path: h.dir.path().to_path_buf(),
                algorithm: "sha256".into(),
                metadata: TransferMetadata::default(),
                headers: BTreeMap::new(),
                throttle: 0,
                allow_mobile: true,
            },
            children,
        )
    }

    async fn settle(group: &mut GroupTransfer) {
        while group.has_pending_input() {
            let input = group.next_input().await;
            group.handle_input(input);
        }
    }

    const A: &str = "http://example.com/a";
    const B: &str = "http://example.com/b";
    const C: &str = "http://example.com/c";

    #[tokio::test]
    async fn finishes_when_every_member_finishes() {
        let h = Harness::new();
        for url in [A, B, C] {
            h.requester
                .route(url, FakeResponse::Body(Bytes::from(url.as_bytes().to_vec())));
        }
        let mut g = group(&h, &[A, B, C]);
        g.start();
        settle(&mut g).await;

        assert_eq!(g.core().state(), TransferState::Finished);
        assert_eq!(g.core().persisted_state(), PersistedState::Finish);
        let events = g.drain_events();
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::GroupFinished { paths } => Some(paths.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].len(), 3);
        for path in &finished[0] {
            assert!(path.exists());
        }
        assert_eq!(g.progress(), g.total_size());
    }

    #[tokio::test]
    async fn member_error_cleans_up_finished_siblings() {
        let h = Harness::new();
        h.requester
            .route(A, FakeResponse::Body(Bytes::from_static(b"aaaa")));
        h.requester
            .route(B, FakeResponse::Status(404, "Not Found".into()));
        h.requester
            .route(C, FakeResponse::Body(Bytes::from_static(b"cccc")));
        let mut g = group(&h, &[A, B, C]);
        g.start();
        settle(&mut g).await;

        assert_eq!(g.core().state(), TransferState::Error);
        let events = g.drain_events();
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![format!("{B}: NETWORK ERROR")]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::GroupFinished { .. })));
        for child in g.children() {
            assert!(!child.file_path().exists());
        }
    }

    #[tokio::test]
    async fn progress_is_the_sum_of_members() {
        let h = Harness::new();
        let mut g = group(&h, &[A, B]);
        g.start();
        let first = h.requester.take_reply().unwrap();
        let second = h.requester.take_reply().unwrap();
        first.push(Bytes::from_static(b"12"), Some(10));
        second.push(Bytes::from_static(b"345"), Some(20));

        for _ in 0..2 {
            let input = g.next_input().await;
            g.handle_input(input);
        }
        assert_eq!(g.progress(), 5);
        assert_eq!(g.total_size(), 30);
        let last = g
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::Progress { .. }))
            .last();
        assert_eq!(
            last,
            Some(TransferEvent::Progress {
                received: 5,
                total: 30
            })
        );
    }

    #[tokio::test]
    async fn operations_are_forwarded_to_members() {
        let h = Harness::new();
        let mut g = group(&h, &[A, B]);
        g.start();
        assert!(g
            .children()
            .iter()
            .all(|c| c.core().state() == TransferState::Downloading));

        g.pause();
        assert_eq!(g.core().state(), TransferState::Paused);
        assert!(g
            .children()
            .iter()
            .all(|c| c.core().state() == TransferState::Paused));

        g.resume();
        assert!(g
            .children()
            .iter()
            .all(|c| c.core().state() == TransferState::Downloading));

        g.cancel();
        g.cancel();
        assert_eq!(g.core().state(), TransferState::Canceled);
        assert!(g
            .children()
            .iter()
            .all(|c| c.core().state() == TransferState::Canceled));
        let cancels: Vec<_> = g
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::Canceled(_)))
            .collect();
        assert_eq!(
            cancels,
            vec![TransferEvent::Canceled(true), TransferEvent::Canceled(false)]
        );
    }

    #[tokio::test]
    async fn cancel_removes_already_finished_members() {
        let h = Harness::new();
        h.requester
            .route(A, FakeResponse::Body(Bytes::from_static(b"done")));
        let mut g = group(&h, &[A, B]);
        g.start();
        // A's progress and completion; B stays in flight.
        for _ in 0..2 {
            let input = g.next_input().await;
            g.handle_input(input);
        }
        assert_eq!(g.finished_paths().len(), 1);
        let finished = g.finished_paths()[0].clone();
        assert!(finished.exists());

        g.cancel();
        assert!(!finished.exists());
        assert_eq!(g.core().state(), TransferState::Canceled);
    }

    #[test]
    fn empty_or_invalid_members_invalidate_the_group() {
        let h = Harness::new();
        let g = group(&h, &[]);
        assert!(!g.core().is_valid());

        let g = group(&h, &[A, "::nope::"]);
        assert!(!g.core().is_valid());
        assert_eq!(g.core().last_error(), Some("Invalid URL: '::nope::'"));
    }
}
