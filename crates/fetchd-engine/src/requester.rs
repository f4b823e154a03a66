//! Transport contract the engine downloads through.
//!
//! A request produces a [`Reply`] (engine side) paired with a [`ReplySender`]
//! (transport side). Bytes pushed by the transport accumulate in a shared
//! buffer until the engine drains them with [`Reply::read_all_available`];
//! the read-buffer size bounds that buffer, which is how throttling works.
//! Dropping the `Reply` aborts the request.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fetchd_types::events::NetworkErrorKind;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// More bytes are buffered. `received` counts bytes of this reply only.
    Progress { received: u64, total: Option<u64> },
    Finished,
    Error(NetworkErrorKind),
    SslErrors { errors: Vec<String>, ignorable: bool },
}

#[derive(Default)]
struct Shared {
    buffer: BytesMut,
    received: u64,
    read_buffer_size: u64,
    status: Option<u16>,
    reason: Option<String>,
    redirect: Option<Url>,
    error_string: Option<String>,
}

struct Inner {
    shared: Mutex<Shared>,
    drained: Notify,
    cancel: CancellationToken,
}

/// Creates a connected sender/reply pair.
pub fn channel() -> (ReplySender, Reply) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(Inner {
        shared: Mutex::new(Shared::default()),
        drained: Notify::new(),
        cancel: CancellationToken::new(),
    });
    (
        ReplySender {
            events: tx,
            inner: inner.clone(),
        },
        Reply { events: rx, inner },
    )
}

/// Engine-side handle to one in-flight request.
pub struct Reply {
    events: mpsc::UnboundedReceiver<ReplyEvent>,
    inner: Arc<Inner>,
}

impl Reply {
    /// `None` once the transport side is gone without finishing.
    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        self.events.recv().await
    }

    pub fn read_all_available(&self) -> Bytes {
        let data = self.inner.shared.lock().buffer.split().freeze();
        self.inner.drained.notify_one();
        data
    }

    pub fn abort(&self) {
        self.inner.cancel.cancel();
    }

    /// Caps the bytes buffered ahead of the reader. 0 means unlimited.
    pub fn set_read_buffer_size(&self, size: u64) {
        self.inner.shared.lock().read_buffer_size = size;
        self.inner.drained.notify_one();
    }

    pub fn status(&self) -> Option<u16> {
        self.inner.shared.lock().status
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.shared.lock().reason.clone()
    }

    pub fn redirect_target(&self) -> Option<Url> {
        self.inner.shared.lock().redirect.clone()
    }

    pub fn error_string(&self) -> Option<String> {
        self.inner.shared.lock().error_string.clone()
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Transport-side handle used to feed a [`Reply`].
pub struct ReplySender {
    events: mpsc::UnboundedSender<ReplyEvent>,
    inner: Arc<Inner>,
}

impl ReplySender {
    pub fn set_status(&self, code: u16, reason: impl Into<String>) {
        let mut shared = self.inner.shared.lock();
        shared.status = Some(code);
        shared.reason = Some(reason.into());
    }

    pub fn push(&self, chunk: Bytes, total: Option<u64>) {
        let received = {
            let mut shared = self.inner.shared.lock();
            shared.buffer.extend_from_slice(&chunk);
            shared.received += chunk.len() as u64;
            shared.received
        };
        let _ = self.events.send(ReplyEvent::Progress { received, total });
    }

    /// Completes the reply, optionally pointing at a redirect target.
    pub fn finish(&self, redirect: Option<Url>) {
        self.inner.shared.lock().redirect = redirect;
        let _ = self.events.send(ReplyEvent::Finished);
    }

    pub fn fail(&self, kind: NetworkErrorKind, message: impl Into<String>) {
        self.inner.shared.lock().error_string = Some(message.into());
        let _ = self.events.send(ReplyEvent::Error(kind));
    }

    pub fn ssl_errors(&self, errors: Vec<String>, ignorable: bool) {
        let _ = self.events.send(ReplyEvent::SslErrors { errors, ignorable });
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.events.is_closed()
    }

    pub async fn aborted(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Waits until the reader has room for more data or the reply is aborted.
    pub async fn wait_for_capacity(&self) {
        loop {
            {
                let shared = self.inner.shared.lock();
                let limit = shared.read_buffer_size;
                if limit == 0 || (shared.buffer.len() as u64) < limit {
                    return;
                }
            }
            tokio::select! {
                _ = self.inner.drained.notified() => {}
                _ = self.inner.cancel.cancelled() => return,
            }
        }
    }
}

/// Issues requests. Implementations must be callable from inside a tokio
/// runtime and return immediately.
pub trait Requester: Send + Sync {
    fn get(&self, request: HttpRequest) -> Reply;

    fn post(&self, request: HttpRequest, body: Bytes) -> Reply;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-memory requester for tests.

    use std::collections::{HashMap, VecDeque};

    use super::*;

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: &'static str,
        pub request: HttpRequest,
        pub body: Option<Bytes>,
    }

    /// Canned answer for a URL.
    #[derive(Debug, Clone)]
    pub enum FakeResponse {
        /// 200 with the body, or 206 with the tail when a `Range` is sent.
        Body(Bytes),
        /// Same as `Body` but without announcing a content length.
        UnsizedBody(Bytes),
        Redirect(Url),
        Status(u16, String),
        Error(NetworkErrorKind),
        Ssl { ignorable: bool },
    }

    type Responder = Box<dyn Fn(&HttpRequest, &ReplySender) -> bool + Send + Sync>;

    #[derive(Default)]
    struct State {
        requests: Vec<RecordedRequest>,
        pending: VecDeque<ReplySender>,
        // Kept so answered replies are not seen as closed by the engine.
        answered: Vec<ReplySender>,
    }

    /// Records every request. Requests matched by a route or responder are
    /// answered synchronously; the rest are queued for [`take_reply`].
    ///
    /// [`take_reply`]: FakeRequester::take_reply
    #[derive(Default)]
    pub struct FakeRequester {
        state: Mutex<State>,
        routes: Mutex<HashMap<String, FakeResponse>>,
        responder: Option<Responder>,
        issued: Notify,
    }

    impl FakeRequester {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_responder(
            responder: impl Fn(&HttpRequest, &ReplySender) -> bool + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Some(Box::new(responder)),
                ..Self::default()
            }
        }

        pub fn route(&self, url: &str, response: FakeResponse) {
            self.routes.lock().insert(url.to_string(), response);
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.state.lock().requests.clone()
        }

        pub fn take_reply(&self) -> Option<ReplySender> {
            self.state.lock().pending.pop_front()
        }

        /// Waits for the next unanswered request.
        pub async fn next_reply(&self) -> ReplySender {
            loop {
                if let Some(sender) = self.take_reply() {
                    return sender;
                }
                self.issued.notified().await;
            }
        }

        fn issue(&self, method: &'static str, request: HttpRequest, body: Option<Bytes>) -> Reply {
            let (sender, reply) = channel();
            let route = self.routes.lock().get(request.url.as_str()).cloned();
            let handled = match route {
                Some(response) => {
                    respond(&request, &sender, &response);
                    true
                }
                None => self
                    .responder
                    .as_ref()
                    .is_some_and(|responder| responder(&request, &sender)),
            };

            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method,
                request,
                body,
            });
            if handled {
                state.answered.push(sender);
            } else {
                state.pending.push_back(sender);
                drop(state);
                self.issued.notify_one();
            }
            reply
        }
    }

    impl Requester for FakeRequester {
        fn get(&self, request: HttpRequest) -> Reply {
            self.issue("GET", request, None)
        }

        fn post(&self, request: HttpRequest, body: Bytes) -> Reply {
            self.issue("POST", request, Some(body))
        }
    }

    /// Plays `response` into `sender`, honoring a `bytes=<n>-` range.
    pub fn respond(request: &HttpRequest, sender: &ReplySender, response: &FakeResponse) {
        match response {
            FakeResponse::Body(body) | FakeResponse::UnsizedBody(body) => {
                let offset = request
                    .header("Range")
                    .and_then(|r| r.strip_prefix("bytes="))
                    .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
                let (status, tail) = match offset {
                    Some(n) => (206, body.slice(n.min(body.len())..)),
                    None => (200, body.clone()),
                };
                sender.set_status(status, if status == 200 { "OK" } else { "Partial Content" });
                let total = match response {
                    FakeResponse::Body(_) => Some(tail.len() as u64),
                    _ => None,
                };
                if !tail.is_empty() {
                    sender.push(tail, total);
                }
                sender.finish(None);
            }
            FakeResponse::Redirect(target) => {
                sender.set_status(302, "Found");
                sender.finish(Some(target.clone()));
            }
            FakeResponse::Status(code, phrase) => {
                sender.set_status(*code, phrase.clone());
                let kind = match code {
                    401 => NetworkErrorKind::AuthenticationRequired,
                    407 => NetworkErrorKind::ProxyAuthenticationRequired,
                    404 => NetworkErrorKind::ContentNotFound,
                    _ => NetworkErrorKind::ProtocolFailure,
                };
                sender.fail(kind, phrase.clone());
            }
            FakeResponse::Error(kind) => sender.fail(*kind, format!("{kind:?}")),
            FakeResponse::Ssl { ignorable } => {
                sender.ssl_errors(vec!["certificate has expired".to_string()], *ignorable);
                if *ignorable {
                    sender.finish(None);
                }
            }
        }
    }
}
