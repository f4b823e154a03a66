use std::error::Error;
use std::io;

use bytes::Bytes;
use fetchd_types::events::NetworkErrorKind;
use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, Method, RequestBuilder, redirect};
use tracing::debug;
use url::Url;

use crate::requester::{self, HttpRequest, Reply, ReplySender, Requester};

/// [`Requester`] backed by reqwest. Redirects are not followed by the client;
/// they surface as a finished reply carrying the target.
#[derive(Clone)]
pub struct HttpRequester {
    client: Client,
}

impl HttpRequester {
    pub fn new() -> reqwest::Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(concat!("fetchd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn send(&self, method: Method, request: HttpRequest, body: Option<Bytes>) -> Reply {
        let (sender, reply) = requester::channel();
        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let url = request.url;
        tokio::spawn(async move {
            tokio::select! {
                _ = sender.aborted() => debug!("Request to {} aborted", url),
                _ = pump(builder, &url, &sender) => {}
            }
        });
        reply
    }
}

impl Requester for HttpRequester {
    fn get(&self, request: HttpRequest) -> Reply {
        self.send(Method::GET, request, None)
    }

    fn post(&self, request: HttpRequest, body: Bytes) -> Reply {
        self.send(Method::POST, request, Some(body))
    }
}

async fn pump(builder: RequestBuilder, url: &Url, sender: &ReplySender) {
    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => return report(sender, &e),
    };

    let status = response.status();
    sender.set_status(status.as_u16(), status.canonical_reason().unwrap_or_default());

    if status.is_redirection() {
        let target = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| url.join(location).ok());
        if let Some(target) = target {
            debug!("{} redirects to {}", url, target);
            sender.finish(Some(target));
            return;
        }
    }

    if status.as_u16() >= 300 {
        let kind = match status.as_u16() {
            401 => NetworkErrorKind::AuthenticationRequired,
            407 => NetworkErrorKind::ProxyAuthenticationRequired,
            404 | 410 => NetworkErrorKind::ContentNotFound,
            _ => NetworkErrorKind::ProtocolFailure,
        };
        sender.fail(kind, status.to_string());
        return;
    }

    let total = response.content_length();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                sender.wait_for_capacity().await;
                if sender.is_aborted() {
                    return;
                }
                sender.push(chunk, total);
            }
            Err(e) => return report(sender, &e),
        }
    }
    sender.finish(None);
}

fn report(sender: &ReplySender, err: &reqwest::Error) {
    let message = error_chain(err);
    if let Some(tls) = tls_error(err) {
        debug!("TLS failure: {}", tls);
        sender.ssl_errors(vec![message], false);
        return;
    }
    sender.fail(classify(err), message);
}

fn classify(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    if let Some(kind) = io_error_kind(err) {
        match kind {
            io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe => return NetworkErrorKind::RemoteHostClosed,
            _ => {}
        }
    }
    if err.is_connect() {
        // Only the causes are searched; the top-level message carries the URL.
        if chain(err)
            .skip(1)
            .any(|cause| cause.to_string().to_ascii_lowercase().contains("dns error"))
        {
            NetworkErrorKind::HostNotFound
        } else {
            NetworkErrorKind::ConnectionRefused
        }
    } else if err.is_body() || err.is_request() {
        NetworkErrorKind::RemoteHostClosed
    } else if err.is_decode() {
        NetworkErrorKind::ProtocolFailure
    } else {
        NetworkErrorKind::Unknown
    }
}

/// `err` followed by its sources.
fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |&cause| cause.source())
}

/// The rustls error somewhere in the chain. Transports wrap it in an
/// `io::Error`, whose `source()` skips the wrapped error itself.
fn tls_error<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a rustls::Error> {
    chain(err).find_map(|cause| {
        cause.downcast_ref::<rustls::Error>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(io::Error::get_ref)
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        })
    })
}

fn io_error_kind(err: &(dyn Error + 'static)) -> Option<io::ErrorKind> {
    chain(err).find_map(|cause| cause.downcast_ref::<io::Error>().map(io::Error::kind))
}

fn error_chain(err: &reqwest::Error) -> String {
    chain(err)
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::ReplyEvent;

    #[test]
    fn tls_errors_are_found_by_type() {
        let wrapped = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::Expired),
        );
        assert!(matches!(
            tls_error(&wrapped),
            Some(rustls::Error::InvalidCertificate(_))
        ));

        let refused = io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "tls handshake with ssl certificate failed",
        );
        assert!(tls_error(&refused).is_none());
        assert_eq!(io_error_kind(&refused), Some(io::ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn client_builds_without_redirects() {
        assert!(HttpRequester::new().is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error_whatever_the_url() {
        let requester = HttpRequester::new().unwrap();
        let url = Url::parse("http://127.0.0.1:1/openssl-3.0-tls-certificate.tar.gz").unwrap();
        let mut reply = requester.get(HttpRequest::new(url));
        assert_eq!(
            reply.next_event().await,
            Some(ReplyEvent::Error(NetworkErrorKind::ConnectionRefused))
        );
        assert!(reply.error_string().is_some_and(|m| m.contains("openssl")));
    }
}
