use thiserror::Error;

/// Failure categories a transfer can end in.
///
/// `Display` is the message carried by the generic `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Bad input detected while building the transfer. Never reported as an
    /// event, only through `last_error`.
    #[error("{0}")]
    Validation(String),

    #[error("NETWORK ERROR")]
    Network,

    #[error("AUTHENTICATION ERROR")]
    Auth,

    #[error("PROXY_AUTHENTICATION ERROR")]
    ProxyAuth,

    /// Status and phrase travel in the `http_error` event; the generic
    /// message is the network one.
    #[error("NETWORK ERROR")]
    Http { code: u16, phrase: String },

    #[error("SSL ERROR")]
    Ssl,

    #[error("HASH ERROR")]
    Hash,

    #[error("COMMAND ERROR")]
    Command,

    #[error("FILE SYSTEM ERROR: {0}")]
    Filesystem(String),
}

impl TransferError {
    pub fn filesystem(err: impl std::fmt::Display) -> Self {
        Self::Filesystem(err.to_string())
    }
}
