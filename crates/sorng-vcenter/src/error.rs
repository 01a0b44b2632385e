//! Error types for the vCenter orchestration crate.

use std::error::Error as StdError;
use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcenterErrorKind {
    /// Endpoint unreachable or connection refused / timed out
    ConnectionError,
    /// Request or operation timeout
    Timeout,
    /// TLS handshake / certificate failure
    TlsError,
    /// Session handle died (socket dropped mid-exchange or session expired)
    StaleSession,
    /// Session was never connected or was explicitly disconnected
    NotConnected,
    /// Authentication failed
    AuthenticationError,
    /// Inventory object / device / file not found
    NotFound,
    /// HTTP error with status code
    ApiError(u16),
    /// SOAP-style fault returned by the management API
    RemoteFault,
    /// Remote task finished in the `error` state
    TaskError,
    /// HTTP NFC lease failure
    LeaseError,
    /// Manifest checksum missing or mismatched
    ChecksumMismatch,
    /// Missing / invalid configuration or inventory prerequisite
    ConfigError,
    /// Operation not supported on this kind of endpoint
    Unsupported,
    /// Disk / file streaming failure
    TransferError,
    /// Local filesystem error
    IoError,
    /// JSON / YAML / XML parse error
    ParseError,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct VcenterError {
    pub kind: VcenterErrorKind,
    pub message: String,
}

impl VcenterError {
    pub fn new(kind: VcenterErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::ConnectionError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::Timeout, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::TlsError, msg)
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::StaleSession, msg)
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::NotConnected, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::AuthenticationError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::NotFound, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::ApiError(status), msg)
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::RemoteFault, msg)
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::TaskError, msg)
    }

    pub fn lease(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::LeaseError, msg)
    }

    pub fn checksum(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::ChecksumMismatch, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::ConfigError, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::Unsupported, msg)
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::TransferError, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VcenterErrorKind::ParseError, msg)
    }

    /// Prefix the message with the sub-operation that failed.
    pub fn context(mut self, what: impl fmt::Display) -> Self {
        self.message = format!("{what}: {}", self.message);
        self
    }

    pub fn is_stale(&self) -> bool {
        self.kind == VcenterErrorKind::StaleSession
    }
}

impl fmt::Display for VcenterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl StdError for VcenterError {}

impl From<VcenterError> for String {
    fn from(e: VcenterError) -> String {
        e.to_string()
    }
}

/// Markers hyper / the OS put in the chain when a pooled socket was
/// closed by the peer between or during exchanges.
const DROPPED_SOCKET_MARKERS: &[&str] = &[
    "connection closed before message completed",
    "incomplete message",
    "connection reset by peer",
    "broken pipe",
];

/// Render an error together with every `source()` below it.
pub(crate) fn describe_chain(e: &(dyn StdError + 'static)) -> String {
    let mut out = e.to_string();
    let mut current = e.source();
    while let Some(src) = current {
        let text = src.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = src.source();
    }
    out
}

fn chain_has_tls_failure(e: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = current {
        if err.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io
                .get_ref()
                .map(|inner| inner.downcast_ref::<rustls::Error>().is_some())
                .unwrap_or(false)
            {
                return true;
            }
        }
        current = err.source();
    }
    false
}

impl From<reqwest::Error> for VcenterError {
    fn from(e: reqwest::Error) -> Self {
        let chain = describe_chain(&e);
        let lowered = chain.to_lowercase();

        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {chain}"))
        } else if chain_has_tls_failure(&e) {
            Self::tls(format!("TLS failure: {chain}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {chain}"))
        } else if DROPPED_SOCKET_MARKERS.iter().any(|m| lowered.contains(m)) {
            Self::stale(format!("Connection dropped: {chain}"))
        } else if let Some(status) = e.status() {
            Self::api(status.as_u16(), format!("HTTP error: {chain}"))
        } else {
            Self::new(VcenterErrorKind::Other, format!("HTTP error: {chain}"))
        }
    }
}

impl From<serde_json::Error> for VcenterError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<serde_yaml::Error> for VcenterError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::parse(format!("YAML parse error: {e}"))
    }
}

impl From<quick_xml::Error> for VcenterError {
    fn from(e: quick_xml::Error) -> Self {
        Self::parse(format!("XML error: {e}"))
    }
}

impl From<std::io::Error> for VcenterError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {e}"))
        } else {
            Self::new(VcenterErrorKind::IoError, format!("I/O error: {e}"))
        }
    }
}

impl From<tokio::task::JoinError> for VcenterError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::new(VcenterErrorKind::Other, format!("Background task failed: {e}"))
    }
}

/// Convenience alias.
pub type VcenterResult<T> = Result<T, VcenterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = VcenterError::not_found("VM 'web-1' not found");
        assert_eq!(e.to_string(), "[NotFound] VM 'web-1' not found");
    }

    #[test]
    fn context_prefixes_message() {
        let e = VcenterError::lease("state error").context("Failed to get lease to upload OVF");
        assert_eq!(e.message, "Failed to get lease to upload OVF: state error");
        assert_eq!(e.kind, VcenterErrorKind::LeaseError);
    }

    #[test]
    fn io_timeout_maps_to_timeout_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        let e: VcenterError = io.into();
        assert_eq!(e.kind, VcenterErrorKind::Timeout);
    }

    #[test]
    fn describe_chain_walks_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "Connection timed out (os error 110)");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        let text = describe_chain(&outer);
        assert!(text.contains("Connection timed out"));
    }

    #[test]
    fn into_string() {
        let s: String = VcenterError::unsupported("rename on ESX").into();
        assert!(s.contains("Unsupported"));
    }
}
