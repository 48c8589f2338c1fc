use std::error::Error;

/// Boxed underlying cause of a failure.
///
/// Encode and decode failures wrap the parser crate's errors behind this
/// type, so callers never depend on parser-internal error types.
pub type Cause = Box<dyn Error + Send + Sync>;

/// Failure classification for transport calls.
///
/// Every failed call reports exactly one of these through its completion
/// callback. Cancelled calls report nothing at all.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request document could not be serialized. No network attempt
    /// was made.
    #[error("request body cannot be encoded: {0}")]
    Encode(#[source] Cause),

    /// I/O failure while connecting, sending or receiving.
    #[error("network error: {0}")]
    Network(#[source] Cause),

    /// The peer answered with a non-200 status. The body is not parsed.
    #[error("request failed with status {0}")]
    Status(u16),

    /// The peer answered 200 with an empty body.
    #[error("response body is empty")]
    EmptyBody,

    /// The response body is not a well-formed property-list dictionary.
    #[error("response is not a property-list dictionary: {0}")]
    Decode(#[source] Cause),
}
