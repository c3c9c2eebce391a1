use thiserror::Error;

/// Errors internal to the forwarder's selection and dial logic.
///
/// These stay inside the crate as a typed enum; the server layer wraps
/// them in [`anyhow::Error`] the same way it wraps TLS and I/O errors.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("no eligible upstream for this client")]
    NoEligibleUpstream,

    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("dial to {0} failed: {1}")]
    DialFailed(String, #[source] std::io::Error),
}
