use std::fmt;

use ethers::types::Bytes;
use thiserror::Error;

/// Failure taxonomy of the UserOperation pipeline.
///
/// Every variant is terminal for the current build attempt.
#[derive(Debug, Error)]
pub enum Error {
    /// A chain read failed or returned inconsistent account state.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The requested action cannot be encoded (e.g. an empty batch).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Relay/bundler RPC failed or returned an error envelope.
    #[error("relay error: {0}")]
    Relay(String),

    /// Malformed DER or a component of the wrong length.
    #[error("signature decode error: {0}")]
    SignatureDecode(String),

    /// The passkey used for the ceremony is not the one the operation belongs to.
    #[error("credential mismatch: expected {expected}, got {actual}")]
    CredentialMismatch { expected: Bytes, actual: Bytes },

    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// The passkey ceremony was cancelled or the authenticator failed.
    #[error("passkey ceremony failed: {0}")]
    Ceremony(String),

    /// Registering a passkey with the registry failed (already registered, relayer tx failed).
    #[error("registration error: {0}")]
    Registration(String),
}

/// States of the UserOperation builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Resolving,
    Encoding,
    GasEstimating,
    Hashing,
    AwaitingSignature,
    Submitting,
    Submitted,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Resolving => "resolving",
            BuildState::Encoding => "encoding",
            BuildState::GasEstimating => "gas-estimating",
            BuildState::Hashing => "hashing",
            BuildState::AwaitingSignature => "awaiting-signature",
            BuildState::Submitting => "submitting",
            BuildState::Submitted => "submitted",
        };
        f.write_str(s)
    }
}

/// A failed build attempt, tagged with the state it failed in.
#[derive(Debug, Error)]
#[error("userOp build failed while {state}: {source}")]
pub struct BuildError {
    pub state: BuildState,
    #[source]
    pub source: Error,
}

impl BuildError {
    pub fn new(state: BuildState, source: Error) -> Self {
        Self { state, source }
    }

    /// Whether the caller must restart from `Resolving`.
    ///
    /// Only a wrong passkey or a cancelled ceremony leaves the nonce and gas
    /// fields untouched, so only those may simply re-prompt for a signature.
    pub fn requires_fresh_attempt(&self) -> bool {
        !matches!(
            self.source,
            Error::CredentialMismatch { .. } | Error::Ceremony(_)
        )
    }
}

/// `map_err` helper: `.map_err(at(BuildState::Hashing))`.
pub fn at(state: BuildState) -> impl FnOnce(Error) -> BuildError {
    move |source| BuildError::new(state, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_signature_failures_allow_reprompt() {
        let mismatch = BuildError::new(
            BuildState::AwaitingSignature,
            Error::CredentialMismatch {
                expected: Bytes::from(vec![1u8]),
                actual: Bytes::from(vec![2u8]),
            },
        );
        assert!(!mismatch.requires_fresh_attempt());

        let cancelled = BuildError::new(
            BuildState::AwaitingSignature,
            Error::Ceremony("user cancelled".into()),
        );
        assert!(!cancelled.requires_fresh_attempt());

        let relay = BuildError::new(BuildState::GasEstimating, Error::Relay("boom".into()));
        assert!(relay.requires_fresh_attempt());
    }

    #[test]
    fn build_error_names_state() {
        let err = BuildError::new(BuildState::Hashing, Error::HashMismatch("x".into()));
        assert_eq!(err.to_string(), "userOp build failed while hashing: hash mismatch: x");
    }
}
