// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;
use tpm2::{TpmAlgId, TpmError};

pub type Result<T, E = PolicyError> = std::result::Result<T, E>;

/// Coarse failure class, used to decide whether the device was touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or missing input; rejected before any device interaction
    Validation,
    /// The device could not report its PCR capability
    Capability,
    /// The device refused a command or answered inconsistently
    DeviceProtocol,
    /// Local storage failure
    Io,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid PCR index {index}, choose between 0..{max}")]
    IndexOutOfRange { index: u32, max: u32 },
    #[error("unsupported hash algorithm: {0:?}")]
    UnsupportedAlgorithm(TpmAlgId),
    #[error("nothing to digest")]
    EmptyDigestInput,
    #[error("{} holds {actual} bytes, {alg:?} needs exactly {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        alg: TpmAlgId,
        expected: usize,
        actual: u64,
    },
    #[error("{alg:?} selection cannot be paired with a {value_alg:?} value")]
    AlgorithmMismatch { alg: TpmAlgId, value_alg: TpmAlgId },

    #[error("failed to retrieve number of supported PCRs: {0}")]
    CapabilityUnavailable(String),

    #[error("failed to start policy session: {0}")]
    SessionStartFailed(#[source] TpmError),
    #[error("policy assertion rejected: {0}")]
    AssertionRejected(#[source] TpmError),
    #[error("failed to get policy digest: {0}")]
    FinalizeFailed(#[source] TpmError),
    #[error("failed to flush session: {0}")]
    FlushFailed(#[source] TpmError),
    #[error("failed to read PCR: {0}")]
    PcrReadFailed(#[source] TpmError),
    #[error("inconsistent TPM response: {0}")]
    DeviceProtocol(String),
    #[error("session 0x{0:08x} saw an earlier TPM failure and cannot be finalized")]
    SessionTainted(u32),
    #[error("session 0x{handle:08x} is {state}, cannot {operation}")]
    InvalidState {
        handle: u32,
        state: &'static str,
        operation: &'static str,
    },

    #[error("could not open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading {} failed: end of file reached after {read} bytes", path.display())]
    ShortRead { path: PathBuf, read: usize },
    #[error("reading {} failed: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save policy digest into {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to emit {key}: {source}")]
    Emit {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl PolicyError {
    pub fn class(&self) -> ErrorClass {
        use PolicyError::*;
        match self {
            MissingParameter(_)
            | IndexOutOfRange { .. }
            | UnsupportedAlgorithm(_)
            | EmptyDigestInput
            | SizeMismatch { .. }
            | AlgorithmMismatch { .. } => ErrorClass::Validation,
            CapabilityUnavailable(_) => ErrorClass::Capability,
            SessionStartFailed(_)
            | AssertionRejected(_)
            | FinalizeFailed(_)
            | FlushFailed(_)
            | PcrReadFailed(_)
            | DeviceProtocol(_)
            | SessionTainted(_)
            | InvalidState { .. } => ErrorClass::DeviceProtocol,
            OpenFailed { .. }
            | ShortRead { .. }
            | ReadFailed { .. }
            | WriteFailed { .. }
            | Emit { .. } => ErrorClass::Io,
        }
    }

    /// TPM response code behind this error, if the TPM produced one
    pub fn response_code(&self) -> Option<u32> {
        match self {
            PolicyError::SessionStartFailed(e)
            | PolicyError::AssertionRejected(e)
            | PolicyError::FinalizeFailed(e)
            | PolicyError::FlushFailed(e)
            | PolicyError::PcrReadFailed(e) => e.response_code(),
            _ => None,
        }
    }
}
