// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use super::constants::TpmCc;

/// Failure of a single TPM command
#[derive(Debug, Error)]
pub enum TpmError {
    /// The TPM answered with a non-success response code
    #[error("{command:?} failed with TPM error: 0x{code:08x}")]
    Response { command: TpmCc, code: u32 },
    /// The command never produced a well-formed response
    #[error("{command:?} transport failure: {source:#}")]
    Transport {
        command: TpmCc,
        #[source]
        source: anyhow::Error,
    },
}

impl TpmError {
    pub fn transport(command: TpmCc, source: anyhow::Error) -> Self {
        Self::Transport { command, source }
    }

    /// The TPM response code, if the TPM answered at all
    pub fn response_code(&self) -> Option<u32> {
        match self {
            Self::Response { code, .. } => Some(*code),
            Self::Transport { .. } => None,
        }
    }

    pub fn command(&self) -> TpmCc {
        match self {
            Self::Response { command, .. } | Self::Transport { command, .. } => *command,
        }
    }
}
