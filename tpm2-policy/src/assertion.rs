// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy assertions: the predicates folded into a session digest

use tpm2::{TpmAlgId, TpmCc, TpmError};

use crate::device::PolicyDevice;
use crate::error::{PolicyError, Result};
use crate::hash::{digest, fold_policy_pcr};
use crate::pcr_value::RegisterValue;
use crate::selection::RegisterSelection;

/// A single policy predicate, ready to submit to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAssertion {
    /// "The selected PCRs hash to `pcr_digest`" (TPM2_PolicyPCR)
    PcrValue {
        selection: RegisterSelection,
        pcr_digest: Vec<u8>,
    },
}

impl PolicyAssertion {
    /// Build a PCR-value assertion.
    ///
    /// `pcr_digest` is the session-hash digest of the PCR values in ascending
    /// index order.
    pub fn pcr_value(
        selection: RegisterSelection,
        values: &[RegisterValue],
        session_hash: TpmAlgId,
    ) -> Result<Self> {
        if values.len() != selection.indices().len() {
            return Err(PolicyError::DeviceProtocol(format!(
                "{} PCR values for {} selected PCRs",
                values.len(),
                selection.indices().len()
            )));
        }
        if let Some(v) = values
            .iter()
            .find(|v| v.algorithm() != selection.algorithm())
        {
            return Err(PolicyError::AlgorithmMismatch {
                alg: selection.algorithm(),
                value_alg: v.algorithm(),
            });
        }
        let buffers: Vec<&[u8]> = values.iter().map(RegisterValue::as_bytes).collect();
        let pcr_digest = digest(session_hash, &buffers)?;
        Ok(Self::PcrValue {
            selection,
            pcr_digest,
        })
    }

    /// The TPM command this assertion issues
    pub fn command(&self) -> TpmCc {
        match self {
            Self::PcrValue { .. } => TpmCc::PolicyPcr,
        }
    }

    /// Issue the assertion against `session`
    pub(crate) fn issue<D: PolicyDevice + ?Sized>(
        &self,
        device: &mut D,
        session: u32,
    ) -> Result<(), TpmError> {
        match self {
            Self::PcrValue {
                selection,
                pcr_digest,
            } => device.policy_pcr(session, pcr_digest, &selection.to_tpml()),
        }
    }

    /// The policy digest the TPM should hold after this assertion
    pub fn fold(&self, session_hash: TpmAlgId, previous: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::PcrValue {
                selection,
                pcr_digest,
            } => fold_policy_pcr(session_hash, previous, &selection.to_tpml(), pcr_digest),
        }
    }
}
