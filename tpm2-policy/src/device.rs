// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The TPM commands a policy build needs, one method per command family

use tpm2::{
    PcrReadOutput, TpmAlgId, TpmContext, TpmError, TpmSe, TpmlPcrSelection, TpmtSymDef, Transport,
};

/// Blocking command interface to the TPM.
///
/// Every call is one request/response round trip; a non-success response
/// code surfaces as [`TpmError::Response`].
pub trait PolicyDevice {
    /// Number of implemented PCRs (TPM_PT_PCR_COUNT)
    fn pcr_count(&mut self) -> Result<u32, TpmError>;

    /// Start an unbound, unsalted session with an empty caller nonce and no
    /// parameter encryption
    fn start_policy_session(
        &mut self,
        session_type: TpmSe,
        auth_hash: TpmAlgId,
    ) -> Result<u32, TpmError>;

    fn pcr_read(&mut self, selection: &TpmlPcrSelection) -> Result<PcrReadOutput, TpmError>;

    fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError>;

    fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>, TpmError>;

    fn flush_context(&mut self, handle: u32) -> Result<(), TpmError>;
}

impl<T: Transport> PolicyDevice for TpmContext<T> {
    fn pcr_count(&mut self) -> Result<u32, TpmError> {
        TpmContext::pcr_count(self)
    }

    fn start_policy_session(
        &mut self,
        session_type: TpmSe,
        auth_hash: TpmAlgId,
    ) -> Result<u32, TpmError> {
        self.start_auth_session(session_type, &TpmtSymDef::null(), auth_hash, &[])
    }

    fn pcr_read(&mut self, selection: &TpmlPcrSelection) -> Result<PcrReadOutput, TpmError> {
        TpmContext::pcr_read(self, selection)
    }

    fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError> {
        TpmContext::policy_pcr(self, session, pcr_digest, selection)
    }

    fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>, TpmError> {
        TpmContext::policy_get_digest(self, session)
    }

    fn flush_context(&mut self, handle: u32) -> Result<(), TpmError> {
        TpmContext::flush_context(self, handle)
    }
}
