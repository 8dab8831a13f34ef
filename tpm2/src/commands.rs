// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! Each method issues exactly one command and blocks for its response.

use anyhow::{anyhow, Result};
use std::path::Path;
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::error::TpmError;
use super::marshal::*;
use super::types::*;

/// Pure Rust TPM context
pub struct TpmContext<T = TpmDevice> {
    transport: T,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { transport: device })
    }

    pub fn device_path(&self) -> &Path {
        self.transport.path()
    }
}

impl<T: Transport> TpmContext<T> {
    /// Create a context over an arbitrary transport
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a command and parse its response, mapping non-success codes
    fn execute(&mut self, cmd: TpmCommand) -> Result<TpmResponse, TpmError> {
        let command = cmd.code();
        let bytes = cmd.finalize();
        debug!("{:?} command: {} bytes", command, bytes.len());

        let response = self
            .transport
            .transmit(&bytes)
            .and_then(|raw| TpmResponse::parse(&raw))
            .map_err(|e| TpmError::transport(command, e))?;
        if !response.is_success() {
            return Err(TpmError::Response {
                command,
                code: response.response_code,
            });
        }
        Ok(response)
    }

    /// Parse response parameters, attributing malformed data to `command`
    fn parse<R>(
        command: TpmCc,
        response: &TpmResponse,
        f: impl FnOnce(&mut ResponseBuffer) -> Result<R>,
    ) -> Result<R, TpmError> {
        let mut buf = response.data_buffer();
        f(&mut buf)
            .and_then(|out| buf.finish().map(|()| out))
            .map_err(|e| TpmError::transport(command, e))
    }

    // ==================== Capability ====================

    /// Query TPM properties starting at `property`
    pub fn get_capability_properties(
        &mut self,
        property: u32,
        count: u32,
    ) -> Result<Vec<TpmsTaggedProperty>, TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add(&TpmCap::TpmProperties.to_u32())
            .add(&property)
            .add(&count);

        let response = self.execute(cmd)?;
        Self::parse(TpmCc::GetCapability, &response, |buf| {
            let _more_data = buf.get_u8()?;
            Ok(TpmsCapabilityData::unmarshal(buf)?.properties)
        })
    }

    /// Number of PCRs the TPM implements (TPM_PT_PCR_COUNT)
    pub fn pcr_count(&mut self) -> Result<u32, TpmError> {
        let props = self.get_capability_properties(tpm_pt::PCR_COUNT, 1)?;
        props
            .iter()
            .find(|p| p.property == tpm_pt::PCR_COUNT)
            .map(|p| p.value)
            .ok_or_else(|| {
                TpmError::transport(
                    TpmCc::GetCapability,
                    anyhow!("TPM_PT_PCR_COUNT missing from capability response"),
                )
            })
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection
    pub fn pcr_read(
        &mut self,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<PcrReadOutput, TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);

        let response = self.execute(cmd)?;
        Self::parse(TpmCc::PcrRead, &response, PcrReadOutput::unmarshal)
    }

    // ==================== Sessions ====================

    /// Start an unbound, unsalted authorization session.
    ///
    /// Returns the session handle; the nonceTPM is discarded.
    pub fn start_auth_session(
        &mut self,
        session_type: TpmSe,
        symmetric: &TpmtSymDef,
        auth_hash: TpmAlgId,
        nonce_caller: &[u8],
    ) -> Result<u32, TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey and bind: unsalted, unbound
        cmd.add_handle(tpm_rh::NULL).add_handle(tpm_rh::NULL);
        cmd.add(&Tpm2b(nonce_caller))
            .add(&Tpm2b(&[])) // encryptedSalt
            .add(&session_type)
            .add(symmetric)
            .add(&auth_hash);

        let response = self.execute(cmd)?;
        let handle = Self::parse(TpmCc::StartAuthSession, &response, |buf| {
            let handle = buf.get_u32()?;
            let _nonce_tpm = buf.get_tpm2b()?;
            Ok(handle)
        })?;

        debug!("started {:?} session 0x{:08x}", session_type, handle);
        Ok(handle)
    }

    /// TPM2_PolicyPCR: bind a PCR selection and the digest of its values
    pub fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: &[u8],
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
        cmd.add_handle(session)
            .add(&Tpm2b(pcr_digest))
            .add(pcr_selection);

        self.execute(cmd)?;
        Ok(())
    }

    /// TPM2_PolicyGetDigest: the session's current policy digest
    pub fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>, TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
        cmd.add_handle(session);

        let response = self.execute(cmd)?;
        Self::parse(TpmCc::PolicyGetDigest, &response, |buf| buf.get_tpm2b())
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<(), TpmError> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        self.execute(cmd)?;
        debug!("flushed context 0x{:08x}", handle);
        Ok(())
    }
}
