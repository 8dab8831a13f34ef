// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides low-level communication with TPM devices via /dev/tpmrm0 or /dev/tpm0.

use anyhow::{anyhow, bail, Context, Result};
use fs_err::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use super::constants::*;
use super::marshal::*;

/// Largest response we accept from the character device
const MAX_RESPONSE_SIZE: usize = 4096;

/// Size of the command/response header: tag (2) + size (4) + code (4)
const HEADER_SIZE: usize = 10;

/// Device nodes tried by [`TpmDevice::detect`], resource manager first
const DEFAULT_DEVICES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// A synchronous request/response channel to a TPM.
///
/// Exactly one command is outstanding at a time; `transmit` blocks until the
/// TPM answers.
pub trait Transport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// TPM character device opened for read and write
pub struct TpmDevice {
    file: File,
}

impl TpmDevice {
    /// Open `path`; a `device:` prefix is accepted and ignored
    pub fn open(path: &str) -> Result<Self> {
        let path = path.strip_prefix("device:").unwrap_or(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context("failed to open TPM device")?;
        Ok(Self { file })
    }

    pub fn detect() -> Result<Self> {
        let path = DEFAULT_DEVICES
            .into_iter()
            .find(|p| Path::new(p).exists())
            .ok_or_else(|| anyhow!("TPM device not found, tried {:?}", DEFAULT_DEVICES))?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to send TPM command")?;

        // The kernel driver hands back the whole response in one read.
        let mut response = vec![0u8; MAX_RESPONSE_SIZE];
        let len = self
            .file
            .read(&mut response)
            .context("failed to receive TPM response")?;
        response.truncate(len);
        Ok(response)
    }
}

/// A command without an authorization area.
///
/// Handles come first, then parameters, each appended in wire order:
///
/// ```
/// use tpm2::{TpmCc, TpmCommand};
///
/// let mut cmd = TpmCommand::new(TpmCc::FlushContext);
/// cmd.add_handle(0x03000000);
/// assert_eq!(cmd.finalize().len(), 14);
/// ```
pub struct TpmCommand {
    code: TpmCc,
    buf: CommandBuffer,
}

impl TpmCommand {
    pub fn new(code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(64);
        buf.put_u16(TpmSt::NoSessions.to_u16());
        buf.put_u32(0); // commandSize, patched in finalize
        buf.put_u32(code.to_u32());
        Self { code, buf }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    pub fn add_handle(&mut self, handle: u32) -> &mut Self {
        self.buf.put_u32(handle);
        self
    }

    pub fn add<T: Marshal + ?Sized>(&mut self, param: &T) -> &mut Self {
        param.marshal(&mut self.buf);
        self
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;
        let data = response[HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }
}
