// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// Largest bitmap `sizeofSelect` (a UINT8) can describe
pub const PCR_SELECT_MAX: usize = u8::MAX as usize;

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    /// Selection with a bitmap of `size_of_select` bytes and the given PCRs set
    pub fn new(hash: TpmAlgId, size_of_select: usize, pcrs: &[u32]) -> Result<Self> {
        if size_of_select > PCR_SELECT_MAX {
            bail!(
                "{}-byte PCR selection exceeds the {}-byte maximum",
                size_of_select,
                PCR_SELECT_MAX
            );
        }
        let mut pcr_select = vec![0u8; size_of_select];
        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            let Some(byte) = pcr_select.get_mut(byte_idx) else {
                bail!("PCR {} does not fit a {}-byte selection", pcr, size_of_select);
            };
            *byte |= 1 << (pcr % 8);
        }
        Ok(Self { hash, pcr_select })
    }

    /// Selected PCR indices in ascending order
    pub fn selected(&self) -> impl Iterator<Item = u32> + '_ {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(byte_idx, &byte)| {
                (0..8u32)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| byte_idx as u32 * 8 + bit)
            })
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        // Bitmaps past PCR_SELECT_MAX are cut so sizeofSelect always matches
        // the bytes that follow it.
        let size = u8::try_from(self.pcr_select.len()).unwrap_or(u8::MAX);
        self.hash.marshal(buf);
        size.marshal(buf);
        buf.put_bytes(&self.pcr_select[..size as usize]);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = buf.get_u16()?;
        let hash = TpmAlgId::from_u16(hash_alg)
            .ok_or_else(|| anyhow!("unknown hash algorithm: 0x{:04x}", hash_alg))?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(selection: TpmsPcrSelection) -> Self {
        Self {
            pcr_selections: vec![selection],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut pcr_selections = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for digest in &self.digests {
            digest.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut digests = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            digests.push(Tpm2bDigest::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

impl Marshal for TpmAlgId {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.to_u16());
    }
}

impl Marshal for TpmSe {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self as u8);
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.algorithm.marshal(buf);
        if self.algorithm != TpmAlgId::Null {
            self.key_bits.marshal(buf);
            self.mode.marshal(buf);
        }
    }
}

/// TPMS_TAGGED_PROPERTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsTaggedProperty {
    pub property: u32,
    pub value: u32,
}

/// TPMS_CAPABILITY_DATA for TPM_CAP_TPM_PROPERTIES, the only capability
/// this crate queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsCapabilityData {
    pub properties: Vec<TpmsTaggedProperty>,
}

impl Unmarshal for TpmsCapabilityData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let capability = buf.get_u32()?;
        if capability != TpmCap::TpmProperties.to_u32() {
            bail!("unsupported capability in response: 0x{:08x}", capability);
        }
        let count = buf.get_u32()? as usize;
        let mut properties = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            properties.push(TpmsTaggedProperty {
                property: buf.get_u32()?,
                value: buf.get_u32()?,
            });
        }
        Ok(Self { properties })
    }
}

/// Output parameters of TPM2_PCR_Read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrReadOutput {
    pub update_counter: u32,
    pub selection: TpmlPcrSelection,
    pub values: TpmlDigest,
}

impl Unmarshal for PcrReadOutput {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            update_counter: buf.get_u32()?,
            selection: TpmlPcrSelection::unmarshal(buf)?,
            values: TpmlDigest::unmarshal(buf)?,
        })
    }
}
