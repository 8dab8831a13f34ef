// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR selection bitmaps sized by the device's PCR count

use tpm2::{TpmAlgId, TpmlPcrSelection, TpmsPcrSelection, PCR_SELECT_MAX};
use tracing::debug;

use crate::device::PolicyDevice;
use crate::error::{PolicyError, Result};

/// Most PCRs a one-bank selection bitmap can address
pub const MAX_PCR_COUNT: u32 = PCR_SELECT_MAX as u32 * 8;

fn check_pcr_count(count: u32) -> Result<()> {
    match count {
        0 => Err(PolicyError::CapabilityUnavailable("TPM reports zero PCRs".into())),
        n if n > MAX_PCR_COUNT => Err(PolicyError::CapabilityUnavailable(format!(
            "TPM reports {} PCRs, a selection can address at most {}",
            n, MAX_PCR_COUNT
        ))),
        _ => Ok(()),
    }
}

/// One PCR bank selection.
///
/// The bitmap is `ceil(max_registers / 8)` bytes; PCR `i` is bit `i % 8` of
/// byte `i / 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSelection {
    algorithm: TpmAlgId,
    select: Vec<u8>,
}

impl RegisterSelection {
    /// Select the single PCR `index` out of `max_registers`.
    ///
    /// `max_registers` must be within `1..=MAX_PCR_COUNT`.
    pub fn encode(algorithm: TpmAlgId, index: u32, max_registers: u32) -> Result<Self> {
        check_pcr_count(max_registers)?;
        if index >= max_registers {
            return Err(PolicyError::IndexOutOfRange {
                index,
                max: max_registers,
            });
        }
        let mut select = vec![0u8; max_registers.div_ceil(8) as usize];
        select[(index / 8) as usize] |= 1 << (index % 8);
        Ok(Self { algorithm, select })
    }

    pub fn algorithm(&self) -> TpmAlgId {
        self.algorithm
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.select
    }

    /// Selected PCR indices, ascending. Values are folded in this order.
    pub fn indices(&self) -> Vec<u32> {
        self.to_tpms().selected().collect()
    }

    fn to_tpms(&self) -> TpmsPcrSelection {
        TpmsPcrSelection {
            hash: self.algorithm,
            pcr_select: self.select.clone(),
        }
    }

    /// Wire form: a TPML_PCR_SELECTION holding this one bank
    pub fn to_tpml(&self) -> TpmlPcrSelection {
        TpmlPcrSelection::single(self.to_tpms())
    }
}

/// Ask the device how many PCRs it implements.
///
/// Zero, or more than [`MAX_PCR_COUNT`], counts as unavailable.
pub fn query_pcr_count<D: PolicyDevice + ?Sized>(device: &mut D) -> Result<u32> {
    let count = device
        .pcr_count()
        .map_err(|e| PolicyError::CapabilityUnavailable(e.to_string()))?;
    check_pcr_count(count)?;
    debug!("TPM implements {} PCRs", count);
    Ok(count)
}
