// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 command layer
//!
//! This crate encodes the TPM 2.0 commands needed to author policy sessions
//! and talks directly to the TPM device without C library dependencies.
//!
//! ## Supported Commands
//!
//! - Capability: `GetCapability` (TPM properties)
//! - PCR operations: `PCR_Read`
//! - Sessions: `StartAuthSession`, `PolicyPCR`, `PolicyGetDigest`, `FlushContext`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::TpmContext;
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let pcrs = ctx.pcr_count()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod error;
mod marshal;
mod types;

pub use commands::TpmContext;
pub use constants::*;
pub use error::TpmError;
pub use types::*;

pub use device::{TpmCommand, TpmDevice, TpmResponse, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Tpm2b, Unmarshal};
