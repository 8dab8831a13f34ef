// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Where the reference PCR value of an assertion comes from

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use fs_err as fs;
use tpm2::TpmAlgId;
use tracing::{debug, warn};

use crate::device::PolicyDevice;
use crate::error::{PolicyError, Result};
use crate::hash::digest_size;
use crate::selection::RegisterSelection;

/// How the PCR value is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Read the current value from the TPM
    DeviceRead,
    /// Raw value supplied by the operator.
    ///
    /// This is an operator-asserted trust boundary: the value is not checked
    /// against the TPM's actual PCR state.
    FileSupplied(PathBuf),
}

/// A PCR value whose length matches its bank's digest size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    algorithm: TpmAlgId,
    bytes: Vec<u8>,
}

impl RegisterValue {
    pub fn new(algorithm: TpmAlgId, bytes: Vec<u8>) -> Result<Self> {
        let expected = digest_size(algorithm)?;
        if bytes.len() != expected {
            return Err(PolicyError::DeviceProtocol(format!(
                "{:?} PCR value is {} bytes, expected {}",
                algorithm,
                bytes.len(),
                expected
            )));
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> TpmAlgId {
        self.algorithm
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Obtain the value of the PCR in `selection`
pub fn obtain_value<D: PolicyDevice + ?Sized>(
    device: &mut D,
    selection: &RegisterSelection,
    source: &ValueSource,
) -> Result<RegisterValue> {
    match source {
        ValueSource::DeviceRead => read_from_device(device, selection),
        ValueSource::FileSupplied(path) => load_from_file(selection.algorithm(), path),
    }
}

/// PCR_Read the selection and check the TPM answered for exactly that PCR
pub fn read_from_device<D: PolicyDevice + ?Sized>(
    device: &mut D,
    selection: &RegisterSelection,
) -> Result<RegisterValue> {
    let requested = selection.to_tpml();
    let out = device
        .pcr_read(&requested)
        .map_err(PolicyError::PcrReadFailed)?;
    debug!("PCR_Read update counter: {}", out.update_counter);

    if out.selection != requested {
        return Err(PolicyError::DeviceProtocol(format!(
            "PCR_Read returned selection {:?}, requested {:?}",
            out.selection, requested
        )));
    }
    let mut values = out.values.digests.into_iter();
    let (Some(value), None) = (values.next(), values.next()) else {
        return Err(PolicyError::DeviceProtocol(
            "PCR_Read must return exactly one value for a single PCR".into(),
        ));
    };
    RegisterValue::new(selection.algorithm(), value.buffer)
}

/// Load a raw PCR value of exactly `digest_size(alg)` bytes
pub fn load_from_file(alg: TpmAlgId, path: &Path) -> Result<RegisterValue> {
    let expected = digest_size(alg)?;

    let open_failed = |source| PolicyError::OpenFailed {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(open_failed)?;
    let actual = file.metadata().map_err(open_failed)?.len();
    if actual != expected as u64 {
        return Err(PolicyError::SizeMismatch {
            path: path.to_path_buf(),
            alg,
            expected,
            actual,
        });
    }

    let bytes = read_value(&mut file, expected, path)?;
    warn!(
        "using operator-supplied {:?} PCR value from {}, not verified against the TPM",
        alg,
        path.display()
    );
    RegisterValue::new(alg, bytes)
}

/// Read exactly `expected` bytes; `path` only names the source in errors
fn read_value<R: Read>(mut reader: R, expected: usize, path: &Path) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; expected];
    let mut read = 0;
    while read < expected {
        match reader.read(&mut bytes[read..]) {
            Ok(0) => {
                return Err(PolicyError::ShortRead {
                    path: path.to_path_buf(),
                    read,
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(PolicyError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    Ok(bytes)
}
