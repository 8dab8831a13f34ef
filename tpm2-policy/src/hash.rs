// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Digest engine
//!
//! Hashes ordered byte buffers with a TPM hash algorithm, and replays the
//! TPM's policy digest updates locally.

use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2::{Marshal, TpmAlgId, TpmCc, TpmlPcrSelection};

use crate::error::{PolicyError, Result};

/// Digest length for `alg`, or `UnsupportedAlgorithm`
pub fn digest_size(alg: TpmAlgId) -> Result<usize> {
    alg.digest_size()
        .ok_or(PolicyError::UnsupportedAlgorithm(alg))
}

fn hash_with<H: Digest>(buffers: &[&[u8]]) -> Vec<u8> {
    let mut hasher = H::new();
    for buf in buffers {
        hasher.update(buf);
    }
    hasher.finalize().to_vec()
}

/// Hash the concatenation of `buffers`, in order
pub fn digest(alg: TpmAlgId, buffers: &[&[u8]]) -> Result<Vec<u8>> {
    if buffers.is_empty() {
        return Err(PolicyError::EmptyDigestInput);
    }
    let out = match alg {
        TpmAlgId::Sha1 => hash_with::<sha1::Sha1>(buffers),
        TpmAlgId::Sha256 => hash_with::<Sha256>(buffers),
        TpmAlgId::Sha384 => hash_with::<Sha384>(buffers),
        TpmAlgId::Sha512 => hash_with::<Sha512>(buffers),
        TpmAlgId::Sm3_256 => hash_with::<sm3::Sm3>(buffers),
        _ => return Err(PolicyError::UnsupportedAlgorithm(alg)),
    };
    Ok(out)
}

/// Initial policy digest of a fresh session: all zeros
pub fn empty_policy(alg: TpmAlgId) -> Result<Vec<u8>> {
    Ok(vec![0u8; digest_size(alg)?])
}

/// Replay of TPM2_PolicyPCR's update of the session digest:
/// `H(previous || TPM_CC_PolicyPCR || pcrs || pcrDigest)`
pub fn fold_policy_pcr(
    alg: TpmAlgId,
    previous: &[u8],
    pcrs: &TpmlPcrSelection,
    pcr_digest: &[u8],
) -> Result<Vec<u8>> {
    let cc = TpmCc::PolicyPcr.to_u32().to_be_bytes();
    let pcrs = pcrs.to_bytes();
    digest(alg, &[previous, &cc, &pcrs, pcr_digest])
}
