// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 policy authoring
//!
//! Builds policy digests by running assertions through a TPM policy session.
//! A trial session yields the digest an object's `authPolicy` should carry;
//! a real session additionally stays open so it can authorize a command.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{TpmAlgId, TpmContext};
//! use tpm2_policy::{
//!     build_policy, PcrPolicyParams, PolicyContext, PolicyRequest, StdoutSink, ValueSource,
//! };
//!
//! let mut tpm = TpmContext::new(None)?;
//! let request = PolicyRequest::PcrValue(PcrPolicyParams {
//!     pcr_index: Some(7),
//!     pcr_alg: TpmAlgId::Sha256,
//!     source: ValueSource::DeviceRead,
//! });
//! build_policy(&mut tpm, &PolicyContext::default(), &request, &mut StdoutSink)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod assertion;
mod device;
mod dispatch;
mod error;
mod hash;
mod pcr_value;
mod selection;
mod session;
mod store;

pub use assertion::PolicyAssertion;
pub use device::PolicyDevice;
pub use dispatch::{
    build_compound, build_policy, PcrPolicyParams, PolicyContext, PolicyOutcome, PolicyRequest,
};
pub use error::{ErrorClass, PolicyError, Result};
pub use hash::{digest, digest_size, empty_policy, fold_policy_pcr};
pub use pcr_value::{load_from_file, obtain_value, read_from_device, RegisterValue, ValueSource};
pub use selection::{query_pcr_count, RegisterSelection, MAX_PCR_COUNT};
pub use session::{PolicySession, RetainedSession, SessionMode, Teardown};
pub use store::{persist, Destination, OutputSink, PolicyDigest, StdoutSink};
