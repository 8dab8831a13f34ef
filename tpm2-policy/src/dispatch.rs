// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy builds: validate a request, run one session, persist the digest

use tpm2::TpmAlgId;
use tracing::info;

use crate::assertion::PolicyAssertion;
use crate::device::PolicyDevice;
use crate::error::{PolicyError, Result};
use crate::hash::digest_size;
use crate::pcr_value::{load_from_file, obtain_value, ValueSource};
use crate::selection::{query_pcr_count, RegisterSelection};
use crate::session::{PolicySession, RetainedSession, SessionMode, Teardown};
use crate::store::{persist, Destination, OutputSink, PolicyDigest};

/// Settings shared by every step of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyContext {
    pub mode: SessionMode,
    /// Session auth hash; also the algorithm of the policy digest
    pub session_hash: TpmAlgId,
    pub destination: Destination,
}

impl Default for PolicyContext {
    fn default() -> Self {
        Self {
            mode: SessionMode::Trial,
            session_hash: TpmAlgId::Sha256,
            destination: Destination::Emit,
        }
    }
}

/// Parameters of a PCR-value policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicyParams {
    /// Must be given explicitly; there is no default PCR
    pub pcr_index: Option<u32>,
    /// PCR bank
    pub pcr_alg: TpmAlgId,
    pub source: ValueSource,
}

/// Which policy to build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PolicyRequest {
    /// No policy type selected; building is a no-op
    #[default]
    None,
    PcrValue(PcrPolicyParams),
}

/// Result of a successful build
#[derive(Debug)]
pub struct PolicyOutcome {
    pub digest: PolicyDigest,
    /// Present for real sessions: the live session, now owned by the caller
    pub session: Option<RetainedSession>,
}

/// Build the requested policy. Returns `Ok(None)` when nothing was requested.
pub fn build_policy<D, S>(
    device: &mut D,
    ctx: &PolicyContext,
    request: &PolicyRequest,
    sink: &mut S,
) -> Result<Option<PolicyOutcome>>
where
    D: PolicyDevice + ?Sized,
    S: OutputSink + ?Sized,
{
    let assertion = match request {
        PolicyRequest::None => return Ok(None),
        PolicyRequest::PcrValue(params) => prepare_pcr_assertion(device, ctx, params)?,
    };
    build_compound(device, ctx, &[assertion], sink).map(Some)
}

/// Validate parameters and resolve the PCR value into an assertion.
///
/// Everything that can be checked locally is checked before the first TPM
/// command.
fn prepare_pcr_assertion<D: PolicyDevice + ?Sized>(
    device: &mut D,
    ctx: &PolicyContext,
    params: &PcrPolicyParams,
) -> Result<PolicyAssertion> {
    let index = params
        .pcr_index
        .ok_or(PolicyError::MissingParameter("pcr index"))?;
    digest_size(params.pcr_alg)?;
    digest_size(ctx.session_hash)?;

    let supplied = match &params.source {
        ValueSource::FileSupplied(path) => Some(load_from_file(params.pcr_alg, path)?),
        ValueSource::DeviceRead => None,
    };

    let max = query_pcr_count(device)?;
    let selection = RegisterSelection::encode(params.pcr_alg, index, max)?;
    info!("PCR index = {}, bank = {:?}", index, params.pcr_alg);

    let value = match supplied {
        Some(value) => value,
        None => obtain_value(device, &selection, &params.source)?,
    };
    PolicyAssertion::pcr_value(selection, &[value], ctx.session_hash)
}

/// Run one session over `assertions` (AND-composed, in order).
///
/// On any failure after the session is open it is flushed best-effort and
/// the error is returned.
pub fn build_compound<D, S>(
    device: &mut D,
    ctx: &PolicyContext,
    assertions: &[PolicyAssertion],
    sink: &mut S,
) -> Result<PolicyOutcome>
where
    D: PolicyDevice + ?Sized,
    S: OutputSink + ?Sized,
{
    let mut session = PolicySession::open(device, ctx.mode, ctx.session_hash)?;

    let digest = match run_open_session(&mut session, device, ctx, assertions, sink) {
        Ok(digest) => digest,
        Err(e) => {
            session.abort(device);
            return Err(e);
        }
    };

    let session = match session.teardown(device)? {
        Teardown::Flushed => None,
        Teardown::Retained(retained) => Some(retained),
    };
    Ok(PolicyOutcome { digest, session })
}

fn run_open_session<D, S>(
    session: &mut PolicySession,
    device: &mut D,
    ctx: &PolicyContext,
    assertions: &[PolicyAssertion],
    sink: &mut S,
) -> Result<PolicyDigest>
where
    D: PolicyDevice + ?Sized,
    S: OutputSink + ?Sized,
{
    for assertion in assertions {
        session.submit(device, assertion)?;
    }
    let digest = session.finalize(device)?;
    info!("policy digest: {}", digest.to_hex_upper());

    persist(&digest, &ctx.destination, sink)?;
    if ctx.mode == SessionMode::Real {
        sink.emit("session-handle", &format!("{:x}", session.handle()))?;
    }
    Ok(digest)
}
