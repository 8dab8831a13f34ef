// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy session lifecycle
//!
//! A session moves `Open -> Finalized`, and is closed by consuming it with
//! [`PolicySession::teardown`] or [`PolicySession::abort`]. Trial sessions
//! are flushed at teardown; real sessions are handed to the caller as a
//! [`RetainedSession`], which from then on owns the TPM handle.

use tpm2::{TpmAlgId, TpmHt, TpmSe};
use tracing::{debug, info, warn};

use crate::assertion::PolicyAssertion;
use crate::device::PolicyDevice;
use crate::error::{PolicyError, Result};
use crate::hash::{digest_size, empty_policy};
use crate::store::PolicyDigest;

/// Whether the session binds real authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Compute the digest only (TPM_SE_TRIAL)
    #[default]
    Trial,
    /// A live policy session usable as authorization (TPM_SE_POLICY)
    Real,
}

impl SessionMode {
    fn session_type(self) -> TpmSe {
        match self {
            SessionMode::Trial => TpmSe::Trial,
            SessionMode::Real => TpmSe::Policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Finalized,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Finalized => "finalized",
        }
    }
}

/// An open policy session on the TPM
#[derive(Debug)]
pub struct PolicySession {
    handle: u32,
    mode: SessionMode,
    auth_hash: TpmAlgId,
    state: SessionState,
    tainted: bool,
    assertions: usize,
    /// Local replay of the TPM's running policy digest
    expected: Vec<u8>,
}

/// What teardown did with the TPM handle
#[derive(Debug)]
pub enum Teardown {
    /// The trial session was flushed
    Flushed,
    /// The real session is still live; the caller now owns it
    Retained(RetainedSession),
}

/// A live policy session handed over to a consuming operation.
///
/// Nothing in this crate flushes or reuses the handle once it is wrapped
/// here. The consumer presents it as authorization, then calls
/// [`RetainedSession::flush`] or takes the raw handle with
/// [`RetainedSession::into_handle`] and becomes responsible for it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a retained session holds a TPM session slot until it is flushed"]
pub struct RetainedSession {
    handle: u32,
    auth_hash: TpmAlgId,
}

impl RetainedSession {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn auth_hash(&self) -> TpmAlgId {
        self.auth_hash
    }

    /// Give up the handle without flushing it
    pub fn into_handle(self) -> u32 {
        self.handle
    }

    /// Release the TPM session slot
    pub fn flush<D: PolicyDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device
            .flush_context(self.handle)
            .map_err(PolicyError::FlushFailed)
    }
}

impl PolicySession {
    /// TPM2_StartAuthSession for a trial or real policy session
    pub fn open<D: PolicyDevice + ?Sized>(
        device: &mut D,
        mode: SessionMode,
        auth_hash: TpmAlgId,
    ) -> Result<Self> {
        let expected = empty_policy(auth_hash)?;

        let handle = device
            .start_policy_session(mode.session_type(), auth_hash)
            .map_err(PolicyError::SessionStartFailed)?;
        let session = Self {
            handle,
            mode,
            auth_hash,
            state: SessionState::Open,
            tainted: false,
            assertions: 0,
            expected,
        };
        if TpmHt::of(handle) != Some(TpmHt::PolicySession) {
            session.abort(device);
            return Err(PolicyError::DeviceProtocol(format!(
                "StartAuthSession returned non-policy handle 0x{:08x}",
                handle
            )));
        }

        info!("opened {:?} policy session 0x{:08x}", mode, handle);
        Ok(session)
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn auth_hash(&self) -> TpmAlgId {
        self.auth_hash
    }

    /// Set once the TPM rejects an assertion or reports a digest the replay disagrees with
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Number of assertions the TPM accepted so far
    pub fn assertion_count(&self) -> usize {
        self.assertions
    }

    fn ensure_state(&self, state: SessionState, operation: &'static str) -> Result<()> {
        if self.state != state {
            return Err(PolicyError::InvalidState {
                handle: self.handle,
                state: self.state.name(),
                operation,
            });
        }
        Ok(())
    }

    /// Extend the session with one more assertion (policy AND).
    ///
    /// A rejected assertion taints the session; it can then only be torn down.
    pub fn submit<D: PolicyDevice + ?Sized>(
        &mut self,
        device: &mut D,
        assertion: &PolicyAssertion,
    ) -> Result<()> {
        self.ensure_state(SessionState::Open, "submit an assertion")?;
        if self.tainted {
            return Err(PolicyError::SessionTainted(self.handle));
        }
        let next = assertion.fold(self.auth_hash, &self.expected)?;

        if let Err(e) = assertion.issue(device, self.handle) {
            self.tainted = true;
            return Err(PolicyError::AssertionRejected(e));
        }
        self.expected = next;
        self.assertions += 1;
        debug!(
            "session 0x{:08x}: {:?} accepted ({} so far)",
            self.handle,
            assertion.command(),
            self.assertions
        );
        Ok(())
    }

    /// TPM2_PolicyGetDigest, checked against the local replay
    pub fn finalize<D: PolicyDevice + ?Sized>(&mut self, device: &mut D) -> Result<PolicyDigest> {
        self.ensure_state(SessionState::Open, "finalize")?;
        if self.tainted {
            return Err(PolicyError::SessionTainted(self.handle));
        }

        let bytes = device
            .policy_get_digest(self.handle)
            .map_err(PolicyError::FinalizeFailed)?;
        let expected_len = digest_size(self.auth_hash)?;
        if bytes.len() != expected_len {
            self.tainted = true;
            return Err(PolicyError::DeviceProtocol(format!(
                "policy digest is {} bytes, {:?} needs {}",
                bytes.len(),
                self.auth_hash,
                expected_len
            )));
        }
        if bytes != self.expected {
            self.tainted = true;
            return Err(PolicyError::DeviceProtocol(format!(
                "TPM policy digest {} differs from locally computed {}",
                hex::encode(&bytes),
                hex::encode(&self.expected)
            )));
        }

        self.state = SessionState::Finalized;
        Ok(PolicyDigest::new(bytes))
    }

    /// End this caller's use of the session.
    ///
    /// Trial sessions are flushed. Real sessions are never flushed here; the
    /// returned [`RetainedSession`] carries the live handle to its consumer.
    pub fn teardown<D: PolicyDevice + ?Sized>(self, device: &mut D) -> Result<Teardown> {
        match self.mode {
            SessionMode::Trial => {
                device
                    .flush_context(self.handle)
                    .map_err(PolicyError::FlushFailed)?;
                debug!("flushed trial session 0x{:08x}", self.handle);
                Ok(Teardown::Flushed)
            }
            SessionMode::Real => {
                info!(
                    "retaining policy session 0x{:08x}; the consumer must flush it",
                    self.handle
                );
                Ok(Teardown::Retained(RetainedSession {
                    handle: self.handle,
                    auth_hash: self.auth_hash,
                }))
            }
        }
    }

    /// Best-effort flush on an error path.
    ///
    /// Used when the build sequence fails after the session was opened; a
    /// real session in that state has no consumer, so it is released too.
    pub fn abort<D: PolicyDevice + ?Sized>(self, device: &mut D) {
        if let Err(e) = device.flush_context(self.handle) {
            warn!("failed to flush session 0x{:08x}: {}", self.handle, e);
        }
    }
}
