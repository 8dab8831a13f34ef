// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use sha2::{Digest, Sha256};
use tpm2::{
    tpm_rc, PcrReadOutput, Tpm2bDigest, TpmAlgId, TpmCc, TpmError, TpmSe, TpmlDigest,
    TpmlPcrSelection,
};
use tpm2_policy::{
    build_compound, build_policy, fold_policy_pcr, Destination, ErrorClass, PcrPolicyParams,
    PolicyAssertion, PolicyContext, PolicyDevice, PolicyError, PolicyRequest, PolicySession,
    RegisterSelection, RegisterValue, SessionMode, ValueSource, MAX_PCR_COUNT,
};

const POLICY_HANDLE: u32 = 0x03000000;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    PcrCount,
    Start(TpmSe, TpmAlgId),
    PcrRead(TpmlPcrSelection),
    PolicyPcr(u32, Vec<u8>, TpmlPcrSelection),
    GetDigest(u32),
    Flush(u32),
}

/// Records every command and tracks the policy digest the way a TPM would
struct MockTpm {
    calls: Vec<Call>,
    pcr_count: u32,
    handle: u32,
    fail: Option<(TpmCc, u32)>,
    /// Replaces the selection echoed by PCR_Read
    read_selection: Option<TpmlPcrSelection>,
    /// Replaces the digest returned by PolicyGetDigest
    digest_override: Option<Vec<u8>>,
    auth_hash: TpmAlgId,
    policy: Vec<u8>,
}

impl MockTpm {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            pcr_count: 24,
            handle: POLICY_HANDLE,
            fail: None,
            read_selection: None,
            digest_override: None,
            auth_hash: TpmAlgId::Sha256,
            policy: Vec::new(),
        }
    }

    fn failing(command: TpmCc, code: u32) -> Self {
        Self {
            fail: Some((command, code)),
            ..Self::new()
        }
    }

    fn check(&self, command: TpmCc) -> Result<(), TpmError> {
        match self.fail {
            Some((cc, code)) if cc == command => Err(TpmError::Response { command, code }),
            _ => Ok(()),
        }
    }

    /// Deterministic PCR content: every byte is the PCR index plus one
    fn pcr_value(alg: TpmAlgId, index: u32) -> Vec<u8> {
        vec![index as u8 + 1; alg.digest_size().unwrap()]
    }
}

impl PolicyDevice for MockTpm {
    fn pcr_count(&mut self) -> Result<u32, TpmError> {
        self.calls.push(Call::PcrCount);
        self.check(TpmCc::GetCapability)?;
        Ok(self.pcr_count)
    }

    fn start_policy_session(
        &mut self,
        session_type: TpmSe,
        auth_hash: TpmAlgId,
    ) -> Result<u32, TpmError> {
        self.calls.push(Call::Start(session_type, auth_hash));
        self.check(TpmCc::StartAuthSession)?;
        self.auth_hash = auth_hash;
        self.policy = vec![0; auth_hash.digest_size().unwrap()];
        Ok(self.handle)
    }

    fn pcr_read(&mut self, selection: &TpmlPcrSelection) -> Result<PcrReadOutput, TpmError> {
        self.calls.push(Call::PcrRead(selection.clone()));
        self.check(TpmCc::PcrRead)?;
        let digests = selection
            .pcr_selections
            .iter()
            .flat_map(|sel| {
                sel.selected()
                    .map(move |i| Tpm2bDigest::new(Self::pcr_value(sel.hash, i)))
            })
            .collect();
        Ok(PcrReadOutput {
            update_counter: 42,
            selection: self
                .read_selection
                .clone()
                .unwrap_or_else(|| selection.clone()),
            values: TpmlDigest { digests },
        })
    }

    fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError> {
        self.calls
            .push(Call::PolicyPcr(session, pcr_digest.to_vec(), selection.clone()));
        self.check(TpmCc::PolicyPcr)?;
        self.policy =
            fold_policy_pcr(self.auth_hash, &self.policy, selection, pcr_digest).unwrap();
        Ok(())
    }

    fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>, TpmError> {
        self.calls.push(Call::GetDigest(session));
        self.check(TpmCc::PolicyGetDigest)?;
        Ok(self
            .digest_override
            .clone()
            .unwrap_or_else(|| self.policy.clone()))
    }

    fn flush_context(&mut self, handle: u32) -> Result<(), TpmError> {
        self.calls.push(Call::Flush(handle));
        self.check(TpmCc::FlushContext)
    }
}

fn pcr_request(index: Option<u32>, alg: TpmAlgId, source: ValueSource) -> PolicyRequest {
    PolicyRequest::PcrValue(PcrPolicyParams {
        pcr_index: index,
        pcr_alg: alg,
        source,
    })
}

fn discard() -> Vec<(String, String)> {
    Vec::new()
}

fn device_read(index: u32, alg: TpmAlgId) -> PolicyRequest {
    pcr_request(Some(index), alg, ValueSource::DeviceRead)
}

#[test]
fn test_trial_pcr7_sha256_end_to_end() {
    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();

    let outcome = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(7, TpmAlgId::Sha256),
        &mut sink,
    )
    .unwrap()
    .unwrap();

    let pcr_value = MockTpm::pcr_value(TpmAlgId::Sha256, 7);
    let pcr_digest = Sha256::digest(&pcr_value).to_vec();
    // count=1, TPM_ALG_SHA256, sizeofSelect=3, PCR 7
    let selection_bytes = [0, 0, 0, 1, 0x00, 0x0B, 3, 0x80, 0x00, 0x00];
    let mut hasher = Sha256::new();
    hasher.update([0u8; 32]);
    hasher.update(0x0000017Fu32.to_be_bytes());
    hasher.update(selection_bytes);
    hasher.update(&pcr_digest);
    let expected = hasher.finalize().to_vec();

    assert_eq!(outcome.digest.as_bytes(), expected.as_slice());
    assert_eq!(outcome.digest.size(), 32);
    assert!(outcome.session.is_none());
    assert_eq!(sink, vec![("policy".into(), hex::encode_upper(&expected))]);

    let selection = RegisterSelection::encode(TpmAlgId::Sha256, 7, 24)
        .unwrap()
        .to_tpml();
    assert_eq!(selection.pcr_selections[0].pcr_select, vec![0x80, 0x00, 0x00]);
    assert_eq!(
        tpm.calls,
        vec![
            Call::PcrCount,
            Call::PcrRead(selection.clone()),
            Call::Start(TpmSe::Trial, TpmAlgId::Sha256),
            Call::PolicyPcr(POLICY_HANDLE, pcr_digest, selection),
            Call::GetDigest(POLICY_HANDLE),
            Call::Flush(POLICY_HANDLE),
        ]
    );
}

#[test]
fn test_missing_index_touches_nothing() {
    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &pcr_request(None, TpmAlgId::Sha1, ValueSource::DeviceRead),
        &mut sink,
    )
    .unwrap_err();

    assert!(matches!(err, PolicyError::MissingParameter(_)));
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(tpm.calls.is_empty());
    assert!(sink.is_empty());
}

#[test]
fn test_unsupported_session_hash_touches_nothing() {
    let mut tpm = MockTpm::new();
    let ctx = PolicyContext {
        session_hash: TpmAlgId::Null,
        ..Default::default()
    };
    let err = build_policy(&mut tpm, &ctx, &device_read(0, TpmAlgId::Sha1), &mut discard())
        .unwrap_err();
    assert!(matches!(
        err,
        PolicyError::UnsupportedAlgorithm(TpmAlgId::Null)
    ));
    assert!(tpm.calls.is_empty());
}

#[test]
fn test_no_policy_type_is_noop() {
    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let outcome = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &PolicyRequest::None,
        &mut sink,
    )
    .unwrap();
    assert!(outcome.is_none());
    assert!(tpm.calls.is_empty());
    assert!(sink.is_empty());
}

#[test]
fn test_index_out_of_range_opens_no_session() {
    let mut tpm = MockTpm::new();
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(24, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PolicyError::IndexOutOfRange { index: 24, max: 24 }
    ));
    assert_eq!(tpm.calls, vec![Call::PcrCount]);
}

#[test]
fn test_capability_failures() {
    let mut tpm = MockTpm::new();
    tpm.pcr_count = 0;
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(0, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Capability);
    assert_eq!(tpm.calls, vec![Call::PcrCount]);

    let mut tpm = MockTpm::failing(TpmCc::GetCapability, tpm_rc::VALUE);
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(0, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::CapabilityUnavailable(_)));
    assert_eq!(tpm.calls, vec![Call::PcrCount]);
}

#[test]
fn test_pcr_count_beyond_selection_width() {
    let mut tpm = MockTpm::new();
    tpm.pcr_count = 4096;
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(7, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::CapabilityUnavailable(_)));
    assert_eq!(tpm.calls, vec![Call::PcrCount]);

    tpm.calls.clear();
    tpm.pcr_count = MAX_PCR_COUNT;
    let outcome = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(MAX_PCR_COUNT - 1, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap()
    .unwrap();
    assert_eq!(outcome.digest.as_bytes(), tpm.policy.as_slice());
}

#[test]
fn test_file_supplied_value() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0x5A; 20]).unwrap();
    file.flush().unwrap();

    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let request = pcr_request(
        Some(16),
        TpmAlgId::Sha1,
        ValueSource::FileSupplied(file.path().to_path_buf()),
    );
    build_policy(&mut tpm, &PolicyContext::default(), &request, &mut sink)
        .unwrap()
        .unwrap();

    assert!(!tpm.calls.iter().any(|c| matches!(c, Call::PcrRead(_))));
    let Some(Call::PolicyPcr(_, pcr_digest, selection)) =
        tpm.calls.iter().find(|c| matches!(c, Call::PolicyPcr(..)))
    else {
        panic!("no PolicyPCR issued");
    };
    assert_eq!(pcr_digest, &Sha256::digest([0x5A; 20]).to_vec());
    assert_eq!(selection.pcr_selections[0].hash, TpmAlgId::Sha1);
    assert_eq!(selection.pcr_selections[0].pcr_select, vec![0x00, 0x00, 0x01]);
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_file_size_mismatch_touches_nothing() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 31]).unwrap();
    file.flush().unwrap();

    let mut tpm = MockTpm::new();
    let request = pcr_request(
        Some(0),
        TpmAlgId::Sha256,
        ValueSource::FileSupplied(file.path().to_path_buf()),
    );
    let err = build_policy(&mut tpm, &PolicyContext::default(), &request, &mut discard())
        .unwrap_err();
    assert!(matches!(
        err,
        PolicyError::SizeMismatch {
            expected: 32,
            actual: 31,
            ..
        }
    ));
    assert!(tpm.calls.is_empty());
}

#[test]
fn test_rejected_assertion_still_flushes() {
    let mut tpm = MockTpm::failing(TpmCc::PolicyPcr, tpm_rc::VALUE);
    let mut sink: Vec<(String, String)> = Vec::new();
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(7, TpmAlgId::Sha256),
        &mut sink,
    )
    .unwrap_err();

    assert!(matches!(err, PolicyError::AssertionRejected(_)));
    assert_eq!(err.response_code(), Some(tpm_rc::VALUE));
    assert!(!tpm.calls.contains(&Call::GetDigest(POLICY_HANDLE)));
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(POLICY_HANDLE)));
    assert!(sink.is_empty());
}

#[test]
fn test_session_start_failure() {
    let mut tpm = MockTpm::failing(TpmCc::StartAuthSession, tpm_rc::SESSION_HANDLES);
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(0, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::SessionStartFailed(_)));
    assert_eq!(err.class(), ErrorClass::DeviceProtocol);
    assert!(!tpm.calls.iter().any(|c| matches!(c, Call::Flush(_))));
}

#[test]
fn test_pcr_read_wrong_selection() {
    let mut tpm = MockTpm::new();
    tpm.read_selection = Some(
        RegisterSelection::encode(TpmAlgId::Sha256, 8, 24)
            .unwrap()
            .to_tpml(),
    );
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(7, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::DeviceProtocol(_)));
    assert!(!tpm.calls.iter().any(|c| matches!(c, Call::Start(..))));
}

#[test]
fn test_device_digest_must_match_replay() {
    let mut tpm = MockTpm::new();
    tpm.digest_override = Some(vec![0xEE; 32]);
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(7, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::DeviceProtocol(_)));
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(POLICY_HANDLE)));
}

#[test]
fn test_digest_mismatch_taints_session() {
    let mut tpm = MockTpm::new();
    let mut session = PolicySession::open(&mut tpm, SessionMode::Trial, TpmAlgId::Sha256).unwrap();
    session
        .submit(&mut tpm, &pcr_assertion(7, TpmAlgId::Sha256))
        .unwrap();

    tpm.digest_override = Some(vec![0xEE; 32]);
    assert!(matches!(
        session.finalize(&mut tpm),
        Err(PolicyError::DeviceProtocol(_))
    ));
    assert!(session.is_tainted());

    tpm.digest_override = Some(vec![0xEE; 20]);
    assert!(matches!(
        session.finalize(&mut tpm),
        Err(PolicyError::SessionTainted(POLICY_HANDLE))
    ));
    let digest_reads = tpm
        .calls
        .iter()
        .filter(|c| **c == Call::GetDigest(POLICY_HANDLE))
        .count();
    assert_eq!(digest_reads, 1);

    session.abort(&mut tpm);
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(POLICY_HANDLE)));
}

#[test]
fn test_short_device_digest_taints_session() {
    let mut tpm = MockTpm::new();
    tpm.digest_override = Some(vec![0xEE; 20]);
    let mut session = PolicySession::open(&mut tpm, SessionMode::Trial, TpmAlgId::Sha256).unwrap();
    assert!(matches!(
        session.finalize(&mut tpm),
        Err(PolicyError::DeviceProtocol(_))
    ));
    assert!(session.is_tainted());
    session.abort(&mut tpm);
}

#[test]
fn test_real_session_is_retained() {
    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let ctx = PolicyContext {
        mode: SessionMode::Real,
        ..Default::default()
    };
    let outcome = build_policy(&mut tpm, &ctx, &device_read(0, TpmAlgId::Sha1), &mut sink)
        .unwrap()
        .unwrap();

    assert!(tpm.calls.contains(&Call::Start(TpmSe::Policy, TpmAlgId::Sha256)));
    assert!(!tpm.calls.iter().any(|c| matches!(c, Call::Flush(_))));
    assert_eq!(sink.len(), 2);
    assert_eq!(sink[0].0, "policy");
    assert_eq!(sink[1], ("session-handle".into(), "3000000".into()));

    let retained = outcome.session.unwrap();
    assert_eq!(retained.handle(), POLICY_HANDLE);
    assert_eq!(retained.auth_hash(), TpmAlgId::Sha256);
    retained.flush(&mut tpm).unwrap();
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(POLICY_HANDLE)));
}

#[test]
fn test_file_destination() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pcr.policy");
    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let ctx = PolicyContext {
        destination: Destination::File(path.clone()),
        ..Default::default()
    };
    let outcome = build_policy(&mut tpm, &ctx, &device_read(3, TpmAlgId::Sha256), &mut sink)
        .unwrap()
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), outcome.digest.as_bytes());
    assert!(sink.is_empty());
}

#[test]
fn test_trial_flush_failure_is_reported() {
    let mut tpm = MockTpm::failing(TpmCc::FlushContext, tpm_rc::HANDLE);
    let err = build_policy(
        &mut tpm,
        &PolicyContext::default(),
        &device_read(0, TpmAlgId::Sha256),
        &mut discard(),
    )
    .unwrap_err();
    assert!(matches!(err, PolicyError::FlushFailed(_)));
    assert_eq!(err.response_code(), Some(tpm_rc::HANDLE));
}

#[test]
fn test_non_policy_handle_rejected() {
    let mut tpm = MockTpm::new();
    tpm.handle = 0x02000000;
    let err = PolicySession::open(&mut tpm, SessionMode::Trial, TpmAlgId::Sha256).unwrap_err();
    assert!(matches!(err, PolicyError::DeviceProtocol(_)));
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(0x02000000)));
}

fn pcr_assertion(index: u32, session_hash: TpmAlgId) -> PolicyAssertion {
    let selection = RegisterSelection::encode(TpmAlgId::Sha1, index, 24).unwrap();
    let value = RegisterValue::new(TpmAlgId::Sha1, MockTpm::pcr_value(TpmAlgId::Sha1, index))
        .unwrap();
    PolicyAssertion::pcr_value(selection, &[value], session_hash).unwrap()
}

#[test]
fn test_assertions_compose_in_order() {
    let first = pcr_assertion(0, TpmAlgId::Sha256);
    let second = pcr_assertion(7, TpmAlgId::Sha256);

    let mut tpm = MockTpm::new();
    let mut sink: Vec<(String, String)> = Vec::new();
    let outcome = build_compound(
        &mut tpm,
        &PolicyContext::default(),
        &[first.clone(), second.clone()],
        &mut sink,
    )
    .unwrap();

    let after_first = first.fold(TpmAlgId::Sha256, &[0; 32]).unwrap();
    let after_second = second.fold(TpmAlgId::Sha256, &after_first).unwrap();
    assert_eq!(outcome.digest.as_bytes(), after_second.as_slice());

    let single = build_compound(
        &mut MockTpm::new(),
        &PolicyContext::default(),
        &[second],
        &mut discard(),
    )
    .unwrap();
    assert_ne!(single.digest, outcome.digest);
}

#[test]
fn test_sm3_session() {
    let mut tpm = MockTpm::new();
    let ctx = PolicyContext {
        session_hash: TpmAlgId::Sm3_256,
        ..Default::default()
    };
    let outcome = build_policy(&mut tpm, &ctx, &device_read(1, TpmAlgId::Sha1), &mut discard())
        .unwrap()
        .unwrap();
    assert_eq!(outcome.digest.size(), 32);
    assert!(tpm.calls.contains(&Call::Start(TpmSe::Trial, TpmAlgId::Sm3_256)));
}

#[test]
fn test_tainted_session_refuses_finalize() {
    let mut tpm = MockTpm::failing(TpmCc::PolicyPcr, tpm_rc::POLICY_FAIL);
    let mut session = PolicySession::open(&mut tpm, SessionMode::Trial, TpmAlgId::Sha256).unwrap();
    let assertion = pcr_assertion(0, TpmAlgId::Sha256);

    assert!(matches!(
        session.submit(&mut tpm, &assertion),
        Err(PolicyError::AssertionRejected(_))
    ));
    assert!(session.is_tainted());
    assert_eq!(session.assertion_count(), 0);
    assert!(matches!(
        session.finalize(&mut tpm),
        Err(PolicyError::SessionTainted(POLICY_HANDLE))
    ));
    assert!(matches!(
        session.submit(&mut tpm, &assertion),
        Err(PolicyError::SessionTainted(_))
    ));
    assert!(!tpm.calls.contains(&Call::GetDigest(POLICY_HANDLE)));

    session.abort(&mut tpm);
    assert_eq!(tpm.calls.last(), Some(&Call::Flush(POLICY_HANDLE)));
}

#[test]
fn test_finalized_session_accepts_nothing_more() {
    let mut tpm = MockTpm::new();
    let mut session = PolicySession::open(&mut tpm, SessionMode::Trial, TpmAlgId::Sha256).unwrap();
    let assertion = pcr_assertion(2, TpmAlgId::Sha256);
    assert_eq!(session.mode(), SessionMode::Trial);
    session.submit(&mut tpm, &assertion).unwrap();
    assert_eq!(session.assertion_count(), 1);
    session.finalize(&mut tpm).unwrap();

    assert!(matches!(
        session.submit(&mut tpm, &assertion),
        Err(PolicyError::InvalidState { .. })
    ));
    assert!(matches!(
        session.finalize(&mut tpm),
        Err(PolicyError::InvalidState { .. })
    ));
    session.teardown(&mut tpm).unwrap();
}
