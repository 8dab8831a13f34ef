// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tpm2::{TpmAlgId, TpmContext};
use tpm2_policy::{
    build_policy, Destination, PcrPolicyParams, PolicyContext, PolicyRequest, SessionMode,
    StdoutSink, ValueSource,
};
use tracing::info;

/// Build a TPM 2.0 policy digest
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Build a PCR policy
    #[arg(short = 'P', long)]
    policy_pcr: bool,

    /// PCR to bind the policy to
    #[arg(short = 'i', long)]
    pcr_index: Option<u32>,

    /// PCR bank algorithm
    #[arg(short = 'g', long, default_value = "sha1", value_parser = parse_hash_alg)]
    pcr_alg: TpmAlgId,

    /// Use the raw PCR value in this file instead of reading the TPM
    #[arg(short = 'F', long)]
    pcr_input_file: Option<PathBuf>,

    /// Write the raw policy digest here instead of printing it
    #[arg(short = 'f', long)]
    policy_file: Option<PathBuf>,

    /// Keep a real policy session open instead of a trial session
    #[arg(short = 'r', long)]
    real_session: bool,

    /// Session hash algorithm, which is also the policy digest algorithm
    #[arg(long, default_value = "sha256", value_parser = parse_hash_alg)]
    session_alg: TpmAlgId,

    /// TPM device path, auto-detected when omitted
    #[arg(short = 'T', long, env = "TPM2_DEVICE")]
    tcti: Option<String>,
}

fn parse_hash_alg(name: &str) -> Result<TpmAlgId> {
    match TpmAlgId::from_name(name) {
        Some(alg) if alg.digest_size().is_some() => Ok(alg),
        _ => anyhow::bail!("unsupported hash algorithm: {name}"),
    }
}

impl Args {
    fn request(&self) -> PolicyRequest {
        if !self.policy_pcr {
            return PolicyRequest::None;
        }
        let source = match &self.pcr_input_file {
            Some(path) => ValueSource::FileSupplied(path.clone()),
            None => ValueSource::DeviceRead,
        };
        PolicyRequest::PcrValue(PcrPolicyParams {
            pcr_index: self.pcr_index,
            pcr_alg: self.pcr_alg,
            source,
        })
    }

    fn context(&self) -> PolicyContext {
        PolicyContext {
            mode: if self.real_session {
                SessionMode::Real
            } else {
                SessionMode::Trial
            },
            session_hash: self.session_alg,
            destination: match &self.policy_file {
                Some(path) => Destination::File(path.clone()),
                None => Destination::Emit,
            },
        }
    }
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    let request = args.request();
    if request == PolicyRequest::None {
        info!("no policy type selected, nothing to do");
        return Ok(());
    }

    let mut tpm = TpmContext::new(args.tcti.as_deref()).context("failed to open TPM")?;
    info!("using TPM device {}", tpm.device_path().display());

    let outcome = build_policy(&mut tpm, &args.context(), &request, &mut StdoutSink)?;
    if let Some(retained) = outcome.and_then(|o| o.session) {
        // Not flushed: the handle belongs to the next command that presents it.
        let handle = retained.into_handle();
        info!("policy session 0x{:08x} left open", handle);
    }
    Ok(())
}
