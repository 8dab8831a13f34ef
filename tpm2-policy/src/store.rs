// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Persisting or emitting a finished policy digest

use std::io::{self, Write};
use std::path::PathBuf;

use fs_err as fs;
use tracing::info;

use crate::error::{PolicyError, Result};

/// The cumulative digest a finalized session reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDigest {
    bytes: Vec<u8>,
}

impl PolicyDigest {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

/// Where the digest goes; exactly one per build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    /// Raw digest bytes written to this path
    File(PathBuf),
    /// Uppercase hex handed to the output sink under `policy`
    #[default]
    Emit,
}

/// Structured key/value output channel
pub trait OutputSink {
    fn emit(&mut self, key: &str, value: &str) -> Result<()>;
}

/// Prints `key: value` lines to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&mut self, key: &str, value: &str) -> Result<()> {
        writeln!(io::stdout().lock(), "{key}: {value}").map_err(|source| PolicyError::Emit {
            key: key.to_string(),
            source,
        })
    }
}

/// Collects emitted pairs in order
impl OutputSink for Vec<(String, String)> {
    fn emit(&mut self, key: &str, value: &str) -> Result<()> {
        self.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Write the digest to its destination
pub fn persist<S: OutputSink + ?Sized>(
    digest: &PolicyDigest,
    destination: &Destination,
    sink: &mut S,
) -> Result<()> {
    match destination {
        Destination::File(path) => {
            fs::write(path, digest.as_bytes()).map_err(|source| PolicyError::WriteFailed {
                path: path.clone(),
                source,
            })?;
            info!("saved {}-byte policy digest to {}", digest.size(), path.display());
            Ok(())
        }
        Destination::Emit => sink.emit("policy", &digest.to_hex_upper()),
    }
}
