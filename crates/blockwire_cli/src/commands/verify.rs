//! Verify command implementation.

use super::{open_log, CliError, Format};
use blockwire_codec::{BufferPool, DEFAULT_BLOCK_SIZE};
use blockwire_core::{inspect, verify_log, CoreError, Rejection, VerifyReport};
use blockwire_storage::StorageBackend;
use serde::Serialize;
use std::path::Path;

/// Verification result.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    /// Boundary check: forward and backward scans agree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<VerifyReport>,
    /// Records replay refused.
    pub rejected: Vec<Rejection>,
    /// Structural damage, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption: Option<String>,
}

impl VerifyResult {
    /// A torn tail alone does not fail verification; opening repairs it.
    pub fn is_ok(&self) -> bool {
        self.corruption.is_none() && self.rejected.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_log(path)?;
    let result = check(&backend)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_result(path, &result),
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err(CliError::VerificationFailed.into())
    }
}

/// Scans the log both ways, then replays it to find rejected records.
///
/// Corruption is part of the result; only storage failures are errors.
pub fn check(backend: &dyn StorageBackend) -> Result<VerifyResult, CoreError> {
    let pool = BufferPool::new(DEFAULT_BLOCK_SIZE);
    let mut result = VerifyResult {
        scan: None,
        rejected: Vec::new(),
        corruption: None,
    };

    match verify_log(backend, &pool) {
        Ok(report) => result.scan = Some(report),
        Err(err @ CoreError::LogCorruption { .. }) => {
            result.corruption = Some(err.to_string());
            return Ok(result);
        }
        Err(err) => return Err(err),
    }

    match inspect(backend, pool) {
        Ok((_, report)) => result.rejected = report.rejected,
        Err(err @ CoreError::LogCorruption { .. }) => result.corruption = Some(err.to_string()),
        Err(err) => return Err(err),
    }
    Ok(result)
}

fn print_result(path: &Path, result: &VerifyResult) {
    println!("Verifying log at {}", path.display());
    if let Some(scan) = &result.scan {
        println!("  Records:     {}", scan.records);
        println!("  End offset:  {}", scan.end_offset);
        if let Some(offset) = scan.torn_tail {
            println!("  Torn tail:   incomplete record at {offset}");
        }
    }
    for rejection in &result.rejected {
        println!(
            "  Rejected:    offset {} (def {}): {}",
            rejection.offset, rejection.definition, rejection.reason
        );
    }
    if let Some(corruption) = &result.corruption {
        println!("  Corruption:  {corruption}");
    }
    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
    } else {
        println!("✗ Log verification failed");
    }
}
