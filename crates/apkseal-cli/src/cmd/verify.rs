//! Verify command.

use std::path::Path;

use anyhow::{Context, Result, bail};

use apkseal_core::SchemeSet;
use apkseal_core::orchestrator::SchemeStatus;
use apkseal_schema::PlatformEnv;

use crate::zip;

/// Verify a package's signing block and print the per-scheme report.
pub fn verify(input: &Path, json: bool, min_sdk: u32, max_sdk: u32) -> Result<()> {
    if min_sdk > max_sdk {
        bail!("--min-sdk is above --max-sdk");
    }
    let buf =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let layout = zip::split(&buf)?;
    let Some(block) = layout.signing_block else {
        bail!("package has no signing block");
    };

    let source = apkseal_core::SlicedContent {
        entries: layout.entries,
        central_directory: layout.central_directory,
        eocd: layout.eocd,
    };
    let report = apkseal_core::verify(
        &source,
        block,
        SchemeSet::default(),
        (min_sdk, max_sdk),
        &PlatformEnv::default(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        for scheme in &report.schemes {
            let status = match scheme.status {
                SchemeStatus::NotUsed => "not used",
                SchemeStatus::Verified => "verified",
                SchemeStatus::Failed => "FAILED",
            };
            println!("{:>5}  {status}", scheme.version.to_string());
            for cert in &scheme.certificates {
                println!("       signer {}", cert.fingerprint());
            }
            for error in &scheme.errors {
                println!("       error: {error}");
            }
        }
        for error in &report.errors {
            println!("error: {error}");
        }
        if let Some(lineage) = &report.lineage {
            println!("lineage ({} nodes):", lineage.len());
            for node in lineage.nodes() {
                println!("  {}", node.certificate.fingerprint());
            }
        }
        println!(
            "{}",
            if report.verified() {
                "VERIFIED"
            } else {
                "NOT VERIFIED"
            }
        );
    }

    if report.verified() {
        Ok(())
    } else {
        bail!("verification failed")
    }
}
