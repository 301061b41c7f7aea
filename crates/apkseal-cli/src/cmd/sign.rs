//! Sign command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use apkseal_core::{
    KeyringSigner, Lineage, SchemeSet, SigningRequest, SlicedContent, TargetedSignerConfig,
    write_atomically,
};

use crate::zip;

/// Everything the sign subcommand was invoked with.
#[derive(Debug)]
pub struct SignArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    pub keys: Vec<PathBuf>,
    pub targets: Vec<u32>,
    pub lineage: Option<PathBuf>,
    pub rotation_min_sdk: Option<u32>,
    pub no_v2: bool,
    pub no_v3: bool,
    pub no_v31: bool,
    pub v4: bool,
    pub preserve_foreign: bool,
    pub min_sdk: u32,
}

/// Sign a package and write the result atomically.
pub fn sign(args: &SignArgs) -> Result<()> {
    if args.targets.len() > args.keys.len() {
        bail!("more --target values than --key values");
    }

    let mut signers = Vec::with_capacity(args.keys.len());
    for (index, path) in args.keys.iter().enumerate() {
        let der = std::fs::read(path)
            .with_context(|| format!("reading key {}", path.display()))?;
        let key = KeyringSigner::from_pkcs8_der(&der)
            .with_context(|| format!("parsing key {}", path.display()))?;
        let identity = apkseal_core::SignerIdentity::new(Arc::new(key));
        let target = args.targets.get(index).copied().unwrap_or(0);
        signers.push(if target == 0 {
            TargetedSignerConfig::untargeted(identity)
        } else {
            TargetedSignerConfig::targeting(identity, target)
        });
    }

    let lineage = args
        .lineage
        .as_deref()
        .map(|path| -> Result<Lineage> {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading lineage {}", path.display()))?;
            Lineage::from_bytes(&bytes).context("parsing lineage")
        })
        .transpose()?;

    // A targeted signer gets the shared lineage attached, cut down to end
    // at its own certificate.
    if let Some(lineage) = &lineage {
        for config in &mut signers {
            if config.min_sdk != 0 && config.lineage.is_none() {
                config.lineage = Some(lineage.truncate(config.identity.leaf())?);
            }
        }
    }

    let buf = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let layout = zip::split(&buf)?;

    let request = SigningRequest {
        signers,
        schemes: SchemeSet {
            v1: false,
            v2: !args.no_v2,
            v3: !args.no_v3,
            v31: !args.no_v31,
            v4: args.v4,
        },
        min_sdk: args.min_sdk,
        rotation_min_sdk: args.rotation_min_sdk,
        lineage,
        preserve_foreign_entries: args.preserve_foreign,
        ..SigningRequest::default()
    }
    .finalize()?;

    let source = SlicedContent {
        entries: layout.entries,
        central_directory: layout.central_directory,
        eocd: layout.eocd,
    };
    let signed = apkseal_core::sign(&request, &source, layout.signing_block)?;

    let out = zip::assemble(&layout, &signed.bytes);
    write_atomically(&args.output, &out)?;
    tracing::info!(path = %args.output.display(), "wrote signed package");

    if let Some(handoff) = signed.v4_digest {
        println!("v4 digest: {}", hex::encode(&handoff.digest));
        for cert in &handoff.certificates {
            println!("v4 certificate: {}", cert.fingerprint());
        }
    }
    Ok(())
}
