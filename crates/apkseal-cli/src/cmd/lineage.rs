//! Lineage file management.

use std::path::Path;

use anyhow::{Context, Result};

use apkseal_core::{KeyringSigner, Lineage, SignerCapability, write_atomically};
use apkseal_schema::{Capabilities, SignatureAlgorithm};

fn load_key(path: &Path) -> Result<KeyringSigner> {
    let der =
        std::fs::read(path).with_context(|| format!("reading key {}", path.display()))?;
    KeyringSigner::from_pkcs8_der(&der)
        .with_context(|| format!("parsing key {}", path.display()))
}

fn load_lineage(path: &Path) -> Result<Lineage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading lineage {}", path.display()))?;
    Lineage::from_bytes(&bytes).context("parsing lineage")
}

/// Start a new lineage rooted at `key`'s certificate.
pub fn create(key: &Path, output: &Path) -> Result<()> {
    let signer = load_key(key)?;
    let lineage = Lineage::new_root(signer.certificate().clone(), Capabilities::all());
    write_atomically(output, &lineage.encode())?;
    println!("created lineage at {}", signer.certificate().fingerprint());
    Ok(())
}

/// Append a rotation from `old_key` to `new_key`.
pub fn rotate(
    lineage: &Path,
    old_key: &Path,
    new_key: &Path,
    caps: Option<u32>,
    output: &Path,
) -> Result<()> {
    let chain = load_lineage(lineage)?;
    let old = load_key(old_key)?;
    let new = load_key(new_key)?;

    let capabilities = caps.map_or_else(Capabilities::default, Capabilities::from_bits);
    let algorithm = old
        .algorithms()
        .first()
        .copied()
        .unwrap_or(SignatureAlgorithm::Ed25519);
    let rotated = chain.rotate(&old, new.certificate().clone(), capabilities, algorithm)?;
    write_atomically(output, &rotated.encode())?;
    println!(
        "rotated to {} ({} nodes)",
        new.certificate().fingerprint(),
        rotated.len()
    );
    Ok(())
}

/// Print a lineage's nodes.
pub fn inspect(lineage: &Path, json: bool) -> Result<()> {
    let chain = load_lineage(lineage)?;
    if json {
        let nodes: Vec<_> = chain
            .nodes()
            .iter()
            .map(|n| {
                serde_json::json!({
                    "certificate": n.certificate.fingerprint(),
                    "capabilities": n.capabilities.bits(),
                    "rotated": n.proof.is_some(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&nodes)?);
    } else {
        for (index, node) in chain.nodes().iter().enumerate() {
            println!(
                "{index}: {} caps={:#07b}{}",
                node.certificate.fingerprint(),
                node.capabilities.bits(),
                if node.proof.is_some() { "" } else { " (root)" }
            );
        }
    }
    Ok(())
}
