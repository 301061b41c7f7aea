//! Keypair generation.

use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rand_core::OsRng;

use apkseal_core::write_atomically;

use crate::KeyAlgorithm;

/// Generate a keypair: PKCS#8 DER private key at `output`, SPKI DER public
/// key next to it.
pub fn keygen(algorithm: KeyAlgorithm, output: &Path) -> Result<()> {
    let (private_der, public_der) = match algorithm {
        KeyAlgorithm::Ed25519 => {
            let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
            (
                key.to_pkcs8_der().context("encoding private key")?,
                key.verifying_key()
                    .to_public_key_der()
                    .context("encoding public key")?,
            )
        }
        KeyAlgorithm::P256 => {
            let key = p256::ecdsa::SigningKey::random(&mut OsRng);
            (
                key.to_pkcs8_der().context("encoding private key")?,
                key.verifying_key()
                    .to_public_key_der()
                    .context("encoding public key")?,
            )
        }
    };

    write_atomically(output, private_der.as_bytes())?;
    let public_path = output.with_extension("pub");
    write_atomically(&public_path, public_der.as_bytes())?;
    println!(
        "wrote {} and {}",
        output.display(),
        public_path.display()
    );
    Ok(())
}
