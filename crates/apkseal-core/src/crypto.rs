//! Certificates and the pluggable signing capability.
//!
//! The engine never touches raw signature math: signing goes through the
//! [`SignerCapability`] trait and verification through [`Certificate`],
//! both delegating to the `rsa`, `p256` and `ed25519-dalek` crates. Public
//! keys travel as self-describing SPKI DER, which keeps certificate file
//! loading (an external concern) out of this crate entirely.

use std::fmt;
use std::sync::Arc;

use apkseal_schema::SignatureAlgorithm;
use apkseal_schema::sdk::ApiLevel;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256, Sha512};
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};

use crate::error::CryptoError;

/// A signer's certificate: opaque SPKI DER plus the parsed public key.
///
/// Equality and hashing are over the encoded bytes, which is what every
/// membership check in a lineage or signer set means.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    key: PublicKey,
}

/// Parsed public key behind a [`Certificate`].
#[derive(Clone)]
enum PublicKey {
    Rsa(rsa::RsaPublicKey),
    EcP256(p256::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl Certificate {
    /// Parse a certificate from SPKI DER bytes.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = if let Ok(k) = rsa::RsaPublicKey::from_public_key_der(der) {
            PublicKey::Rsa(k)
        } else if let Ok(k) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            PublicKey::EcP256(k)
        } else if let Ok(k) = ed25519_dalek::VerifyingKey::from_public_key_der(der) {
            PublicKey::Ed25519(k)
        } else {
            return Err(CryptoError::MalformedKey(
                "SPKI DER is not an RSA, P-256 or Ed25519 key".into(),
            ));
        };
        Ok(Self {
            der: der.to_vec(),
            key,
        })
    }

    /// The encoded form carried in signed-data payloads and lineages.
    pub fn encoded(&self) -> &[u8] {
        &self.der
    }

    /// Hex SHA2-256 fingerprint of the encoded certificate.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Size of the underlying key in bits (modulus size for RSA).
    pub fn key_bits(&self) -> usize {
        match &self.key {
            PublicKey::Rsa(k) => rsa::traits::PublicKeyParts::size(k) * 8,
            PublicKey::EcP256(_) => 256,
            PublicKey::Ed25519(_) => 255,
        }
    }

    /// Whether the key is strong enough for block signing. RSA under 2048
    /// bits is rejected; the other families have fixed, sufficient sizes.
    pub fn meets_minimum_strength(&self) -> bool {
        match &self.key {
            PublicKey::Rsa(k) => rsa::traits::PublicKeyParts::size(k) * 8 >= 2048,
            PublicKey::EcP256(_) | PublicKey::Ed25519(_) => true,
        }
    }

    /// Check `signature` over `message` under `algorithm`.
    ///
    /// Returns `Ok(false)` for a signature that simply does not verify
    /// (including undecodable signature bytes); errors are reserved for
    /// algorithm/key mismatches this certificate can never satisfy.
    pub fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        match (algorithm, &self.key) {
            (SignatureAlgorithm::RsaPkcs1Sha256, PublicKey::Rsa(k)) => {
                let vk = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(k.clone());
                Ok(decode_and_verify::<rsa::pkcs1v15::Signature, _>(&vk, message, signature))
            }
            (SignatureAlgorithm::RsaPkcs1Sha512, PublicKey::Rsa(k)) => {
                let vk = rsa::pkcs1v15::VerifyingKey::<Sha512>::new(k.clone());
                Ok(decode_and_verify::<rsa::pkcs1v15::Signature, _>(&vk, message, signature))
            }
            (SignatureAlgorithm::RsaPssSha256, PublicKey::Rsa(k)) => {
                let vk = rsa::pss::VerifyingKey::<Sha256>::new(k.clone());
                Ok(decode_and_verify::<rsa::pss::Signature, _>(&vk, message, signature))
            }
            (SignatureAlgorithm::RsaPssSha512, PublicKey::Rsa(k)) => {
                let vk = rsa::pss::VerifyingKey::<Sha512>::new(k.clone());
                Ok(decode_and_verify::<rsa::pss::Signature, _>(&vk, message, signature))
            }
            (SignatureAlgorithm::EcdsaSha256, PublicKey::EcP256(k)) => {
                let Ok(sig) = p256::ecdsa::Signature::from_der(signature) else {
                    return Ok(false);
                };
                Ok(k.verify(message, &sig).is_ok())
            }
            (SignatureAlgorithm::Ed25519, PublicKey::Ed25519(k)) => {
                let Ok(sig) = ed25519_dalek::Signature::try_from(signature) else {
                    return Ok(false);
                };
                Ok(k.verify(message, &sig).is_ok())
            }
            (SignatureAlgorithm::DsaSha256, _) => {
                Err(CryptoError::UnsupportedAlgorithm(algorithm.id()))
            }
            _ => Err(CryptoError::KeyMismatch),
        }
    }
}

fn decode_and_verify<'a, S, V>(verifier: &V, message: &[u8], signature: &'a [u8]) -> bool
where
    S: TryFrom<&'a [u8]>,
    V: Verifier<S>,
{
    match S::try_from(signature) {
        Ok(sig) => verifier.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl std::hash::Hash for Certificate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.der.hash(state);
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint())
            .field("key_bits", &self.key_bits())
            .finish()
    }
}

/// The opaque signing capability a [`SignerIdentity`] carries.
///
/// Implementations produce a raw signature over `message`; they never see
/// package bytes directly, only the pre-assembled signed-data payloads.
pub trait SignerCapability: fmt::Debug + Send + Sync {
    /// Leaf certificate corresponding to the signing key.
    fn certificate(&self) -> &Certificate;

    /// Algorithms this capability signs with, strongest-preferred first.
    fn algorithms(&self) -> Vec<SignatureAlgorithm>;

    /// Sign `message` with `algorithm`.
    fn sign(&self, algorithm: SignatureAlgorithm, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// A signer: certificate chain (leaf first) plus its signing capability.
#[derive(Debug, Clone)]
pub struct SignerIdentity {
    /// Certificate chain, leaf first.
    pub certificates: Vec<Certificate>,
    /// The capability that produces signatures for the leaf key.
    pub capability: Arc<dyn SignerCapability>,
}

impl SignerIdentity {
    /// Build an identity whose chain is just the capability's own leaf.
    pub fn new(capability: Arc<dyn SignerCapability>) -> Self {
        let certificates = vec![capability.certificate().clone()];
        Self {
            certificates,
            capability,
        }
    }

    /// Leaf certificate of the chain.
    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }
}

impl PartialEq for SignerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.certificates == other.certificates
    }
}

/// In-crate [`SignerCapability`] over a private key held in memory.
///
/// Keys arrive as PKCS#8 DER; the certificate is derived from the key's
/// public half, so a `KeyringSigner` is always self-consistent.
pub struct KeyringSigner {
    key: PrivateKey,
    certificate: Certificate,
    algorithms: Vec<SignatureAlgorithm>,
}

enum PrivateKey {
    Rsa(rsa::RsaPrivateKey),
    EcP256(p256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl KeyringSigner {
    /// Import a PKCS#8 DER private key, deriving certificate and default
    /// algorithm list from the key type.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        if let Ok(k) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            return Self::from_private_key(PrivateKey::Rsa(k));
        }
        if let Ok(k) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Self::from_private_key(PrivateKey::EcP256(k));
        }
        if let Ok(k) = ed25519_dalek::SigningKey::from_pkcs8_der(der) {
            return Self::from_private_key(PrivateKey::Ed25519(k));
        }
        Err(CryptoError::MalformedKey(
            "PKCS#8 DER is not an RSA, P-256 or Ed25519 key".into(),
        ))
    }

    /// Wrap an in-memory Ed25519 key.
    pub fn from_ed25519(key: ed25519_dalek::SigningKey) -> Result<Self, CryptoError> {
        Self::from_private_key(PrivateKey::Ed25519(key))
    }

    /// Wrap an in-memory P-256 key.
    pub fn from_p256(key: p256::ecdsa::SigningKey) -> Result<Self, CryptoError> {
        Self::from_private_key(PrivateKey::EcP256(key))
    }

    /// Wrap an in-memory RSA key.
    pub fn from_rsa(key: rsa::RsaPrivateKey) -> Result<Self, CryptoError> {
        Self::from_private_key(PrivateKey::Rsa(key))
    }

    fn from_private_key(key: PrivateKey) -> Result<Self, CryptoError> {
        let spki = match &key {
            PrivateKey::Rsa(k) => k
                .to_public_key()
                .to_public_key_der()
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?,
            PrivateKey::EcP256(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?,
            PrivateKey::Ed25519(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?,
        };
        let certificate = Certificate::from_spki_der(spki.as_bytes())?;
        let algorithms = default_algorithms(&key);
        Ok(Self {
            key,
            certificate,
            algorithms,
        })
    }

    /// Replace the default algorithm list, e.g. to opt an RSA key into PSS.
    pub fn with_algorithms(mut self, algorithms: Vec<SignatureAlgorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Reject keys too weak for the platform range being targeted.
    pub fn check_strength(&self, min_sdk: ApiLevel) -> Result<(), CryptoError> {
        let bits = self.certificate.key_bits();
        if matches!(self.key, PrivateKey::Rsa(_)) && bits < 2048 {
            return Err(CryptoError::WeakKey { bits, min_sdk });
        }
        Ok(())
    }
}

/// Digest strength follows key strength: big RSA moduli get SHA2-512.
fn default_algorithms(key: &PrivateKey) -> Vec<SignatureAlgorithm> {
    match key {
        PrivateKey::Rsa(k) => {
            if rsa::traits::PublicKeyParts::size(k) * 8 >= 3072 {
                vec![SignatureAlgorithm::RsaPkcs1Sha512]
            } else {
                vec![SignatureAlgorithm::RsaPkcs1Sha256]
            }
        }
        PrivateKey::EcP256(_) => vec![SignatureAlgorithm::EcdsaSha256],
        PrivateKey::Ed25519(_) => vec![SignatureAlgorithm::Ed25519],
    }
}

impl SignerCapability for KeyringSigner {
    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn algorithms(&self) -> Vec<SignatureAlgorithm> {
        self.algorithms.clone()
    }

    fn sign(&self, algorithm: SignatureAlgorithm, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match (algorithm, &self.key) {
            (SignatureAlgorithm::RsaPkcs1Sha256, PrivateKey::Rsa(k)) => {
                let sk = rsa::pkcs1v15::SigningKey::<Sha256>::new(k.clone());
                Ok(sk.sign(message).to_vec())
            }
            (SignatureAlgorithm::RsaPkcs1Sha512, PrivateKey::Rsa(k)) => {
                let sk = rsa::pkcs1v15::SigningKey::<Sha512>::new(k.clone());
                Ok(sk.sign(message).to_vec())
            }
            (SignatureAlgorithm::RsaPssSha256, PrivateKey::Rsa(k)) => {
                let sk = rsa::pss::SigningKey::<Sha256>::new(k.clone());
                Ok(sk.sign_with_rng(&mut OsRng, message).to_vec())
            }
            (SignatureAlgorithm::RsaPssSha512, PrivateKey::Rsa(k)) => {
                let sk = rsa::pss::SigningKey::<Sha512>::new(k.clone());
                Ok(sk.sign_with_rng(&mut OsRng, message).to_vec())
            }
            (SignatureAlgorithm::EcdsaSha256, PrivateKey::EcP256(k)) => {
                let sig: p256::ecdsa::Signature = k.sign(message);
                Ok(sig.to_der().as_bytes().to_vec())
            }
            (SignatureAlgorithm::Ed25519, PrivateKey::Ed25519(k)) => {
                Ok(k.sign(message).to_vec())
            }
            (SignatureAlgorithm::DsaSha256, _) => {
                Err(CryptoError::UnsupportedAlgorithm(algorithm.id()))
            }
            _ => Err(CryptoError::KeyMismatch),
        }
    }
}

impl fmt::Debug for KeyringSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyringSigner")
            .field("certificate", &self.certificate)
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn ed25519_signer() -> KeyringSigner {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        KeyringSigner::from_ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)).unwrap()
    }

    fn p256_signer() -> KeyringSigner {
        let mut seed = [0u8; 32];
        loop {
            rand::rng().fill_bytes(&mut seed);
            if let Ok(key) = p256::ecdsa::SigningKey::from_slice(&seed) {
                return KeyringSigner::from_p256(key).unwrap();
            }
        }
    }

    #[test]
    fn ed25519_sign_verify_round_trip() {
        let signer = ed25519_signer();
        let sig = signer.sign(SignatureAlgorithm::Ed25519, b"payload").unwrap();
        assert!(
            signer
                .certificate()
                .verify(SignatureAlgorithm::Ed25519, b"payload", &sig)
                .unwrap()
        );
        assert!(
            !signer
                .certificate()
                .verify(SignatureAlgorithm::Ed25519, b"tampered", &sig)
                .unwrap()
        );
    }

    #[test]
    fn ecdsa_sign_verify_round_trip() {
        let signer = p256_signer();
        let sig = signer.sign(SignatureAlgorithm::EcdsaSha256, b"payload").unwrap();
        assert!(
            signer
                .certificate()
                .verify(SignatureAlgorithm::EcdsaSha256, b"payload", &sig)
                .unwrap()
        );
    }

    #[test]
    fn mismatched_key_family_is_rejected() {
        let signer = ed25519_signer();
        let err = signer
            .sign(SignatureAlgorithm::RsaPkcs1Sha256, b"payload")
            .unwrap_err();
        assert!(matches!(err, CryptoError::KeyMismatch));
    }

    #[test]
    fn dsa_is_unsupported() {
        let signer = ed25519_signer();
        let err = signer.sign(SignatureAlgorithm::DsaSha256, b"payload").unwrap_err();
        assert!(matches!(err, CryptoError::UnsupportedAlgorithm(0x0301)));
    }

    #[test]
    fn certificate_round_trips_through_spki() {
        let signer = ed25519_signer();
        let der = signer.certificate().encoded().to_vec();
        let reparsed = Certificate::from_spki_der(&der).unwrap();
        assert_eq!(&reparsed, signer.certificate());
    }

    #[test]
    fn garbage_spki_is_rejected() {
        assert!(Certificate::from_spki_der(b"not a key").is_err());
    }
}
