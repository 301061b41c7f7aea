//! Signing-certificate lineage: the append-only rotation proof chain.
//!
//! A lineage is an ordered sequence of nodes, oldest first. Node 0 is the
//! root of trust and carries no proof; every later node carries a
//! proof-of-rotation signature made by the previous node's key over the
//! canonical encoding of (previous certificate, this certificate, this
//! node's capability bits). Decoding a persisted lineage and validating the
//! proof chain are separate steps so each can be exercised independently.

use apkseal_schema::{Capabilities, SignatureAlgorithm};

use crate::crypto::{Certificate, SignerCapability};
use crate::error::{ConfigError, Result, SealError};
use crate::wire::{Reader, put_len_prefixed};

/// Persisted-stream magic; the version follows as a little-endian u32.
const LINEAGE_MAGIC: &[u8; 8] = b"lineage1";
const LINEAGE_VERSION: u32 = 1;

/// Proof-of-rotation signature attached to every non-root node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Algorithm the previous node's key signed with.
    pub algorithm: SignatureAlgorithm,
    /// The raw signature bytes.
    pub signature: Vec<u8>,
}

/// One link of the rotation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageNode {
    /// Certificate of the key this node introduces.
    pub certificate: Certificate,
    /// Capabilities the key retains after any later rotation.
    pub capabilities: Capabilities,
    /// Endorsement by the previous node's key; `None` only for the root.
    pub proof: Option<Proof>,
}

/// A validated rotation chain. Instances only exist for sequences whose
/// every proof has been checked, so consumers never re-verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    nodes: Vec<LineageNode>,
}

impl Lineage {
    /// Start a fresh lineage at a root certificate.
    pub fn new_root(certificate: Certificate, capabilities: Capabilities) -> Self {
        Self {
            nodes: vec![LineageNode {
                certificate,
                capabilities,
                proof: None,
            }],
        }
    }

    /// Extend the chain by one rotation: `parent` must hold the current
    /// newest key and endorses `new_cert` with `algorithm`.
    pub fn rotate(
        &self,
        parent: &dyn SignerCapability,
        new_cert: Certificate,
        capabilities: Capabilities,
        algorithm: SignatureAlgorithm,
    ) -> Result<Self> {
        let newest = self.newest();
        if parent.certificate() != &newest.certificate {
            return Err(ConfigError::SignerNotInLineage.into());
        }
        let message = proof_message(&newest.certificate, &new_cert, capabilities);
        let signature = parent.sign(algorithm, &message)?;
        let mut nodes = self.nodes.clone();
        nodes.push(LineageNode {
            certificate: new_cert,
            capabilities,
            proof: Some(Proof {
                algorithm,
                signature,
            }),
        });
        Ok(Self { nodes })
    }

    /// Append an externally-built node, verifying its proof against the
    /// current newest certificate.
    pub fn append_node(&self, node: LineageNode) -> Result<Self> {
        let index = self.nodes.len();
        verify_link(self.newest(), &node, index)?;
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Ok(Self { nodes })
    }

    /// Merge two chains. Succeeds only when one is an exact prefix of the
    /// other; the longer chain is returned.
    pub fn merge(a: &Self, b: &Self) -> Result<Self> {
        let (short, long) = if a.nodes.len() <= b.nodes.len() {
            (a, b)
        } else {
            (b, a)
        };
        if long.nodes[..short.nodes.len()] != short.nodes[..] {
            return Err(ConfigError::DivergentLineage.into());
        }
        Ok(long.clone())
    }

    /// The prefix ending at the node whose certificate matches `cert`.
    pub fn truncate(&self, cert: &Certificate) -> Result<Self> {
        let pos = self
            .nodes
            .iter()
            .position(|n| &n.certificate == cert)
            .ok_or(ConfigError::SignerNotInLineage)?;
        Ok(Self {
            nodes: self.nodes[..=pos].to_vec(),
        })
    }

    /// Whether `cert` belongs to any node of this chain.
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.nodes.iter().any(|n| &n.certificate == cert)
    }

    /// Capabilities recorded for `cert`, if it is a member.
    pub fn capabilities_of(&self, cert: &Certificate) -> Option<Capabilities> {
        self.nodes
            .iter()
            .find(|n| &n.certificate == cert)
            .map(|n| n.capabilities)
    }

    /// Root node: the original signer.
    pub fn oldest(&self) -> &LineageNode {
        &self.nodes[0]
    }

    /// Most recent node: the active signer.
    pub fn newest(&self) -> &LineageNode {
        self.nodes.last().expect("lineage is never empty")
    }

    /// Number of nodes in the chain.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always `false`: every constructor installs the root node first.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes oldest-first.
    pub fn nodes(&self) -> &[LineageNode] {
        &self.nodes
    }

    /// Serialize to the self-contained persisted stream.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(LINEAGE_MAGIC);
        out.extend_from_slice(&LINEAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for node in &self.nodes {
            put_len_prefixed(&mut out, node.certificate.encoded());
            out.extend_from_slice(&node.capabilities.bits().to_le_bytes());
            match &node.proof {
                Some(proof) => {
                    out.extend_from_slice(&proof.algorithm.id().to_le_bytes());
                    put_len_prefixed(&mut out, &proof.signature);
                }
                None => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        out
    }

    /// Decode and validate a persisted stream in one step.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        validate(decode(bytes)?)
    }
}

/// Pure decode: bytes to a candidate node sequence. No signature is checked
/// here; feed the result to [`validate`].
pub fn decode(bytes: &[u8]) -> Result<Vec<LineageNode>> {
    let mut r = Reader::new(bytes);
    let magic = r.take(LINEAGE_MAGIC.len())?;
    if magic != LINEAGE_MAGIC {
        return Err(SealError::Malformed("bad lineage magic".into()));
    }
    let version = r.u32()?;
    if version != LINEAGE_VERSION {
        return Err(SealError::Malformed(format!(
            "unsupported lineage version {version}"
        )));
    }
    let count = r.u32()? as usize;
    let mut nodes = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        let cert_der = r.len_prefixed()?;
        let certificate = Certificate::from_spki_der(cert_der).map_err(|e| {
            SealError::Malformed(format!("lineage node {index}: unparseable certificate: {e}"))
        })?;
        let capabilities = Capabilities::from_bits(r.u32()?);
        let alg_id = r.u32()?;
        let signature = r.len_prefixed()?.to_vec();
        let proof = if alg_id == 0 && signature.is_empty() {
            None
        } else {
            let algorithm = SignatureAlgorithm::from_id(alg_id).ok_or_else(|| {
                SealError::Malformed(format!(
                    "lineage node {index}: unknown proof algorithm {alg_id:#06x}"
                ))
            })?;
            Some(Proof {
                algorithm,
                signature,
            })
        };
        nodes.push(LineageNode {
            certificate,
            capabilities,
            proof,
        });
    }
    if !r.is_empty() {
        return Err(SealError::Malformed("trailing bytes after lineage".into()));
    }
    Ok(nodes)
}

/// Pure validate: candidate sequence to a verified chain.
pub fn validate(nodes: Vec<LineageNode>) -> Result<Lineage> {
    let Some(root) = nodes.first() else {
        return Err(SealError::Malformed("empty lineage".into()));
    };
    if root.proof.is_some() {
        return Err(SealError::Malformed("lineage root carries a proof".into()));
    }
    for (index, pair) in nodes.windows(2).enumerate() {
        verify_link(&pair[0], &pair[1], index + 1)?;
    }
    Ok(Lineage { nodes })
}

/// Canonical proof message for a rotation from `prev` to `next`.
fn proof_message(prev: &Certificate, next: &Certificate, capabilities: Capabilities) -> Vec<u8> {
    let mut msg = Vec::with_capacity(prev.encoded().len() + next.encoded().len() + 12);
    put_len_prefixed(&mut msg, prev.encoded());
    put_len_prefixed(&mut msg, next.encoded());
    msg.extend_from_slice(&capabilities.bits().to_le_bytes());
    msg
}

fn verify_link(prev: &LineageNode, node: &LineageNode, index: usize) -> Result<()> {
    let Some(proof) = &node.proof else {
        return Err(ConfigError::InvalidProof(index).into());
    };
    let message = proof_message(&prev.certificate, &node.certificate, node.capabilities);
    let ok = prev
        .certificate
        .verify(proof.algorithm, &message, &proof.signature)?;
    if !ok {
        return Err(ConfigError::InvalidProof(index).into());
    }
    Ok(())
}
