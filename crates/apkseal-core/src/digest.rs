//! Two-level chunked content digests.
//!
//! Every scheme signs over the same construction: the signed region (all
//! package bytes except the signing block itself) is split into 1 MiB
//! chunks, each chunk is hashed with a type byte and length prefix, and the
//! ordered chunk digests are hashed once more into the top-level digest.
//! Chunk hashing is embarrassingly parallel; combination is strictly by
//! chunk index, so the result is identical at any parallelism degree.

use std::collections::BTreeMap;

use apkseal_schema::ContentDigestAlgorithm;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Result, SealError};

/// Fixed chunk size of the two-level digest scheme.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const CHUNK_PREFIX: u8 = 0xa5;
const TOP_PREFIX: u8 = 0x5a;

/// Supplies the three signed regions of a package.
///
/// The signing block is inserted between the entries region and the central
/// directory; neither it nor its eventual size may influence the digest.
pub trait ContentSource {
    /// The zip local-file entries region (everything before the block).
    fn entries(&self) -> &[u8];
    /// The central-directory region.
    fn central_directory(&self) -> &[u8];
    /// The end-of-central-directory record.
    fn end_of_central_directory(&self) -> &[u8];
}

/// Borrowed three-region content source.
#[derive(Debug, Clone, Copy)]
pub struct SlicedContent<'a> {
    /// Entries region.
    pub entries: &'a [u8],
    /// Central directory region.
    pub central_directory: &'a [u8],
    /// End-of-central-directory record.
    pub eocd: &'a [u8],
}

impl ContentSource for SlicedContent<'_> {
    fn entries(&self) -> &[u8] {
        self.entries
    }

    fn central_directory(&self) -> &[u8] {
        self.central_directory
    }

    fn end_of_central_directory(&self) -> &[u8] {
        self.eocd
    }
}

/// Compute the top-level digest for each requested algorithm.
///
/// All algorithms share one chunking pass; chunk work is spread over a
/// bounded pool sized by [`num_cpus`].
pub fn compute_digests(
    source: &dyn ContentSource,
    algorithms: &[ContentDigestAlgorithm],
) -> Result<BTreeMap<ContentDigestAlgorithm, Vec<u8>>> {
    compute_digests_with_workers(source, algorithms, num_cpus::get().max(1))
}

/// [`compute_digests`] with an explicit worker count. Exposed so tests can
/// pin the parallelism degree; the output never depends on it.
pub fn compute_digests_with_workers(
    source: &dyn ContentSource,
    algorithms: &[ContentDigestAlgorithm],
    workers: usize,
) -> Result<BTreeMap<ContentDigestAlgorithm, Vec<u8>>> {
    let eocd = patched_eocd(source)?;
    let regions: [&[u8]; 3] = [source.entries(), source.central_directory(), &eocd];

    // Chunk descriptors in signed-region order; chunking never crosses a
    // region boundary.
    let mut chunks: Vec<(usize, usize, usize)> = Vec::new();
    for (region_idx, region) in regions.iter().enumerate() {
        let mut offset = 0;
        while offset < region.len() {
            let len = CHUNK_SIZE.min(region.len() - offset);
            chunks.push((region_idx, offset, len));
            offset += len;
        }
    }

    let chunk_count = u32::try_from(chunks.len())
        .map_err(|_| SealError::Malformed("signed region exceeds 2^32 chunks".into()))?;
    let chunk_digests = digest_chunks(&regions, &chunks, algorithms, workers.max(1));

    let mut out = BTreeMap::new();
    for (alg_idx, &alg) in algorithms.iter().enumerate() {
        let mut top = Vec::with_capacity(5 + chunks.len() * alg.digest_len());
        top.push(TOP_PREFIX);
        top.extend_from_slice(&chunk_count.to_le_bytes());
        for per_chunk in &chunk_digests {
            top.extend_from_slice(&per_chunk[alg_idx]);
        }
        out.insert(alg, hash(alg, &top));
    }
    Ok(out)
}

/// Per-chunk digests, indexed `[chunk][algorithm]`, computed on a scoped
/// pool and stitched back together strictly by chunk index.
fn digest_chunks(
    regions: &[&[u8]; 3],
    chunks: &[(usize, usize, usize)],
    algorithms: &[ContentDigestAlgorithm],
    workers: usize,
) -> Vec<Vec<Vec<u8>>> {
    let workers = workers.min(chunks.len()).max(1);
    if workers == 1 || chunks.len() == 1 {
        return chunks
            .iter()
            .map(|c| digest_one_chunk(regions, *c, algorithms))
            .collect();
    }

    let per_worker = chunks.len().div_ceil(workers);
    let mut results: Vec<Vec<Vec<Vec<u8>>>> = Vec::with_capacity(workers);
    std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .chunks(per_worker)
            .map(|batch| {
                scope.spawn(move || {
                    batch
                        .iter()
                        .map(|c| digest_one_chunk(regions, *c, algorithms))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            // A digest worker has no failure path; a panic here is a bug.
            results.push(handle.join().expect("digest worker panicked"));
        }
    });
    results.into_iter().flatten().collect()
}

fn digest_one_chunk(
    regions: &[&[u8]; 3],
    (region_idx, offset, len): (usize, usize, usize),
    algorithms: &[ContentDigestAlgorithm],
) -> Vec<Vec<u8>> {
    let data = &regions[region_idx][offset..offset + len];
    let mut header = [0u8; 5];
    header[0] = CHUNK_PREFIX;
    header[1..5].copy_from_slice(&(len as u32).to_le_bytes());

    algorithms
        .iter()
        .map(|&alg| match alg {
            ContentDigestAlgorithm::ChunkedSha256 => {
                let mut h = Sha256::new();
                h.update(header);
                h.update(data);
                h.finalize().to_vec()
            }
            ContentDigestAlgorithm::ChunkedSha512 => {
                let mut h = Sha512::new();
                h.update(header);
                h.update(data);
                h.finalize().to_vec()
            }
        })
        .collect()
}

fn hash(alg: ContentDigestAlgorithm, data: &[u8]) -> Vec<u8> {
    match alg {
        ContentDigestAlgorithm::ChunkedSha256 => Sha256::digest(data).to_vec(),
        ContentDigestAlgorithm::ChunkedSha512 => Sha512::digest(data).to_vec(),
    }
}

/// The end-of-central-directory record, with its central-directory offset
/// field rewritten to the value it held before the block's insertion.
///
/// The block sits between the entries region and the central directory, so
/// the on-disk offset points past a block whose size depends on the
/// signatures being computed. Digesting the pre-block offset breaks that
/// circularity.
fn patched_eocd(source: &dyn ContentSource) -> Result<Vec<u8>> {
    const EOCD_MIN_LEN: usize = 22;
    const CD_OFFSET_FIELD: usize = 16;

    let eocd = source.end_of_central_directory();
    if eocd.len() < EOCD_MIN_LEN {
        return Err(SealError::Malformed(format!(
            "end-of-central-directory record too short: {} bytes",
            eocd.len()
        )));
    }
    let pre_block_offset = u32::try_from(source.entries().len()).unwrap_or(u32::MAX);
    let mut patched = eocd.to_vec();
    patched[CD_OFFSET_FIELD..CD_OFFSET_FIELD + 4]
        .copy_from_slice(&pre_block_offset.to_le_bytes());
    Ok(patched)
}
