//! Minimal zip-container splitting.
//!
//! The signing engine works on three regions; this module finds them in a
//! package file and reassembles a signed one. It reads just enough of the
//! zip format to do that: the end-of-central-directory record and, when
//! present, the signing block wedged before the central directory. Nothing
//! here parses entries or rewrites archive contents.

use anyhow::{Context, Result, bail};

use apkseal_core::block::SigningBlock;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_MIN_LEN: usize = 22;
const CD_OFFSET_FIELD: usize = 16;
const CD_SIZE_FIELD: usize = 12;

/// A package split into the regions the signing engine works over.
#[derive(Debug)]
pub struct PackageLayout<'a> {
    /// Local-file entries region.
    pub entries: &'a [u8],
    /// Raw existing signing block, if one is present.
    pub signing_block: Option<&'a [u8]>,
    /// Central directory region.
    pub central_directory: &'a [u8],
    /// End-of-central-directory record, including any comment.
    pub eocd: &'a [u8],
}

/// Split `buf` into entries, optional signing block, central directory and
/// EoCD.
pub fn split(buf: &[u8]) -> Result<PackageLayout<'_>> {
    let eocd_pos = find_eocd(buf).context("no end-of-central-directory record")?;
    let eocd = &buf[eocd_pos..];

    let cd_size = read_u32(eocd, CD_SIZE_FIELD) as usize;
    let cd_offset = read_u32(eocd, CD_OFFSET_FIELD) as usize;
    if cd_offset
        .checked_add(cd_size)
        .is_none_or(|end| end != eocd_pos)
    {
        bail!("central directory does not end at the EoCD record");
    }
    let central_directory = &buf[cd_offset..eocd_pos];

    // A signing block, when present, sits immediately before the central
    // directory with its magic as the last sixteen bytes.
    let before_cd = &buf[..cd_offset];
    let (entries, signing_block) = match SigningBlock::parse(before_cd) {
        Ok(block) if block.offset + block.size == cd_offset => (
            &buf[..block.offset],
            Some(&buf[block.offset..cd_offset]),
        ),
        _ => (before_cd, None),
    };

    Ok(PackageLayout {
        entries,
        signing_block,
        central_directory,
        eocd,
    })
}

/// Reassemble a package around a freshly produced signing block, patching
/// the EoCD's central-directory offset.
pub fn assemble(layout: &PackageLayout<'_>, block: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        layout.entries.len() + block.len() + layout.central_directory.len() + layout.eocd.len(),
    );
    out.extend_from_slice(layout.entries);
    out.extend_from_slice(block);
    let cd_offset = out.len();
    out.extend_from_slice(layout.central_directory);
    out.extend_from_slice(layout.eocd);
    let field = out.len() - layout.eocd.len() + CD_OFFSET_FIELD;
    out[field..field + 4].copy_from_slice(&(cd_offset as u32).to_le_bytes());
    out
}

/// Locate the EoCD record: last signature match whose comment length is
/// consistent with the file end.
fn find_eocd(buf: &[u8]) -> Option<usize> {
    if buf.len() < EOCD_MIN_LEN {
        return None;
    }
    (0..=buf.len() - EOCD_MIN_LEN).rev().find(|&pos| {
        read_u32(&buf[pos..], 0) == EOCD_SIGNATURE
            && pos + EOCD_MIN_LEN + read_u16(&buf[pos..], 20) as usize == buf.len()
    })
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("caller checked length"))
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().expect("caller checked length"))
}
