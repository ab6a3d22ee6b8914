//! On-disk container: a fixed header followed by the (optionally lz4-compressed) blob.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SaveStateError};
use crate::format::{SectionTag, ARCHIVE_HEADER_LEN, ARCHIVE_MAGIC, ARCHIVE_VERSION};
use crate::io::{Fields, PutLe};
use crate::section::parse_blob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(SaveStateError::Corrupt("invalid compression kind")),
        }
    }
}

fn max_lz4_decompressed_len(compressed_len: usize) -> usize {
    // A single lz4 sequence can expand to at most ~255x its encoded size.
    compressed_len.saturating_mul(255).saturating_add(16)
}

pub fn write_archive(blob: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let body = match compression {
        Compression::None => blob.to_vec(),
        Compression::Lz4 => lz4_flex::block::compress(blob),
    };
    let mut out = Vec::with_capacity(ARCHIVE_HEADER_LEN + body.len());
    out.put_bytes(ARCHIVE_MAGIC);
    out.put_u32(ARCHIVE_VERSION);
    out.put_u8(compression as u8);
    out.put_bytes(&[0; 3]); // reserved
    out.put_u64(blob.len() as u64);
    out.put_bytes(&body);
    Ok(out)
}

struct ArchiveHeader {
    compression: Compression,
    uncompressed_len: usize,
}

/// Splits `bytes` into its header and the (possibly compressed) body.
fn read_archive_header(bytes: &[u8]) -> Result<(ArchiveHeader, &[u8])> {
    if bytes.len() < ARCHIVE_HEADER_LEN {
        return Err(SaveStateError::Corrupt("truncated archive header"));
    }
    let mut r = Fields::new(bytes, "truncated archive header");
    if &r.array::<8>()? != ARCHIVE_MAGIC {
        return Err(SaveStateError::InvalidMagic);
    }
    let version = r.u32()?;
    if version != ARCHIVE_VERSION {
        return Err(SaveStateError::UnsupportedVersion(version));
    }
    let compression = Compression::from_u8(r.u8()?)?;
    r.take(3)?; // reserved
    let uncompressed_len: usize = r
        .u64()?
        .try_into()
        .map_err(|_| SaveStateError::Corrupt("uncompressed length overflow"))?;
    let header = ArchiveHeader {
        compression,
        uncompressed_len,
    };
    Ok((header, r.rest()))
}

/// Validates the archive header and returns the decompressed blob.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<u8>> {
    let (header, r) = read_archive_header(bytes)?;
    match header.compression {
        Compression::None => {
            if r.len() != header.uncompressed_len {
                return Err(SaveStateError::Corrupt("archive length mismatch"));
            }
            Ok(r.to_vec())
        }
        Compression::Lz4 => {
            if header.uncompressed_len > max_lz4_decompressed_len(r.len()) {
                return Err(SaveStateError::Corrupt("lz4 length exceeds maximum ratio"));
            }
            let blob = lz4_flex::block::decompress(r, header.uncompressed_len)?;
            if blob.len() != header.uncompressed_len {
                return Err(SaveStateError::Corrupt("archive length mismatch"));
            }
            Ok(blob)
        }
    }
}

/// Writes an archive to `path` atomically (temp file in the same directory, then rename).
///
/// With `backup` set, an existing file at `path` is first copied to its [`backup_path`]. The slot
/// itself is only ever replaced by the rename, so a failed write leaves it untouched.
pub fn save_to_file(path: &Path, blob: &[u8], compression: Compression, backup: bool) -> Result<()> {
    let archive = write_archive(blob, compression)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&archive)?;
    tmp.as_file().sync_all()?;

    if backup && path.is_file() {
        fs::copy(path, backup_path(path))?;
    }
    tmp.persist(path).map_err(|err| SaveStateError::Io(err.error))?;
    tracing::debug!(path = %path.display(), bytes = archive.len(), "wrote save state");
    Ok(())
}

pub fn load_from_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    read_archive(&bytes)
}

/// `foo.kss` -> `foo.kss.backup`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub tag: SectionTag,
    pub version: u32,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveStateInfo {
    pub compression: Compression,
    pub archive_len: usize,
    pub blob_len: usize,
    pub sections: Vec<SectionInfo>,
}

/// Describes a save-state file without thawing it.
pub fn inspect(bytes: &[u8]) -> Result<SaveStateInfo> {
    let (header, _) = read_archive_header(bytes)?;
    let blob = read_archive(bytes)?;
    let sections = parse_blob(&blob)?
        .into_iter()
        .map(|s| SectionInfo {
            tag: s.tag,
            version: s.version,
            len: s.payload.len(),
        })
        .collect();
    Ok(SaveStateInfo {
        compression: header.compression,
        archive_len: bytes.len(),
        blob_len: blob.len(),
        sections,
    })
}
