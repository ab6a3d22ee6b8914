//! Sectioned blob encoding and the freeze/thaw driver.
//!
//! A blob is `BLOB_MAGIC`, `BLOB_VERSION`, then one `[tag][version][len][payload]` record per
//! participating subsystem, in freeze order.

use crate::error::{Result, SaveStateError};
use crate::format::{SectionTag, BLOB_HEADER_LEN, BLOB_MAGIC, BLOB_VERSION, SECTION_HEADER_LEN};
use crate::io::{Fields, PutLe};

/// A subsystem that participates in save states.
///
/// `freeze` appends the section payload to `out` (it must only append). `thaw` receives exactly
/// the payload written by a `freeze` of the same tag and version.
pub trait Freeze {
    fn tag(&self) -> SectionTag;
    fn version(&self) -> u32;
    fn freeze(&mut self, out: &mut Vec<u8>) -> Result<()>;
    fn thaw(&mut self, payload: &[u8]) -> Result<()>;
}

/// One decoded section, borrowing its payload from the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    pub tag: SectionTag,
    pub version: u32,
    pub payload: &'a [u8],
}

/// Runs every hook's `freeze` in order and concatenates the sections.
pub fn freeze_sections(hooks: &mut [&mut dyn Freeze]) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    blob.put_bytes(BLOB_MAGIC);
    blob.put_u32(BLOB_VERSION);
    for hook in hooks.iter_mut() {
        let tag = hook.tag();
        let header_pos = blob.len();
        blob.put_bytes(tag.as_bytes());
        blob.put_u32(hook.version());
        blob.put_u32(0); // placeholder len

        let payload_start = blob.len();
        hook.freeze(&mut blob)?;
        let len = blob.len() - payload_start;
        let len: u32 = len
            .try_into()
            .map_err(|_| SaveStateError::SectionTooLarge { tag, len })?;
        blob[header_pos + 12..header_pos + 16].copy_from_slice(&len.to_le_bytes());
        tracing::trace!(section = %tag, len, "froze section");
    }
    Ok(blob)
}

/// Decodes the section list without interpreting payloads.
pub fn parse_blob(blob: &[u8]) -> Result<Vec<Section<'_>>> {
    if blob.len() < BLOB_HEADER_LEN {
        return Err(SaveStateError::Corrupt("truncated blob header"));
    }
    let mut r = Fields::new(blob, "truncated blob header");
    if &r.array::<8>()? != BLOB_MAGIC {
        return Err(SaveStateError::InvalidMagic);
    }
    let version = r.u32()?;
    if version != BLOB_VERSION {
        return Err(SaveStateError::UnsupportedVersion(version));
    }

    let mut sections = Vec::new();
    while !r.is_empty() {
        if r.remaining() < SECTION_HEADER_LEN {
            return Err(SaveStateError::Corrupt("truncated section header"));
        }
        let tag = SectionTag(r.array()?);
        let version = r.u32()?;
        let len = r.u32()? as usize;
        if len > r.remaining() {
            return Err(SaveStateError::Corrupt("section payload exceeds blob"));
        }
        sections.push(Section {
            tag,
            version,
            payload: r.take(len)?,
        });
    }
    Ok(sections)
}

/// Checks that `blob` holds exactly the hooks' sections, in order, with matching versions.
pub fn validate_sections<'a>(blob: &'a [u8], hooks: &[&mut dyn Freeze]) -> Result<Vec<Section<'a>>> {
    let sections = parse_blob(blob)?;
    for (index, hook) in hooks.iter().enumerate() {
        let Some(section) = sections.get(index) else {
            return Err(SaveStateError::MissingSection(hook.tag()));
        };
        if section.tag != hook.tag() {
            return Err(SaveStateError::UnexpectedSection {
                index,
                expected: hook.tag(),
                found: section.tag,
            });
        }
        if section.version != hook.version() {
            return Err(SaveStateError::SectionVersion {
                tag: section.tag,
                expected: hook.version(),
                found: section.version,
            });
        }
    }
    if sections.len() > hooks.len() {
        return Err(SaveStateError::ExtraSections(sections.len() - hooks.len()));
    }
    Ok(sections)
}

/// Validates the whole blob, then replays each section into its hook. No hook runs unless every
/// section matches.
pub fn thaw_sections(blob: &[u8], hooks: &mut [&mut dyn Freeze]) -> Result<()> {
    let sections = validate_sections(blob, hooks)?;
    for (hook, section) in hooks.iter_mut().zip(sections) {
        hook.thaw(section.payload)?;
        tracing::trace!(section = %section.tag, len = section.payload.len(), "thawed section");
    }
    Ok(())
}
