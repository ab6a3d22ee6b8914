use std::fmt;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"KSTLSAVE";
pub const ARCHIVE_VERSION: u32 = 1;
/// magic + version + compression + 3 reserved + uncompressed length.
pub const ARCHIVE_HEADER_LEN: usize = 8 + 4 + 1 + 3 + 8;

pub const BLOB_MAGIC: &[u8; 8] = b"KSTLBLOB";
pub const BLOB_VERSION: u32 = 1;
pub const BLOB_HEADER_LEN: usize = 8 + 4;

/// tag + version + length.
pub const SECTION_HEADER_LEN: usize = 8 + 4 + 4;

/// Eight-byte section name, zero padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionTag(pub [u8; 8]);

impl SectionTag {
    pub const CPU: SectionTag = SectionTag::new("CPU");
    pub const MEMORY: SectionTag = SectionTag::new("MEMORY");
    pub const COPROC: SectionTag = SectionTag::new("COPROC");
    pub const GRAPHICS: SectionTag = SectionTag::new("GS");
    pub const AUDIO: SectionTag = SectionTag::new("SPU");
    pub const INPUT: SectionTag = SectionTag::new("PAD");
    pub const NETWORK: SectionTag = SectionTag::new("NET");
    pub const EXPANSION: SectionTag = SectionTag::new("EXPBUS");
    pub const MEDIA: SectionTag = SectionTag::new("CDVD");

    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= 8, "section tags are at most 8 bytes");
        let mut tag = [0u8; 8];
        let mut i = 0;
        while i < bytes.len() {
            tag[i] = bytes[i];
            i += 1;
        }
        SectionTag(tag)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        for &b in &self.0[..end] {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionTag({self})")
    }
}
