use kestrel_savestate::io::{Fields, PutLe};
use kestrel_savestate::{
    freeze_sections, inspect, load_from_file, slot_path, thaw_sections, Compression, Freeze,
    Result, SaveStateError, SectionTag,
};

struct Ram {
    bytes: Vec<u8>,
}

impl Freeze for Ram {
    fn tag(&self) -> SectionTag {
        SectionTag::MEMORY
    }

    fn version(&self) -> u32 {
        3
    }

    fn freeze(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.put_prefixed(&self.bytes)
    }

    fn thaw(&mut self, payload: &[u8]) -> Result<()> {
        let bytes = Fields::new(payload, "truncated RAM").prefixed()?;
        if bytes.len() != self.bytes.len() {
            return Err(SaveStateError::hook(self.tag(), "RAM size mismatch"));
        }
        self.bytes.copy_from_slice(bytes);
        Ok(())
    }
}

struct Cpu {
    pc: u32,
    gprs: [u64; 4],
}

impl Freeze for Cpu {
    fn tag(&self) -> SectionTag {
        SectionTag::CPU
    }

    fn version(&self) -> u32 {
        1
    }

    fn freeze(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.put_u32(self.pc);
        for gpr in self.gprs {
            out.put_u64(gpr);
        }
        Ok(())
    }

    fn thaw(&mut self, payload: &[u8]) -> Result<()> {
        let mut fields = Fields::new(payload, "truncated CPU state");
        self.pc = fields.u32()?;
        for gpr in &mut self.gprs {
            *gpr = fields.u64()?;
        }
        fields.finish("trailing bytes in CPU state")
    }
}

#[test]
fn slot_file_roundtrip_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = slot_path(dir.path(), "SLES-50000", 0xDEAD_BEEF, 3);

    let mut cpu = Cpu {
        pc: 0xBFC0_0000,
        gprs: [1, u64::MAX, 3, 4],
    };
    let mut ram = Ram {
        bytes: (0..8192u32).map(|i| (i * 7) as u8).collect(),
    };
    let blob = freeze_sections(&mut [&mut cpu, &mut ram]).unwrap();
    kestrel_savestate::save_to_file(&path, &blob, Compression::Lz4, false).unwrap();

    let info = inspect(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(info.sections.len(), 2);
    assert_eq!(info.sections[0].tag, SectionTag::CPU);
    assert_eq!(info.sections[1].version, 3);

    let expected_ram = ram.bytes.clone();
    cpu.pc = 0;
    cpu.gprs = [0; 4];
    ram.bytes.fill(0);

    let loaded = load_from_file(&path).unwrap();
    thaw_sections(&loaded, &mut [&mut cpu, &mut ram]).unwrap();
    assert_eq!(cpu.pc, 0xBFC0_0000);
    assert_eq!(cpu.gprs, [1, u64::MAX, 3, 4]);
    assert_eq!(ram.bytes, expected_ram);
}

#[test]
fn hook_errors_carry_the_section_tag() {
    let mut small = Ram { bytes: vec![0; 16] };
    let blob = freeze_sections(&mut [&mut small]).unwrap();
    let mut big = Ram { bytes: vec![0; 32] };
    let err = thaw_sections(&blob, &mut [&mut big]).unwrap_err();
    assert_eq!(err.to_string(), "section `MEMORY`: RAM size mismatch");
}
