// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The few PE image header fields managed modules are described by.

use crate::error::DumpError;
use crate::memory::ProcessMemory;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// "MZ"
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d;
/// "PE\0\0"
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ImageDosHeader {
    pub e_magic: u16,
    pub e_reserved: [u16; 29],
    pub e_lfanew: u32,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// NT headers up to `SizeOfImage`, which sits at the same offset in the
/// PE32 and PE32+ optional headers.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ImageNtHeadersPrefix {
    pub signature: u32,
    pub file_header: ImageFileHeader,
    pub optional_magic: u16,
    pub optional_reserved: [u8; 54],
    pub size_of_image: u32,
}

/// What the crash report needs from a PE image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub time_date_stamp: u32,
    pub size_of_image: u32,
}

/// Parses the headers of the PE image mapped at `base`. The headers read
/// become part of the dump.
pub fn read_image_info(memory: &mut ProcessMemory, base: u64) -> Result<ImageInfo, DumpError> {
    let dos: ImageDosHeader = memory.read_struct(base)?;
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return Err(DumpError::UnsupportedHeader);
    }

    let nt: ImageNtHeadersPrefix = memory.read_struct(base + u64::from(dos.e_lfanew))?;
    if nt.signature != IMAGE_NT_SIGNATURE {
        return Err(DumpError::UnsupportedHeader);
    }

    Ok(ImageInfo {
        time_date_stamp: nt.file_header.time_date_stamp,
        size_of_image: nt.size_of_image,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::fake::FakeProcess;
    use zerocopy::FromZeros;

    /// Writes minimal PE headers at `base`.
    pub(crate) fn write_pe_headers(process: &mut FakeProcess, base: u64, stamp: u32, size: u32) {
        let mut dos = ImageDosHeader::new_zeroed();
        dos.e_magic = IMAGE_DOS_SIGNATURE;
        dos.e_lfanew = 0x80;
        process.write(base, dos.as_bytes());

        let mut nt = ImageNtHeadersPrefix::new_zeroed();
        nt.signature = IMAGE_NT_SIGNATURE;
        nt.file_header.time_date_stamp = stamp;
        nt.optional_magic = 0x20b;
        nt.size_of_image = size;
        process.write(base + 0x80, nt.as_bytes());
    }

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<ImageDosHeader>(), 64);
        assert_eq!(std::mem::size_of::<ImageFileHeader>(), 20);
        assert_eq!(std::mem::offset_of!(ImageNtHeadersPrefix, size_of_image), 24 + 56);
    }

    #[test]
    fn reads_stamp_and_size() {
        let mut process = FakeProcess::default();
        write_pe_headers(&mut process, 0x10000, 0x5f5e_100, 0x6000);
        process.map(0x20000, 0x21000);
        let mut memory = ProcessMemory::new(Box::new(process));

        let info = read_image_info(&mut memory, 0x10000).unwrap();
        assert_eq!(info.time_date_stamp, 0x5f5e_100);
        assert_eq!(info.size_of_image, 0x6000);
        assert!(memory.regions().find_containing(0x10000).is_some());

        assert!(matches!(
            read_image_info(&mut memory, 0x20000),
            Err(DumpError::UnsupportedHeader)
        ));
    }
}
