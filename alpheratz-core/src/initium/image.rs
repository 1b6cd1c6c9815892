//! ELF image-tag parsing: `PT_NOTE` segments carrying `INITIUM`-named notes.
//!
//! Notes are read directly out of the raw `PT_NOTE` segment bytes rather
//! than through `xmas_elf`'s note helpers, since the wire format here
//! (possibly several notes packed into one segment, 4-byte-aligned) is
//! exactly what the Initium protocol itself specifies and is cheaper to
//! walk by hand than to coerce through a generic note abstraction.

use alloc::string::String;
use alloc::vec::Vec;

use xmas_elf::program::Type as ProgramType;
use xmas_elf::ElfFile;

use crate::mmu::Mode;
use crate::status::{Result, Status};

pub const INITIUM_NOTE_NAME: &str = "INITIUM";
pub const INITIUM_VERSION: u32 = 1;

pub const IMAGE_FLAG_SECTIONS: u32 = 1 << 0;
pub const IMAGE_FLAG_LOG: u32 = 1 << 1;

pub const LOAD_FLAG_FIXED: u32 = 1 << 0;

const ITAG_IMAGE: u32 = 0;
const ITAG_LOAD: u32 = 1;
const ITAG_OPTION: u32 = 2;
const ITAG_MAPPING: u32 = 3;
const ITAG_VIDEO: u32 = 4;

const MIN_SIZE_IMAGE: usize = 8;
const MIN_SIZE_LOAD: usize = 40;
const MIN_SIZE_OPTION: usize = 16;
const MIN_SIZE_MAPPING: usize = 24;
const MIN_SIZE_VIDEO: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTagImage {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTagLoad {
    pub flags: u32,
    pub alignment: u64,
    pub min_alignment: u64,
    pub virt_map_base: u64,
    pub virt_map_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Boolean,
    String,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTagOption {
    pub option_type: OptionType,
    pub name: String,
    pub default: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTagMapping {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTagVideo {
    pub types: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    Image(ImageTagImage),
    Load(ImageTagLoad),
    Option(ImageTagOption),
    Mapping(ImageTagMapping),
    Video(ImageTagVideo),
}

/// The decoded set of Initium image tags carried by a kernel ELF, plus its
/// addressing mode — everything known before `load()` begins allocating and
/// mapping memory.
pub struct Image {
    pub mode: Mode,
    pub entry: u64,
    pub tags: Vec<ImageTag>,
}

impl Image {
    /// First tag of a non-repeating kind (Image, Load, Video).
    pub fn image(&self) -> Option<&ImageTagImage> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Image(i) => Some(i),
            _ => None,
        })
    }

    pub fn load(&self) -> Option<&ImageTagLoad> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Load(l) => Some(l),
            _ => None,
        })
    }

    pub fn video(&self) -> Option<&ImageTagVideo> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Video(v) => Some(v),
            _ => None,
        })
    }

    pub fn options(&self) -> impl Iterator<Item = &ImageTagOption> {
        self.tags.iter().filter_map(|t| match t {
            ImageTag::Option(o) => Some(o),
            _ => None,
        })
    }

    pub fn mappings(&self) -> impl Iterator<Item = &ImageTagMapping> {
        self.tags.iter().filter_map(|t| match t {
            ImageTag::Mapping(m) => Some(m),
            _ => None,
        })
    }
}

fn round_up4(v: usize) -> usize {
    (v + 3) & !3
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes.get(offset..offset + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    bytes.get(offset..offset + 8).map(|s| u64::from_le_bytes(s.try_into().unwrap()))
}

/// Decode a single `{type, data}` note descriptor into an [`ImageTag`],
/// enforcing the minimum-size-per-type rule. Tags larger than the
/// minimum are accepted verbatim (forward-compat); the extra bytes are
/// simply not interpreted by fields this loader understands.
fn decode_tag(note_type: u32, desc: &[u8]) -> Result<ImageTag> {
    match note_type {
        ITAG_IMAGE => {
            if desc.len() < MIN_SIZE_IMAGE {
                return Err(Status::MalformedImage);
            }
            Ok(ImageTag::Image(ImageTagImage {
                version: read_u32(desc, 0).ok_or(Status::MalformedImage)?,
                flags: read_u32(desc, 4).ok_or(Status::MalformedImage)?,
            }))
        }
        ITAG_LOAD => {
            if desc.len() < MIN_SIZE_LOAD {
                return Err(Status::MalformedImage);
            }
            Ok(ImageTag::Load(ImageTagLoad {
                flags: read_u32(desc, 0).ok_or(Status::MalformedImage)?,
                alignment: read_u64(desc, 8).ok_or(Status::MalformedImage)?,
                min_alignment: read_u64(desc, 16).ok_or(Status::MalformedImage)?,
                virt_map_base: read_u64(desc, 24).ok_or(Status::MalformedImage)?,
                virt_map_size: read_u64(desc, 32).ok_or(Status::MalformedImage)?,
            }))
        }
        ITAG_OPTION => {
            if desc.len() < MIN_SIZE_OPTION {
                return Err(Status::MalformedImage);
            }
            let option_type = match desc[0] {
                0 => OptionType::Boolean,
                1 => OptionType::String,
                2 => OptionType::Integer,
                _ => return Err(Status::MalformedImage),
            };
            let name_len = read_u32(desc, 4).ok_or(Status::MalformedImage)? as usize;
            let desc_len = read_u32(desc, 8).ok_or(Status::MalformedImage)? as usize;
            let default_len = read_u32(desc, 12).ok_or(Status::MalformedImage)? as usize;

            let name_start = MIN_SIZE_OPTION;
            let name_end = name_start + name_len;
            let desc_start = name_end;
            let desc_end = desc_start + desc_len;
            let default_start = desc_end;
            let default_end = default_start + default_len;
            if desc.len() < default_end {
                return Err(Status::MalformedImage);
            }

            let name = core::str::from_utf8(&desc[name_start..name_end])
                .unwrap_or_default()
                .trim_end_matches('\0')
                .into();

            Ok(ImageTag::Option(ImageTagOption {
                option_type,
                name,
                default: desc[default_start..default_end].to_vec(),
            }))
        }
        ITAG_MAPPING => {
            if desc.len() < MIN_SIZE_MAPPING {
                return Err(Status::MalformedImage);
            }
            Ok(ImageTag::Mapping(ImageTagMapping {
                virt: read_u64(desc, 0).ok_or(Status::MalformedImage)?,
                phys: read_u64(desc, 8).ok_or(Status::MalformedImage)?,
                size: read_u64(desc, 16).ok_or(Status::MalformedImage)?,
            }))
        }
        ITAG_VIDEO => {
            if desc.len() < MIN_SIZE_VIDEO {
                return Err(Status::MalformedImage);
            }
            Ok(ImageTag::Video(ImageTagVideo {
                types: read_u32(desc, 0).ok_or(Status::MalformedImage)?,
                width: read_u32(desc, 4).ok_or(Status::MalformedImage)?,
                height: read_u32(desc, 8).ok_or(Status::MalformedImage)?,
                bpp: desc[12],
            }))
        }
        _ => Err(Status::MalformedImage),
    }
}

fn is_duplicate_forbidden(tag: &ImageTag) -> bool {
    matches!(tag, ImageTag::Image(_) | ImageTag::Load(_) | ImageTag::Video(_))
}

fn same_kind(a: &ImageTag, b: &ImageTag) -> bool {
    core::mem::discriminant(a) == core::mem::discriminant(b)
}

/// Scan one `PT_NOTE` segment's raw bytes for `INITIUM`-named notes,
/// appending each to `out`.
fn scan_note_segment(bytes: &[u8], out: &mut Vec<ImageTag>) -> Result<()> {
    let mut offset = 0usize;
    while offset + 12 <= bytes.len() {
        let namesz = read_u32(bytes, offset).ok_or(Status::MalformedImage)? as usize;
        let descsz = read_u32(bytes, offset + 4).ok_or(Status::MalformedImage)? as usize;
        let note_type = read_u32(bytes, offset + 8).ok_or(Status::MalformedImage)?;
        offset += 12;

        let name_end = offset + namesz;
        if name_end > bytes.len() {
            return Err(Status::MalformedImage);
        }
        let name = core::str::from_utf8(&bytes[offset..name_end]).unwrap_or("").trim_end_matches('\0');
        offset += round_up4(namesz);
        if offset > bytes.len() {
            return Err(Status::MalformedImage);
        }

        let desc_end = offset + descsz;
        if desc_end > bytes.len() {
            return Err(Status::MalformedImage);
        }
        let desc = &bytes[offset..desc_end];
        offset += round_up4(descsz);
        if offset > bytes.len() {
            return Err(Status::MalformedImage);
        }

        if name == INITIUM_NOTE_NAME {
            let tag = decode_tag(note_type, desc)?;
            if is_duplicate_forbidden(&tag) && out.iter().any(|existing| same_kind(existing, &tag)) {
                return Err(Status::MalformedImage);
            }
            out.push(tag);
        }
    }
    Ok(())
}

/// One `PT_LOAD` program header, the raw material [`crate::initium::loader`]
/// turns into allocated-and-mapped kernel memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub paddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
}

/// Collect every `PT_LOAD` header in file order.
pub fn load_segments(file: &[u8]) -> Result<Vec<LoadSegment>> {
    let elf = ElfFile::new(file).map_err(|_| Status::UnknownImage)?;
    let mut segments = Vec::new();
    for ph in elf.program_iter() {
        if ph.get_type().map_err(|_| Status::MalformedImage)? != ProgramType::Load {
            continue;
        }
        segments.push(LoadSegment {
            vaddr: ph.virtual_addr(),
            paddr: ph.physical_addr(),
            offset: ph.offset(),
            filesz: ph.file_size(),
            memsz: ph.mem_size(),
        });
    }
    Ok(segments)
}

/// Raw section-header-table bytes plus the fields the Sections info tag
/// needs (`shstrndx`, per-entry size), read only when the image sets
/// `IMAGE_FLAG_SECTIONS` so the kernel can find its own symbol/string tables
/// (`initium_elfxx.h`'s `load_sections`).
pub fn section_header_table(file: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    let elf = ElfFile::new(file).map_err(|_| Status::UnknownImage)?;
    let entsize = elf.header.pt2.sh_entry_size() as u32;
    let count = elf.header.pt2.sh_count() as u32;
    let shstrndx = elf.header.pt2.sh_str_index() as u32;

    let start = elf.header.pt2.sh_offset() as usize;
    let end = start + entsize as usize * count as usize;
    let raw = file.get(start..end).ok_or(Status::MalformedImage)?.to_vec();
    Ok((shstrndx, entsize, raw))
}

/// Identify the kernel's addressing mode, entry point, and full set of
/// Initium image tags. `file` is the whole kernel image read into
/// memory by the caller (the loader has no streaming-read ELF parser).
pub fn parse(file: &[u8]) -> Result<Image> {
    let elf = ElfFile::new(file).map_err(|_| Status::UnknownImage)?;

    let mode = match elf.header.pt1.class() {
        xmas_elf::header::Class::ThirtyTwo => Mode::Bits32,
        xmas_elf::header::Class::SixtyFour => Mode::Bits64,
        _ => return Err(Status::UnknownImage),
    };
    let entry = elf.header.pt2.entry_point();

    let mut tags = Vec::new();
    for ph in elf.program_iter() {
        if ph.get_type().map_err(|_| Status::MalformedImage)? != ProgramType::Note {
            continue;
        }
        let start = ph.offset() as usize;
        let end = start + ph.file_size() as usize;
        let segment = file.get(start..end).ok_or(Status::MalformedImage)?;
        scan_note_segment(segment, &mut tags)?;
    }

    let image = Image { mode, entry, tags };
    match image.image() {
        None => Err(Status::UnknownImage),
        Some(img) if img.version != INITIUM_VERSION => Err(Status::UnknownImage),
        Some(_) => Ok(image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &str, ty: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let name_bytes: Vec<u8> = name.bytes().chain(core::iter::once(0)).collect();
        out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&name_bytes);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn decodes_image_and_load_tags() {
        let mut segment = Vec::new();
        let mut image_desc = Vec::new();
        image_desc.extend_from_slice(&1u32.to_le_bytes());
        image_desc.extend_from_slice(&0u32.to_le_bytes());
        segment.extend(note("INITIUM", ITAG_IMAGE, &image_desc));

        let mut load_desc = Vec::new();
        load_desc.extend_from_slice(&0u32.to_le_bytes());
        load_desc.extend_from_slice(&0u32.to_le_bytes());
        load_desc.extend_from_slice(&0x20_0000u64.to_le_bytes());
        load_desc.extend_from_slice(&0x1000u64.to_le_bytes());
        load_desc.extend_from_slice(&0u64.to_le_bytes());
        load_desc.extend_from_slice(&0u64.to_le_bytes());
        segment.extend(note("INITIUM", ITAG_LOAD, &load_desc));

        let mut tags = Vec::new();
        scan_note_segment(&segment, &mut tags).unwrap();
        assert_eq!(tags.len(), 2);
        assert!(matches!(tags[0], ImageTag::Image(ImageTagImage { version: 1, .. })));
        let ImageTag::Load(load) = &tags[1] else { panic!("expected load tag") };
        assert_eq!(load.alignment, 0x20_0000);
    }

    #[test]
    fn foreign_named_notes_are_ignored() {
        let segment = note("GNU", 1, &[0u8; 16]);
        let mut tags = Vec::new();
        scan_note_segment(&segment, &mut tags).unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn undersized_descriptor_is_malformed() {
        let segment = note("INITIUM", ITAG_IMAGE, &[0u8; 4]);
        let mut tags = Vec::new();
        assert_eq!(scan_note_segment(&segment, &mut tags), Err(Status::MalformedImage));
    }

    #[test]
    fn duplicate_image_tag_is_rejected() {
        let desc = [0u8; 8];
        let mut segment = note("INITIUM", ITAG_IMAGE, &desc);
        segment.extend(note("INITIUM", ITAG_IMAGE, &desc));
        let mut tags = Vec::new();
        assert_eq!(scan_note_segment(&segment, &mut tags), Err(Status::MalformedImage));
    }

    #[test]
    fn load_segments_rejects_non_elf_input() {
        assert_eq!(load_segments(&[0u8; 16]), Err(Status::UnknownImage));
    }

    #[test]
    fn section_header_table_rejects_non_elf_input() {
        assert_eq!(section_header_table(&[0u8; 16]), Err(Status::UnknownImage));
    }

    #[test]
    fn duplicate_option_and_mapping_tags_are_allowed() {
        let opt_desc = {
            let mut d = alloc::vec![0u8; 16];
            d[4..8].copy_from_slice(&0u32.to_le_bytes());
            d
        };
        let mut segment = note("INITIUM", ITAG_OPTION, &opt_desc);
        segment.extend(note("INITIUM", ITAG_OPTION, &opt_desc));
        let mut tags = Vec::new();
        scan_note_segment(&segment, &mut tags).unwrap();
        assert_eq!(tags.len(), 2);
    }
}
