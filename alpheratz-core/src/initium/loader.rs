//! Kernel-independent load orchestration: placing the kernel image,
//! installing additional mappings, and authoring the boot-info tag list.
//!
//! Everything here stops short of the two things that are genuinely
//! architecture-specific: building page tables and jumping into the kernel.
//! Those are pushed out through [`ArchLoader`] (page-table construction,
//! CPU-feature checks, arch setup) and [`PhysWriter`] (the raw copy of
//! loader-resident bytes to a physical destination, which on real hardware
//! is just a pointer write through the loader's own identity mapping, and
//! in tests is a `BTreeMap` standing in for physical memory).

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::Value;
use crate::initium::image::{self, Image, ImageTagOption, LOAD_FLAG_FIXED, OptionType};
use crate::initium::tags::TagListBuilder;
use crate::memory::{AllocFlags, MemoryType, PhysAllocator, PAGE_SIZE};
use crate::mmu::{MappingRecord, MmuContext, Mode, TrackedMmu};
use crate::status::{Result, Status};
use crate::vmem::VirtualAllocator;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn is_pow2(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Validated, defaulted kernel load parameters (the Load image tag, after
/// `check_alignment_params`/`check_virt_map_params`). `alignment == 0` means
/// "page size" throughout, matching the image-tag wire format's convention.
#[derive(Debug, Clone, Copy)]
pub struct LoadParams {
    pub flags: u32,
    pub alignment: u64,
    pub min_alignment: u64,
    pub virt_map_base: u64,
    pub virt_map_size: u64,
}

impl LoadParams {
    fn from_image(image: &Image) -> LoadParams {
        match image.load() {
            Some(l) => LoadParams {
                flags: l.flags,
                alignment: l.alignment,
                min_alignment: l.min_alignment,
                virt_map_base: l.virt_map_base,
                virt_map_size: l.virt_map_size,
            },
            None => LoadParams { flags: 0, alignment: 0, min_alignment: 0, virt_map_base: 0, virt_map_size: 0 },
        }
    }

    /// `check_alignment_params` + `check_virt_map_params`.
    fn validate(&mut self, mode: Mode) -> Result<()> {
        if self.alignment != 0 && (self.alignment < PAGE_SIZE || !is_pow2(self.alignment)) {
            return Err(Status::MalformedImage);
        }
        if self.min_alignment != 0 {
            if self.min_alignment < PAGE_SIZE || self.min_alignment > self.alignment || !is_pow2(self.min_alignment) {
                return Err(Status::MalformedImage);
            }
        } else {
            self.min_alignment = self.alignment;
        }

        if self.virt_map_base % PAGE_SIZE != 0 || self.virt_map_size % PAGE_SIZE != 0 {
            return Err(Status::MalformedImage);
        }
        if self.virt_map_base != 0 && self.virt_map_size == 0 {
            return Err(Status::MalformedImage);
        }
        if self.virt_map_base.checked_add(self.virt_map_size).is_none() {
            return Err(Status::MalformedImage);
        }

        if mode == Mode::Bits32 {
            if self.virt_map_base == 0 && self.virt_map_size == 0 {
                self.virt_map_size = 1u64 << 32;
            } else if self.virt_map_base + self.virt_map_size > 1u64 << 32 {
                return Err(Status::MalformedImage);
            }
        }

        Ok(())
    }
}

/// The architecture seam: page-table construction, CPU-feature validation,
/// and arch-specific setup. Trampoline assembly and the actual jump into the
/// kernel live on the other side of [`enter`](ArchLoader::enter), which
/// this module never calls itself — the caller invokes it once it is ready
/// to give up control.
pub trait ArchLoader {
    type Mmu: MmuContext;

    /// A fresh page-table context for `mode`; `root_ty` is `Pagetables` for
    /// the kernel's own address space and `Internal` for the throwaway
    /// trampoline context so its pages are reclaimed by `finalize`... no,
    /// internal pages are never reclaimed, only converted to Free.
    fn create_mmu(&mut self, mode: Mode, root_ty: MemoryType) -> Self::Mmu;

    /// CPU feature / mode requirement check (`initium_arch_check_kernel`).
    fn check_kernel(&self, _image: &Image) -> Result<()> {
        Ok(())
    }

    /// Arch-specific load-parameter validation/defaulting beyond the
    /// generic alignment/virtual-map checks (`initium_arch_check_load_params`).
    fn check_load_params(&self, _mode: Mode, _params: &mut LoadParams) -> Result<()> {
        Ok(())
    }

    /// Arch-specific mappings installed once the kernel's address space
    /// exists but before the tag list is built (`initium_arch_setup`).
    fn setup(&mut self, _mmu: &mut TrackedMmu<Self::Mmu>) -> Result<()> {
        Ok(())
    }
}

/// Copies loader-resident bytes to a physical destination. On real hardware
/// this is a pointer write through the loader's own identity mapping;
/// nothing about it is architecture-specific, but it is still pushed behind
/// a trait so unit tests can substitute an in-memory stand-in for "physical
/// memory" instead of dereferencing arbitrary addresses.
pub trait PhysWriter {
    fn write(&mut self, phys: u64, data: &[u8]);
}

/// Where the kernel's own boot device came from, resolved by the caller
/// against the device tree and `root_device` environment variable
/// (`add_bootdev_tag`); the device tree itself is not known to this module.
pub enum BootDeviceInfo {
    None,
    Other(String),
    Fs(String),
}

/// The loader's own running footprint, needed to build the trampoline's
/// temporary identity-mapped address space (`setup_trampoline`). Only the
/// firmware entry stub knows its own link-time extent.
pub struct LoaderFootprint {
    pub virt_start: u64,
    pub phys_start: u64,
    pub size: u64,
}

pub struct LoadRequest<'a> {
    pub file: &'a [u8],
    pub image: &'a Image,
    pub modules: &'a [(String, &'a [u8])],
    /// Resolved `(option name, value)` pairs; every option tag on the image
    /// must have a matching entry, bound into the environment by the
    /// `initium` command before `load` ever runs.
    pub option_values: &'a [(String, Value)],
    pub boot_device: BootDeviceInfo,
    pub loader_footprint: LoaderFootprint,
}

/// Everything the caller needs to actually start the kernel: the finished
/// address spaces and tag list, handed back instead of entering the kernel
/// directly so this module never performs the unsafe jump itself.
pub struct LoadOutcome<M> {
    pub mode: Mode,
    pub entry: u64,
    pub kernel_mmu_root: u64,
    pub trampoline_mmu: M,
    pub trampoline_phys: u64,
    pub trampoline_virt: u64,
    pub tags_phys: u64,
    pub tags_virt: u64,
}

fn alloc_virtual(
    vmem: &mut VirtualAllocator,
    mmu: &mut TrackedMmu<impl MmuContext>,
    phys: u64,
    size: u64,
) -> Result<u64> {
    let addr = vmem.alloc(size, 0).ok_or(Status::NoMemory)?;
    if !mmu.map(addr, phys, size) {
        crate::internal_error!("invalid virtual mapping (phys {phys:#x})");
    }
    Ok(addr)
}

fn map_virtual(
    vmem: &mut VirtualAllocator,
    mmu: &mut TrackedMmu<impl MmuContext>,
    virt: u64,
    phys: u64,
    size: u64,
) -> Result<()> {
    if !vmem.insert(virt, size) {
        return Err(Status::MalformedImage);
    }
    if !mmu.map(virt, phys, size) {
        crate::internal_error!("invalid virtual mapping (virt {virt:#x})");
    }
    Ok(())
}

/// Allocate a single block of physical memory covering `[virt_base,
/// virt_end)` and map it in, backing off the alignment in powers of two
/// until `load.min_alignment` is reached (`allocate_kernel`).
fn allocate_kernel(
    phys: &mut impl PhysAllocator,
    mmu: &mut TrackedMmu<impl MmuContext>,
    load: &LoadParams,
    virt_base: u64,
    virt_end: u64,
) -> Result<u64> {
    if virt_base % PAGE_SIZE != 0 {
        crate::internal_error!("kernel load address is not page aligned");
    }
    let size = align_up(virt_end - virt_base, PAGE_SIZE);

    let mut align = if load.alignment != 0 { load.alignment } else { PAGE_SIZE };
    let min_align = if load.min_alignment != 0 { load.min_alignment } else { PAGE_SIZE };

    let mut dest = None;
    while align >= min_align {
        match phys.alloc(size, align, 0, 0, MemoryType::Allocated, AllocFlags::HIGH | AllocFlags::CAN_FAIL) {
            Ok(p) => {
                dest = Some(p);
                break;
            }
            Err(_) => align >>= 1,
        }
    }
    // Exhausting every alignment down to
    // `min_alignment` is a panic ("insufficient memory"), not a recoverable
    // boot error — matching `FreeListAllocator::alloc`/`FirmwareAllocator::alloc`'s
    // own `internal_error!` on exhaustion.
    let dest = dest.unwrap_or_else(|| crate::internal_error!("insufficient memory for kernel image"));

    if !mmu.map(virt_base, dest, size) {
        crate::internal_error!("invalid kernel virtual mapping");
    }
    Ok(dest)
}

/// Allocate memory for one segment at its fixed physical address
/// (`allocate_segment`, the `INITIUM_LOAD_FIXED` path).
fn allocate_segment(
    phys: &mut impl PhysAllocator,
    mmu: &mut TrackedMmu<impl MmuContext>,
    virt: u64,
    target_phys: u64,
    size: u64,
) -> Result<u64> {
    if virt % PAGE_SIZE != 0 || target_phys % PAGE_SIZE != 0 {
        crate::internal_error!("segment load address is not page aligned");
    }
    let size = align_up(size, PAGE_SIZE);
    let dest = phys.alloc(size, 0, target_phys, target_phys + size, MemoryType::Allocated, AllocFlags::empty())?;

    if !mmu.map(virt, dest, size) {
        crate::internal_error!("invalid segment virtual mapping");
    }
    Ok(dest)
}

fn copy_segment(file: &[u8], seg: &image::LoadSegment, dest: u64, writer: &mut impl PhysWriter) -> Result<()> {
    let start = seg.offset as usize;
    let end = start + seg.filesz as usize;
    let data = file.get(start..end).ok_or(Status::MalformedImage)?;
    writer.write(dest, data);

    let bss = seg.memsz.saturating_sub(seg.filesz);
    if bss > 0 {
        writer.write(dest + seg.filesz, &alloc::vec![0u8; bss as usize]);
    }
    Ok(())
}

fn encode_option(opt: &ImageTagOption, value: &Value) -> Result<(u8, Vec<u8>)> {
    match (opt.option_type, value) {
        (OptionType::Boolean, Value::Boolean(b)) => Ok((0, alloc::vec![*b as u8])),
        (OptionType::String, Value::String(s)) => {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            Ok((1, bytes))
        }
        (OptionType::Integer, Value::Integer(i)) => Ok((2, i.to_le_bytes().to_vec())),
        _ => Err(Status::InvalidArg),
    }
}

/// Run the whole Initium load sequence: place the kernel
/// image, apply its requested mappings, let the architecture do its own
/// setup, load modules and optional section headers, allocate the stack and
/// kernel-entry trampoline, and assemble the final tag list. Physical
/// allocation is assumed complete once this returns — `finalize` runs as
/// the very last allocating step, mirroring `add_memory_tags`.
pub fn load<A: ArchLoader>(
    arch: &mut A,
    phys: &mut impl PhysAllocator,
    writer: &mut impl PhysWriter,
    req: LoadRequest,
) -> Result<LoadOutcome<A::Mmu>> {
    let image = req.image;
    arch.check_kernel(image)?;

    let mut load_params = LoadParams::from_image(image);
    load_params.validate(image.mode)?;
    arch.check_load_params(image.mode, &mut load_params)?;

    let mut mmu = TrackedMmu::new(arch.create_mmu(image.mode, MemoryType::PageTables));
    let mut vmem = VirtualAllocator::new(load_params.virt_map_base, load_params.virt_map_size);
    vmem.reserve(0, PAGE_SIZE);

    // For now, assume the tag list never exceeds a page (matches the
    // source's own simplifying assumption); reserved up front so the Core
    // tag can carry its final physical address without a backpatch.
    let tags_phys = phys.alloc(PAGE_SIZE, 0, 0, 0, MemoryType::Reclaimable, AllocFlags::HIGH)?;

    // Load the kernel image.
    let segments = image::load_segments(req.file)?;
    let fixed = load_params.flags & LOAD_FLAG_FIXED != 0;
    let mut kernel_phys = 0u64;

    if !fixed {
        let mut virt_base = u64::MAX;
        let mut virt_end = 0u64;
        for seg in &segments {
            if seg.memsz == 0 {
                continue;
            }
            virt_base = virt_base.min(seg.vaddr);
            virt_end = virt_end.max(seg.vaddr + seg.memsz);
        }
        if virt_base == u64::MAX {
            return Err(Status::MalformedImage);
        }

        let load_base = allocate_kernel(phys, &mut mmu, &load_params, virt_base, virt_end)?;
        kernel_phys = load_base;

        for seg in &segments {
            if seg.memsz == 0 {
                continue;
            }
            let dest = load_base + (seg.vaddr - virt_base);
            copy_segment(req.file, seg, dest, writer)?;
        }
    } else {
        for seg in &segments {
            if seg.memsz == 0 {
                continue;
            }
            let dest = allocate_segment(phys, &mut mmu, seg.vaddr, seg.paddr, seg.memsz)?;
            if kernel_phys == 0 {
                kernel_phys = dest;
            }
            copy_segment(req.file, seg, dest, writer)?;
        }
    }

    // Additional mappings requested by the image itself.
    for m in image.mappings() {
        if m.virt == u64::MAX {
            alloc_virtual(&mut vmem, &mut mmu, m.phys, m.size)?;
        } else {
            map_virtual(&mut vmem, &mut mmu, m.virt, m.phys, m.size)?;
        }
    }

    // ArchLoader setup, then the tag list can finally be mapped.
    arch.setup(&mut mmu)?;
    let tags_virt = alloc_virtual(&mut vmem, &mut mmu, tags_phys, PAGE_SIZE)?;

    // Optional section headers.
    let sections = if image.image().map(|i| i.flags & image::IMAGE_FLAG_SECTIONS != 0).unwrap_or(false) {
        Some(image::section_header_table(req.file)?)
    } else {
        None
    };

    // Modules.
    let mut module_tags = Vec::new();
    for (name, data) in req.modules {
        let size = align_up(data.len() as u64, PAGE_SIZE);
        let dest = phys.alloc(size, 0, 0, 0, MemoryType::Modules, AllocFlags::HIGH)?;
        writer.write(dest, data);
        module_tags.push((dest, data.len() as u32, name.clone()));
    }

    // Stack.
    let stack_phys = phys.alloc(PAGE_SIZE, 0, 0, 0, MemoryType::Stack, AllocFlags::HIGH)?;
    let stack_base = alloc_virtual(&mut vmem, &mut mmu, stack_phys, PAGE_SIZE)?;

    // Kernel-entry trampoline: a temporary address space that identity-maps
    // the loader and a single page carrying the entry sequence, so the loader
    // never has to assume it lives at an identity-mapped address in the
    // kernel's own address space (`setup_trampoline`).
    vmem.reserve(req.loader_footprint.virt_start, req.loader_footprint.size);
    let trampoline_phys = phys.alloc(PAGE_SIZE, 0, 0, 0, MemoryType::Internal, AllocFlags::HIGH)?;
    let trampoline_virt = alloc_virtual(&mut vmem, &mut mmu, trampoline_phys, PAGE_SIZE)?;

    let mut trampoline_mmu = arch.create_mmu(image.mode, MemoryType::Internal);
    let loader_ok = trampoline_mmu.map(req.loader_footprint.virt_start, req.loader_footprint.phys_start, req.loader_footprint.size);
    let page_ok = trampoline_mmu.map(trampoline_virt, trampoline_phys, PAGE_SIZE);
    if !loader_ok || !page_ok {
        crate::internal_error!("failed to construct kernel-entry trampoline address space");
    }

    // Options. Every option tag must have a value bound by the
    // `initium` command; a missing entry means the environment and image
    // have drifted out of sync, which is an internal error, not a boot one.
    let mut option_tags = Vec::new();
    for opt in image.options() {
        let value = req
            .option_values
            .iter()
            .find(|(n, _)| n == &opt.name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| crate::internal_error!("option '{}' has no bound value", opt.name));
        let (code, bytes) = encode_option(opt, value)?;
        option_tags.push((code, opt.name.clone(), bytes));
    }

    // All physical allocation is done; finalize to get the map the kernel
    // will actually see (`add_memory_tags`).
    let memory_map = phys.finalize();
    let vmem_mappings = mmu.mappings_sorted();

    let mut builder = TagListBuilder::new();
    builder.core(tags_phys, kernel_phys, stack_base, stack_phys, PAGE_SIZE as u32);
    if let Some((shstrndx, entsize, raw)) = &sections {
        builder.sections(*shstrndx, *entsize, raw);
    }
    for (addr, size, name) in &module_tags {
        builder.module(*addr, *size, name);
    }
    for (code, name, bytes) in &option_tags {
        builder.option(*code, name, bytes);
    }
    match &req.boot_device {
        BootDeviceInfo::None => builder.boot_dev_none(),
        BootDeviceInfo::Other(s) => builder.boot_dev_other(s),
        BootDeviceInfo::Fs(uuid) => builder.boot_dev_fs(uuid),
    }
    for range in &memory_map {
        builder.memory(range.start, range.size, range.ty);
    }
    for mapping in &vmem_mappings {
        builder.vmem(*mapping);
    }

    let tags_bytes = builder.finish();
    if tags_bytes.len() as u64 > PAGE_SIZE {
        crate::internal_error!("info tag list ({} bytes) exceeds one page", tags_bytes.len());
    }
    writer.write(tags_phys, &tags_bytes);

    Ok(LoadOutcome {
        mode: image.mode,
        entry: image.entry,
        kernel_mmu_root: mmu.arch.root_phys(),
        trampoline_mmu,
        trampoline_phys,
        trampoline_virt,
        tags_phys,
        tags_virt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initium::image::{ImageTag, ImageTagImage, ImageTagLoad};
    use crate::memory::FreeListAllocator;
    use crate::memory::TARGET_PHYS_MIN;
    use alloc::collections::BTreeMap;

    struct FakeArch {
        next_root: u64,
    }

    struct FakeMmu {
        mode: Mode,
        root: u64,
        table: BTreeMap<u64, u64>,
    }

    impl MmuContext for FakeMmu {
        fn mode(&self) -> Mode {
            self.mode
        }
        fn root_phys(&self) -> u64 {
            self.root
        }
        fn map(&mut self, virt: u64, phys: u64, size: u64) -> bool {
            let pages = size / PAGE_SIZE;
            for i in 0..pages {
                let v = virt + i * PAGE_SIZE;
                let p = phys + i * PAGE_SIZE;
                if let Some(&existing) = self.table.get(&v) {
                    if existing != p {
                        return false;
                    }
                } else {
                    self.table.insert(v, p);
                }
            }
            true
        }
    }

    impl ArchLoader for FakeArch {
        type Mmu = FakeMmu;

        fn create_mmu(&mut self, mode: Mode, _root_ty: MemoryType) -> FakeMmu {
            self.next_root += PAGE_SIZE;
            FakeMmu { mode, root: self.next_root, table: BTreeMap::new() }
        }
    }

    #[derive(Default)]
    struct FakePhysWriter {
        written: BTreeMap<u64, Vec<u8>>,
    }

    impl PhysWriter for FakePhysWriter {
        fn write(&mut self, phys: u64, data: &[u8]) {
            self.written.insert(phys, data.to_vec());
        }
    }

    fn allocator() -> FreeListAllocator {
        let mut a = FreeListAllocator::new();
        a.add(TARGET_PHYS_MIN, 64 * (PAGE_SIZE as u64), MemoryType::Free);
        a
    }

    fn image_with(tags: Vec<ImageTag>) -> Image {
        Image { mode: Mode::Bits64, entry: 0x20_0000, tags }
    }

    #[test]
    fn load_params_defaults_min_alignment_to_alignment() {
        let image = image_with(alloc::vec![
            ImageTag::Image(ImageTagImage { version: 1, flags: 0 }),
            ImageTag::Load(ImageTagLoad {
                flags: 0,
                alignment: 0x20_0000,
                min_alignment: 0,
                virt_map_base: 0,
                virt_map_size: 0,
            }),
        ]);
        let mut params = LoadParams::from_image(&image);
        params.validate(Mode::Bits64).unwrap();
        assert_eq!(params.min_alignment, 0x20_0000);
    }

    #[test]
    fn load_params_32bit_defaults_to_full_4gb_window() {
        let image = image_with(alloc::vec![ImageTag::Image(ImageTagImage { version: 1, flags: 0 })]);
        let mut params = LoadParams::from_image(&image);
        params.validate(Mode::Bits32).unwrap();
        assert_eq!(params.virt_map_size, 1u64 << 32);
    }

    #[test]
    fn load_params_rejects_non_power_of_two_alignment() {
        let image = image_with(alloc::vec![
            ImageTag::Image(ImageTagImage { version: 1, flags: 0 }),
            ImageTag::Load(ImageTagLoad {
                flags: 0,
                alignment: 0x3000,
                min_alignment: 0,
                virt_map_base: 0,
                virt_map_size: 0,
            }),
        ]);
        let mut params = LoadParams::from_image(&image);
        assert_eq!(params.validate(Mode::Bits64), Err(Status::MalformedImage));
    }

    #[test]
    fn allocate_kernel_backs_off_alignment_until_min_is_satisfied() {
        let mut phys = allocator();
        // Reserve everything 2MiB-aligned except a single page so the first
        // (2MiB) alignment attempt must fail and the loop must retry with a
        // smaller alignment before succeeding at page granularity.
        phys.protect(TARGET_PHYS_MIN, 63 * PAGE_SIZE);
        let mut mmu = TrackedMmu::new(FakeMmu { mode: Mode::Bits64, root: 0, table: BTreeMap::new() });
        let load = LoadParams { flags: 0, alignment: 0x20_0000, min_alignment: PAGE_SIZE, virt_map_base: 0, virt_map_size: 0 };
        let phys_addr = allocate_kernel(&mut phys, &mut mmu, &load, 0x10_0000, 0x10_1000).unwrap();
        assert_eq!(phys_addr % PAGE_SIZE, 0);
    }

    /// `load`'s kernel-placement path (no `INITIUM_LOAD_FIXED`) allocates a
    /// single block and installs a single mapping for it, so address-order
    /// Vmem tags carry exactly one entry for the whole image regardless of
    /// how many `PT_LOAD` segments it has.
    #[test]
    fn non_fixed_placement_produces_one_mapping_covering_the_kernel() {
        let mut phys = allocator();
        let mut mmu = TrackedMmu::new(FakeMmu { mode: Mode::Bits64, root: 0, table: BTreeMap::new() });
        let load_params = LoadParams { flags: 0, alignment: 0, min_alignment: 0, virt_map_base: 0, virt_map_size: 0x1000_0000 };
        let file = alloc::vec![0xABu8; 0x2000];
        let seg = image::LoadSegment { vaddr: 0x10_0000, paddr: 0, offset: 0, filesz: 0x1000, memsz: 0x2000 };

        let load_base = allocate_kernel(&mut phys, &mut mmu, &load_params, seg.vaddr, seg.vaddr + seg.memsz).unwrap();
        let mut writer = FakePhysWriter::default();
        copy_segment(&file, &seg, load_base, &mut writer).unwrap();

        let mappings = mmu.mappings_sorted();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].virt, 0x10_0000);
        assert_eq!(mappings[0].size, align_up(seg.memsz, PAGE_SIZE));
        assert!(writer.written.contains_key(&load_base));
    }

    #[test]
    fn fixed_flag_places_each_segment_independently() {
        let mut phys = allocator();
        let mut mmu = TrackedMmu::new(FakeMmu { mode: Mode::Bits64, root: 0, table: BTreeMap::new() });
        let a = allocate_segment(&mut phys, &mut mmu, 0x10_0000, TARGET_PHYS_MIN, PAGE_SIZE).unwrap();
        let b = allocate_segment(&mut phys, &mut mmu, 0x20_0000, TARGET_PHYS_MIN + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a, TARGET_PHYS_MIN);
        assert_eq!(b, TARGET_PHYS_MIN + PAGE_SIZE);
        let mappings = mmu.mappings_sorted();
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn encode_option_rejects_type_mismatch() {
        let opt = ImageTagOption { option_type: OptionType::Boolean, name: "quiet".into(), default: Vec::new() };
        assert_eq!(encode_option(&opt, &Value::Integer(1)), Err(Status::InvalidArg));
    }

    #[test]
    fn encode_option_encodes_each_type() {
        let bool_opt = ImageTagOption { option_type: OptionType::Boolean, name: "a".into(), default: Vec::new() };
        let (code, bytes) = encode_option(&bool_opt, &Value::Boolean(true)).unwrap();
        assert_eq!((code, bytes), (0, alloc::vec![1u8]));

        let str_opt = ImageTagOption { option_type: OptionType::String, name: "b".into(), default: Vec::new() };
        let (code, bytes) = encode_option(&str_opt, &Value::String("hi".into())).unwrap();
        assert_eq!(code, 1);
        assert_eq!(bytes, alloc::vec![b'h', b'i', 0]);

        let int_opt = ImageTagOption { option_type: OptionType::Integer, name: "c".into(), default: Vec::new() };
        let (code, bytes) = encode_option(&int_opt, &Value::Integer(7)).unwrap();
        assert_eq!(code, 2);
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 7);
    }

    fn note_record(note_type: u32, desc: &[u8]) -> Vec<u8> {
        let name = b"INITIUM\0";
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&note_type.to_le_bytes());
        out.extend_from_slice(name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    /// A real (if minimal) ELF64 executable — one `PT_LOAD` segment and one
    /// `PT_NOTE` segment carrying the given Initium notes — so `load` is
    /// exercised against actual `xmas_elf` parsing rather than just its
    /// internal helpers.
    fn minimal_kernel_elf(notes: &[(u32, Vec<u8>)], entry: u64, load_data: &[u8]) -> Vec<u8> {
        let note_bytes: Vec<u8> = notes.iter().flat_map(|(ty, desc)| note_record(*ty, desc)).collect();

        let ehdr_size = 64u64;
        let phdr_size = 56u64;
        let note_offset = ehdr_size + 2 * phdr_size;
        let load_offset = note_offset + note_bytes.len() as u64;

        let mut file = Vec::new();
        file.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        file.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
        file.extend_from_slice(&0x3Eu16.to_le_bytes()); // e_machine: EM_X86_64
        file.extend_from_slice(&1u32.to_le_bytes()); // e_version
        file.extend_from_slice(&entry.to_le_bytes()); // e_entry
        file.extend_from_slice(&ehdr_size.to_le_bytes()); // e_phoff
        file.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        file.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        file.extend_from_slice(&(ehdr_size as u16).to_le_bytes()); // e_ehsize
        file.extend_from_slice(&(phdr_size as u16).to_le_bytes()); // e_phentsize
        file.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
        file.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        file.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        file.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        // PT_LOAD
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&7u32.to_le_bytes());
        file.extend_from_slice(&load_offset.to_le_bytes());
        file.extend_from_slice(&entry.to_le_bytes());
        file.extend_from_slice(&entry.to_le_bytes());
        file.extend_from_slice(&(load_data.len() as u64).to_le_bytes());
        file.extend_from_slice(&(load_data.len() as u64 + 0x1000).to_le_bytes());
        file.extend_from_slice(&0x1000u64.to_le_bytes());

        // PT_NOTE
        file.extend_from_slice(&4u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&note_offset.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&(note_bytes.len() as u64).to_le_bytes());
        file.extend_from_slice(&(note_bytes.len() as u64).to_le_bytes());
        file.extend_from_slice(&4u64.to_le_bytes());

        file.extend_from_slice(&note_bytes);
        file.extend_from_slice(load_data);
        file
    }

    #[test]
    fn load_runs_the_full_pipeline_over_a_real_kernel_image() {
        let mut image_desc = Vec::new();
        image_desc.extend_from_slice(&1u32.to_le_bytes()); // version
        image_desc.extend_from_slice(&0u32.to_le_bytes()); // flags

        let mut load_desc = alloc::vec![0u8; 40];
        load_desc[32..40].copy_from_slice(&0x100_0000u64.to_le_bytes()); // virt_map_size

        let entry = 0x20_0000u64;
        let load_data = alloc::vec![0x90u8; 0x400];
        let file = minimal_kernel_elf(&[(0, image_desc), (1, load_desc)], entry, &load_data);
        let image = image::parse(&file).unwrap();

        let mut phys = allocator();
        let mut arch = FakeArch { next_root: 0 };
        let mut writer = FakePhysWriter::default();
        let req = LoadRequest {
            file: &file,
            image: &image,
            modules: &[],
            option_values: &[],
            boot_device: BootDeviceInfo::None,
            loader_footprint: LoaderFootprint { virt_start: 0, phys_start: 0, size: PAGE_SIZE },
        };

        let outcome = load(&mut arch, &mut phys, &mut writer, req).unwrap();
        assert_eq!(outcome.entry, entry);
        assert_eq!(outcome.mode, Mode::Bits64);
        assert!(writer.written.contains_key(&outcome.tags_phys));
        assert_ne!(outcome.kernel_mmu_root, outcome.trampoline_mmu.root);
    }

    #[test]
    fn mapping_record_helper_round_trips_into_vmem_tag() {
        let mapping = MappingRecord { virt: 0x1000, phys: 0x2000, size: PAGE_SIZE };
        let mut builder = TagListBuilder::new();
        builder.core(0, 0, 0, 0, 0);
        builder.vmem(mapping);
        let bytes = builder.finish();
        assert!(bytes.len() > 8);
    }
}
