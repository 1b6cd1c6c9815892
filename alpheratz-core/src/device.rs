//! Polymorphic device tree: registration, lookup by name/UUID/label, and
//! the disk-then-partition probing fallback.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::fs::Mount;
use crate::status::{Result, Status};

pub const DEFAULT_BOUNCE_CHUNK: u64 = 2048;

/// Logical sector size assumed by [`PartitionScheme`] LBA arithmetic (MBR
/// and GPT both address in 512-byte units regardless of the underlying
/// device's own `block_size`).
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Partition,
    Network,
    Image,
}

/// Per-device operations (the source's `device_ops_t` vtable).
pub trait DeviceOps {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Disks additionally expose block-aligned reads; non-disks return
    /// `NotSupported`.
    fn read_blocks(&self, _buf: &mut [u8], _block_count: u64, _lba: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn block_size(&self) -> u64 {
        DEFAULT_BOUNCE_CHUNK
    }

    /// A short human-readable identification string for the menu/shell
    /// (`device.c`'s `print_device_list`).
    fn identify(&self) -> String {
        String::from("Unknown")
    }
}

pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    pub ops: alloc::boxed::Box<dyn DeviceOps>,
    pub mount: RefCell<Option<Rc<Mount>>>,
}

impl Device {
    pub fn new(name: impl Into<String>, kind: DeviceKind, ops: alloc::boxed::Box<dyn DeviceOps>) -> Self {
        Device { name: name.into(), kind, ops, mount: RefCell::new(None) }
    }

    /// Generic `read`, bouncing through a block-sized buffer for disks when
    /// the request is unaligned to the block size or the caller's buffer is
    /// not 8-byte aligned.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !matches!(self.kind, DeviceKind::Disk | DeviceKind::Partition) {
            return self.ops.read(buf, offset);
        }
        self.disk_device_read(buf, offset)
    }

    fn disk_device_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let block = self.ops.block_size();
        let aligned_offset = offset % block == 0;
        let aligned_buf = (buf.as_ptr() as usize) % 8 == 0;
        let count = buf.len() as u64;

        if aligned_offset && aligned_buf && count % block == 0 {
            let lba = offset / block;
            return self.ops.read_blocks(buf, count / block, lba);
        }

        // Bounce path: read one block at a time into a scratch buffer and
        // copy out the requested slice.
        let mut written = 0u64;
        let mut cur_offset = offset;
        let mut scratch = alloc::vec![0u8; block as usize];
        while written < count {
            let lba = cur_offset / block;
            let block_off = (cur_offset % block) as usize;
            self.ops.read_blocks(&mut scratch, 1, lba)?;
            let take = core::cmp::min(block as usize - block_off, (count - written) as usize);
            let dst_start = written as usize;
            buf[dst_start..dst_start + take].copy_from_slice(&scratch[block_off..block_off + take]);
            written += take as u64;
            cur_offset += take as u64;
        }
        Ok(())
    }

    pub fn identify(&self) -> String {
        self.ops.identify()
    }
}

/// One entry of a partition table, in 512-byte logical sectors.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEntry {
    pub start_lba: u64,
    pub size_lba: u64,
}

/// A partition-table format the device tree can probe a flat disk with once
/// `fs_probe` finds no filesystem directly on it.
pub trait PartitionScheme {
    /// Read `disk` and return its partition entries, or `None` if `disk`
    /// does not carry this scheme's signature.
    fn identify(&self, disk: &Device) -> Option<Vec<PartitionEntry>>;

    /// Whether `entry` is the partition the platform reports booting from.
    /// Default: match on starting LBA.
    fn is_boot_partition(&self, entry: &PartitionEntry, boot_start_lba: u64) -> bool {
        entry.start_lba == boot_start_lba
    }
}

/// MBR: signature `0x55AA` at offset `0x1FE`, four 16-byte primary
/// entries starting at `0x1BE` (partition type at +4, start LBA and sector
/// count as little-endian `u32`s at +8 and +12).
pub struct MbrScheme;

impl PartitionScheme for MbrScheme {
    fn identify(&self, disk: &Device) -> Option<Vec<PartitionEntry>> {
        let mut sector = alloc::vec![0u8; SECTOR_SIZE as usize];
        disk.read(&mut sector, 0).ok()?;
        if sector[0x1FE] != 0x55 || sector[0x1FF] != 0xAA {
            return None;
        }

        let mut entries = Vec::new();
        for i in 0..4u64 {
            let base = 0x1BE + (i * 16) as usize;
            if sector[base + 4] == 0 {
                continue;
            }
            let start_lba = u32::from_le_bytes(sector[base + 8..base + 12].try_into().unwrap()) as u64;
            let size_lba = u32::from_le_bytes(sector[base + 12..base + 16].try_into().unwrap()) as u64;
            if size_lba == 0 {
                continue;
            }
            entries.push(PartitionEntry { start_lba, size_lba });
        }
        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }
}

/// GPT: the `"EFI PART"` header signature at LBA 1, followed by the
/// partition-entry-array LBA/count/size fields used to locate and walk the
/// entry array itself.
pub struct GptScheme;

impl PartitionScheme for GptScheme {
    fn identify(&self, disk: &Device) -> Option<Vec<PartitionEntry>> {
        let mut header = alloc::vec![0u8; SECTOR_SIZE as usize];
        disk.read(&mut header, SECTOR_SIZE).ok()?;
        if &header[0..8] != b"EFI PART" {
            return None;
        }

        let entry_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
        let entry_count = u32::from_le_bytes(header[80..84].try_into().unwrap()) as u64;
        let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap()) as u64;
        if entry_count == 0 || entry_size == 0 || entry_size > SECTOR_SIZE {
            return None;
        }

        let per_sector = SECTOR_SIZE / entry_size;
        let mut entries = Vec::new();
        let mut scratch = alloc::vec![0u8; SECTOR_SIZE as usize];
        let mut remaining = entry_count;
        let mut lba = entry_lba;
        while remaining > 0 {
            disk.read(&mut scratch, lba * SECTOR_SIZE).ok()?;
            for slot in 0..per_sector.min(remaining) {
                let base = (slot * entry_size) as usize;
                if scratch[base..base + 16].iter().all(|b| *b == 0) {
                    continue; // unused entry: type GUID all-zero
                }
                let start_lba = u64::from_le_bytes(scratch[base + 32..base + 40].try_into().unwrap());
                let last_lba = u64::from_le_bytes(scratch[base + 40..base + 48].try_into().unwrap());
                entries.push(PartitionEntry { start_lba, size_lba: last_lba + 1 - start_lba });
            }
            remaining = remaining.saturating_sub(per_sector);
            lba += 1;
        }
        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }
}

/// A synthesized `parent,index` child disk: a byte/LBA-offset window into
/// its parent device.
struct PartitionOps {
    parent: Rc<Device>,
    start_lba: u64,
    size_lba: u64,
}

impl DeviceOps for PartitionOps {
    fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn read_blocks(&self, buf: &mut [u8], block_count: u64, lba: u64) -> Result<()> {
        self.parent.ops.read_blocks(buf, block_count, self.start_lba + lba)
    }

    fn block_size(&self) -> u64 {
        self.parent.ops.block_size()
    }

    fn identify(&self) -> String {
        alloc::format!("{} partition ({} sectors)", self.parent.name, self.size_lba)
    }
}

/// The process-wide device tree, replacing the source's `device_list`
/// static with an owned collection threaded through `BootContext`.
#[derive(Default)]
pub struct DeviceTree {
    devices: Vec<Rc<Device>>,
    pub boot_device: Option<Rc<Device>>,
}

impl DeviceTree {
    pub fn new() -> Self {
        DeviceTree::default()
    }

    /// Register a device, probing it for a filesystem. Fails the whole
    /// process (internal error) on a duplicate name.
    pub fn register(&mut self, device: Device, probe: impl FnOnce(&Device) -> Option<Mount>) -> Rc<Device> {
        if self.lookup(&device.name).is_some() {
            crate::internal_error!("device named '{}' already exists", device.name);
        }
        let device = Rc::new(device);
        if let Some(mount) = probe(&device) {
            *device.mount.borrow_mut() = Some(Rc::new(mount));
        }
        self.devices.push(device.clone());
        device
    }

    /// Register a disk, and, when `probe` finds no filesystem directly on
    /// it, walk `schemes` to synthesize `parent,index` child disks and
    /// recurse into each — an MBR extended partition or a GPT
    /// protective-MBR shell are both handled by recursing past a
    /// synthesized child that itself carries no filesystem. `boot_lba`, when
    /// the platform reports the LBA it booted from, is carried onto whichever
    /// device — the flat disk or one of its synthesized partitions — actually
    /// turns out to be the boot device, rather than being lost at the first
    /// `fs_probe` failure.
    pub fn register_with_schemes(
        &mut self,
        device: Device,
        probe: &dyn Fn(&Device) -> Option<Mount>,
        schemes: &[&dyn PartitionScheme],
        boot_lba: Option<u64>,
    ) -> Rc<Device> {
        let disk = self.register(device, |d| probe(d));
        if disk.mount.borrow().is_some() {
            if boot_lba.is_some() {
                self.boot_device = Some(disk.clone());
            }
        } else {
            self.synthesize_partitions(&disk, probe, schemes, boot_lba);
        }
        disk
    }

    fn synthesize_partitions(
        &mut self,
        parent: &Rc<Device>,
        probe: &dyn Fn(&Device) -> Option<Mount>,
        schemes: &[&dyn PartitionScheme],
        boot_lba: Option<u64>,
    ) {
        for scheme in schemes {
            let Some(entries) = scheme.identify(parent) else { continue };
            for (i, entry) in entries.into_iter().enumerate() {
                let name = alloc::format!("{},{i}", parent.name);
                let ops = PartitionOps { parent: parent.clone(), start_lba: entry.start_lba, size_lba: entry.size_lba };
                let child = self.register(Device::new(name, DeviceKind::Partition, alloc::boxed::Box::new(ops)), |d| probe(d));

                if boot_lba.is_some_and(|lba| scheme.is_boot_partition(&entry, lba)) {
                    self.boot_device = Some(child.clone());
                }
                if child.mount.borrow().is_none() {
                    self.synthesize_partitions(&child, probe, schemes, boot_lba);
                }
            }
            break;
        }
    }

    /// Look up by bare name, `uuid:<x>`, or `label:<x>`.
    pub fn lookup(&self, name: &str) -> Option<Rc<Device>> {
        if let Some(uuid) = name.strip_prefix("uuid:") {
            return self.devices.iter().find(|d| d.mount.borrow().as_ref().and_then(|m| m.uuid.as_deref()) == Some(uuid)).cloned();
        }
        if let Some(label) = name.strip_prefix("label:") {
            return self
                .devices
                .iter()
                .find(|d| d.mount.borrow().as_ref().and_then(|m| m.label.as_deref()) == Some(label))
                .cloned();
        }
        self.devices.iter().find(|d| d.name == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Device>> {
        self.devices.iter()
    }
}

/// Parse a leading `(devname)` prefix off `path`, resolving it against
/// `devices`. `None` when `path` carries no such prefix, in
/// which case the caller falls back to its own currently-selected device.
pub fn resolve_device_prefix<'p>(devices: &DeviceTree, path: &'p str) -> Option<(Rc<Device>, &'p str)> {
    let rest = path.strip_prefix('(')?;
    let (name, rest) = rest.split_once(')')?;
    let device = devices.lookup(name)?;
    Some((device, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;
    impl DeviceOps for NullOps {
        fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_finds_registered_device_by_name() {
        let mut tree = DeviceTree::new();
        tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullOps)), |_| None);
        assert!(tree.lookup("hd0").is_some());
        assert!(tree.lookup("hd1").is_none());
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_name_is_fatal() {
        let mut tree = DeviceTree::new();
        tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullOps)), |_| None);
        tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullOps)), |_| None);
    }

    struct BlockOps {
        data: Vec<u8>,
        block: u64,
    }
    impl DeviceOps for BlockOps {
        fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<()> {
            Err(Status::NotSupported)
        }
        fn read_blocks(&self, buf: &mut [u8], block_count: u64, lba: u64) -> Result<()> {
            let start = (lba * self.block) as usize;
            let len = (block_count * self.block) as usize;
            buf[..len].copy_from_slice(&self.data[start..start + len]);
            Ok(())
        }
        fn block_size(&self) -> u64 {
            self.block
        }
    }

    #[test]
    fn bounce_read_handles_unaligned_offset_and_count() {
        let data: Vec<u8> = (0u16..4096).map(|v| v as u8).collect();
        let dev = Device::new(
            "hd0",
            DeviceKind::Disk,
            alloc::boxed::Box::new(BlockOps { data: data.clone(), block: 2048 }),
        );
        let mut buf = alloc::vec![0u8; 3000];
        dev.read(&mut buf, 100).unwrap();
        assert_eq!(&buf[..], &data[100..3100]);
    }

    const FS_SIGNATURE: &[u8] = b"FS0!";

    /// One MBR disk, 20 512-byte sectors, a single primary partition at LBA
    /// 2 for 5 sectors carrying `FS_SIGNATURE` at its first byte.
    fn mbr_disk() -> Vec<u8> {
        let mut data = alloc::vec![0u8; 20 * 512];
        data[0x1FE] = 0x55;
        data[0x1FF] = 0xAA;
        let base = 0x1BE;
        data[base + 4] = 0x83; // Linux partition type
        data[base + 8..base + 12].copy_from_slice(&2u32.to_le_bytes());
        data[base + 12..base + 16].copy_from_slice(&5u32.to_le_bytes());
        data[2 * 512..2 * 512 + FS_SIGNATURE.len()].copy_from_slice(FS_SIGNATURE);
        data
    }

    fn probe_fs_signature(d: &Device) -> Option<Mount> {
        let mut buf = alloc::vec![0u8; FS_SIGNATURE.len()];
        d.read(&mut buf, 0).ok()?;
        (buf == FS_SIGNATURE).then(|| Mount { label: None, uuid: None, case_insensitive: false, ops: alloc::boxed::Box::new(NullFs) })
    }

    struct NullFs;
    impl crate::fs::FsOps for NullFs {
        fn root(&self) -> crate::fs::FsPrivate {
            crate::fs::FsPrivate::None
        }
        fn iterate(&self, _dir: &crate::fs::FsPrivate, _cb: &mut dyn FnMut(&str, &crate::fs::FsPrivate, bool) -> bool) -> Result<()> {
            Ok(())
        }
        fn read(&self, _handle: &crate::fs::FsPrivate, _buf: &mut [u8], _offset: u64) -> Result<()> {
            Ok(())
        }
        fn size(&self, _handle: &crate::fs::FsPrivate) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn mbr_scheme_finds_partition_table() {
        let dev = Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(BlockOps { data: mbr_disk(), block: 512 }));
        let entries = MbrScheme.identify(&dev).expect("mbr signature should be recognized");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start_lba, 2);
        assert_eq!(entries[0].size_lba, 5);
    }

    #[test]
    fn register_with_schemes_synthesizes_and_mounts_partition() {
        let mut tree = DeviceTree::new();
        let schemes: &[&dyn PartitionScheme] = &[&MbrScheme, &GptScheme];
        let disk = Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(BlockOps { data: mbr_disk(), block: 512 }));

        tree.register_with_schemes(disk, &probe_fs_signature, schemes, None);

        assert!(tree.lookup("hd0").unwrap().mount.borrow().is_none());
        let partition = tree.lookup("hd0,0").expect("mbr partition should be synthesized");
        assert!(partition.mount.borrow().is_some());
        assert_eq!(partition.kind, DeviceKind::Partition);
    }

    #[test]
    fn register_with_schemes_preserves_boot_device_onto_partition() {
        let mut tree = DeviceTree::new();
        let schemes: &[&dyn PartitionScheme] = &[&MbrScheme];
        let disk = Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(BlockOps { data: mbr_disk(), block: 512 }));

        tree.register_with_schemes(disk, &probe_fs_signature, schemes, Some(2));

        let boot = tree.boot_device.expect("boot device should be tracked through the partition walk");
        assert_eq!(boot.name, "hd0,0");
    }

    #[test]
    fn resolve_device_prefix_splits_name_and_path() {
        let mut tree = DeviceTree::new();
        tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullOps)), |_| None);

        let (device, rest) = resolve_device_prefix(&tree, "(hd0)/boot/loader.cfg").unwrap();
        assert_eq!(device.name, "hd0");
        assert_eq!(rest, "/boot/loader.cfg");
        assert!(resolve_device_prefix(&tree, "/boot/loader.cfg").is_none());
    }
}
