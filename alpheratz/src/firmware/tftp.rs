//! TFTP-over-PXE network device, using
//! the firmware's own PXE base-code service: GET-FILE-SIZE
//! then READ-FILE, since UEFI's PXE protocol only exposes whole-file
//! transfers rather than packet-level I/O. NIC selection and DHCP bring-up reuse
//! `net.rs`'s existing logic (architecture-agnostic regardless of the
//! transfer protocol layered on top).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use alpheratz_core::device::{Device, DeviceKind, DeviceOps, DeviceTree};
use alpheratz_core::fs::{FsOps, FsPrivate, Mount};
use alpheratz_core::status::{Result, Status};
use uefi::CStr8;
use uefi::boot;
use uefi::proto::network::pxe::{BaseCode, DhcpV4Packet, IpAddress};

fn to_cstr8(path: &str, storage: &mut Vec<u8>) -> Option<&CStr8> {
    storage.clear();
    storage.extend_from_slice(path.as_bytes());
    storage.push(0);
    CStr8::from_bytes_with_nul(storage).ok()
}

struct PxeFs {
    handle: uefi::Handle,
    server_ip: IpAddress,
}

impl PxeFs {
    fn with_base_code<R>(&self, f: impl FnOnce(&mut BaseCode) -> R) -> Option<R> {
        let mut bc = boot::open_protocol_exclusive::<BaseCode>(self.handle).ok()?;
        Some(f(&mut bc))
    }
}

impl FsOps for PxeFs {
    fn root(&self) -> FsPrivate {
        FsPrivate::None
    }

    /// PXE has no directory protocol; every lookup is resolved lazily
    /// against the boot server by filename alone, with a GET-FILE-SIZE
    /// probe upfront just to confirm the file exists.
    fn open_path(&self, path: &str, _from: &FsPrivate) -> Option<Result<(FsPrivate, bool)>> {
        let mut storage = Vec::new();
        let filename = to_cstr8(path, &mut storage)?;
        let result = self.with_base_code(|bc| bc.tftp_get_file_size(&self.server_ip, filename))?;
        match result {
            Ok(_) => Some(Ok((FsPrivate::Path(String::from(path)), false))),
            Err(_) => Some(Err(Status::NotFound)),
        }
    }

    fn iterate(&self, _dir: &FsPrivate, _cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// The PXE base-code API has no notion of a stream position, only
    /// "fetch this whole file into one buffer" — so `offset` must be zero.
    fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> Result<()> {
        let FsPrivate::Path(path) = handle else { return Err(Status::InvalidArg) };
        if offset != 0 {
            return Err(Status::NotSupported);
        }
        let mut storage = Vec::new();
        let filename = to_cstr8(path, &mut storage).ok_or(Status::InvalidArg)?;
        self.with_base_code(|bc| bc.tftp_read_file(&self.server_ip, filename, Some(buf)))
            .ok_or(Status::DeviceError)?
            .map_err(|_| Status::DeviceError)?;
        Ok(())
    }

    fn size(&self, handle: &FsPrivate) -> Result<u64> {
        let FsPrivate::Path(path) = handle else { return Err(Status::InvalidArg) };
        let mut storage = Vec::new();
        let filename = to_cstr8(path, &mut storage).ok_or(Status::InvalidArg)?;
        self.with_base_code(|bc| bc.tftp_get_file_size(&self.server_ip, filename))
            .ok_or(Status::DeviceError)?
            .map_err(|_| Status::DeviceError)
    }
}

struct PxeDeviceOps;

impl DeviceOps for PxeDeviceOps {
    fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn identify(&self) -> String {
        String::from("PXE/TFTP network boot device")
    }
}

/// Register a `net0` device backed by the first PXE base-code handle the
/// firmware exposes, once DHCP has configured it (`net::bring_up_ipv4` must
/// already have run). Returns `None` if no PXE stack is present or no DHCP
/// offer has been accepted yet, which is the common case when booting from
/// local media.
pub fn populate(devices: &mut DeviceTree) -> Option<()> {
    let handles = boot::locate_handle_buffer(boot::SearchType::ByProtocol(&BaseCode::GUID)).ok()?;
    let handle = *handles.first()?;
    let bc = boot::open_protocol_exclusive::<BaseCode>(handle).ok()?;
    let mode = bc.mode();
    if !mode.dhcp_ack_received {
        return None;
    }
    let dhcpv4: &DhcpV4Packet = mode.dhcp_ack.as_ref();
    let server_ip = IpAddress::new_v4(dhcpv4.bootp_si_addr);
    drop(bc);

    devices.register(Device::new("net0", DeviceKind::Network, Box::new(PxeDeviceOps)), |_| {
        Some(Mount { label: None, uuid: None, case_insensitive: false, ops: Box::new(PxeFs { handle, server_ip }) })
    });
    Some(())
}

/// Fetch a whole file over TFTP. The PXE API hands back one contiguous buffer per
/// READ-FILE call, so there is no partial-read path to expose.
pub fn read_whole(devices: &DeviceTree, path: &str) -> Option<Vec<u8>> {
    let device = devices.lookup("net0")?;
    let mount = device.mount.borrow().clone()?;
    let handle = alpheratz_core::fs::open(&mount, path, None).ok()?;
    let size = handle.size().ok()? as usize;
    let mut buf = alloc::vec![0u8; size];
    handle.read(&mut buf, 0).ok()?;
    Some(buf)
}
