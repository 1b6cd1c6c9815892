//! NIC selection and DHCP bring-up, feeding the device tree rather than a
//! static `[network]` table: there is no user-facing network configuration left to
//! read (PXE boot dials in through `device net0`, not loader options), so
//! this module always brings up the first `SimpleNetwork` handle with DHCP.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use core::fmt::Write;

use uefi::Identify;
use uefi::boot;
use uefi::prelude::*;
use uefi::proto::network::ip4config2::Ip4Config2;
use uefi::proto::network::snp::SimpleNetwork;

fn snp_mac6(snp: &SimpleNetwork) -> [u8; 6] {
    let mac = snp.mode().current_address;
    let mut out = [0u8; 6];
    out.copy_from_slice(&mac.0[0..6]);
    out
}

fn mac_to_string(mac: [u8; 6]) -> String {
    let mut s = String::with_capacity(17);
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            s.push(':');
        }
        let _ = write!(s, "{:02X}", b);
    }
    s
}

/// The first `SimpleNetwork` handle the firmware exposes, or `None` if no
/// NIC is present (the common case when booting from local media).
pub fn select_nic_handle() -> uefi::Result<Handle> {
    let handles = boot::locate_handle_buffer(boot::SearchType::ByProtocol(&SimpleNetwork::GUID))?;
    handles.first().copied().ok_or_else(|| uefi::Error::from(Status::NOT_FOUND))
}

/// Start the NIC, connect the full driver stack, and bring IPv4 up over
/// DHCP (`firmware/tftp.rs::populate` needs this to have already run so a
/// DHCP ACK is on hand).
pub fn bring_up_ipv4(nic: Handle) -> uefi::Result<()> {
    if let Ok(snp) = boot::open_protocol_exclusive::<SimpleNetwork>(nic) {
        let _ = snp.start();
        let _ = snp.initialize(0, 0);

        let mac = snp_mac6(&snp);
        uefi::system::with_stdout(|out| {
            let _ = writeln!(out, "NIC: {}", mac_to_string(mac));
        });
    }

    // Recursively connect all controllers to ensure the full network driver
    // stack (MNP -> ARP -> IP4 -> DHCP4) is bound; BDS may not have done
    // this if no network boot was attempted.
    if let Ok(all) = boot::locate_handle_buffer(boot::SearchType::AllHandles) {
        for &h in all.iter() {
            let _ = boot::connect_controller(h, None, None, true);
        }
    }

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "Waiting for DHCP...\r\n");
    });
    let mut ip4 = match Ip4Config2::new(nic) {
        Ok(v) => v,
        Err(e) => {
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "  Ip4Config2::new failed: {:?}\r\n", e.status());
            });
            return Err(e);
        }
    };
    if let Err(e) = ip4.ifup() {
        uefi::system::with_stdout(|out| {
            let _ = write!(out, "  ifup failed: {:?}\r\n", e.status());
        });
        return Err(e);
    }
    uefi::system::with_stdout(|out| {
        let _ = write!(out, "IPv4 ready.\r\n");
    });
    Ok(())
}

/// Bring up the network stack ahead of configuration loading, so that a
/// `device net0` command in `loader.cfg` has something to resolve
/// (`firmware::tftp::populate` registers the device once DHCP succeeds).
/// Silently does nothing if no NIC is present or DHCP never completes —
/// PXE boot is opportunistic, not required.
pub fn try_bring_up() {
    if let Ok(nic) = select_nic_handle() {
        let _ = bring_up_ipv4(nic);
    }
}
