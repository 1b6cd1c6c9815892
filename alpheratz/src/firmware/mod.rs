//! UEFI bindings for the architecture-independent core's trait seams:
//! physical memory ([`mem`]) and the device tree / filesystem contract
//! ([`fs`]). Network boot ([`tftp`]) fetches whole files over PXE/TFTP.

pub mod fs;
pub mod mem;
pub mod tftp;
