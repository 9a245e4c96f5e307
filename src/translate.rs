//! Virtual ↔ physical address translation.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, error};

use crate::cache::PAGE_SIZE;
use crate::error::{Error, Result};

const PAGEMAP: &str = "/proc/self/pagemap";
const PAGEMAP_ENTRY_SIZE: u64 = 8;
const PFN_MASK: u64 = (1 << 54) - 1;
const PAGE_PRESENT: u64 = 1 << 63;

/// Exposed by the `direct_physical_map` kernel module.
pub const DIRECT_MAP_PROC: &str = "/proc/direct_physical_map";

/// The x86_64 direct map covers 64 TiB.
pub const DIRECT_MAP_SIZE: usize = 64 << 40;

/// An open handle on a pagemap file. Reading frame numbers needs
/// `CAP_SYS_ADMIN`; without it the kernel still reports pages as present but
/// zeroes every frame number, which surfaces as a `PermissionDenied`
/// [`Error::Pagemap`]. Pages that are not present are [`Error::Unmapped`].
pub struct Pagemap {
    file: File,
}

impl Pagemap {
    pub fn open() -> Result<Self> {
        Self::open_path(PAGEMAP)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).map_err(Error::Pagemap)?;
        Ok(Pagemap { file })
    }

    pub fn virtual_to_physical(&self, virtual_address: usize) -> Result<usize> {
        let mut entry = [0u8; PAGEMAP_ENTRY_SIZE as usize];
        let offset = (virtual_address / PAGE_SIZE) as u64 * PAGEMAP_ENTRY_SIZE;
        self.file
            .read_exact_at(&mut entry, offset)
            .map_err(Error::Pagemap)?;
        let entry = u64::from_ne_bytes(entry);
        if let Some(physical_address) = entry_to_physical(entry, virtual_address) {
            return Ok(physical_address);
        }
        if entry & PAGE_PRESENT != 0 {
            error!("Frame numbers are hidden, are you root?");
            return Err(Error::Pagemap(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "pagemap frame numbers need CAP_SYS_ADMIN",
            )));
        }
        Err(Error::Unmapped { virtual_address })
    }
}

/// Frame number from a pagemap entry plus the page offset of `virtual_address`.
pub fn entry_to_physical(entry: u64, virtual_address: usize) -> Option<usize> {
    match entry & PFN_MASK {
        0 => None,
        frame => Some(frame as usize * PAGE_SIZE + virtual_address % PAGE_SIZE),
    }
}

static SELF_PAGEMAP: OnceLock<Pagemap> = OnceLock::new();

/// Our own pagemap, opened on first use. A failed open is not remembered.
fn self_pagemap() -> Result<&'static Pagemap> {
    if let Some(pagemap) = SELF_PAGEMAP.get() {
        return Ok(pagemap);
    }
    let pagemap = Pagemap::open()?;
    Ok(SELF_PAGEMAP.get_or_init(|| pagemap))
}

pub fn virtual_to_physical(virtual_address: usize) -> Result<usize> {
    self_pagemap()?.virtual_to_physical(virtual_address)
}

/// Direct map alias of `physical_address`.
///
/// Addresses for which adding the offset overflows are already kernel
/// virtual addresses and are returned unchanged. Anything else past the end
/// of the direct map is rejected.
pub fn physical_to_virtual(physical_address: usize, physical_offset: usize) -> Result<usize> {
    let Some(virtual_address) = physical_address.checked_add(physical_offset) else {
        return Ok(physical_address);
    };
    if physical_address >= DIRECT_MAP_SIZE {
        error!("phys_to_virt argument {physical_address:#x} is > 64 TB");
        return Err(Error::AddressOutOfRange { physical_address });
    }
    Ok(virtual_address)
}

/// Asks the kernel module for the virtual address of physical address 0.
pub fn query_direct_map() -> Result<usize> {
    let contents = fs::read_to_string(DIRECT_MAP_PROC).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            Error::DirectMap(format!("{DIRECT_MAP_PROC} not found, is the module loaded?"))
        }
        _ => Error::DirectMap(e.to_string()),
    })?;
    let offset = parse_direct_map(&contents)?;
    debug!("Direct physical map at {offset:#x}");
    Ok(offset)
}

pub fn parse_direct_map(contents: &str) -> Result<usize> {
    let line = contents.trim();
    let digits = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
        .ok_or_else(|| Error::DirectMap(format!("expected a hex address, got {line:?}")))?;
    usize::from_str_radix(digits, 16).map_err(|e| Error::DirectMap(format!("{line:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const OFFSET: usize = 0xffff_8800_0000_0000;

    #[test]
    fn phys_to_virt_adds_offset() {
        for phys in [0, 0x1000, 0x4000_0000, DIRECT_MAP_SIZE - 1] {
            let virt = physical_to_virtual(phys, OFFSET).unwrap();
            assert_eq!(virt - OFFSET, phys);
        }
    }

    #[test]
    fn phys_to_virt_rejects_addresses_past_the_map() {
        assert!(matches!(
            physical_to_virtual(DIRECT_MAP_SIZE, OFFSET),
            Err(Error::AddressOutOfRange { physical_address }) if physical_address == DIRECT_MAP_SIZE
        ));
    }

    #[test]
    fn phys_to_virt_passes_kernel_addresses_through() {
        let kernel = 0xffff_ffff_8100_0000;
        assert_eq!(physical_to_virtual(kernel, OFFSET).unwrap(), kernel);
    }

    #[test]
    fn entry_translation() {
        assert_eq!(entry_to_physical(0, 0x1234), None);
        // Present bit and soft-dirty bits are not part of the frame number.
        let entry = (1 << 63) | (1 << 55) | 0x42;
        assert_eq!(entry_to_physical(entry, 0x7000_0123), Some(0x42_123));
    }

    #[test]
    fn pagemap_lookup_reads_entry_at_page_index() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut entries = vec![0u64; 4];
        entries[2] = PAGE_PRESENT;
        entries[3] = PAGE_PRESENT | 0x99;
        for entry in &entries {
            file.write_all(&entry.to_ne_bytes()).unwrap();
        }
        file.flush().unwrap();

        let pagemap = Pagemap::open_path(file.path()).unwrap();
        assert_eq!(
            pagemap.virtual_to_physical(3 * PAGE_SIZE + 0x10).unwrap(),
            0x99 * PAGE_SIZE + 0x10
        );
        assert!(matches!(
            pagemap.virtual_to_physical(PAGE_SIZE),
            Err(Error::Unmapped { .. })
        ));
        assert!(matches!(
            pagemap.virtual_to_physical(100 * PAGE_SIZE),
            Err(Error::Pagemap(_))
        ));
    }

    #[test]
    fn hidden_frame_number_is_a_permission_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0u64.to_ne_bytes()).unwrap();
        file.write_all(&PAGE_PRESENT.to_ne_bytes()).unwrap();
        file.flush().unwrap();

        let pagemap = Pagemap::open_path(file.path()).unwrap();
        match pagemap.virtual_to_physical(PAGE_SIZE + 0x20) {
            Err(Error::Pagemap(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected a permission error, got {other:?}"),
        }
        assert!(matches!(
            pagemap.virtual_to_physical(0x20),
            Err(Error::Unmapped { virtual_address: 0x20 })
        ));
    }

    #[test]
    fn own_pagemap_is_opened_once() {
        let value = Box::new(0x77u8);
        let address = &*value as *const u8 as usize;
        let first = virtual_to_physical(address);
        let cached = SELF_PAGEMAP.get().map(|p| p as *const Pagemap);
        assert!(cached.is_some());

        let second = virtual_to_physical(address);
        assert_eq!(SELF_PAGEMAP.get().map(|p| p as *const Pagemap), cached);
        match (first, second) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(Error::Pagemap(a)), Err(Error::Pagemap(b))) => assert_eq!(a.kind(), b.kind()),
            other => panic!("lookups disagree: {other:?}"),
        }
    }

    #[test]
    fn missing_pagemap_is_a_pagemap_error() {
        assert!(matches!(
            Pagemap::open_path("/nonexistent/pagemap"),
            Err(Error::Pagemap(_))
        ));
    }

    #[test]
    fn parses_direct_map_line() {
        assert_eq!(parse_direct_map("0xffff888000000000\n").unwrap(), 0xffff_8880_0000_0000);
        assert!(parse_direct_map("ffff888000000000").is_err());
        assert!(parse_direct_map("0xnothex").is_err());
    }
}
