use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not establish a Flush+Reload cache miss threshold")]
    Calibration,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("unsupported page size {0}, expected 4096")]
    PageSize(usize),
    #[error("could not allocate the probe buffer")]
    ProbeAllocation,
    #[error("could not start load thread: {0}")]
    LoadThread(#[source] std::io::Error),
    #[error("could not change the SIGSEGV disposition: {0}")]
    Signal(#[source] nix::Error),
    #[error("another engine is already active in this process")]
    AlreadyActive,
    #[error("pagemap unavailable (root or read access to /proc/self/pagemap required): {0}")]
    Pagemap(#[source] std::io::Error),
    #[error("virtual address {virtual_address:#x} is not backed by a physical page")]
    Unmapped { virtual_address: usize },
    #[error("physical address {physical_address:#x} is outside the direct physical map")]
    AddressOutOfRange { physical_address: usize },
    #[error("direct physical map query failed: {0}")]
    DirectMap(String),
}

pub type Result<T> = core::result::Result<T, Error>;
