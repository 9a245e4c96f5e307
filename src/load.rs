//! Background threads that keep the core busy while leaking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::config::LoadType;
use crate::error::{Error, Result};

pub(crate) struct LoadThreads {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl LoadThreads {
    /// Starts `count` workers. If one fails to start, the ones already
    /// running are stopped before the error is returned.
    pub fn spawn(count: usize, load_type: LoadType) -> Result<Self> {
        let mut threads = LoadThreads {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(count),
        };
        for i in 0..count {
            let stop = threads.stop.clone();
            let handle = thread::Builder::new()
                .name(format!("kdump-load-{i}"))
                .spawn(move || run(load_type, &stop))
                .map_err(Error::LoadThread)?;
            threads.handles.push(handle);
        }
        debug!("Started {count} load threads ({load_type:?})");
        Ok(threads)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("load thread panicked");
            }
        }
        debug!("Stopped load threads");
    }
}

impl Drop for LoadThreads {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(load_type: LoadType, stop: &AtomicBool) {
    match load_type {
        LoadType::Idle => {
            while !stop.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        LoadType::Yield => {
            while !stop.load(Ordering::Relaxed) {
                thread::yield_now();
            }
        }
        LoadType::Io => {
            while !stop.load(Ordering::Relaxed) {
                nix::unistd::sync();
            }
        }
    }
}
