#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use r8c_uart_loader::device::{parse_u32, BlockRegion, BlockSchedule, Device};
use r8c_uart_loader::engine::{Phase, Progress};
use r8c_uart_loader::image::MemoryImage;
use r8c_uart_loader::job::{Action, Job, Outcome};
use r8c_uart_loader::protocol::{BaudRate, DeviceId};
use r8c_uart_loader::{Options, Programmer};

/// Mismatches printed before the report is summarised
const MISMATCH_REPORT_LIMIT: usize = 32;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate once connected (9600, 19200, 38400, 57600, 115200)
    #[structopt(long, default_value = "115200")]
    baud: u32,

    /// Identity code as 14 hex digits
    #[structopt(long, default_value = "00000000000000", parse(try_from_str = parse_id))]
    id: DeviceId,

    /// Target device preset
    #[structopt(long, default_value = "r8c")]
    device: String,

    /// Erase block layout override, START-END:SIZE (repeatable)
    #[structopt(long = "block")]
    blocks: Vec<BlockRegion>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Connect and report boot firmware version and status
    Info,
    /// Read flash back into an S-record file
    Read {
        /// First address to read
        #[structopt(parse(try_from_str = parse_u32))]
        start: u32,
        /// Last address to read
        #[structopt(parse(try_from_str = parse_u32))]
        end: u32,
        /// Output S-record file
        output: PathBuf,
    },
    /// Erase the blocks an image touches, or the whole device without one
    Erase { file: Option<PathBuf> },
    /// Erase, write and verify an S-record image
    Write {
        file: PathBuf,
        /// Do not erase before writing
        #[structopt(long)]
        no_erase: bool,
        /// Do not read back after writing
        #[structopt(long)]
        no_verify: bool,
    },
    /// Compare device contents against an S-record image
    Verify { file: PathBuf },
}

fn parse_id(s: &str) -> Result<DeviceId, String> {
    let b = hex::decode(s).map_err(|e| format!("invalid identity {:?}: {}", s, e))?;
    DeviceId::from_slice(&b).ok_or_else(|| format!("identity must be 7 bytes, got {}", b.len()))
}

/// Progress bar per engine phase
#[derive(Default)]
struct Bar {
    bar: Option<ProgressBar>,
}

impl Progress for Bar {
    fn begin(&mut self, phase: Phase, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .progress_chars("#>-"),
        );
        bar.set_message(&phase.to_string());
        self.bar = Some(bar);
    }

    fn step(&mut self, done: usize) {
        if let Some(b) = &self.bar {
            b.set_position(done as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(b) = self.bar.take() {
            b.finish();
        }
    }
}

fn load(path: &Path, device: &Device) -> anyhow::Result<MemoryImage> {
    let image = MemoryImage::load(path, device.flash_size)
        .with_context(|| format!("Loading image {}", path.display()))?;

    if let Some(h) = image.header() {
        info!("Image header: {}", h);
    }
    match image.range() {
        Some((lo, hi)) => info!(
            "Loaded {} in {} spans (0x{:06x}-0x{:06x})",
            bytefmt::format(image.programmed() as u64),
            image.spans().len(),
            lo,
            hi
        ),
        None => warn!("Image {} contains no data", path.display()),
    }
    for s in image.spans() {
        debug!("Span {} ({})", s, bytefmt::format(s.len() as u64));
    }

    Ok(image)
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let mut device =
        Device::preset(&o.device).ok_or_else(|| anyhow!("Unknown device {:?}", o.device))?;
    if !o.blocks.is_empty() {
        device.schedule = BlockSchedule::new(o.blocks.clone());
    }
    for r in device.schedule.regions() {
        debug!("Erase blocks {}", r);
    }

    let baud = BaudRate::from_bps(o.baud).ok_or_else(|| anyhow!("Unsupported baud rate {}", o.baud))?;

    // Images are parsed in full before the device is touched
    let image = match &o.operation {
        Operation::Erase { file: Some(file) }
        | Operation::Write { file, .. }
        | Operation::Verify { file } => Some(load(file, &device)?),
        _ => None,
    };

    let action = match &o.operation {
        Operation::Info => Action::Info,
        Operation::Read { start, end, .. } => {
            if end < start {
                bail!("Read range ends before it starts");
            }
            if *end as usize >= device.flash_size {
                bail!(
                    "Read range ends at 0x{:x}, past 0x{:x} bytes of flash",
                    end,
                    device.flash_size
                );
            }
            Action::Read {
                start: *start,
                end: *end,
            }
        }
        Operation::Erase { .. } => Action::Erase {
            image: image.as_ref(),
        },
        Operation::Write {
            no_erase,
            no_verify,
            ..
        } => Action::Write {
            image: image.as_ref().context("No image loaded")?,
            erase: !no_erase,
            verify: !no_verify,
        },
        Operation::Verify { .. } => Action::Verify {
            image: image.as_ref().context("No image loaded")?,
        },
    };

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.options.clone())
        .map_err(|e| anyhow!("Error connecting to serial port {}: {:?}", o.port, e))?;

    let job = Job {
        device: &device,
        id: o.id,
        baud,
        action,
    };

    let outcome = job
        .run(&mut p, &mut Bar::default())
        .context("Programming session failed")?;

    report(&o, &outcome)
}

fn report(o: &Args, outcome: &Outcome) -> anyhow::Result<()> {
    if let Some(s) = &outcome.status {
        info!("Status: {}", s);
    }

    if let Operation::Info = o.operation {
        println!("Boot firmware: {}", outcome.version.trim_end());
    }

    if let (Some(image), Operation::Read { output, .. }) = (&outcome.read, &o.operation) {
        let mut text = String::new();
        image.write_srec(&mut text)?;
        std::fs::write(output, text)
            .with_context(|| format!("Writing image {}", output.display()))?;
        info!(
            "Saved {} of programmed data to {}",
            bytefmt::format(image.programmed() as u64),
            output.display()
        );
    }

    if outcome.erased > 0 {
        info!("Erased {} blocks", outcome.erased);
    }
    if outcome.written > 0 {
        info!("Wrote {} pages", outcome.written);
    }

    if let Some(v) = &outcome.verify {
        if !v.passed() {
            let mut msg = String::new();
            for m in v.mismatches.iter().take(MISMATCH_REPORT_LIMIT) {
                writeln!(msg, "  {}", m)?;
            }
            if v.mismatches.len() > MISMATCH_REPORT_LIMIT {
                writeln!(
                    msg,
                    "  ... {} more",
                    v.mismatches.len() - MISMATCH_REPORT_LIMIT
                )?;
            }
            error!("Verification mismatches:\n{}", msg);
            bail!(
                "Verification failed: {} of {} bytes differ",
                v.mismatches.len(),
                v.bytes
            );
        }
        info!("Verified {} pages ({} bytes)", v.pages, v.bytes);
    }

    Ok(())
}
