//! R8C/M16C Serial Bootloader.
//!
//! Programs on-chip flash through the boot ROM's standard serial I/O mode
//! (asynchronous, 8N1). A [`Programmer`] holds one session with the monitor;
//! [`engine::Engine`] turns a [`image::MemoryImage`] into the erase, write and
//! verify commands for that session, and [`job::Job`] sequences a whole run.

use core::fmt;
use std::collections::BTreeSet;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod engine;
pub mod image;
pub mod job;
pub mod link;
pub mod protocol;

#[cfg(test)]
mod sim;

use image::ImageError;
use link::{Link, Recv};
use protocol::*;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_baud(&mut self, baud: u32) -> Result<(), E>;
}

/// Session state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Syncing,
    Connected(BaudRate),
    Authenticated(BaudRate),
}

/// Device operation in progress, reported with failures
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Op {
    Sync,
    Speed(BaudRate),
    Version,
    Status,
    ClearStatus,
    IdCheck,
    Erase(u32),
    Write(u32),
    Read(u32),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Sync => write!(f, "synchronisation"),
            Op::Speed(b) => write!(f, "speed change to {}", b),
            Op::Version => write!(f, "version query"),
            Op::Status => write!(f, "status query"),
            Op::ClearStatus => write!(f, "status clear"),
            Op::IdCheck => write!(f, "identity check"),
            Op::Erase(a) => write!(f, "erase of block 0x{:06x}", a),
            Op::Write(a) => write!(f, "write of page 0x{:06x}", a),
            Op::Read(a) => write!(f, "read of page 0x{:06x}", a),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: fmt::Debug> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("no response from boot monitor after {attempts} synchronisation attempts")]
    SyncFailed { attempts: u32 },

    #[error("timeout during {op}: received {received} of {expected} bytes")]
    Timeout {
        op: Op,
        expected: usize,
        received: usize,
    },

    #[error("unexpected response 0x{response:02x} to {op}")]
    UnexpectedResponse { op: Op, response: u8 },

    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),

    #[error("identity check rejected ({status})")]
    IdRejected { status: Status },

    #[error("erase failed at block 0x{address:06x} ({status})")]
    EraseFailed { address: u32, status: Status },

    #[error("write failed at page 0x{address:06x} ({status})")]
    WriteFailed { address: u32, status: Status },

    #[error("{op} is not page aligned")]
    Unaligned { op: Op },

    #[error("{op} not permitted in state {state:?}")]
    InvalidState { op: Op, state: State },

    #[error("no erase block defined for address 0x{address:06x}")]
    NoBlock { address: u32 },

    #[error("page 0x{address:06x} written before block 0x{block:06x} was erased")]
    NotErased { address: u32, block: u32 },

    #[error("range 0x{start:06x}-0x{end:06x} outside 0x{size:x} bytes of flash")]
    OutOfRange { start: u32, end: u32, size: usize },

    #[error("invalid image: {0}")]
    Image(ImageError),
}

impl<SerialError: fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for short bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for status after an erase or page write
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub busy_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Spacing between synchronisation bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub sync_interval_ms: u32,

    /// Number of synchronisation bytes sent before each probe
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "16"))]
    pub sync_burst: u32,

    /// Number of synchronisation attempts before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub sync_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 100,
            busy_timeout_ms: 2000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            sync_interval_ms: 20,
            sync_burst: 16,
            sync_attempts: 3,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    link: Link<P, D, E>,
    erased: BTreeSet<u32>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let link = Link::new(port, delay, options.poll_delay_ms);
        Self {
            state: State::Disconnected,
            options,
            link,
            erased: BTreeSet::new(),
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Current host line speed
    pub fn baud(&self) -> BaudRate {
        self.link.baud()
    }

    /// Base addresses of blocks erased in this session
    pub fn erased(&self) -> &BTreeSet<u32> {
        &self.erased
    }

    pub fn is_erased(&self, block: u32) -> bool {
        self.erased.contains(&block)
    }

    pub fn port(&mut self) -> &mut P {
        self.link.port()
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        self.link.free()
    }

    /// Connect to the boot monitor, resetting the device unless disabled
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.state = State::Syncing;
        self.erased.clear();

        // First, reset device
        if !self.options.no_reset {
            debug!("Resetting device");

            self.link.port().set_dtr(true)?;
            self.link.port().set_rts(true)?;

            self.link.delay_ms(100u32);

            self.link.port().set_dtr(false)?;
            self.link.port().set_rts(false)?;

            self.link.delay_ms(self.options.init_delay_ms);
        }

        match self.synchronise() {
            Ok(()) => {
                self.state = State::Connected(self.link.baud());
                info!("Boot monitor connected at {}", self.link.baud());
                Ok(())
            }
            Err(e) => {
                self.state = State::Disconnected;
                Err(e)
            }
        }
    }

    fn synchronise(&mut self) -> Result<(), Error<E>> {
        let attempts = self.options.sync_attempts.max(1);

        for attempt in 1..=attempts {
            debug!("Sending synchronisation burst ({}/{})", attempt, attempts);

            for _ in 0..self.options.sync_burst {
                self.link.send(&[SYNC_FILL])?;
                self.link.delay_ms(self.options.sync_interval_ms);
            }
            self.link.flush()?;
            self.link.purge()?;

            self.link.send(&[SYNC_PROBE])?;
            self.link.flush()?;

            let mut b = [0u8; 1];
            match self.link.recv(&mut b, self.options.response_timeout_ms)? {
                Recv::Complete if b[0] == SYNC_PROBE => {
                    debug!("Received synchronisation echo");
                    return Ok(());
                }
                Recv::Complete => debug!("Received unexpected value: 0x{:02x}", b[0]),
                Recv::Timeout { .. } => debug!("No synchronisation echo"),
            }
        }

        Err(Error::SyncFailed { attempts })
    }

    /// Change the line speed, host side only follows once the monitor echoes
    pub fn set_speed(&mut self, baud: BaudRate) -> Result<(), Error<E>> {
        let op = Op::Speed(baud);
        self.require_connected(op)?;

        let c = baud.command();
        debug!("Requesting {} (0x{:02x})", baud, c);

        self.link.send(&[c])?;
        self.link.flush()?;

        let mut b = [0u8; 1];
        self.receive(op, &mut b, self.options.response_timeout_ms)?;
        if b[0] != c {
            debug!("Received unexpected value: 0x{:02x}", b[0]);
            return Err(Error::UnexpectedResponse { op, response: b[0] });
        }

        self.link.set_baud(baud)?;
        self.state = match self.state {
            State::Authenticated(_) => State::Authenticated(baud),
            _ => State::Connected(baud),
        };

        info!("Switched to {}", baud);

        Ok(())
    }

    /// Change the line speed by rate in bits per second
    pub fn set_speed_bps(&mut self, bps: u32) -> Result<(), Error<E>> {
        let baud = BaudRate::from_bps(bps).ok_or(Error::UnsupportedBaud(bps))?;
        self.set_speed(baud)
    }

    /// Read the boot firmware version string
    pub fn version(&mut self) -> Result<String, Error<E>> {
        self.require_connected(Op::Version)?;

        self.link.send(&[Command::Version as u8])?;
        self.link.flush()?;

        let mut b = [0u8; VERSION_LEN];
        self.receive(Op::Version, &mut b, self.options.response_timeout_ms)?;

        Ok(String::from_utf8_lossy(&b).into_owned())
    }

    /// Read the status registers
    pub fn status(&mut self) -> Result<Status, Error<E>> {
        self.require_connected(Op::Status)?;
        self.read_status(Op::Status, self.options.response_timeout_ms)
    }

    fn read_status(&mut self, op: Op, timeout_ms: u32) -> Result<Status, Error<E>> {
        self.link.send(&[Command::ReadStatus as u8])?;
        self.link.flush()?;

        let mut b = [0u8; 2];
        self.receive(op, &mut b, timeout_ms)?;

        let s = Status::new(b[0], b[1]);
        debug!("Status: {}", s);

        Ok(s)
    }

    /// Clear accumulated status flags
    pub fn clear_status(&mut self) -> Result<(), Error<E>> {
        self.require_connected(Op::ClearStatus)?;

        self.link.send(&[Command::ClearStatus as u8])?;
        self.link.flush()?;

        Ok(())
    }

    /// Present the identity code, unlocking the flash commands on success
    pub fn authenticate(&mut self, id: &DeviceId) -> Result<Status, Error<E>> {
        self.require_connected(Op::IdCheck)?;

        debug!("Sending identity check");

        self.link.send(&[Command::IdCheck as u8])?;
        self.link.send(&ID_CHECK_HEADER)?;
        self.link.send(&id.0)?;
        self.link.flush()?;

        let status = self.read_status(Op::IdCheck, self.options.response_timeout_ms)?;
        if status.id_check() != IdCheck::Verified {
            debug!("Identity rejected: {:?}", status.id_check());
            // A failed check revokes any earlier unlock
            if let State::Authenticated(b) = self.state {
                self.state = State::Connected(b);
            }
            return Err(Error::IdRejected { status });
        }

        if let State::Connected(b) = self.state {
            self.state = State::Authenticated(b);
        }
        info!("Identity verified");

        Ok(status)
    }

    /// Erase the block with base address `address`.
    ///
    /// Returns false without touching the device if the block was already
    /// erased in this session.
    pub fn erase_block(&mut self, address: u32) -> Result<bool, Error<E>> {
        let op = Op::Erase(address);
        self.require_authenticated(op)?;

        if self.erased.contains(&address) {
            debug!("Block 0x{:06x} already erased", address);
            return Ok(false);
        }

        debug!("Erasing block 0x{:06x}", address);

        self.link.send(&Command::BlockErase.addressed(address))?;
        self.link.send(&[ERASE_CONFIRM])?;
        self.link.flush()?;

        let status = self.read_status(op, self.options.busy_timeout_ms)?;
        if status.erase_error() {
            return Err(Error::EraseFailed { address, status });
        }

        self.clear_status()?;
        self.erased.insert(address);

        Ok(true)
    }

    /// Program one 256 byte page
    pub fn write_page(&mut self, address: u32, data: &[u8; PAGE_SIZE]) -> Result<(), Error<E>> {
        let op = Op::Write(address);
        self.require_authenticated(op)?;
        Self::require_aligned(op, address)?;

        debug!("Writing page 0x{:06x}", address);

        self.link.send(&Command::PageProgram.addressed(address))?;
        self.link.send(data)?;
        self.link.flush()?;

        let status = self.read_status(op, self.options.busy_timeout_ms)?;
        if status.write_error() {
            return Err(Error::WriteFailed { address, status });
        }

        self.clear_status()
    }

    /// Read one 256 byte page
    pub fn read_page(&mut self, address: u32, data: &mut [u8; PAGE_SIZE]) -> Result<(), Error<E>> {
        let op = Op::Read(address);
        self.require_authenticated(op)?;
        Self::require_aligned(op, address)?;

        debug!("Reading page 0x{:06x}", address);

        self.link.send(&Command::PageRead.addressed(address))?;
        self.link.flush()?;

        // Double the wire time, plus the usual response margin
        let timeout =
            2 * self.link.baud().transfer_ms(PAGE_SIZE) + self.options.response_timeout_ms;
        self.receive(op, data, timeout)
    }

    /// End the session, returning monitor and host to the reset line speed
    pub fn disconnect(&mut self) -> Result<(), Error<E>> {
        let connected = matches!(self.state, State::Connected(_) | State::Authenticated(_));

        if connected && self.link.baud() != BaudRate::DEFAULT {
            if let Err(e) = self.set_speed(BaudRate::DEFAULT) {
                warn!("Failed to restore {}: {}", BaudRate::DEFAULT, e);
            }
        }

        self.state = State::Disconnected;
        self.erased.clear();

        if self.link.baud() != BaudRate::DEFAULT {
            self.link.set_baud(BaudRate::DEFAULT)?;
        }

        debug!("Disconnected");

        Ok(())
    }

    fn receive(&mut self, op: Op, data: &mut [u8], timeout_ms: u32) -> Result<(), Error<E>> {
        match self.link.recv(data, timeout_ms)? {
            Recv::Complete => Ok(()),
            Recv::Timeout { received } => {
                error!("Receive timeout during {}", op);
                Err(Error::Timeout {
                    op,
                    expected: data.len(),
                    received,
                })
            }
        }
    }

    fn require_connected(&self, op: Op) -> Result<(), Error<E>> {
        match self.state {
            State::Connected(_) | State::Authenticated(_) => Ok(()),
            state => Err(Error::InvalidState { op, state }),
        }
    }

    fn require_authenticated(&self, op: Op) -> Result<(), Error<E>> {
        match self.state {
            State::Authenticated(_) => Ok(()),
            state => Err(Error::InvalidState { op, state }),
        }
    }

    fn require_aligned(op: Op, address: u32) -> Result<(), Error<E>> {
        if address as usize % PAGE_SIZE != 0 {
            return Err(Error::Unaligned { op });
        }
        Ok(())
    }
}
