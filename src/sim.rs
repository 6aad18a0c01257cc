//! Simulated boot monitor for tests.
//!
//! Decodes the host's command stream byte by byte and answers the way the
//! boot ROM does, backed by an in-memory flash array.

use core::convert::Infallible;
use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::device::{BlockSchedule, Device};
use crate::image::DEFAULT_SIZE;
use crate::protocol::*;
use crate::SerialPort;

pub struct SimDevice {
    pub flash: Vec<u8>,
    pub id: [u8; ID_LEN],
    pub schedule: BlockSchedule,

    /// Speed selections left unanswered
    pub mute: Vec<u8>,
    /// Drop every byte without answering
    pub silent: bool,
    /// Block base whose erase reports failure
    pub fail_erase: Option<u32>,
    /// Page whose write reports failure
    pub fail_write: Option<u32>,
    /// Bytes returned in place of flash contents on read
    pub corrupt: Vec<(u32, u8)>,
    /// Speed selection answered with the wrong byte, leaving the speed unchanged
    pub misecho: Option<(u8, u8)>,

    srd: u8,
    srd1: u8,
    rx: Vec<u8>,
    log: Vec<u8>,
    tx: VecDeque<u8>,
    dtr: bool,
    resets: usize,
    zeros: usize,
    host_baud: u32,
    device_baud: u32,
    erases: Vec<u32>,
    writes: Vec<u32>,
    reads: Vec<u32>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            flash: vec![ERASED; DEFAULT_SIZE],
            id: [0xFF; ID_LEN],
            schedule: Device::r8c().schedule,
            mute: Vec::new(),
            silent: false,
            fail_erase: None,
            fail_write: None,
            corrupt: Vec::new(),
            misecho: None,
            srd: Status::SRD_READY,
            srd1: 0,
            rx: Vec::new(),
            log: Vec::new(),
            tx: VecDeque::new(),
            dtr: false,
            resets: 0,
            zeros: 0,
            host_baud: BaudRate::DEFAULT.bps(),
            device_baud: BaudRate::DEFAULT.bps(),
            erases: Vec::new(),
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }
}

impl SimDevice {
    /// Queue bytes for the host to receive
    pub fn inject(&mut self, data: &[u8]) {
        self.tx.extend(data.iter().copied());
    }

    pub fn host_baud(&self) -> u32 {
        self.host_baud
    }

    pub fn device_baud(&self) -> u32 {
        self.device_baud
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn zeros(&self) -> usize {
        self.zeros
    }

    /// Every command byte received, sync fill excluded
    pub fn received(&self) -> &[u8] {
        &self.log
    }

    /// Block erase commands received, in order
    pub fn erases(&self) -> &[u32] {
        &self.erases
    }

    /// Page write commands received, in order
    pub fn writes(&self) -> &[u32] {
        &self.writes
    }

    /// Page read commands received, in order
    pub fn reads(&self) -> &[u32] {
        &self.reads
    }

    fn frame_len(cmd: u8) -> Option<usize> {
        match cmd {
            0xB0..=0xB4 => Some(1),
            0xFB | 0x70 | 0x50 => Some(1),
            0xF5 => Some(1 + ID_CHECK_HEADER.len() + ID_LEN),
            0x20 => Some(4),
            0x41 => Some(3 + PAGE_SIZE),
            0xFF => Some(3),
            _ => None,
        }
    }

    fn receive(&mut self, b: u8) {
        if self.silent {
            return;
        }
        if self.rx.is_empty() && b == SYNC_FILL {
            self.zeros += 1;
            return;
        }

        self.rx.push(b);
        self.log.push(b);

        let len = match Self::frame_len(self.rx[0]) {
            Some(len) => len,
            None => {
                self.rx.clear();
                return;
            }
        };
        if self.rx.len() < len {
            return;
        }

        let frame: Vec<u8> = self.rx.drain(..).collect();
        self.execute(&frame);
    }

    fn execute(&mut self, frame: &[u8]) {
        let address = (frame.get(1).copied().unwrap_or(0) as u32) << 8
            | (frame.get(2).copied().unwrap_or(0) as u32) << 16;

        match frame[0] {
            c @ 0xB0..=0xB4 => {
                match self.misecho {
                    Some((m, reply)) if m == c => self.tx.push_back(reply),
                    _ if self.mute.contains(&c) => (),
                    _ => {
                        self.device_baud = BaudRate::from_command(c).unwrap().bps();
                        self.tx.push_back(c);
                    }
                }
            }
            0xFB => self.tx.extend(b"VER.2.01".iter().copied()),
            0x70 => {
                self.tx.push_back(self.srd);
                self.tx.push_back(self.srd1);
            }
            0x50 => self.srd &= !(Status::SRD_ERASE_ERROR | Status::SRD_PROGRAM_ERROR),
            0xF5 => {
                let id = if frame[5..] == self.id[..] {
                    IdCheck::Verified
                } else {
                    IdCheck::Mismatch
                };
                self.srd1 = (self.srd1 & !0x0C) | id.bits() << Status::SRD1_ID_SHIFT;
            }
            0x20 => {
                if frame[3] != ERASE_CONFIRM {
                    return;
                }
                self.erases.push(address);
                if self.fail_erase == Some(address) {
                    self.srd |= Status::SRD_ERASE_ERROR;
                    return;
                }
                let block = self.schedule.block_for(address).unwrap();
                let (start, end) = (block.base as usize, block.end() as usize);
                for b in &mut self.flash[start..=end] {
                    *b = ERASED;
                }
            }
            0x41 => {
                self.writes.push(address);
                if self.fail_write == Some(address) {
                    self.srd |= Status::SRD_PROGRAM_ERROR;
                    return;
                }
                let start = address as usize;
                for (f, d) in self.flash[start..start + PAGE_SIZE]
                    .iter_mut()
                    .zip(&frame[3..])
                {
                    *f &= *d;
                }
            }
            0xFF => {
                self.reads.push(address);
                for a in address..address + PAGE_SIZE as u32 {
                    let v = self
                        .corrupt
                        .iter()
                        .find(|(c, _)| *c == a)
                        .map(|(_, v)| *v)
                        .unwrap_or(self.flash[a as usize]);
                    self.tx.push_back(v);
                }
            }
            _ => (),
        }
    }
}

impl Write<u8> for SimDevice {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SimDevice {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<Infallible> for SimDevice {
    fn set_rts(&mut self, _level: bool) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Infallible> {
        if level && !self.dtr {
            self.resets += 1;
            self.rx.clear();
            self.tx.clear();
        }
        self.dtr = level;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Infallible> {
        self.host_baud = baud;
        Ok(())
    }
}

/// Delay provider that only counts
#[derive(Default)]
pub struct SimDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}
