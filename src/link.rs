//! Byte transport to the boot monitor.
//!
//! All receives are bounded: the port is polled and the delay provider is
//! used to count out the caller's timeout.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::BaudRate;
use crate::SerialPort;

/// Upper bound on bytes discarded by a single purge
const PURGE_LIMIT: usize = 4096;

/// Outcome of a bounded receive
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Recv {
    /// The buffer was filled
    Complete,
    /// The timeout expired after `received` bytes
    Timeout { received: usize },
}

pub struct Link<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    baud: BaudRate,
    _err: PhantomData<E>,
}

impl<P, D, E> Link<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Wrap a port already configured for the monitor's reset speed
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            baud: BaudRate::DEFAULT,
            _err: PhantomData,
        }
    }

    /// Current host line speed
    pub fn baud(&self) -> BaudRate {
        self.baud
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms)
    }

    /// Write every byte of `data`, returning the number sent
    pub fn send(&mut self, data: &[u8]) -> Result<usize, E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(data.len())
    }

    pub fn flush(&mut self) -> Result<(), E> {
        block!(self.port.flush())
    }

    /// Fill `buf`, giving up once `timeout_ms` has elapsed without completion
    pub fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<Recv, E> {
        let mut t = 0;
        let mut n = 0;

        while n < buf.len() {
            match self.port.read() {
                Ok(v) => {
                    buf[n] = v;
                    n += 1;
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e),
            }

            if t >= timeout_ms {
                return Ok(Recv::Timeout { received: n });
            }

            self.delay.delay_ms(self.poll_delay_ms);
            t += self.poll_delay_ms;
        }

        Ok(Recv::Complete)
    }

    /// Discard anything waiting in the receive path, returning the count dropped
    pub fn purge(&mut self) -> Result<usize, E> {
        let mut n = 0;
        while n < PURGE_LIMIT {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }
        Ok(n)
    }

    /// Switch the host side line speed
    pub fn set_baud(&mut self, baud: BaudRate) -> Result<(), E> {
        self.flush()?;
        self.port.set_baud(baud.bps())?;
        self.baud = baud;
        Ok(())
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }
}
