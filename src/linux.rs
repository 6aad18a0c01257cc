use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::protocol::BaudRate as MonitorBaud;
use crate::{Options, Programmer, SerialPort};

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::Io(k) => k,
        ErrorKind::NoDevice => IoErrorKind::NotFound,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(io_kind)?;
        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(io_kind)?;
        self.0.write_settings(&settings).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance.
    ///
    /// The port is opened at the monitor's reset speed, the session switches
    /// speed once connected.
    pub fn linux<P: AsRef<Path>>(port: P, options: Options) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(MonitorBaud::DEFAULT.bps() as usize))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return after one poll period so timeouts stay bounded
        port.0
            .set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
