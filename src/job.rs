//! One programming session from connect to disconnect.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::device::Device;
use crate::engine::{Engine, Progress, VerifyReport};
use crate::image::MemoryImage;
use crate::protocol::{BaudRate, DeviceId, Status};
use crate::{Error, Programmer, SerialPort};

#[derive(Clone, PartialEq, Debug)]
pub enum Action<'a> {
    /// Report version and status
    Info,
    /// Read `start..=end` back from the device
    Read { start: u32, end: u32 },
    /// Erase the blocks an image touches, or every block when `None`
    Erase { image: Option<&'a MemoryImage> },
    /// Program an image
    Write {
        image: &'a MemoryImage,
        erase: bool,
        verify: bool,
    },
    /// Compare device contents with an image
    Verify { image: &'a MemoryImage },
}

#[derive(Clone, PartialEq, Debug)]
pub struct Job<'a> {
    pub device: &'a Device,
    pub id: DeviceId,
    /// Line speed to switch to once connected
    pub baud: BaudRate,
    pub action: Action<'a>,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Outcome {
    pub version: String,
    pub status: Option<Status>,
    /// Erase commands issued
    pub erased: usize,
    /// Pages written
    pub written: usize,
    pub verify: Option<VerifyReport>,
    pub read: Option<MemoryImage>,
}

impl<'a> Job<'a> {
    /// Connect, run the action and disconnect.
    ///
    /// The first failure aborts the session; the link is still returned to
    /// its default speed before the error is handed back.
    pub fn run<P, D, E>(
        &self,
        programmer: &mut Programmer<P, D, E>,
        progress: &mut dyn Progress,
    ) -> Result<Outcome, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: fmt::Debug,
    {
        info!("Connecting to bootloader");
        programmer.init()?;

        let r = self.session(programmer, progress);

        match (programmer.disconnect(), r) {
            (Ok(()), r) => r,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(r)) => {
                warn!("Disconnect after failure also failed: {}", e);
                Err(r)
            }
        }
    }

    fn session<P, D, E>(
        &self,
        programmer: &mut Programmer<P, D, E>,
        progress: &mut dyn Progress,
    ) -> Result<Outcome, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: fmt::Debug,
    {
        let mut outcome = Outcome::default();

        if programmer.baud() != self.baud {
            programmer.set_speed(self.baud)?;
        }

        outcome.version = programmer.version()?;
        info!("Boot firmware: {}", outcome.version.trim_end());

        if self.id.is_blank() {
            debug!("Using blank identity {}", self.id);
        }
        programmer.authenticate(&self.id)?;
        programmer.clear_status()?;

        let schedule = &self.device.schedule;
        let mut engine = Engine::new(programmer, schedule);

        match &self.action {
            Action::Info => (),
            Action::Read { start, end } => {
                let image = engine.read(*start, *end, self.device.flash_size, progress)?;
                outcome.read = Some(image);
            }
            Action::Erase { image: Some(image) } => {
                outcome.erased = engine.erase(image, progress)?;
            }
            Action::Erase { image: None } => {
                outcome.erased = engine.erase_all(progress)?;
            }
            Action::Write {
                image,
                erase,
                verify,
            } => {
                if *erase {
                    outcome.erased = engine.erase(image, progress)?;
                }
                outcome.written = engine.write(image, !*erase, progress)?;
                if *verify {
                    outcome.verify = Some(engine.verify(image, progress)?);
                }
            }
            Action::Verify { image } => {
                outcome.verify = Some(engine.verify(image, progress)?);
            }
        }

        outcome.status = Some(programmer.status()?);

        Ok(outcome)
    }
}
