//! Wire-level definitions for the R8C/M16C standard serial I/O boot monitor.

use core::fmt;

/// Byte sent repeatedly while the monitor is waiting for a start condition
pub const SYNC_FILL: u8 = 0x00;

/// Probe sent after the fill burst, echoed by the monitor once synchronised
pub const SYNC_PROBE: u8 = 0xB0;

/// Confirmation byte terminating an erase command
pub const ERASE_CONFIRM: u8 = 0xD0;

/// Header of the identity check command (address low/mid/high, length)
pub const ID_CHECK_HEADER: [u8; 4] = [0xDF, 0xFF, 0x00, 0x07];

/// Length of the firmware version string
pub const VERSION_LEN: usize = 8;

/// Read / write unit
pub const PAGE_SIZE: usize = 256;

/// Value of erased flash
pub const ERASED: u8 = 0xFF;

/// Length of the device identity code
pub const ID_LEN: usize = 7;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Read a 256 byte page
    PageRead = 0xFF,

    /// Program a 256 byte page
    PageProgram = 0x41,

    /// Erase the block containing an address
    BlockErase = 0x20,

    /// Read the status registers (SRD, SRD1)
    ReadStatus = 0x70,

    /// Clear the accumulated status flags
    ClearStatus = 0x50,

    /// Present the identity code
    IdCheck = 0xF5,

    /// Read the 8 character boot firmware version
    Version = 0xFB,
}

impl Command {
    /// Command header for an addressed operation.
    ///
    /// The monitor only takes the middle and high address bytes, pages are
    /// always 256-aligned.
    pub fn addressed(self, address: u32) -> [u8; 3] {
        [self as u8, (address >> 8) as u8, (address >> 16) as u8]
    }
}

/// Line speeds selectable through the monitor
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    pub const ALL: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    /// Speed of the monitor after reset
    pub const DEFAULT: BaudRate = BaudRate::B9600;

    /// Selection command, echoed by the monitor on acceptance
    pub fn command(self) -> u8 {
        match self {
            BaudRate::B9600 => 0xB0,
            BaudRate::B19200 => 0xB1,
            BaudRate::B38400 => 0xB2,
            BaudRate::B57600 => 0xB3,
            BaudRate::B115200 => 0xB4,
        }
    }

    pub fn bps(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }

    pub fn from_bps(bps: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.bps() == bps)
    }

    pub fn from_command(c: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.command() == c)
    }

    /// Worst case time to move `len` bytes (8N1, 10 bits per byte)
    pub fn transfer_ms(self, len: usize) -> u32 {
        let bits = len as u64 * 10;
        ((bits * 1000 + self.bps() as u64 - 1) / self.bps() as u64) as u32
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} baud", self.bps())
    }
}

/// Outcome of the identity check, SRD1 bits 3:2
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IdCheck {
    NotVerified,
    Mismatch,
    Reserved,
    Verified,
}

impl IdCheck {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => IdCheck::NotVerified,
            0b01 => IdCheck::Mismatch,
            0b10 => IdCheck::Reserved,
            _ => IdCheck::Verified,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            IdCheck::NotVerified => 0b00,
            IdCheck::Mismatch => 0b01,
            IdCheck::Reserved => 0b10,
            IdCheck::Verified => 0b11,
        }
    }
}

/// Decoded status register pair
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Status {
    /// Status register (SRD)
    pub srd: u8,
    /// Extended status register (SRD1)
    pub srd1: u8,
}

impl Status {
    pub const SRD_READY: u8 = 1 << 7;
    pub const SRD_ERASE_ERROR: u8 = 1 << 5;
    pub const SRD_PROGRAM_ERROR: u8 = 1 << 4;
    pub const SRD1_ID_SHIFT: u8 = 2;

    pub fn new(srd: u8, srd1: u8) -> Self {
        Self { srd, srd1 }
    }

    pub fn ready(&self) -> bool {
        self.srd & Self::SRD_READY != 0
    }

    pub fn erase_error(&self) -> bool {
        self.srd & Self::SRD_ERASE_ERROR != 0
    }

    pub fn write_error(&self) -> bool {
        self.srd & Self::SRD_PROGRAM_ERROR != 0
    }

    pub fn id_check(&self) -> IdCheck {
        IdCheck::from_bits(self.srd1 >> Self::SRD1_ID_SHIFT)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SRD=0x{:02x} SRD1=0x{:02x} (ready: {}, erase error: {}, write error: {}, id: {:?})",
            self.srd,
            self.srd1,
            self.ready(),
            self.erase_error(),
            self.write_error(),
            self.id_check()
        )
    }
}

/// Identity code presented to unlock the monitor
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DeviceId(pub [u8; ID_LEN]);

impl DeviceId {
    /// Identity of a blank device
    pub const BLANK: DeviceId = DeviceId([0x00; ID_LEN]);

    /// Identity of an erased device
    pub const ERASED: DeviceId = DeviceId([0xFF; ID_LEN]);

    /// Whether this is one of the "no protection" identities
    pub fn is_blank(&self) -> bool {
        *self == Self::BLANK || *self == Self::ERASED
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        if s.len() != ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(s);
        Some(DeviceId(id))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::BLANK
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decoding() {
        let s = Status::new(0x80, 0x0C);
        assert!(s.ready());
        assert!(!s.erase_error());
        assert!(!s.write_error());
        assert_eq!(s.id_check(), IdCheck::Verified);

        let s = Status::new(0xB0, 0x04);
        assert!(s.erase_error());
        assert!(s.write_error());
        assert_eq!(s.id_check(), IdCheck::Mismatch);
    }

    #[test]
    fn baud_table() {
        assert_eq!(BaudRate::from_bps(57600), Some(BaudRate::B57600));
        assert_eq!(BaudRate::B57600.command(), 0xB3);
        assert_eq!(BaudRate::from_command(0xB4), Some(BaudRate::B115200));
        assert_eq!(BaudRate::from_bps(4800), None);
        // 2560 bits at 9600 baud
        assert_eq!(BaudRate::B9600.transfer_ms(256), 267);
    }

    #[test]
    fn addressed_header() {
        assert_eq!(Command::PageProgram.addressed(0x0F_A300), [0x41, 0xA3, 0x0F]);
        assert_eq!(Command::BlockErase.addressed(0x1000), [0x20, 0x10, 0x00]);
    }

    #[test]
    fn blank_ids() {
        assert!(DeviceId::BLANK.is_blank());
        assert!(DeviceId::ERASED.is_blank());
        assert!(!DeviceId([0, 0, 0, 0, 0, 0, 1]).is_blank());
        assert_eq!(DeviceId::from_slice(&[1, 2, 3]), None);
        assert_eq!(DeviceId::ERASED.to_string(), "FFFFFFFFFFFFFF");
    }
}
