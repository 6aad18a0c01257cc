//! Motorola S-record images.
//!
//! Records are decoded by a character level state machine into a dense
//! [`MemoryImage`] initialised to erased flash, along with the
//! [`AreaSpan`]s that actually hold programmed data.

use core::fmt;
use std::borrow::Cow;

use crate::protocol::ERASED;

/// Default image size, the 20-bit address space of the R8C/M16C
pub const DEFAULT_SIZE: usize = 0x10_0000;

/// Data bytes per emitted record
const RECORD_DATA_LEN: usize = 32;

/// Largest S0 payload that fits a record's length byte
const HEADER_MAX_LEN: usize = 0xFF - 2 - 1;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ImageError {
    #[error("line {line}: unexpected character {found:?}")]
    InvalidCharacter { line: usize, found: char },

    #[error("line {line}: record truncated")]
    Truncated { line: usize },

    #[error("line {line}: checksum mismatch (record 0x{record:02x}, computed 0x{computed:02x})")]
    Checksum { line: usize, record: u8, computed: u8 },

    #[error("line {line}: unsupported record type S{kind}")]
    UnsupportedRecord { line: usize, kind: char },

    #[error("line {line}: record length {length} too short for a {width} byte address")]
    Length { line: usize, length: u8, width: usize },

    #[error("line {line}: data at 0x{address:06x} exceeds image size of 0x{size:x} bytes")]
    OutOfRange { line: usize, address: u32, size: usize },

    #[error("reading image: {0}")]
    Io(String),
}

/// Inclusive range of programmed addresses
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AreaSpan {
    pub start: u32,
    pub end: u32,
}

impl AreaSpan {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }
}

impl fmt::Display for AreaSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}-0x{:06x}", self.start, self.end)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct MemoryImage {
    data: Vec<u8>,
    range: Option<(u32, u32)>,
    spans: Vec<AreaSpan>,
    header: Option<Vec<u8>>,
    entry: Option<u32>,
}

impl MemoryImage {
    /// Create an erased image of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![ERASED; size],
            range: None,
            spans: Vec::new(),
            header: None,
            entry: None,
        }
    }

    /// Parse S-records from a character stream
    pub fn parse<I>(chars: I, size: usize) -> Result<Self, ImageError>
    where
        I: IntoIterator<Item = char>,
    {
        let mut parser = Parser::new(Self::new(size));
        for c in chars {
            if !parser.push(c)? {
                break;
            }
        }
        parser.finish()
    }

    pub fn from_srec(text: &str, size: usize) -> Result<Self, ImageError> {
        Self::parse(text.chars(), size)
    }

    /// Load an S-record file from disk
    pub fn load<P: AsRef<std::path::Path>>(path: P, size: usize) -> Result<Self, ImageError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ImageError::Io(e.to_string()))?;
        Self::from_srec(&text, size)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Lowest and highest written address
    pub fn range(&self) -> Option<(u32, u32)> {
        self.range
    }

    pub fn spans(&self) -> &[AreaSpan] {
        &self.spans
    }

    /// Number of programmed bytes
    pub fn programmed(&self) -> usize {
        self.spans.iter().map(AreaSpan::len).sum()
    }

    /// Text of the S0 header record, if present
    pub fn header(&self) -> Option<Cow<'_, str>> {
        self.header.as_deref().map(String::from_utf8_lossy)
    }

    /// Raw bytes of the S0 header record
    pub fn header_bytes(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// Execution start address from the termination record
    pub fn entry(&self) -> Option<u32> {
        self.entry
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes from `address` to `address + len`, clipped to the image
    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        let start = (address as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }

    /// Store `bytes` at `address` and refresh the written spans
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), ImageError> {
        self.store(0, address, bytes)?;
        self.update_spans();
        Ok(())
    }

    fn store(&mut self, line: usize, address: u32, bytes: &[u8]) -> Result<(), ImageError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let start = address as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(ImageError::OutOfRange {
                line,
                address,
                size: self.data.len(),
            });
        }

        self.data[start..end].copy_from_slice(bytes);

        let last = (end - 1) as u32;
        self.range = Some(match self.range {
            Some((lo, hi)) => (lo.min(address), hi.max(last)),
            None => (address, last),
        });

        Ok(())
    }

    fn update_spans(&mut self) {
        self.spans.clear();

        let (lo, hi) = match self.range {
            Some(r) => r,
            None => return,
        };

        let mut start = None;
        for a in lo..=hi {
            match (self.data[a as usize] != ERASED, start) {
                (true, None) => start = Some(a),
                (false, Some(s)) => {
                    self.spans.push(AreaSpan::new(s, a - 1));
                    start = None;
                }
                _ => (),
            }
        }
        if let Some(s) = start {
            self.spans.push(AreaSpan::new(s, hi));
        }
    }

    /// Emit the programmed spans as S-records
    pub fn write_srec<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let max = self.spans.last().map(|s| s.end).unwrap_or(0);
        let (data_kind, end_kind, width) = match max {
            0..=0xFFFF => (1, 9, 2),
            0x1_0000..=0xFF_FFFF => (2, 8, 3),
            _ => (3, 7, 4),
        };

        if let Some(h) = &self.header {
            write_record(out, 0, 2, 0, &h[..h.len().min(HEADER_MAX_LEN)])?;
        }

        for span in &self.spans {
            let mut address = span.start;
            while address <= span.end {
                let len = ((span.end - address) as usize + 1).min(RECORD_DATA_LEN);
                write_record(out, data_kind, width, address, self.slice(address, len))?;
                address += len as u32;
            }
        }

        write_record(out, end_kind, width, self.entry.unwrap_or(0), &[])
    }
}

fn write_record<W: fmt::Write>(
    out: &mut W,
    kind: u8,
    width: usize,
    address: u32,
    data: &[u8],
) -> fmt::Result {
    let length = (width + data.len() + 1) as u8;
    let mut sum = length as u32;

    write!(out, "S{}{:02X}", kind, length)?;
    for i in (0..width).rev() {
        let b = (address >> (i * 8)) as u8;
        sum += b as u32;
        write!(out, "{:02X}", b)?;
    }
    for b in data {
        sum += *b as u32;
        write!(out, "{:02X}", b)?;
    }
    writeln!(out, "{:02X}", !(sum as u8))
}

/// Address width in bytes for a record type
fn address_width(kind: u8) -> Option<usize> {
    match kind {
        0 | 1 | 5 | 9 => Some(2),
        2 | 6 | 8 => Some(3),
        3 | 7 => Some(4),
        _ => None,
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum State {
    /// Between records
    Idle,
    /// Marker seen, awaiting the type digit
    Kind,
    /// Reading the length byte
    Length,
    /// Reading address, data and checksum
    Body,
    /// Count or termination record processed
    Done,
}

struct Parser {
    image: MemoryImage,
    state: State,
    line: usize,
    kind: u8,
    width: usize,
    length: u8,
    nibble: Option<u8>,
    body: Vec<u8>,
}

impl Parser {
    fn new(image: MemoryImage) -> Self {
        Self {
            image,
            state: State::Idle,
            line: 1,
            kind: 0,
            width: 0,
            length: 0,
            nibble: None,
            body: Vec::with_capacity(u8::MAX as usize),
        }
    }

    /// Feed one character, returns false once parsing has ended
    fn push(&mut self, c: char) -> Result<bool, ImageError> {
        let line = self.line;
        if c == '\n' {
            self.line += 1;
        }

        match self.state {
            State::Idle => match c {
                'S' => self.state = State::Kind,
                c if c.is_whitespace() => (),
                c => return Err(ImageError::InvalidCharacter { line, found: c }),
            },
            State::Kind => {
                let kind = c
                    .to_digit(10)
                    .ok_or(ImageError::InvalidCharacter { line, found: c })?
                    as u8;
                self.width = address_width(kind)
                    .ok_or(ImageError::UnsupportedRecord { line, kind: c })?;
                self.kind = kind;
                self.nibble = None;
                self.state = State::Length;
            }
            State::Length | State::Body => {
                let v = match c.to_digit(16) {
                    Some(v) => v as u8,
                    None if c.is_whitespace() => return Err(ImageError::Truncated { line }),
                    None => return Err(ImageError::InvalidCharacter { line, found: c }),
                };

                let hi = match self.nibble.take() {
                    Some(hi) => hi,
                    None => {
                        self.nibble = Some(v);
                        return Ok(true);
                    }
                };
                let byte = hi << 4 | v;

                if self.state == State::Length {
                    if (byte as usize) < self.width + 1 {
                        return Err(ImageError::Length {
                            line,
                            length: byte,
                            width: self.width,
                        });
                    }
                    self.length = byte;
                    self.body.clear();
                    self.state = State::Body;
                } else {
                    self.body.push(byte);
                    if self.body.len() == self.length as usize {
                        self.record(line)?;
                    }
                }
            }
            State::Done => return Ok(false),
        }

        Ok(self.state != State::Done)
    }

    fn record(&mut self, line: usize) -> Result<(), ImageError> {
        let (payload, checksum) = self.body.split_at(self.body.len() - 1);

        let sum = payload
            .iter()
            .fold(self.length as u32, |acc, b| acc + *b as u32);
        let computed = !(sum as u8);
        if computed != checksum[0] {
            return Err(ImageError::Checksum {
                line,
                record: checksum[0],
                computed,
            });
        }

        let (address, data) = payload.split_at(self.width);
        let address = address.iter().fold(0u32, |acc, b| acc << 8 | *b as u32);

        match self.kind {
            0 => {
                let end = data
                    .iter()
                    .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
                    .map_or(0, |i| i + 1);
                self.image.header = Some(data[..end].to_vec());
                self.state = State::Idle;
            }
            1..=3 => {
                let data = data.to_vec();
                self.image.store(line, address, &data)?;
                self.state = State::Idle;
            }
            5 | 6 => self.state = State::Done,
            _ => {
                self.image.entry = Some(address);
                self.state = State::Done;
            }
        }

        Ok(())
    }

    fn finish(mut self) -> Result<MemoryImage, ImageError> {
        match self.state {
            State::Idle | State::Done => {
                self.image.update_spans();
                Ok(self.image)
            }
            _ => Err(ImageError::Truncated { line: self.line }),
        }
    }
}
