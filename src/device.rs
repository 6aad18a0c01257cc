//! Target descriptions: flash size and the erase block layout.

use core::fmt;
use core::str::FromStr;

use crate::image::DEFAULT_SIZE;

/// A run of equally sized erase blocks, `start..=end`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockRegion {
    pub start: u32,
    pub end: u32,
    pub size: u32,
}

impl BlockRegion {
    pub const fn new(start: u32, end: u32, size: u32) -> Self {
        Self { start, end, size }
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }
}

impl fmt::Display for BlockRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}:{}", self.start, self.end, self.size)
    }
}

/// Parses `START-END:SIZE`, numbers in decimal or `0x` hex
impl FromStr for BlockRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (range, size) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':SIZE' in {:?}", s))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("missing '-END' in {:?}", s))?;

        let region = BlockRegion::new(parse_u32(start)?, parse_u32(end)?, parse_u32(size)?);
        if region.end < region.start {
            return Err(format!("region {} ends before it starts", region));
        }
        if region.size == 0 || (region.end - region.start + 1) % region.size != 0 {
            return Err(format!("region {} is not a whole number of blocks", region));
        }
        if region.start % region.size != 0 {
            return Err(format!("region {} is not block aligned", region));
        }
        Ok(region)
    }
}

/// Parse a decimal or `0x` prefixed hex number
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse::<u32>(),
    };
    r.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

/// An erase block, identified by its base address
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Block {
    pub base: u32,
    pub size: u32,
}

impl Block {
    pub fn end(&self) -> u32 {
        self.base + (self.size - 1)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x} ({} bytes)", self.base, self.size)
    }
}

/// Address to erase block size mapping
#[derive(Clone, PartialEq, Debug, Default)]
pub struct BlockSchedule {
    regions: Vec<BlockRegion>,
}

impl BlockSchedule {
    pub fn new(mut regions: Vec<BlockRegion>) -> Self {
        regions.sort_by_key(|r| r.start);
        Self { regions }
    }

    pub fn regions(&self) -> &[BlockRegion] {
        &self.regions
    }

    /// Erase block containing `address`
    pub fn block_for(&self, address: u32) -> Option<Block> {
        self.regions.iter().find(|r| r.contains(address)).map(|r| Block {
            base: r.start + (address - r.start) / r.size * r.size,
            size: r.size,
        })
    }

    /// Every block described by the schedule
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.regions.iter().flat_map(|r| {
            let count = (r.end - r.start) / r.size + 1;
            (0..count).map(move |i| Block {
                base: r.start + i * r.size,
                size: r.size,
            })
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Device {
    pub name: String,
    /// Size of the address space images are loaded into
    pub flash_size: usize,
    pub schedule: BlockSchedule,
}

impl Device {
    /// Built-in device descriptions by name
    pub fn preset(name: &str) -> Option<Device> {
        match name {
            "r8c" | "m16c" => Some(Device::r8c()),
            _ => None,
        }
    }

    /// R8C/M16C program ROM: 1 KiB blocks up to 0x7FFF, 4 KiB blocks above
    pub fn r8c() -> Device {
        Device {
            name: "r8c".to_string(),
            flash_size: DEFAULT_SIZE,
            schedule: BlockSchedule::new(vec![
                BlockRegion::new(0x0_0000, 0x0_7FFF, 0x400),
                BlockRegion::new(0x0_8000, 0xF_FFFF, 0x1000),
            ]),
        }
    }
}
