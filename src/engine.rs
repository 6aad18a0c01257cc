//! Erase, write and verify planning over a [`MemoryImage`].
//!
//! Blocks are erased at most once per session, pages are written whole with
//! erased padding, and verification collects every differing byte rather
//! than stopping at the first.

use core::fmt;
use std::collections::BTreeSet;

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{Block, BlockSchedule};
use crate::image::{AreaSpan, MemoryImage};
use crate::protocol::{ERASED, PAGE_SIZE};
use crate::{Error, Programmer, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Phase {
    Erase,
    Write,
    Verify,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Erase => "Erasing",
            Phase::Write => "Writing",
            Phase::Verify => "Verifying",
            Phase::Read => "Reading",
        };
        f.write_str(s)
    }
}

/// Receives "N of M steps done" notifications
pub trait Progress {
    fn begin(&mut self, _phase: Phase, _total: usize) {}
    fn step(&mut self, _done: usize) {}
    fn finish(&mut self) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

/// A byte that read back differently from the image
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Mismatch {
    pub address: u32,
    pub expected: u8,
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:06x}: expected 0x{:02x}, read 0x{:02x}",
            self.address, self.expected, self.actual
        )
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct VerifyReport {
    /// Pages read back
    pub pages: usize,
    /// Bytes compared
    pub bytes: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Base address of the page holding `address`
pub fn page_base(address: u32) -> u32 {
    address & !(PAGE_SIZE as u32 - 1)
}

/// Pages touched by `spans`, ascending
pub fn pages(spans: &[AreaSpan]) -> Vec<u32> {
    let mut pages = BTreeSet::new();
    for s in spans {
        let mut p = page_base(s.start);
        while p <= s.end {
            pages.insert(p);
            p = match p.checked_add(PAGE_SIZE as u32) {
                Some(n) => n,
                None => break,
            };
        }
    }
    pages.into_iter().collect()
}

/// Distinct erase blocks touched by `spans`, ascending.
///
/// Fails with the first address the schedule does not cover.
pub fn blocks(schedule: &BlockSchedule, spans: &[AreaSpan]) -> Result<Vec<Block>, u32> {
    let mut blocks = BTreeSet::new();
    for s in spans {
        let mut a = s.start;
        loop {
            let b = schedule.block_for(a).ok_or(a)?;
            blocks.insert(b);
            a = match b.base.checked_add(b.size) {
                Some(n) if n <= s.end => n,
                _ => break,
            };
        }
    }
    Ok(blocks.into_iter().collect())
}

/// Compare `actual`, read from `address`, with the image byte for byte.
///
/// Bytes past the end of the image are expected erased, matching the padding
/// a page write sends.
pub fn compare(
    image: &MemoryImage,
    address: u32,
    actual: &[u8],
    mismatches: &mut Vec<Mismatch>,
) -> usize {
    let expected = image.slice(address, actual.len());

    for (i, a) in actual.iter().enumerate() {
        let e = expected.get(i).copied().unwrap_or(ERASED);
        if e != *a {
            mismatches.push(Mismatch {
                address: address + i as u32,
                expected: e,
                actual: *a,
            });
        }
    }

    actual.len()
}

pub struct Engine<'a, P, D, E> {
    programmer: &'a mut Programmer<P, D, E>,
    schedule: &'a BlockSchedule,
}

impl<'a, P, D, E> Engine<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    pub fn new(programmer: &'a mut Programmer<P, D, E>, schedule: &'a BlockSchedule) -> Self {
        Self {
            programmer,
            schedule,
        }
    }

    /// Erase every block holding image data, skipping those already erased
    pub fn erase(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn Progress,
    ) -> Result<usize, Error<E>> {
        let blocks =
            blocks(self.schedule, image.spans()).map_err(|address| Error::NoBlock { address })?;
        self.erase_blocks(&blocks, progress)
    }

    /// Erase every block in the schedule
    pub fn erase_all(&mut self, progress: &mut dyn Progress) -> Result<usize, Error<E>> {
        let blocks: Vec<_> = self.schedule.blocks().collect();
        self.erase_blocks(&blocks, progress)
    }

    /// Erase `blocks`, returning the number of erase commands issued
    pub fn erase_blocks(
        &mut self,
        blocks: &[Block],
        progress: &mut dyn Progress,
    ) -> Result<usize, Error<E>> {
        let pending: Vec<_> = blocks
            .iter()
            .filter(|b| !self.programmer.is_erased(b.base))
            .collect();

        info!(
            "Erasing {} blocks ({} already erased)",
            pending.len(),
            blocks.len() - pending.len()
        );

        progress.begin(Phase::Erase, pending.len());
        for (i, b) in pending.iter().enumerate() {
            self.programmer.erase_block(b.base)?;
            progress.step(i + 1);
        }
        progress.finish();

        Ok(pending.len())
    }

    /// Write every page holding image data.
    ///
    /// Unless `assume_erased` is set, each page's block must have been erased
    /// earlier in the session; this is checked before anything is written.
    pub fn write(
        &mut self,
        image: &MemoryImage,
        assume_erased: bool,
        progress: &mut dyn Progress,
    ) -> Result<usize, Error<E>> {
        let pages = pages(image.spans());

        if !assume_erased {
            for p in &pages {
                let b = self
                    .schedule
                    .block_for(*p)
                    .ok_or(Error::NoBlock { address: *p })?;
                if !self.programmer.is_erased(b.base) {
                    return Err(Error::NotErased {
                        address: *p,
                        block: b.base,
                    });
                }
            }
        }

        info!("Writing {} pages", pages.len());

        let mut buf = [ERASED; PAGE_SIZE];
        progress.begin(Phase::Write, pages.len());
        for (i, p) in pages.iter().enumerate() {
            let data = image.slice(*p, PAGE_SIZE);
            buf[..data.len()].copy_from_slice(data);
            for b in &mut buf[data.len()..] {
                *b = ERASED;
            }

            self.programmer.write_page(*p, &buf)?;
            progress.step(i + 1);
        }
        progress.finish();

        Ok(pages.len())
    }

    /// Read back every page holding image data and compare the whole page
    pub fn verify(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn Progress,
    ) -> Result<VerifyReport, Error<E>> {
        let pages = pages(image.spans());
        let mut report = VerifyReport::default();

        info!("Verifying {} pages", pages.len());

        let mut buf = [0u8; PAGE_SIZE];
        progress.begin(Phase::Verify, pages.len());
        for (i, p) in pages.iter().enumerate() {
            self.programmer.read_page(*p, &mut buf)?;

            let before = report.mismatches.len();
            report.bytes += compare(image, *p, &buf, &mut report.mismatches);
            report.pages += 1;

            if report.mismatches.len() > before {
                debug!(
                    "Page 0x{:06x}: {} mismatches",
                    p,
                    report.mismatches.len() - before
                );
            }
            progress.step(i + 1);
        }
        progress.finish();

        Ok(report)
    }

    /// Read pages covering `start..=end` into a fresh image of `size` bytes
    pub fn read(
        &mut self,
        start: u32,
        end: u32,
        size: usize,
        progress: &mut dyn Progress,
    ) -> Result<MemoryImage, Error<E>> {
        if start > end || end as usize >= size {
            return Err(Error::OutOfRange { start, end, size });
        }

        let pages = pages(&[AreaSpan::new(start, end)]);
        let base = pages.first().copied().unwrap_or(0);
        let mut data = Vec::with_capacity(pages.len() * PAGE_SIZE);

        info!("Reading {} pages from 0x{:06x}", pages.len(), base);

        let mut buf = [0u8; PAGE_SIZE];
        progress.begin(Phase::Read, pages.len());
        for (i, p) in pages.iter().enumerate() {
            self.programmer.read_page(*p, &mut buf)?;
            data.extend_from_slice(&buf);
            progress.step(i + 1);
        }
        progress.finish();

        let mut image = MemoryImage::new(size);
        image.write(base, &data).map_err(Error::Image)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockRegion, Device};
    use crate::protocol::DeviceId;
    use crate::sim::{SimDelay, SimDevice};
    use crate::Options;

    type Sim = Programmer<SimDevice, SimDelay, core::convert::Infallible>;

    fn connected(dev: SimDevice) -> Sim {
        let mut p = Programmer::new(dev, SimDelay::default(), Options::default());
        p.init().unwrap();
        p.authenticate(&DeviceId::ERASED).unwrap();
        p
    }

    fn image(chunks: Vec<(u32, Vec<u8>)>) -> MemoryImage {
        let mut img = MemoryImage::new(crate::image::DEFAULT_SIZE);
        for (a, d) in chunks {
            img.write(a, &d).unwrap();
        }
        img
    }

    #[derive(Default)]
    struct Steps(Vec<(Phase, usize)>, usize);

    impl Progress for Steps {
        fn begin(&mut self, phase: Phase, total: usize) {
            self.0.push((phase, total));
        }
        fn step(&mut self, done: usize) {
            self.1 = done;
        }
    }

    #[test]
    fn page_walk() {
        let spans = [
            AreaSpan::new(0x10FF, 0x1100),
            AreaSpan::new(0x1180, 0x1190),
            AreaSpan::new(0x2000, 0x2000),
        ];
        assert_eq!(pages(&spans), vec![0x1000, 0x1100, 0x2000]);
    }

    #[test]
    fn block_walk_is_order_independent() {
        let schedule = Device::r8c().schedule;
        let forward = [
            AreaSpan::new(0x1000, 0x1000),
            AreaSpan::new(0x1300, 0x1310),
            AreaSpan::new(0x7F00, 0x8100),
            AreaSpan::new(0x8200, 0x8F00),
        ];
        let mut reverse = forward;
        reverse.reverse();

        let expected = vec![
            Block { base: 0x1000, size: 0x400 },
            Block { base: 0x7C00, size: 0x400 },
            Block { base: 0x8000, size: 0x1000 },
        ];
        assert_eq!(blocks(&schedule, &forward), Ok(expected.clone()));
        assert_eq!(blocks(&schedule, &reverse), Ok(expected));
    }

    #[test]
    fn block_walk_outside_schedule() {
        let schedule = BlockSchedule::new(vec![BlockRegion::new(0, 0xFFF, 0x400)]);
        assert_eq!(
            blocks(&schedule, &[AreaSpan::new(0xF00, 0x1100)]),
            Err(0x1000)
        );
    }

    #[test]
    fn shared_block_erased_once() {
        let schedule = Device::r8c().schedule;
        let mut p = connected(SimDevice::default());
        let img = image(vec![(0x1000, vec![1; 16]), (0x1300, vec![2; 16])]);

        let n = Engine::new(&mut p, &schedule)
            .erase(&img, &mut NoProgress)
            .unwrap();

        assert_eq!(n, 1);
        assert_eq!(p.port().erases(), &[0x1000]);
    }

    #[test]
    fn erase_skips_blocks_erased_earlier_in_session() {
        let schedule = Device::r8c().schedule;
        let mut p = connected(SimDevice::default());
        let first = image(vec![(0x8010, vec![1; 4])]);
        let second = image(vec![(0x8800, vec![2; 4]), (0x9000, vec![3; 4])]);

        let mut e = Engine::new(&mut p, &schedule);
        assert_eq!(e.erase(&first, &mut NoProgress), Ok(1));
        assert_eq!(e.erase(&second, &mut NoProgress), Ok(1));

        assert_eq!(p.port().erases(), &[0x8000, 0x9000]);
    }

    #[test]
    fn erase_all_covers_schedule() {
        let schedule = BlockSchedule::new(vec![
            BlockRegion::new(0x0000, 0x0FFF, 0x400),
            BlockRegion::new(0x8000, 0xFFFF, 0x4000),
        ]);
        let mut p = connected(SimDevice::default());

        let mut steps = Steps::default();
        let n = Engine::new(&mut p, &schedule)
            .erase_all(&mut steps)
            .unwrap();

        assert_eq!(n, 6);
        assert_eq!(steps.0, vec![(Phase::Erase, 6)]);
        assert_eq!(steps.1, 6);
    }

    #[test]
    fn write_requires_erase() {
        let schedule = Device::r8c().schedule;
        let mut p = connected(SimDevice::default());
        let img = image(vec![(0x8000, vec![1; 4])]);

        assert_eq!(
            Engine::new(&mut p, &schedule).write(&img, false, &mut NoProgress),
            Err(Error::NotErased {
                address: 0x8000,
                block: 0x8000
            })
        );
        assert!(p.port().writes().is_empty());
    }

    #[test]
    fn erase_write_verify_round_trip() {
        let schedule = Device::r8c().schedule;
        let mut p = connected(SimDevice::default());

        let code: Vec<u8> = (0..700u32).map(|i| (i * 13 + 5) as u8).collect();
        let img = image(vec![
            (0x0_4010, code.clone()),
            (0x0_FFF0, vec![0x5A; 0x20]),
            (0x0_7FFE, vec![1, 2]),
        ]);

        let mut e = Engine::new(&mut p, &schedule);
        e.erase(&img, &mut NoProgress).unwrap();
        let written = e.write(&img, false, &mut NoProgress).unwrap();
        let report = e.verify(&img, &mut NoProgress).unwrap();

        assert_eq!(written, pages(img.spans()).len());
        assert!(report.passed());
        assert_eq!(report.pages, written);
        assert_eq!(report.bytes, written * PAGE_SIZE);

        // Padding around the data stays erased
        assert_eq!(p.port().flash[0x4000], ERASED);
        assert_eq!(&p.port().flash[0x4010..0x4010 + 700], &code[..]);
        assert_eq!(p.port().erases(), &[0x4000, 0x7C00, 0xF000, 0x10000]);
    }

    #[test]
    fn verify_reports_single_mismatch() {
        let schedule = Device::r8c().schedule;
        let mut dev = SimDevice::default();
        dev.corrupt.push((0x9105, 0x00));
        let mut p = connected(dev);

        let img = image(vec![(0x9100, vec![0xA5; PAGE_SIZE])]);

        let mut e = Engine::new(&mut p, &schedule);
        e.erase(&img, &mut NoProgress).unwrap();
        e.write(&img, false, &mut NoProgress).unwrap();
        let report = e.verify(&img, &mut NoProgress).unwrap();

        assert!(!report.passed());
        assert_eq!(
            report.mismatches,
            vec![Mismatch {
                address: 0x9105,
                expected: 0xA5,
                actual: 0x00
            }]
        );
    }

    #[test]
    fn verify_collects_across_pages() {
        let schedule = Device::r8c().schedule;
        let mut dev = SimDevice::default();
        dev.flash[0x8000..0x8400].copy_from_slice(&[0x11; 0x400]);
        dev.corrupt.push((0x8001, 0x10));
        dev.corrupt.push((0x8302, 0x00));
        let mut p = connected(dev);

        let img = image(vec![(0x8000, vec![0x11; 0x400])]);

        let report = Engine::new(&mut p, &schedule)
            .verify(&img, &mut NoProgress)
            .unwrap();

        assert_eq!(report.pages, 4);
        assert_eq!(
            report.mismatches.iter().map(|m| m.address).collect::<Vec<_>>(),
            vec![0x8001, 0x8302]
        );
        assert!(p.port().erases().is_empty());
    }

    #[test]
    fn verify_checks_whole_page() {
        let schedule = Device::r8c().schedule;
        let mut dev = SimDevice::default();
        dev.flash[0x8000..0x8100].copy_from_slice(&[0u8; PAGE_SIZE]);
        dev.flash[0x8000..0x8004].copy_from_slice(&[1, 2, 3, 4]);
        let mut p = connected(dev);

        // The record sets 0x8002 to 0xFF explicitly
        let img = image(vec![(0x8000, vec![1, 2, 0xFF, 4])]);

        let report = Engine::new(&mut p, &schedule)
            .verify(&img, &mut NoProgress)
            .unwrap();

        assert_eq!(report.pages, 1);
        assert_eq!(report.bytes, PAGE_SIZE);
        assert_eq!(
            report.mismatches[0],
            Mismatch {
                address: 0x8002,
                expected: 0xFF,
                actual: 0x03
            }
        );
        // Padding after the data must read back erased too
        assert_eq!(report.mismatches.len(), 1 + PAGE_SIZE - 4);
        assert_eq!(report.mismatches[1].address, 0x8004);
    }

    #[test]
    fn compare_pads_past_image_end() {
        let mut img = MemoryImage::new(0x104);
        img.write(0x100, &[1, 2, 0xFF, 4]).unwrap();

        let mut actual = [ERASED; PAGE_SIZE];
        actual[..4].copy_from_slice(&[1, 2, 0xFF, 4]);
        actual[0x80] = 0x00;

        let mut mismatches = vec![];
        assert_eq!(compare(&img, 0x100, &actual, &mut mismatches), PAGE_SIZE);
        assert_eq!(
            mismatches,
            vec![Mismatch {
                address: 0x180,
                expected: ERASED,
                actual: 0x00
            }]
        );
    }

    #[test]
    fn read_back_to_image() {
        let schedule = Device::r8c().schedule;
        let mut dev = SimDevice::default();
        dev.flash[0xC080..0xC090].copy_from_slice(&[0x3C; 16]);
        let mut p = connected(dev);

        let img = Engine::new(&mut p, &schedule)
            .read(0xC000, 0xC1FF, 0x10_0000, &mut NoProgress)
            .unwrap();

        assert_eq!(img.spans(), &[AreaSpan::new(0xC080, 0xC08F)]);
        assert_eq!(p.port().reads(), &[0xC000, 0xC100]);
    }

    #[test]
    fn read_outside_flash_rejected() {
        let schedule = Device::r8c().schedule;
        let mut p = connected(SimDevice::default());

        assert_eq!(
            Engine::new(&mut p, &schedule).read(
                0,
                0xFFFF_FFFF,
                0x10_0000,
                &mut NoProgress
            ),
            Err(Error::OutOfRange {
                start: 0,
                end: 0xFFFF_FFFF,
                size: 0x10_0000
            })
        );
        assert!(p.port().reads().is_empty());
    }

    #[test]
    fn abort_identifies_page() {
        let schedule = Device::r8c().schedule;
        let mut dev = SimDevice::default();
        dev.fail_write = Some(0x8100);
        let mut p = connected(dev);
        let img = image(vec![(0x8000, vec![7; 0x300])]);

        let mut e = Engine::new(&mut p, &schedule);
        e.erase(&img, &mut NoProgress).unwrap();
        assert!(matches!(
            e.write(&img, false, &mut NoProgress),
            Err(Error::WriteFailed { address: 0x8100, .. })
        ));

        // No writes after the failing page
        assert_eq!(p.port().writes(), &[0x8000, 0x8100]);
    }
}
