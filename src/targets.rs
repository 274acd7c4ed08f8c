//! Flashable processors on the receiver
//!
//! The receiver carries two independently flashable processors: the
//! application microcontroller running the firmware proper, and the
//! correlator coprocessor loading its image from a dedicated serial NOR
//! flash. Both are programmed through the same bootloader, which tells
//! them apart by a one-byte flash identifier on the wire.

use std::ops::Range;

use strum::{Display, EnumIter, EnumString, VariantNames};

/// One erase-granularity unit of a target's flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Index used in erase commands.
    pub index: u32,
    /// First address covered by this sector.
    pub start: u32,
    /// Size of the sector in bytes.
    pub size: u32,
}

impl Sector {
    const fn new(index: u32, start: u32, size: u32) -> Self {
        Sector { index, start, size }
    }

    /// The address span covered by this sector.
    pub fn range(&self) -> Range<u32> {
        self.start..self.start + self.size
    }

    /// Whether `addr` falls inside this sector.
    pub fn contains(&self, addr: u32) -> bool {
        self.range().contains(&addr)
    }
}

/// Application microcontroller sector table (STM32F4-style geometry).
const APPLICATION_SECTORS: [Sector; 12] = [
    Sector::new(0, 0x0800_0000, 0x4000),
    Sector::new(1, 0x0800_4000, 0x4000),
    Sector::new(2, 0x0800_8000, 0x4000),
    Sector::new(3, 0x0800_C000, 0x4000),
    Sector::new(4, 0x0801_0000, 0x1_0000),
    Sector::new(5, 0x0802_0000, 0x2_0000),
    Sector::new(6, 0x0804_0000, 0x2_0000),
    Sector::new(7, 0x0806_0000, 0x2_0000),
    Sector::new(8, 0x0808_0000, 0x2_0000),
    Sector::new(9, 0x080A_0000, 0x2_0000),
    Sector::new(10, 0x080C_0000, 0x2_0000),
    Sector::new(11, 0x080E_0000, 0x2_0000),
];

/// The bootloader lives in the first application sector and must survive
/// every update.
const APPLICATION_RESTRICTED: [u32; 1] = [0];

/// Coprocessor configuration flash sector table (uniform 64 KiB serial
/// NOR geometry).
const COPROCESSOR_SECTORS: [Sector; 16] = [
    Sector::new(0, 0x0000_0000, 0x1_0000),
    Sector::new(1, 0x0001_0000, 0x1_0000),
    Sector::new(2, 0x0002_0000, 0x1_0000),
    Sector::new(3, 0x0003_0000, 0x1_0000),
    Sector::new(4, 0x0004_0000, 0x1_0000),
    Sector::new(5, 0x0005_0000, 0x1_0000),
    Sector::new(6, 0x0006_0000, 0x1_0000),
    Sector::new(7, 0x0007_0000, 0x1_0000),
    Sector::new(8, 0x0008_0000, 0x1_0000),
    Sector::new(9, 0x0009_0000, 0x1_0000),
    Sector::new(10, 0x000A_0000, 0x1_0000),
    Sector::new(11, 0x000B_0000, 0x1_0000),
    Sector::new(12, 0x000C_0000, 0x1_0000),
    Sector::new(13, 0x000D_0000, 0x1_0000),
    Sector::new(14, 0x000E_0000, 0x1_0000),
    Sector::new(15, 0x000F_0000, 0x1_0000),
];

const COPROCESSOR_RESTRICTED: [u32; 0] = [];

/// Flashable targets on the receiver
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    /// Application microcontroller
    Application,
    /// Correlator coprocessor
    Coprocessor,
}

impl Target {
    /// The ordered sector table of this target's flash.
    pub fn sector_map(&self) -> &'static [Sector] {
        match self {
            Target::Application => &APPLICATION_SECTORS,
            Target::Coprocessor => &COPROCESSOR_SECTORS,
        }
    }

    /// Sector indices that must never be erased or written.
    pub fn restricted_sectors(&self) -> &'static [u32] {
        match self {
            Target::Application => &APPLICATION_RESTRICTED,
            Target::Coprocessor => &COPROCESSOR_RESTRICTED,
        }
    }

    /// Whether `sector` holds the bootloader or other protected data.
    pub fn is_restricted(&self, sector: u32) -> bool {
        self.restricted_sectors().contains(&sector)
    }

    /// The full address span declared by this target's sector table.
    pub fn address_range(&self) -> Range<u32> {
        let map = self.sector_map();
        let first = &map[0];
        let last = &map[map.len() - 1];

        first.start..last.start + last.size
    }

    /// Look up the sector containing `addr`, if any.
    pub fn sector_containing(&self, addr: u32) -> Option<&'static Sector> {
        self.sector_map().iter().find(|sector| sector.contains(addr))
    }

    /// One-byte flash identifier used in erase/program messages.
    pub fn flash_id(&self) -> u8 {
        match self {
            Target::Application => 0,
            Target::Coprocessor => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_tables_are_contiguous() {
        for target in [Target::Application, Target::Coprocessor] {
            let map = target.sector_map();
            for pair in map.windows(2) {
                assert_eq!(pair[0].start + pair[0].size, pair[1].start);
                assert_eq!(pair[0].index + 1, pair[1].index);
            }
        }
    }

    #[test]
    fn application_geometry() {
        let range = Target::Application.address_range();
        assert_eq!(range, 0x0800_0000..0x0810_0000);
        assert!(Target::Application.is_restricted(0));
        assert!(!Target::Application.is_restricted(1));
    }

    #[test]
    fn coprocessor_geometry() {
        assert_eq!(Target::Coprocessor.address_range(), 0..0x0010_0000);
        assert!(Target::Coprocessor.restricted_sectors().is_empty());
    }

    #[test]
    fn sector_lookup() {
        let sector = Target::Application.sector_containing(0x0800_4000).unwrap();
        assert_eq!(sector.index, 1);

        // Last byte of the last sector, then one past the end.
        let sector = Target::Application.sector_containing(0x080F_FFFF).unwrap();
        assert_eq!(sector.index, 11);
        assert!(Target::Application.sector_containing(0x0810_0000).is_none());

        let sector = Target::Coprocessor.sector_containing(0x0001_0000).unwrap();
        assert_eq!(sector.index, 1);
    }
}
