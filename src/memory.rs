//! Memory images read from or written to the ECU.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Identifies who asked for a tracked region
pub type RegionTag = u64;

/// A contiguous piece of ECU memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryImage {
    pub start: u32,
    pub data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    /// Image of `size` zero bytes
    pub fn zeroed(start: u32, size: u32) -> Self {
        Self::new(start, vec![0; size as usize])
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// First address past the image
    pub fn end(&self) -> u32 {
        self.start + self.size()
    }

    pub fn contains(&self, start: u32, size: u32) -> bool {
        start >= self.start && start as u64 + size as u64 <= self.end() as u64
    }

    /// The bytes backing `start..start + size`, if the image covers them.
    pub fn slice(&self, start: u32, size: u32) -> Option<&[u8]> {
        if !self.contains(start, size) {
            return None;
        }
        let offset = (start - self.start) as usize;
        Some(&self.data[offset..offset + size as usize])
    }
}

/// A memory image belonging to whoever registered `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMemoryImage {
    pub image: MemoryImage,
    pub tag: RegionTag,
}

/// Checksum the ECU compares against in the ValidateFlashChecksum routine,
/// the low half of the CRC-32 of the data.
pub fn flash_checksum(data: &[u8]) -> u16 {
    crc32fast::hash(data) as u16
}

/// Sector table of the external flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    pub base_address: u32,
    pub sectors: Vec<u32>,
}

/// ME7 29F800 boot block flash
pub mod me7 {
    pub const BASE_ADDRESS: u32 = 0x800000;
    pub const SIZE: u32 = 0x100000;

    pub const SECTORS: [u32; 19] = [
        0x4000, 0x2000, 0x2000, 0x8000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000,
        0x10000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000, 0x10000,
    ];
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            base_address: me7::BASE_ADDRESS,
            sectors: me7::SECTORS.to_vec(),
        }
    }
}

impl MemoryLayout {
    pub fn size(&self) -> u32 {
        self.sectors.iter().sum()
    }

    pub fn end(&self) -> u32 {
        self.base_address + self.size()
    }

    /// Checks every sector can be flashed on its own.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sectors.is_empty() {
            return Err(Error::InvalidLayout("no sectors".into()));
        }
        if self.base_address % 2 != 0 {
            return Err(Error::InvalidLayout(format!(
                "base address {:#08x} is odd",
                self.base_address
            )));
        }
        if let Some((index, size)) = self
            .sectors
            .iter()
            .enumerate()
            .find(|(_, size)| **size == 0 || **size % 2 != 0)
        {
            return Err(Error::InvalidLayout(format!(
                "sector {index} has size {size:#x}, sizes must be even and non zero"
            )));
        }
        if self.base_address as u64 + self.sectors.iter().map(|s| *s as u64).sum::<u64>()
            > 0x1000000
        {
            return Err(Error::InvalidLayout("layout does not fit in 24 bit addresses".into()));
        }
        Ok(())
    }

    /// Sector sized zero images covering the whole layout
    pub fn empty_sectors(&self) -> Vec<MemoryImage> {
        let mut start = self.base_address;
        self.sectors
            .iter()
            .map(|size| {
                let image = MemoryImage::zeroed(start, *size);
                start += size;
                image
            })
            .collect()
    }

    /// Splits a full flash image into one image per sector.
    pub fn split(&self, data: &[u8]) -> Result<Vec<MemoryImage>, Error> {
        self.validate()?;
        if data.len() != self.size() as usize {
            return Err(Error::InvalidLayout(format!(
                "image is {:#x} bytes but the layout covers {:#x}",
                data.len(),
                self.size()
            )));
        }

        let mut offset = 0usize;
        let mut start = self.base_address;
        Ok(self
            .sectors
            .iter()
            .map(|size| {
                let size = *size as usize;
                let image = MemoryImage::new(start, data[offset..offset + size].to_vec());
                offset += size;
                start += size as u32;
                image
            })
            .collect())
    }

    /// Joins sector images back into a flash image, gaps are left as 0xFF.
    pub fn combine<'a>(&self, images: impl IntoIterator<Item = &'a MemoryImage>) -> Vec<u8> {
        let mut data = vec![0xFF; self.size() as usize];
        for image in images {
            if image.start < self.base_address {
                continue;
            }
            let offset = (image.start - self.base_address) as usize;
            if offset >= data.len() {
                continue;
            }
            let length = image.data.len().min(data.len() - offset);
            data[offset..offset + length].copy_from_slice(&image.data[..length]);
        }
        data
    }
}

/// Reference counted set of memory regions, ordered by address.
///
/// Registering the same region with the same tag twice needs two removals
/// before it stops being tracked.
#[derive(Debug, Clone, Default)]
pub struct TrackedRegions {
    regions: BTreeMap<(u32, u32, RegionTag), usize>,
    revision: u64,
}

/// Regions shared between whoever subscribes and the operation reading them
pub type SharedRegions = Arc<Mutex<TrackedRegions>>;

impl TrackedRegions {
    pub fn add(&mut self, start: u32, size: u32, tag: RegionTag) {
        let count = self.regions.entry((start, size, tag)).or_default();
        *count += 1;
        if *count == 1 {
            self.revision += 1;
        }
    }

    /// Drops one reference of every region registered with `tag`.
    ///
    /// Returns whether any region stopped being tracked.
    pub fn remove(&mut self, tag: RegionTag) -> bool {
        let before = self.regions.len();
        self.regions.retain(|(_, _, region_tag), count| {
            if *region_tag == tag {
                *count -= 1;
            }
            *count > 0
        });
        let removed = self.regions.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.regions.clear();
        self.revision += 1;
    }

    /// Changes whenever a region starts or stops being tracked
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// `(start, size, tag)` of every region in address order
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, RegionTag)> + '_ {
        self.regions.keys().copied()
    }

    pub fn get(&self, index: usize) -> Option<(u32, u32, RegionTag)> {
        self.regions.keys().nth(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_layout_covers_one_megabyte() {
        let layout = MemoryLayout::default();
        assert!(layout.validate().is_ok());
        assert_eq!(layout.size(), me7::SIZE);
        assert_eq!(layout.end(), 0x900000);
        assert_eq!(layout.sectors.len(), 19);
    }

    #[test]
    fn invalid_layouts() {
        let odd = MemoryLayout {
            base_address: 0x800001,
            sectors: vec![0x100],
        };
        assert!(odd.validate().is_err());

        let odd_sector = MemoryLayout {
            base_address: 0x800000,
            sectors: vec![0x100, 0x101],
        };
        assert!(odd_sector.validate().is_err());

        let empty = MemoryLayout {
            base_address: 0,
            sectors: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn split_then_combine() {
        let layout = MemoryLayout {
            base_address: 0x800000,
            sectors: vec![4, 2, 2],
        };
        let data: Vec<u8> = (1..=8).collect();
        let sectors = layout.split(&data).unwrap();

        assert_eq!(
            sectors,
            vec![
                MemoryImage::new(0x800000, vec![1, 2, 3, 4]),
                MemoryImage::new(0x800004, vec![5, 6]),
                MemoryImage::new(0x800006, vec![7, 8]),
            ]
        );
        assert_eq!(layout.combine(&sectors), data);
        assert_eq!(layout.combine(&sectors[1..2]), vec![0xFF, 0xFF, 0xFF, 0xFF, 5, 6, 0xFF, 0xFF]);
        assert!(layout.split(&data[1..]).is_err());
    }

    #[test]
    fn image_slices() {
        let image = MemoryImage::new(0x380000, vec![1, 2, 3, 4]);
        assert_eq!(image.end(), 0x380004);
        assert_eq!(image.slice(0x380001, 2), Some(&[2, 3][..]));
        assert_eq!(image.slice(0x380003, 2), None);
        assert_eq!(image.slice(0x37FFFF, 1), None);
    }

    #[test]
    fn tracked_regions_are_reference_counted() {
        let mut regions = TrackedRegions::default();
        regions.add(0x380010, 2, 7);
        regions.add(0x380000, 1, 3);
        regions.add(0x380010, 2, 7);
        assert_eq!(regions.revision(), 2);

        assert_eq!(
            regions.iter().collect::<Vec<_>>(),
            vec![(0x380000, 1, 3), (0x380010, 2, 7)]
        );

        assert!(!regions.remove(7));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.revision(), 2);
        assert!(regions.remove(7));
        assert_eq!(regions.revision(), 3);
        assert_eq!(regions.get(0), Some((0x380000, 1, 3)));
        assert_eq!(regions.get(1), None);

        regions.clear();
        assert!(regions.is_empty());
    }

    #[test]
    fn checksum_is_low_half_of_crc32() {
        // CRC-32 of "123456789" is 0xCBF43926
        assert_eq!(flash_checksum(b"123456789"), 0x3926);
    }
}
