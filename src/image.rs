//! Program images and relocation targets

use std::fmt;
use std::ops::Range;

/// A finished machine-code image and the address it was assembled for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    bytes: Vec<u8>,
    origin: u16,
}

impl ProgramImage {
    /// Create an image; the bytes must fit between `origin` and the top of memory
    pub fn new(bytes: Vec<u8>, origin: u16) -> Result<Self, String> {
        let room = 0x10000 - origin as usize;
        if bytes.len() > room {
            return Err(format!(
                "image of {} bytes does not fit at ${:04X} ({} bytes available)",
                bytes.len(),
                origin,
                room
            ));
        }
        Ok(ProgramImage { bytes, origin })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn origin(&self) -> u16 {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address range covered by the image
    pub fn address_range(&self) -> Range<u32> {
        self.origin as u32..self.origin as u32 + self.bytes.len() as u32
    }

    pub fn contains_address(&self, address: u16) -> bool {
        self.address_range().contains(&(address as u32))
    }

    /// Offset of `address` within the image, if it lies inside
    pub fn offset_of(&self, address: u16) -> Option<usize> {
        if self.contains_address(address) {
            Some((address - self.origin) as usize)
        } else {
            None
        }
    }

    pub fn address_of(&self, offset: usize) -> u16 {
        self.origin.wrapping_add(offset as u16)
    }
}

/// A contiguous window of zero-page addresses: `base ..= base + length - 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RamZpRange {
    pub base: u8,
    pub length: u8,
}

impl RamZpRange {
    pub fn new(base: u8, length: u8) -> Self {
        RamZpRange { base, length }
    }

    /// The window stays inside page zero
    pub fn is_valid(&self) -> bool {
        self.base as u16 + self.length as u16 <= 0x100
    }

    pub fn contains(&self, zp: u8) -> bool {
        zp >= self.base && (zp as u16) < self.base as u16 + self.length as u16
    }

    /// Last address of the window, `None` for an empty window
    pub fn last(&self) -> Option<u8> {
        if self.length == 0 {
            None
        } else {
            Some(self.base.wrapping_add(self.length - 1))
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = u8> {
        let base = self.base as u16;
        (base..base + self.length as u16).map(|zp| zp as u8)
    }
}

impl fmt::Display for RamZpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "${:02X}-${:02X}", self.base, last),
            None => write!(f, "${:02X} (empty)", self.base),
        }
    }
}

/// Where a relocated image should live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationTarget {
    pub code_base: u16,
    pub zp_range: RamZpRange,
}

impl RelocationTarget {
    pub fn new(code_base: u16, zp_range: RamZpRange) -> Self {
        RelocationTarget {
            code_base,
            zp_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_must_fit_below_top_of_memory() {
        assert!(ProgramImage::new(vec![0; 0x100], 0xFF00).is_ok());
        assert!(ProgramImage::new(vec![0; 0x101], 0xFF00).is_err());
    }

    #[test]
    fn offsets_and_addresses() {
        let image = ProgramImage::new(vec![0xEA; 4], 0xC000).unwrap();
        assert_eq!(image.offset_of(0xC003), Some(3));
        assert_eq!(image.offset_of(0xC004), None);
        assert_eq!(image.offset_of(0xBFFF), None);
        assert_eq!(image.address_of(2), 0xC002);
    }

    #[test]
    fn zero_page_window_bounds() {
        let window = RamZpRange::new(0x80, 0x10);
        assert!(window.is_valid());
        assert!(window.contains(0x80));
        assert!(window.contains(0x8F));
        assert!(!window.contains(0x90));
        assert_eq!(window.last(), Some(0x8F));
        assert_eq!(window.to_string(), "$80-$8F");
        assert!(!RamZpRange::new(0xF8, 0x10).is_valid());
        assert_eq!(RamZpRange::new(0xF0, 0x10).addresses().last(), Some(0xFF));
    }
}
