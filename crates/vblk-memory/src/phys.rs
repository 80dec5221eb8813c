use core::fmt;
use std::sync::{PoisonError, RwLock};

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest physical memory size.
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    SizeTooLarge { size: u64 },
}

impl fmt::Display for GuestMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestMemoryError::OutOfRange { paddr, len, size } => write!(
                f,
                "guest memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}"
            ),
            GuestMemoryError::SizeTooLarge { size } => {
                write!(f, "guest memory size {size} does not fit in usize")
            }
        }
    }
}

impl std::error::Error for GuestMemoryError {}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Guest *physical* memory as seen by a device model.
///
/// Device models run on several worker contexts at once, so both reads and writes go through a
/// shared reference; implementations provide their own interior synchronization.
pub trait GuestMemory: Send + Sync {
    fn size(&self) -> u64;

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    fn read_u8_le(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(paddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8_le(&self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    fn write_u16_le(&self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u32_le(&self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

fn check_range(size: u64, paddr: u64, len: usize) -> GuestMemoryResult<()> {
    let len_u64 = len as u64;
    let end = paddr
        .checked_add(len_u64)
        .ok_or(GuestMemoryError::OutOfRange { paddr, len, size })?;
    if end > size {
        return Err(GuestMemoryError::OutOfRange { paddr, len, size });
    }
    Ok(())
}

/// Flat, heap-backed guest RAM.
#[derive(Debug)]
pub struct GuestRam {
    data: RwLock<Vec<u8>>,
    size: u64,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; size]),
            size: size as u64,
        }
    }

    pub fn try_new(size: u64) -> GuestMemoryResult<Self> {
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self::new(len))
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        check_range(self.size, paddr, dst.len())?;
        let start = paddr as usize;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&data[start..start + dst.len()]);
        Ok(())
    }

    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        check_range(self.size, paddr, src.len())?;
        let start = paddr as usize;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_helpers_round_trip() {
        let ram = GuestRam::new(64);
        ram.write_u64_le(8, 0x1122_3344_5566_7788).unwrap();
        ram.write_u16_le(0, 0xbeef).unwrap();
        assert_eq!(ram.read_u64_le(8).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(ram.read_u8_le(0).unwrap(), 0xef);
        assert_eq!(ram.read_u16_le(0).unwrap(), 0xbeef);
    }

    #[test]
    fn accesses_past_the_end_are_rejected() {
        let ram = GuestRam::new(16);
        assert_eq!(
            ram.write_from(12, &[0; 8]),
            Err(GuestMemoryError::OutOfRange {
                paddr: 12,
                len: 8,
                size: 16
            })
        );
        let mut buf = [0u8; 1];
        assert!(ram.read_into(u64::MAX, &mut buf).is_err());
        ram.read_into(15, &mut buf).unwrap();
    }
}
