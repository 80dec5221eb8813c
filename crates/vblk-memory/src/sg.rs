use crate::phys::{GuestMemory, GuestMemoryError, GuestMemoryResult};

/// One contiguous guest buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    pub addr: u64,
    pub len: u32,
}

/// An ordered list of guest buffers that together form one logical byte stream.
///
/// Request payloads are described by descriptor chains that are rarely contiguous in guest memory;
/// `SgList` lets the device peel the header and trailer off a chain and then hand the remaining
/// payload to the backend without copying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList {
    segs: Vec<SgSegment>,
}

impl SgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segs: Vec<SgSegment>) -> Self {
        Self { segs }
    }

    pub fn push(&mut self, addr: u64, len: u32) {
        self.segs.push(SgSegment { addr, len });
    }

    pub fn segments(&self) -> &[SgSegment] {
        &self.segs
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn first(&self) -> Option<&SgSegment> {
        self.segs.first()
    }

    pub fn last(&self) -> Option<&SgSegment> {
        self.segs.last()
    }

    /// Total payload size in bytes.
    pub fn size(&self) -> u64 {
        self.segs.iter().map(|s| u64::from(s.len)).sum()
    }

    pub fn extend_from(&mut self, other: &SgList) {
        self.segs.extend_from_slice(&other.segs);
    }

    /// Concatenates several lists into a new one, preserving order.
    pub fn concat<'a>(lists: impl IntoIterator<Item = &'a SgList>) -> SgList {
        let mut out = SgList::new();
        for list in lists {
            out.extend_from(list);
        }
        out
    }

    /// Removes the first `bytes` bytes and returns them as their own list.
    ///
    /// Returns `None` (leaving `self` untouched) when the list holds fewer than `bytes` bytes.
    pub fn split_front(&mut self, bytes: u64) -> Option<SgList> {
        if bytes > self.size() {
            return None;
        }
        let mut head = SgList::new();
        let mut remaining = bytes;
        let mut consumed = 0;
        while remaining > 0 {
            let seg = self.segs[consumed];
            let len = u64::from(seg.len);
            if len <= remaining {
                head.segs.push(seg);
                remaining -= len;
                consumed += 1;
            } else {
                let take = remaining as u32;
                head.segs.push(SgSegment {
                    addr: seg.addr,
                    len: take,
                });
                self.segs[consumed] = SgSegment {
                    addr: seg.addr.wrapping_add(remaining),
                    len: seg.len - take,
                };
                remaining = 0;
            }
        }
        self.segs.drain(..consumed);
        Some(head)
    }

    /// Removes the last `bytes` bytes and returns them as their own list.
    pub fn split_back(&mut self, bytes: u64) -> Option<SgList> {
        if bytes > self.size() {
            return None;
        }
        let mut tail = Vec::new();
        let mut remaining = bytes;
        while remaining > 0 {
            let idx = self.segs.len() - 1;
            let seg = self.segs[idx];
            let len = u64::from(seg.len);
            if len <= remaining {
                tail.push(seg);
                remaining -= len;
                self.segs.pop();
            } else {
                let take = remaining as u32;
                let keep = seg.len - take;
                tail.push(SgSegment {
                    addr: seg.addr.wrapping_add(u64::from(keep)),
                    len: take,
                });
                self.segs[idx].len = keep;
                remaining = 0;
            }
        }
        tail.reverse();
        Some(SgList { segs: tail })
    }

    /// Copies up to `dst.len()` bytes starting `offset` bytes into the list.
    ///
    /// Returns the number of bytes copied, which is short when the list ends first.
    pub fn to_buf(
        &self,
        mem: &dyn GuestMemory,
        offset: u64,
        dst: &mut [u8],
    ) -> GuestMemoryResult<usize> {
        let mut copied = 0usize;
        for (addr, len) in self.chunks(offset, dst.len()) {
            mem.read_into(addr, &mut dst[copied..copied + len])?;
            copied += len;
        }
        Ok(copied)
    }

    /// Copies up to `src.len()` bytes into the list starting `offset` bytes in.
    pub fn from_buf(
        &self,
        mem: &dyn GuestMemory,
        offset: u64,
        src: &[u8],
    ) -> GuestMemoryResult<usize> {
        let mut copied = 0usize;
        for (addr, len) in self.chunks(offset, src.len()) {
            mem.write_from(addr, &src[copied..copied + len])?;
            copied += len;
        }
        Ok(copied)
    }

    /// Reads the whole list into a freshly allocated buffer.
    pub fn gather(&self, mem: &dyn GuestMemory) -> GuestMemoryResult<Vec<u8>> {
        let size = self.size();
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        let mut buf = vec![0u8; len];
        self.to_buf(mem, 0, &mut buf)?;
        Ok(buf)
    }

    fn chunks(&self, mut skip: u64, mut want: usize) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        for seg in &self.segs {
            if want == 0 {
                break;
            }
            let len = u64::from(seg.len);
            if skip >= len {
                skip -= len;
                continue;
            }
            let avail = (len - skip) as usize;
            let take = avail.min(want);
            out.push((seg.addr.wrapping_add(skip), take));
            want -= take;
            skip = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GuestRam;
    use proptest::prelude::*;

    fn list(segs: &[(u64, u32)]) -> SgList {
        SgList::from_segments(
            segs.iter()
                .map(|&(addr, len)| SgSegment { addr, len })
                .collect(),
        )
    }

    #[test]
    fn split_front_cuts_inside_a_segment() {
        let mut sg = list(&[(0x1000, 10), (0x2000, 20)]);
        let head = sg.split_front(16).unwrap();
        assert_eq!(head, list(&[(0x1000, 10), (0x2000, 6)]));
        assert_eq!(sg, list(&[(0x2006, 14)]));
    }

    #[test]
    fn split_back_takes_trailing_byte() {
        let mut sg = list(&[(0x1000, 512), (0x3000, 1)]);
        let tail = sg.split_back(1).unwrap();
        assert_eq!(tail, list(&[(0x3000, 1)]));
        assert_eq!(sg.size(), 512);

        let mut sg = list(&[(0x1000, 513)]);
        let tail = sg.split_back(1).unwrap();
        assert_eq!(tail, list(&[(0x1200, 1)]));
        assert_eq!(sg, list(&[(0x1000, 512)]));
    }

    #[test]
    fn split_larger_than_list_is_refused() {
        let mut sg = list(&[(0x1000, 4)]);
        assert!(sg.split_front(5).is_none());
        assert!(sg.split_back(5).is_none());
        assert_eq!(sg.size(), 4);
    }

    #[test]
    fn gather_and_scatter_cross_segments() {
        let ram = GuestRam::new(0x4000);
        let sg = list(&[(0x1000, 3), (0x2000, 5)]);
        assert_eq!(sg.from_buf(&ram, 1, b"abcdefgh").unwrap(), 7);
        let mut out = [0u8; 8];
        assert_eq!(sg.to_buf(&ram, 0, &mut out).unwrap(), 8);
        assert_eq!(&out, b"\0abcdefg");
    }

    proptest! {
        #[test]
        fn split_front_preserves_total_size(
            lens in proptest::collection::vec(0u32..64, 1..8),
            cut in 0u64..600,
        ) {
            let mut sg = SgList::new();
            for (i, len) in lens.iter().enumerate() {
                sg.push(0x1000 * (i as u64 + 1), *len);
            }
            let total = sg.size();
            match sg.split_front(cut) {
                Some(head) => {
                    prop_assert_eq!(head.size(), cut);
                    prop_assert_eq!(sg.size(), total - cut);
                }
                None => prop_assert!(cut > total),
            }
        }
    }
}
