use std::collections::BTreeMap;

use thiserror::Error;

const MAGIC: [u8; 4] = *b"VSNP";
const FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
const HEADER_LEN: usize = 4 + 4 + 4 + 4;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,

    #[error("bad snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot format version {0}.{1}")]
    UnsupportedFormatVersion(u16, u16),

    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported device major version {found} (supported: {supported})")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },

    #[error("duplicate field tag {0}")]
    DuplicateFieldTag(u16),

    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Builds a TLV snapshot. Fields are emitted sorted by tag regardless of insertion order.
#[derive(Debug)]
pub struct SnapshotWriter {
    device_id: [u8; 4],
    device_version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            device_id,
            device_version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.fields.insert(tag, bytes);
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field_bytes(tag, vec![v]);
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field_u8(tag, v as u8);
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.fields.values().map(|v| 6 + v.len()).sum::<usize>(),
        );
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.major.to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.minor.to_le_bytes());
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.device_version.minor.to_le_bytes());
        for (tag, value) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(&value);
        }
        out
    }
}

/// Parsed view over a TLV snapshot.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_device_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = codec::Decoder::new(bytes);
        if d.bytes(4)? != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let format_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        if format_version.major != FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion(
                format_version.major,
                format_version.minor,
            ));
        }
        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(d.bytes(4)?);
        if device_id != expected_device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_device_id,
                found: device_id,
            });
        }
        let device_version = SnapshotVersion::new(d.u16()?, d.u16()?);

        let mut fields = BTreeMap::new();
        while !d.is_empty() {
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let value = d.bytes(len)?;
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(&self, tag: u16, what: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(buf) => buf
                .try_into()
                .map(Some)
                .map_err(|_| SnapshotError::InvalidFieldEncoding(what)),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8")?.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed(tag, "u16")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed(tag, "u32")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed(tag, "u64")?.map(u64::from_le_bytes))
    }
}

/// Little-endian field codecs used inside TLV values.
pub mod codec {
    use super::{SnapshotError, SnapshotResult};

    #[derive(Debug, Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, v: u8) -> Self {
            self.buf.push(v);
            self
        }

        pub fn bool(self, v: bool) -> Self {
            self.u8(v as u8)
        }

        pub fn u16(mut self, v: u16) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u64(mut self, v: u64) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn bytes(mut self, v: &[u8]) -> Self {
            self.buf.extend_from_slice(v);
            self
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    #[derive(Debug)]
    pub struct Decoder<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Decoder<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }

        pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
            if len > self.remaining() {
                return Err(SnapshotError::UnexpectedEof);
            }
            let out = &self.buf[self.pos..self.pos + len];
            self.pos += len;
            Ok(out)
        }

        fn array<const N: usize>(&mut self) -> SnapshotResult<[u8; N]> {
            let mut out = [0u8; N];
            out.copy_from_slice(self.bytes(N)?);
            Ok(out)
        }

        pub fn u8(&mut self) -> SnapshotResult<u8> {
            Ok(self.array::<1>()?[0])
        }

        pub fn bool(&mut self) -> SnapshotResult<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
            }
        }

        pub fn u16(&mut self) -> SnapshotResult<u16> {
            Ok(u16::from_le_bytes(self.array()?))
        }

        pub fn u32(&mut self) -> SnapshotResult<u32> {
            Ok(u32::from_le_bytes(self.array()?))
        }

        pub fn u64(&mut self) -> SnapshotResult<u64> {
            Ok(u64::from_le_bytes(self.array()?))
        }

        /// Fails if any bytes are left unread.
        pub fn finish(self) -> SnapshotResult<()> {
            if !self.is_empty() {
                return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
            }
            Ok(())
        }
    }
}
