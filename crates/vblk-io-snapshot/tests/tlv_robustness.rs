use vblk_io_snapshot::io::state::codec::{Decoder, Encoder};
use vblk_io_snapshot::io::state::{
    SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter,
};

const ID: [u8; 4] = *b"TEST";
const VERSION: SnapshotVersion = SnapshotVersion::new(1, 2);

#[test]
fn fields_come_back_sorted_and_typed() {
    let mut w = SnapshotWriter::new(ID, VERSION);
    w.field_u64(7, 0xdead_beef);
    w.field_bool(2, true);
    w.field_bytes(3, vec![1, 2, 3]);
    let bytes = w.finish();

    let r = SnapshotReader::parse(&bytes, ID).unwrap();
    assert_eq!(r.header().device_version, VERSION);
    r.ensure_device_major(1).unwrap();
    assert_eq!(r.u64(7).unwrap(), Some(0xdead_beef));
    assert_eq!(r.bool(2).unwrap(), Some(true));
    assert_eq!(r.bytes(3), Some(&[1u8, 2, 3][..]));
    assert_eq!(r.u32(9).unwrap(), None);
}

#[test]
fn writer_output_is_independent_of_insertion_order() {
    let mut a = SnapshotWriter::new(ID, VERSION);
    a.field_u32(1, 10);
    a.field_u32(2, 20);
    let mut b = SnapshotWriter::new(ID, VERSION);
    b.field_u32(2, 20);
    b.field_u32(1, 10);
    assert_eq!(a.finish(), b.finish());
}

#[test]
fn reader_rejects_foreign_device_and_major() {
    let bytes = SnapshotWriter::new(ID, VERSION).finish();
    assert_eq!(
        SnapshotReader::parse(&bytes, *b"XXXX").unwrap_err(),
        SnapshotError::DeviceIdMismatch {
            expected: *b"XXXX",
            found: ID
        }
    );
    let r = SnapshotReader::parse(&bytes, ID).unwrap();
    assert_eq!(
        r.ensure_device_major(2).unwrap_err(),
        SnapshotError::UnsupportedDeviceMajorVersion {
            found: 1,
            supported: 2
        }
    );
}

#[test]
fn truncated_snapshot_is_an_error() {
    let mut w = SnapshotWriter::new(ID, VERSION);
    w.field_u64(1, 5);
    let bytes = w.finish();
    for len in 0..bytes.len() {
        assert!(SnapshotReader::parse(&bytes[..len], ID).is_err());
    }
}

#[test]
fn wrong_width_field_is_rejected() {
    let mut w = SnapshotWriter::new(ID, VERSION);
    w.field_bytes(1, vec![0; 3]);
    let bytes = w.finish();
    let r = SnapshotReader::parse(&bytes, ID).unwrap();
    assert_eq!(
        r.u32(1).unwrap_err(),
        SnapshotError::InvalidFieldEncoding("u32")
    );
}

#[test]
fn codec_round_trip_and_trailing_bytes() {
    let buf = Encoder::new().u8(1).u16(2).u32(3).u64(4).bool(false).finish();
    let mut d = Decoder::new(&buf);
    assert_eq!(d.u8().unwrap(), 1);
    assert_eq!(d.u16().unwrap(), 2);
    assert_eq!(d.u32().unwrap(), 3);
    assert_eq!(d.u64().unwrap(), 4);
    assert!(!d.bool().unwrap());
    d.finish().unwrap();

    let mut d = Decoder::new(&buf);
    d.u8().unwrap();
    assert!(d.finish().is_err());
    assert_eq!(Decoder::new(&[]).u32().unwrap_err(), SnapshotError::UnexpectedEof);
}
