/// Kind of a zone on a zoned block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockZoneType {
    Conventional,
    SequentialWriteRequired,
    SequentialWritePreferred,
}

/// Zone condition as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockZoneState {
    NotWritePointer,
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    ReadOnly,
    Full,
    Offline,
}

/// One zone as returned by a zone report. All values are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockZoneDescriptor {
    pub start: u64,
    pub length: u64,
    pub cap: u64,
    pub wp: u64,
    pub zone_type: BlockZoneType,
    pub state: BlockZoneState,
}

/// Zone management operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOp {
    Open,
    Close,
    Finish,
    Reset,
}
