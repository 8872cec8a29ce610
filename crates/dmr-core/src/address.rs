
/// Destination id of the broadcast/no-op call. Packets to this id are dropped.
pub const DST_NONE: u32 = 0;
/// Destination id of the unlink pseudo-talkgroup: clears the dynamic
/// talkgroup on the originating slot.
pub const DST_UNLINK: u32 = 4000;
/// Destination id of the parrot loopback service.
pub const DST_PARROT: u32 = 9990;

#[allow(dead_code)]
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum DmrIdType {
    Unknown,
    /// Individual subscriber id (a radio / hotspot user)
    Subscriber,
    /// Talkgroup id
    Talkgroup,
    /// Repeater id (6 or 9 digit, per network convention)
    Repeater,
}

impl core::fmt::Display for DmrIdType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DmrIdType::Unknown => write!(f, "Unknown"),
            DmrIdType::Subscriber => write!(f, "SU"),
            DmrIdType::Talkgroup => write!(f, "TG"),
            DmrIdType::Repeater => write!(f, "RPT"),
        }
    }
}

#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub struct DmrAddress {
    pub id: u32,
    pub id_type: DmrIdType,
}

impl DmrAddress {
    pub fn new(id: u32, id_type: DmrIdType) -> Self {
        Self { id, id_type }
    }

    /// Convenience constructor for a subscriber address
    pub fn subscriber(id: u32) -> Self {
        Self::new(id, DmrIdType::Subscriber)
    }

    /// Convenience constructor for a talkgroup address
    pub fn talkgroup(id: u32) -> Self {
        Self::new(id, DmrIdType::Talkgroup)
    }

    /// True for the reserved service ids that must never be fanned out
    pub fn is_service_id(&self) -> bool {
        matches!(self.id, DST_NONE | DST_UNLINK | DST_PARROT)
    }
}

impl core::fmt::Display for DmrAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.id_type, self.id)
    }
}
