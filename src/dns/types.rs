/// Record types seen in answers. Only A is queried; CNAME chains show up
/// ahead of the addresses and are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    CNAME,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(v: u16) -> Self {
        match v {
            1 => RecordType::A,
            5 => RecordType::CNAME,
            other => RecordType::Unknown(other),
        }
    }
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::CNAME => 5,
            RecordType::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    ServFail,
    NxDomain,
    Refused,
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(v: u8) -> Self {
        match v {
            0 => ResponseCode::NoError,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }
}
