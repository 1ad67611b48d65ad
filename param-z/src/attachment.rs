use std::time::{SystemTime, UNIX_EPOCH};

use zenoh::bytes::ZBytes;
use zenoh_ext::{ZDeserializer, ZSerializer};

use crate::transport::Priority;

/// Routing metadata travelling next to a packet, in place of a CSP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub sequence_number: i64,
    pub source_timestamp: i64,
    pub source_node: u16,
    pub priority: u8,
}

impl Attachment {
    pub fn new(sequence_number: i64, source_node: u16, priority: Priority) -> Self {
        let source_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Self {
            sequence_number,
            source_timestamp,
            source_node,
            priority: priority as u8,
        }
    }
}

impl TryFrom<&ZBytes> for Attachment {
    type Error = zenoh::Error;
    fn try_from(value: &ZBytes) -> Result<Self, Self::Error> {
        let mut des = ZDeserializer::new(value);
        let sequence_number = des.deserialize::<i64>()?;
        let source_timestamp = des.deserialize::<i64>()?;
        let source_node = des.deserialize::<u16>()?;
        let priority = des.deserialize::<u8>()?;
        Ok(Attachment {
            sequence_number,
            source_timestamp,
            source_node,
            priority,
        })
    }
}

impl From<Attachment> for ZBytes {
    fn from(value: Attachment) -> Self {
        let mut ser = ZSerializer::new();
        ser.serialize(value.sequence_number);
        ser.serialize(value.source_timestamp);
        ser.serialize(value.source_node);
        ser.serialize(value.priority);
        ser.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_fields_survive() {
        let att = Attachment::new(7, 12, Priority::High);
        let bytes: ZBytes = att.into();
        let back = Attachment::try_from(&bytes).unwrap();
        assert_eq!(back, att);
        assert_eq!(back.priority, 1);
    }
}
