//! Frame layout, big-endian:
//!
//! ```text
//! +--------+---------+-----------+----------+-----------+
//! | u32    | u32     | u64       | u8       | bytes     |
//! | magic  | length  | timestamp | type_tag | payload   |
//! +--------+---------+-----------+----------+-----------+
//! | u32 CRC32C over length..payload                      |
//! +--------+---------+-----------+----------+-----------+
//! ```
//!
//! `timestamp` and `type_tag` are promoted into the header so a scanner can
//! apply a time-range prefilter without decoding the payload at all. The
//! payload carries `id`, `resource`, and `data` in a length-prefixed,
//! order-preserving encoding.

use crate::core::event::{Event, EventKind, ResourceRef};
use crate::core::timestamp::Timestamp;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Per-frame sync marker. Distinct from the file-level `KEVT` magic (§6),
/// which identifies the segment file as a whole.
pub const FRAME_MAGIC: u32 = 0x4B45_4631; // "KEF1"

/// magic(4) + length(4) + timestamp(8) + type_tag(1)
pub const FRAME_HEADER_LEN: usize = 4 + 4 + 8 + 1;
/// Trailing CRC32C.
pub const FRAME_TRAILER_LEN: usize = 4;

/// The promoted fields of a frame, decodable without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub timestamp: Timestamp,
    pub kind: EventKind,
}

impl FrameHeader {
    /// Total on-disk size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload_len as usize + FRAME_TRAILER_LEN
    }
}

fn kind_to_tag(kind: EventKind) -> u8 {
    match kind {
        EventKind::Create => 0,
        EventKind::Update => 1,
        EventKind::Delete => 2,
    }
}

fn tag_to_kind(tag: u8) -> Option<EventKind> {
    match tag {
        0 => Some(EventKind::Create),
        1 => Some(EventKind::Update),
        2 => Some(EventKind::Delete),
        _ => None,
    }
}

fn encode_payload(event: &Event) -> BytesMut {
    let mut buf = BytesMut::new();

    let uuid = Uuid::parse_str(&event.id.to_string()).expect("EventId is always a valid uuid");
    buf.put_slice(uuid.as_bytes());

    put_str(&mut buf, &event.resource.group);
    put_str(&mut buf, &event.resource.version);
    put_str(&mut buf, &event.resource.kind);
    put_str(&mut buf, &event.resource.namespace);
    put_str(&mut buf, &event.resource.name);
    put_str(&mut buf, &event.resource.uid);
    match &event.resource.involved_object_uid {
        Some(uid) => {
            buf.put_u8(1);
            put_str(&mut buf, uid);
        }
        None => buf.put_u8(0),
    }

    buf.put_u32(event.data.len() as u32);
    buf.put_slice(&event.data);

    buf
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf, what: &str) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::Truncated {
            offset: 0,
        });
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated { offset: 0 });
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| Error::Corrupt {
        location: what.to_string(),
        reason: e.to_string(),
    })
}

fn decode_payload(mut buf: &[u8]) -> Result<(Uuid, ResourceRef, Bytes)> {
    if buf.remaining() < 16 {
        return Err(Error::Truncated { offset: 0 });
    }
    let mut id_bytes = [0u8; 16];
    buf.copy_to_slice(&mut id_bytes);
    let id = Uuid::from_bytes(id_bytes);

    let group = get_str(&mut buf, "resource.group")?;
    let version = get_str(&mut buf, "resource.version")?;
    let kind = get_str(&mut buf, "resource.kind")?;
    let namespace = get_str(&mut buf, "resource.namespace")?;
    let name = get_str(&mut buf, "resource.name")?;
    let uid = get_str(&mut buf, "resource.uid")?;

    if buf.remaining() < 1 {
        return Err(Error::Truncated { offset: 0 });
    }
    let has_involved = buf.get_u8();
    let involved_object_uid = if has_involved == 1 {
        Some(get_str(&mut buf, "resource.involvedObjectUid")?)
    } else {
        None
    };

    if buf.remaining() < 4 {
        return Err(Error::Truncated { offset: 0 });
    }
    let data_len = buf.get_u32() as usize;
    if buf.remaining() < data_len {
        return Err(Error::Truncated { offset: 0 });
    }
    let mut data = vec![0u8; data_len];
    buf.copy_to_slice(&mut data);

    let resource = ResourceRef {
        group,
        version,
        kind,
        namespace,
        name,
        uid,
        involved_object_uid,
    };

    Ok((id, resource, Bytes::from(data)))
}

/// Encode `event` into a complete frame: header, payload, and trailing
/// CRC32C computed over `length..payload` per the wire format.
pub fn encode_frame(event: &Event) -> Bytes {
    let payload = encode_payload(event);

    let mut body = BytesMut::with_capacity(FRAME_HEADER_LEN - 4 + payload.len());
    body.put_u32(payload.len() as u32);
    body.put_u64(event.timestamp.as_nanos() as u64);
    body.put_u8(kind_to_tag(event.kind));
    body.put_slice(&payload);

    let crc = crc32c::crc32c(&body);

    let mut frame = BytesMut::with_capacity(4 + body.len() + FRAME_TRAILER_LEN);
    frame.put_u32(FRAME_MAGIC);
    frame.put_slice(&body);
    frame.put_u32(crc);
    frame.freeze()
}

/// Parse just the promoted header fields out of `buf`, without touching
/// the payload. `buf` must contain at least `FRAME_HEADER_LEN` bytes.
pub fn decode_frame_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(Error::Truncated { offset: 0 });
    }
    let mut cursor = buf;
    let magic = cursor.get_u32();
    if magic != FRAME_MAGIC {
        return Err(Error::Corrupt {
            location: "frame header".to_string(),
            reason: format!("bad magic 0x{magic:08X}"),
        });
    }
    let payload_len = cursor.get_u32();
    let timestamp = Timestamp::from_nanos(cursor.get_u64() as i64);
    let tag = cursor.get_u8();
    let kind = tag_to_kind(tag).ok_or_else(|| Error::Corrupt {
        location: "frame header".to_string(),
        reason: format!("unknown type_tag {tag}"),
    })?;

    Ok(FrameHeader {
        payload_len,
        timestamp,
        kind,
    })
}

/// Fully decode one frame from the start of `buf`, verifying its CRC32C.
/// Returns the decoded event and the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(Event, usize)> {
    let header = decode_frame_header(buf)?;
    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Err(Error::Truncated { offset: 0 });
    }

    // CRC32C covers length..payload: everything after the 4-byte magic,
    // up to (not including) the trailing checksum.
    let body = &buf[4..frame_len - FRAME_TRAILER_LEN];
    let expected_crc = u32::from_be_bytes(
        buf[frame_len - FRAME_TRAILER_LEN..frame_len]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    );
    let actual_crc = crc32c::crc32c(body);
    if actual_crc != expected_crc {
        return Err(Error::Corrupt {
            location: "frame body".to_string(),
            reason: format!("crc32c mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
        });
    }

    let payload = &body[FRAME_HEADER_LEN - 4..];
    let (uuid, resource, data) = decode_payload(payload)?;

    let event = Event {
        id: crate::core::event::EventId::parse(&uuid.to_string())
            .expect("uuid round-trips through its own Display"),
        timestamp: header.timestamp,
        kind: header.kind,
        resource,
        data,
    };

    Ok((event, frame_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", "default", "p1", "u1");
        Event::new(
            Timestamp::from_nanos(1_700_000_000_000_000_000),
            EventKind::Create,
            resource,
            Bytes::from_static(br#"{"x":1}"#),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let event = sample_event();
        let frame = encode_frame(&event);
        let (decoded, consumed) = decode_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.timestamp, event.timestamp);
        assert_eq!(decoded.kind, event.kind);
        assert_eq!(decoded.resource, event.resource);
        assert_eq!(decoded.data, event.data);
    }

    #[test]
    fn header_only_decode_matches_full_decode() {
        let event = sample_event();
        let frame = encode_frame(&event);
        let header = decode_frame_header(&frame).unwrap();
        assert_eq!(header.timestamp, event.timestamp);
        assert_eq!(header.kind, event.kind);
    }

    #[test]
    fn corrupt_byte_in_payload_fails_crc_check() {
        let event = sample_event();
        let mut frame = encode_frame(&event).to_vec();
        let mutate_at = FRAME_HEADER_LEN + 5;
        frame[mutate_at] ^= 0xFF;
        let err = decode_frame(&frame).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn truncated_frame_is_reported_as_truncated() {
        let event = sample_event();
        let frame = encode_frame(&event);
        let truncated = &frame[..frame.len() - 3];
        let err = decode_frame(truncated).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn bad_magic_is_reported_as_corrupt() {
        let event = sample_event();
        let mut frame = encode_frame(&event).to_vec();
        frame[0] ^= 0xFF;
        let err = decode_frame(&frame).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn involved_object_uid_round_trips_when_present() {
        let mut event = sample_event();
        event.resource.involved_object_uid = Some("u9".to_string());
        let frame = encode_frame(&event);
        let (decoded, _) = decode_frame(&frame).unwrap();
        assert_eq!(decoded.resource.involved_object_uid.as_deref(), Some("u9"));
    }
}
