//! Wire framing: the 8-byte header and the VALUE/TEXT batch payloads.

use thiserror::Error;

/// Size in bytes of a Loxone binary message header.
pub const HEADER_SIZE: usize = 8;
/// Size in bytes of a single VALUE_STATES record (16B id + 8B f64).
const VALUE_ENTRY_SIZE: usize = 24;
/// Fixed first byte of every header frame.
const HEADER_START_BYTE: u8 = 0x03;

/// Errors produced while decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Header frame was shorter than [`HEADER_SIZE`].
    #[error("header requires {HEADER_SIZE} bytes, got {0}")]
    HeaderTooShort(usize),
    /// Header frame's first byte was not [`HEADER_START_BYTE`].
    #[error("invalid header start byte {0:#04x}")]
    BadStartByte(u8),
}

/// The message type carried in a decoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Plain UTF-8 text, usually a JSON command response.
    Text,
    /// Binary file payload (unused by the exporter).
    Binary,
    /// A batch of numeric value updates.
    ValueStates,
    /// A batch of text value updates.
    TextStates,
    /// Day-timer control updates (ignored by the exporter).
    DaytimerStates,
    /// The Miniserver has declared itself out of service.
    OutOfService,
    /// Keepalive reply.
    Keepalive,
    /// Weather station updates (ignored by the exporter).
    WeatherStates,
    /// A value outside the known 0-7 range; preserved for forward
    /// compatibility rather than treated as an error.
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageType::Text,
            1 => MessageType::Binary,
            2 => MessageType::ValueStates,
            3 => MessageType::TextStates,
            4 => MessageType::DaytimerStates,
            5 => MessageType::OutOfService,
            6 => MessageType::Keepalive,
            7 => MessageType::WeatherStates,
            other => MessageType::Unknown(other),
        }
    }
}

/// A decoded 8-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Which kind of payload follows.
    pub msg_type: MessageType,
    /// Declared payload length in bytes.
    pub payload_length: u32,
    /// True when `payload_length` is an estimate and a corrected header
    /// frame will follow before the payload.
    pub estimated: bool,
}

/// Decode an 8-byte header frame.
///
/// Layout (little-endian): `start:u8, msg_type:u8, info_flags:u8,
/// reserved:u8, payload_length:u32`.
pub fn decode_header(data: &[u8]) -> Result<MessageHeader, FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::HeaderTooShort(data.len()));
    }
    if data[0] != HEADER_START_BYTE {
        return Err(FrameError::BadStartByte(data[0]));
    }
    let msg_type = MessageType::from(data[1]);
    let estimated = data[2] & 0x01 != 0;
    let payload_length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok(MessageHeader {
        msg_type,
        payload_length,
        estimated,
    })
}

/// Encode a header frame, used when building an outgoing keepalive or
/// command frame for tests and for the mock Miniserver.
#[must_use]
pub fn encode_header(msg_type: u8, payload_length: u32, estimated: bool) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = HEADER_START_BYTE;
    buf[1] = msg_type;
    buf[2] = u8::from(estimated);
    buf[3] = 0;
    buf[4..8].copy_from_slice(&payload_length.to_le_bytes());
    buf
}

/// Convert 16 little-endian GUID-layout bytes into the canonical lowercase
/// `8-4-4-4-12` hex string used as every identifier in the data model.
#[must_use]
pub fn guid_bytes_to_string(bytes: &[u8; 16]) -> String {
    // The wire format stores the GUID in little-endian layout: the first
    // three groups are byte-swapped relative to the canonical big-endian
    // string form; the final two groups are stored as-is.
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[3], bytes[2], bytes[1], bytes[0],
        bytes[5], bytes[4],
        bytes[7], bytes[6],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

/// Parse a VALUE_STATES payload into `(state_id, value)` pairs.
///
/// Each record is 24 bytes: a 16-byte wire-format id followed by an 8-byte
/// little-endian `f64`. A trailing partial record is silently discarded.
#[must_use]
pub fn parse_value_states(payload: &[u8]) -> Vec<(String, f64)> {
    let mut results = Vec::with_capacity(payload.len() / VALUE_ENTRY_SIZE);
    let mut offset = 0;
    while offset + VALUE_ENTRY_SIZE <= payload.len() {
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&payload[offset..offset + 16]);
        let mut value_bytes = [0u8; 8];
        value_bytes.copy_from_slice(&payload[offset + 16..offset + 24]);
        let value = f64::from_le_bytes(value_bytes);
        results.push((guid_bytes_to_string(&id_bytes), value));
        offset += VALUE_ENTRY_SIZE;
    }
    results
}

/// Parse a TEXT_STATES payload into `(state_id, text)` pairs.
///
/// Each record: 16B state id + 16B icon id (ignored) + 4B little-endian
/// text length (including a null terminator) + the text itself, zero-padded
/// to a 4-byte boundary. Parsing stops, without error, the moment a
/// declared length would run past the end of the payload.
#[must_use]
pub fn parse_text_states(payload: &[u8]) -> Vec<(String, String)> {
    let mut results = Vec::new();
    let mut offset = 0;

    while offset + 36 <= payload.len() {
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&payload[offset..offset + 16]);
        offset += 16;
        // icon id, ignored
        offset += 16;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&payload[offset..offset + 4]);
        let text_len = u32::from_le_bytes(len_bytes) as usize;
        offset += 4;

        if offset + text_len > payload.len() {
            break;
        }

        let raw = &payload[offset..offset + text_len];
        let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        let text = String::from_utf8_lossy(trimmed).into_owned();
        results.push((guid_bytes_to_string(&id_bytes), text));

        let padded = text_len + (4 - text_len % 4) % 4;
        offset += padded;
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_value_states_header() {
        let header = encode_header(2, 48, false);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded.msg_type, MessageType::ValueStates);
        assert_eq!(decoded.payload_length, 48);
        assert!(!decoded.estimated);
    }

    #[test]
    fn rejects_short_header() {
        let err = decode_header(&[3, 2, 0]).unwrap_err();
        assert_eq!(err, FrameError::HeaderTooShort(3));
    }

    #[test]
    fn rejects_bad_start_byte() {
        let mut header = encode_header(2, 0, false);
        header[0] = 0xFF;
        let err = decode_header(&header).unwrap_err();
        assert_eq!(err, FrameError::BadStartByte(0xFF));
    }

    #[test]
    fn unknown_message_type_round_trips_without_error() {
        let header = encode_header(42, 0, false);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Unknown(42));
    }

    #[test]
    fn parses_a_single_value_record() {
        let id = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        let mut payload = Vec::from(id);
        payload.extend_from_slice(&42.5f64.to_le_bytes());
        let parsed = parse_value_states(&payload);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, guid_bytes_to_string(&id));
        assert_eq!(parsed[0].1, 42.5);
    }

    #[test]
    fn drops_trailing_partial_value_record() {
        let mut payload = vec![0u8; VALUE_ENTRY_SIZE];
        payload.extend_from_slice(&[1, 2, 3]);
        let parsed = parse_value_states(&payload);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn parses_text_state_with_padding() {
        let mut payload = vec![0u8; 16]; // state id
        payload.extend_from_slice(&[0u8; 16]); // icon id
        let text = b"on\0"; // length 3, needs 1 pad byte
        payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
        payload.extend_from_slice(text);
        payload.push(0); // padding to 4-byte boundary
        let parsed = parse_text_states(&payload);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1, "on");
    }

    #[test]
    fn stops_without_error_on_overrunning_length() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(&1000u32.to_le_bytes());
        let parsed = parse_text_states(&payload);
        assert!(parsed.is_empty());
    }

    #[test]
    fn guid_round_trip_matches_known_vector() {
        // Little-endian wire layout for the canonical uuid
        // "04030201-0605-0807-0910-111213141516".
        let bytes = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12, 0x13, 0x14,
            0x15, 0x16,
        ];
        assert_eq!(
            guid_bytes_to_string(&bytes),
            "04030201-0605-0807-0910-111213141516"
        );
    }
}
