//! MC 3E ASCII frame encoding and decoding
//!
//! ASCII framing: subheader, network/station/module/request destination,
//! request data length, CPU monitoring timer, command, subcommand, device
//! code, head address, and read count — all hex-encoded ASCII. The decoder
//! verifies the response return code (`0000` = success) and extracts the
//! payload as hex words (4 chars each) or bits (1 char each).

use super::address::DeviceCode;
use thiserror::Error;

const REQUEST_SUBHEADER: &str = "5000";
const RESPONSE_SUBHEADER: &str = "D000";
const CMD_BATCH_READ: u16 = 0x0401;
const CMD_BATCH_WRITE: u16 = 0x1401;
const SUBCMD_WORD_UNITS: u16 = 0x0000;
const SUBCMD_BIT_UNITS: u16 = 0x0001;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McError {
    #[error("PLC returned non-zero end code {code:04X}: {message}")]
    ProtocolError { code: u16, message: String },
    #[error("malformed MC3E frame: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation timed out")]
    Timeout,
}

impl McError {
    /// Map a known MC3E end code to a human-readable message. Unknown
    /// non-zero codes still surface as `ProtocolError` with a generic text.
    pub fn from_end_code(code: u16) -> Option<Self> {
        if code == 0 {
            return None;
        }
        let message = match code {
            0x4001 => "read error".to_string(),
            0xC050 => "ascii conversion error".to_string(),
            0xC051 => "command error".to_string(),
            _ => format!("unmapped PLC error code {code:04X}"),
        };
        Some(McError::ProtocolError { code, message })
    }
}

/// Whether a read addresses bit devices or word devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Word,
    Bit,
}

impl ReadKind {
    fn subcommand(self) -> u16 {
        match self {
            ReadKind::Word => SUBCMD_WORD_UNITS,
            ReadKind::Bit => SUBCMD_BIT_UNITS,
        }
    }

    fn from_subcommand(sub: u16) -> Result<Self, McError> {
        match sub {
            SUBCMD_WORD_UNITS => Ok(ReadKind::Word),
            SUBCMD_BIT_UNITS => Ok(ReadKind::Bit),
            other => Err(McError::Malformed(format!("unknown subcommand {other:04X}"))),
        }
    }
}

/// A batch read request for one contiguous run of a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub network: u8,
    pub station: u8,
    pub module_io: u16,
    pub module_station: u8,
    pub monitoring_timer: u16,
    pub device: DeviceCode,
    pub head_address: u32,
    pub count: u16,
    pub kind: ReadKind,
}

impl ReadRequest {
    /// Defaults matching a typical single-CPU Q-series station addressed
    /// directly over Ethernet: network 0, station 0xFF (host station),
    /// module I/O 0x03FF (own station), module station 0.
    pub fn new(device: DeviceCode, head_address: u32, count: u16) -> Self {
        let kind = if device.is_bit_device() {
            ReadKind::Bit
        } else {
            ReadKind::Word
        };
        Self {
            network: 0,
            station: 0xFF,
            module_io: 0x03FF,
            module_station: 0,
            monitoring_timer: 0x0010,
            device,
            head_address,
            count,
            kind,
        }
    }
}

/// Encode a batch read request into its MC3E ASCII wire form.
pub fn encode_read_request(req: &ReadRequest) -> String {
    let body = format!(
        "{:04X}{:04X}{:04X}{:06X}{}{:04X}",
        req.monitoring_timer,
        CMD_BATCH_READ,
        req.kind.subcommand(),
        req.head_address,
        req.device.wire_code(),
        req.count,
    );
    let request_data_length = body.len() as u16;

    format!(
        "{}{:02X}{:02X}{:04X}{:02X}{:04X}{}",
        REQUEST_SUBHEADER,
        req.network,
        req.station,
        req.module_io,
        req.module_station,
        request_data_length,
        body,
    )
}

/// Parse a request frame previously produced by [`encode_read_request`].
/// `decode(encode(req)) == req` for every supported read request.
pub fn parse_request(frame: &str) -> Result<ReadRequest, McError> {
    let bytes = frame.as_bytes();
    let take = |from: usize, len: usize| -> Result<&str, McError> {
        frame
            .get(from..from + len)
            .ok_or_else(|| McError::Malformed(format!("frame too short at offset {from}")))
    };
    let hex_u8 = |s: &str| u8::from_str_radix(s, 16).map_err(|_| McError::Malformed(s.to_string()));
    let hex_u16 =
        |s: &str| u16::from_str_radix(s, 16).map_err(|_| McError::Malformed(s.to_string()));
    let hex_u32 =
        |s: &str| u32::from_str_radix(s, 16).map_err(|_| McError::Malformed(s.to_string()));

    if bytes.len() < 16 || &frame[0..4] != REQUEST_SUBHEADER {
        return Err(McError::Malformed("missing or wrong request subheader".into()));
    }

    let network = hex_u8(take(4, 2)?)?;
    let station = hex_u8(take(6, 2)?)?;
    let module_io = hex_u16(take(8, 4)?)?;
    let module_station = hex_u8(take(12, 2)?)?;
    let request_data_length = hex_u16(take(14, 4)?)? as usize;

    let body_start = 18;
    let body = take(body_start, request_data_length)?;
    if body.len() < 18 {
        return Err(McError::Malformed("body too short".into()));
    }

    let monitoring_timer = hex_u16(&body[0..4])?;
    let command = hex_u16(&body[4..8])?;
    if command != CMD_BATCH_READ {
        return Err(McError::Malformed(format!("unsupported command {command:04X}")));
    }
    let subcommand = hex_u16(&body[8..12])?;
    let kind = ReadKind::from_subcommand(subcommand)?;
    let head_address = hex_u32(&body[12..18])?;
    let device_code = &body[18..20];
    let device = device_from_wire_code(device_code)?;
    let count = hex_u16(&body[20..24])?;

    Ok(ReadRequest {
        network,
        station,
        module_io,
        module_station,
        monitoring_timer,
        device,
        head_address,
        count,
        kind,
    })
}

fn device_from_wire_code(code: &str) -> Result<DeviceCode, McError> {
    use DeviceCode::*;
    for device in [D, W, M, B, X, Y, Sm, Sd, R, Zr] {
        if device.wire_code() == code {
            return Ok(device);
        }
    }
    Err(McError::Malformed(format!("unknown device wire code {code:?}")))
}

/// Decoded payload of a successful batch read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadValues {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

/// Decode a batch read response frame. `kind` and `expected_count` must
/// match the request that produced this response — the codec does not
/// re-derive them from the frame.
pub fn decode_response(
    frame: &str,
    kind: ReadKind,
    expected_count: u16,
) -> Result<ReadValues, McError> {
    if frame.len() < 18 || &frame[0..4] != RESPONSE_SUBHEADER {
        return Err(McError::Malformed("missing or wrong response subheader".into()));
    }
    let hex_u16 =
        |s: &str| u16::from_str_radix(s, 16).map_err(|_| McError::Malformed(s.to_string()));

    let response_data_length = hex_u16(&frame[14..18])? as usize;
    let rest = frame
        .get(18..18 + response_data_length)
        .ok_or_else(|| McError::Malformed("response shorter than declared length".into()))?;

    if rest.len() < 4 {
        return Err(McError::Malformed("response missing end code".into()));
    }
    let end_code = hex_u16(&rest[0..4])?;
    if let Some(err) = McError::from_end_code(end_code) {
        return Err(err);
    }

    let payload = &rest[4..];
    match kind {
        ReadKind::Word => {
            let expected_len = expected_count as usize * 4;
            if payload.len() != expected_len {
                return Err(McError::Malformed(format!(
                    "expected {expected_len} hex chars of word payload, got {}",
                    payload.len()
                )));
            }
            let mut values = Vec::with_capacity(expected_count as usize);
            for chunk in payload.as_bytes().chunks(4) {
                let s = std::str::from_utf8(chunk).unwrap();
                values.push(hex_u16(s)?);
            }
            Ok(ReadValues::Words(values))
        }
        ReadKind::Bit => {
            if payload.len() != expected_count as usize {
                return Err(McError::Malformed(format!(
                    "expected {expected_count} bit chars of payload, got {}",
                    payload.len()
                )));
            }
            let mut values = Vec::with_capacity(expected_count as usize);
            for c in payload.chars() {
                match c {
                    '1' => values.push(true),
                    '0' => values.push(false),
                    other => {
                        return Err(McError::Malformed(format!("invalid bit character {other:?}")))
                    }
                }
            }
            Ok(ReadValues::Bits(values))
        }
    }
}

/// Encode a successful response frame. Used by the in-process PLC simulator
/// in tests, and exercises the exact inverse of [`decode_response`].
pub fn encode_response_success(values: &ReadValues) -> String {
    let payload = match values {
        ReadValues::Words(words) => words.iter().map(|w| format!("{w:04X}")).collect::<String>(),
        ReadValues::Bits(bits) => bits
            .iter()
            .map(|b| if *b { '1' } else { '0' })
            .collect::<String>(),
    };
    let rest = format!("0000{payload}");
    let response_data_length = rest.len() as u16;
    format!("{RESPONSE_SUBHEADER}00FF03FF00{response_data_length:04X}{rest}")
}

/// Encode an error response frame carrying the given non-zero end code.
pub fn encode_response_error(code: u16) -> String {
    let rest = format!("{code:04X}");
    let response_data_length = rest.len() as u16;
    format!("{RESPONSE_SUBHEADER}00FF03FF00{response_data_length:04X}{rest}")
}

/// A single-word write request, used only for the handshake-mode trigger
/// reset write-back (spec: always a separate round trip from the read that
/// precedes it, never folded into one frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub network: u8,
    pub station: u8,
    pub module_io: u16,
    pub module_station: u8,
    pub monitoring_timer: u16,
    pub device: DeviceCode,
    pub head_address: u32,
    pub value: u16,
}

impl WriteRequest {
    pub fn new(device: DeviceCode, head_address: u32, value: u16) -> Self {
        Self {
            network: 0,
            station: 0xFF,
            module_io: 0x03FF,
            module_station: 0,
            monitoring_timer: 0x0010,
            device,
            head_address,
            value,
        }
    }
}

/// Encode a single-word write request into its MC3E ASCII wire form.
pub fn encode_write_request(req: &WriteRequest) -> String {
    let body = format!(
        "{:04X}{:04X}{:04X}{:06X}{}{:04X}{:04X}",
        req.monitoring_timer,
        CMD_BATCH_WRITE,
        SUBCMD_WORD_UNITS,
        req.head_address,
        req.device.wire_code(),
        1u16, // point count: always one word for a trigger reset
        req.value,
    );
    let request_data_length = body.len() as u16;

    format!(
        "{}{:02X}{:02X}{:04X}{:02X}{:04X}{}",
        REQUEST_SUBHEADER,
        req.network,
        req.station,
        req.module_io,
        req.module_station,
        request_data_length,
        body,
    )
}

/// Decode a write-acknowledgement response: success iff the end code is zero.
pub fn decode_write_response(frame: &str) -> Result<(), McError> {
    if frame.len() < 18 || &frame[0..4] != RESPONSE_SUBHEADER {
        return Err(McError::Malformed("missing or wrong response subheader".into()));
    }
    let hex_u16 =
        |s: &str| u16::from_str_radix(s, 16).map_err(|_| McError::Malformed(s.to_string()));
    let response_data_length = hex_u16(&frame[14..18])? as usize;
    let rest = frame
        .get(18..18 + response_data_length)
        .ok_or_else(|| McError::Malformed("response shorter than declared length".into()))?;
    if rest.len() < 4 {
        return Err(McError::Malformed("response missing end code".into()));
    }
    let end_code = hex_u16(&rest[0..4])?;
    match McError::from_end_code(end_code) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_word_read_request() {
        let req = ReadRequest::new(DeviceCode::D, 100, 3);
        let encoded = encode_read_request(&req);
        let decoded = parse_request(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn round_trip_bit_read_request() {
        let req = ReadRequest::new(DeviceCode::M, 50, 16);
        let encoded = encode_read_request(&req);
        let decoded = parse_request(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn round_trip_every_device() {
        for device in [
            DeviceCode::D,
            DeviceCode::W,
            DeviceCode::M,
            DeviceCode::B,
            DeviceCode::X,
            DeviceCode::Y,
            DeviceCode::Sm,
            DeviceCode::Sd,
            DeviceCode::R,
            DeviceCode::Zr,
        ] {
            let req = ReadRequest::new(device, 7, 5);
            let encoded = encode_read_request(&req);
            let decoded = parse_request(&encoded).unwrap();
            assert_eq!(req, decoded);
        }
    }

    #[test]
    fn decode_successful_word_response() {
        let values = ReadValues::Words(vec![42, 43, 44]);
        let frame = encode_response_success(&values);
        let decoded = decode_response(&frame, ReadKind::Word, 3).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_successful_bit_response() {
        let values = ReadValues::Bits(vec![true, false, true, true]);
        let frame = encode_response_success(&values);
        let decoded = decode_response(&frame, ReadKind::Bit, 4).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_protocol_error_read_error() {
        let frame = encode_response_error(0x4001);
        let err = decode_response(&frame, ReadKind::Word, 1).unwrap_err();
        assert!(matches!(err, McError::ProtocolError { code: 0x4001, .. }));
    }

    #[test]
    fn decode_protocol_error_ascii_conversion() {
        let frame = encode_response_error(0xC050);
        let err = decode_response(&frame, ReadKind::Word, 1).unwrap_err();
        assert!(matches!(err, McError::ProtocolError { code: 0xC050, .. }));
    }

    #[test]
    fn decode_rejects_wrong_subheader() {
        let err = decode_response("XXXX00FF03FF0000080000002A", ReadKind::Word, 1).unwrap_err();
        assert!(matches!(err, McError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_payload_length_mismatch() {
        let frame = encode_response_success(&ReadValues::Words(vec![1, 2]));
        let err = decode_response(&frame, ReadKind::Word, 3).unwrap_err();
        assert!(matches!(err, McError::Malformed(_)));
    }

    #[test]
    fn write_request_round_trips_through_success_ack() {
        let req = WriteRequest::new(DeviceCode::M, 100, 0);
        let encoded = encode_write_request(&req);
        assert!(encoded.starts_with(REQUEST_SUBHEADER));
        let ack = encode_response_success(&ReadValues::Words(vec![]));
        decode_write_response(&ack).unwrap();
    }

    #[test]
    fn write_ack_surfaces_protocol_error() {
        let ack = encode_response_error(0xC051);
        let err = decode_write_response(&ack).unwrap_err();
        assert!(matches!(err, McError::ProtocolError { code: 0xC051, .. }));
    }
}
