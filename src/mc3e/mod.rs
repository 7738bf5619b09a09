//! MC 3E ASCII protocol codec
//!
//! Encodes batch read requests and decodes responses for the Mitsubishi
//! MC protocol, format 3E, ASCII framing, over TCP. The codec never
//! silently splits or merges a contiguous run: one run in, one frame out.

pub mod address;
pub mod frame;
pub mod grouper;

pub use address::{AddressError, DeviceAddress, DeviceCode};
pub use frame::{
    decode_response, decode_write_response, encode_read_request, encode_response_error,
    encode_response_success, encode_write_request, parse_request, McError, ReadKind, ReadRequest,
    ReadValues, WriteRequest,
};
pub use grouper::{group_addresses, AddressRun};
