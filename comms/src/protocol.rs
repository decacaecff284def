type HeaderType = u32;
pub const HEADER_SIZE: usize = size_of::<HeaderType>();
pub type Header = [u8; HEADER_SIZE];

const ERR_H: HeaderType = 0;
const CONTROL_H: HeaderType = 1;
const REQUEST_H: HeaderType = 2;
const RESPONSE_H: HeaderType = 3;

pub const ERR: Header = ERR_H.to_be_bytes();
pub const CONTROL: Header = CONTROL_H.to_be_bytes();
pub const REQUEST: Header = REQUEST_H.to_be_bytes();
pub const RESPONSE: Header = RESPONSE_H.to_be_bytes();

/// Size of the correlation id carried by request and response frames.
pub const CORRELATION_SIZE: usize = size_of::<u64>();

/// Frames above this size are rejected before allocating their buffer.
pub const MAX_FRAME_LEN: usize = 1 << 30;
