//! The few spinel header fields a transport needs to look at.
//!
//! Everything past the command byte is opaque here.

pub const HEADER_FLAG: u8 = 0x80;
pub const HEADER_TID_MASK: u8 = 0x0F;
pub const HEADER_IID_MASK: u8 = 0x30;
pub const HEADER_IID_SHIFT: u8 = 4;

pub const CMD_NOOP: u8 = 0;
pub const CMD_RESET: u8 = 1;
pub const CMD_PROP_VALUE_IS: u8 = 6;

pub const PROP_LAST_STATUS: u8 = 0;
pub const STATUS_RESET_SOFTWARE: u8 = 0x72;

/// `PROP_VALUE_IS(LAST_STATUS) = RESET_SOFTWARE` with TID 0, as the RCP sends after
/// a software reset.
pub const RESET_RESPONSE: [u8; 4] = [
    HEADER_FLAG,
    CMD_PROP_VALUE_IS,
    PROP_LAST_STATUS,
    STATUS_RESET_SOFTWARE,
];

pub fn header_tid(header: u8) -> u8 {
    header & HEADER_TID_MASK
}

pub fn header_iid(header: u8) -> u8 {
    (header & HEADER_IID_MASK) >> HEADER_IID_SHIFT
}

/// Whether `frame` is a spinel RESET command sent without a transaction id.
///
/// Frames shorter than header plus command are never a reset.
pub fn is_reset_command(frame: &[u8]) -> bool {
    matches!(frame, [header, command, ..] if header_tid(*header) == 0 && *command == CMD_RESET)
}
