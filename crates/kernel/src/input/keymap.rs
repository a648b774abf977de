//! Scancode set 1 translation tables (US layout)
//!
//! 128 entries, indexed by make-code. Zero means "no printable
//! character": modifiers, latch keys, function keys, and the specials
//! (Enter, Backspace, Tab, Esc) that the translator maps before it
//! consults these tables.

/// Unshifted characters
pub const NORMAL: [u8; 128] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', // 0x00-0x07
    b'7', b'8', b'9', b'0', b'-', b'=', 0, 0, // 0x08-0x0F
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', // 0x10-0x17
    b'o', b'p', b'[', b']', 0, 0, b'a', b's', // 0x18-0x1F
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', // 0x20-0x27
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', // 0x28-0x2F
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', // 0x30-0x37
    0, b' ', 0, 0, 0, 0, 0, 0, // 0x38-0x3F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x40-0x47
    0, 0, b'-', 0, 0, 0, b'+', 0, // 0x48-0x4F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x50-0x57
    0, 0, 0, 0, 0, 0, 0, 0, // 0x58-0x5F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x60-0x67
    0, 0, 0, 0, 0, 0, 0, 0, // 0x68-0x6F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x70-0x77
    0, 0, 0, 0, 0, 0, 0, 0, // 0x78-0x7F
];

/// Characters with shift held
pub const SHIFTED: [u8; 128] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^', // 0x00-0x07
    b'&', b'*', b'(', b')', b'_', b'+', 0, 0, // 0x08-0x0F
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', // 0x10-0x17
    b'O', b'P', b'{', b'}', 0, 0, b'A', b'S', // 0x18-0x1F
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', // 0x20-0x27
    b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V', // 0x28-0x2F
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', // 0x30-0x37
    0, b' ', 0, 0, 0, 0, 0, 0, // 0x38-0x3F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x40-0x47
    0, 0, b'-', 0, 0, 0, b'+', 0, // 0x48-0x4F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x50-0x57
    0, 0, 0, 0, 0, 0, 0, 0, // 0x58-0x5F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x60-0x67
    0, 0, 0, 0, 0, 0, 0, 0, // 0x68-0x6F
    0, 0, 0, 0, 0, 0, 0, 0, // 0x70-0x77
    0, 0, 0, 0, 0, 0, 0, 0, // 0x78-0x7F
];
