//! Hex/ASCII rendering of leaked memory.

use std::fmt::Write;

#[inline]
pub fn human_readable(byte: u8) -> char {
    match byte {
        0x20..=0x7E => byte as char,
        _ => '.',
    }
}

/// True when the line holds nothing but unknown (zero) bytes.
pub fn is_blank(s: &[u8]) -> bool {
    s.iter().all(|&b| b == 0)
}

/// One dump line: `   address: | 41 42 .. | AB.. |`.
pub fn format_line(addr: usize, s: &[u8]) -> String {
    let mut line = format!("{addr:10x}: | ");
    for byte in s {
        let _ = write!(line, "{byte:02x} ");
    }
    line.push_str("| ");
    line.extend(s.iter().map(|&b| human_readable(b)));
    line.push_str(" |");
    line
}
