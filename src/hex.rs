//! Hex rendering of MIDI payloads for debug logging

use std::fmt::Write;

/// Format MIDI bytes as a space separated hex string, e.g. `90 3C 7F`
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as one continuous hex string, e.g. `903C7F`
pub fn hex_string(data: &[u8], uppercase: bool) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        if uppercase {
            let _ = write!(out, "{:02X}", b);
        } else {
            let _ = write!(out, "{:02x}", b);
        }
    }
    out
}

/// Multi-line hex dump with offsets, 4-byte groups and an ASCII gutter.
///
/// ```text
/// 00000000  48 65 6C 6C  6F 2C 20 57  6F 72 6C 64  21 00 01 02  |Hello, World!...|
/// ```
pub fn hex_dump(data: &[u8], bytes_per_line: usize) -> String {
    let bpl = bytes_per_line.max(1);
    let full_width = bpl * 3 + (bpl - 1) / 4;
    let mut out = String::new();

    for (line_idx, chunk) in data.chunks(bpl).enumerate() {
        let _ = write!(out, "{:08X}  ", line_idx * bpl);

        for (i, byte) in chunk.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                out.push(' ');
            }
            let _ = write!(out, "{:02X} ", byte);
        }

        let width = chunk.len() * 3 + (chunk.len() - 1) / 4;
        out.extend(std::iter::repeat(' ').take(full_width - width));

        out.push_str(" |");
        for &byte in chunk {
            if (0x20..=0x7E).contains(&byte) {
                out.push(byte as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }

    out
}

/// Parse hex tokens such as `["90", "3C", "7F"]` or `["903C7F"]` into bytes
pub fn parse_hex_tokens<S: AsRef<str>>(tokens: &[S]) -> Option<Vec<u8>> {
    let joined: String = tokens
        .iter()
        .flat_map(|t| {
            let t = t.as_ref().trim();
            t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t).chars()
        })
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();

    if joined.is_empty() || joined.len() % 2 != 0 {
        return None;
    }

    (0..joined.len())
        .step_by(2)
        .map(|i| joined.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
