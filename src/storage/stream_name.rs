//! Compression of stream names into the private-use range.
//!
//! Characters from `0-9A-Za-z._` map to 6-bit codes; two codes pack into
//! one `0x3800..0x4800` char, a lone code becomes `0x4800 + code`. Table
//! streams carry a leading `U+4840`. Other characters pass through.

const TABLE_PREFIX: char = '\u{4840}';

fn utf2mime(c: char) -> Option<u32> {
    match c {
        '0'..='9' => Some(c as u32 - '0' as u32),
        'A'..='Z' => Some(c as u32 - 'A' as u32 + 10),
        'a'..='z' => Some(c as u32 - 'a' as u32 + 36),
        '.' => Some(62),
        '_' => Some(63),
        _ => None,
    }
}

fn mime2utf(x: u32) -> char {
    let c = match x {
        0..=9 => '0' as u32 + x,
        10..=35 => 'A' as u32 + x - 10,
        36..=61 => 'a' as u32 + x - 36,
        62 => '.' as u32,
        _ => '_' as u32,
    };
    char::from_u32(c).unwrap_or('_')
}

#[must_use]
pub fn encode_stream_name(name: &str, is_table: bool) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    if is_table {
        out.push(TABLE_PREFIX);
    }
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        let Some(code) = utf2mime(c) else {
            out.push(c);
            continue;
        };
        let packed = match chars.peek().copied().and_then(utf2mime) {
            Some(next) => {
                chars.next();
                code + (next << 6) + 0x3800
            }
            None => code + 0x4800,
        };
        out.push(char::from_u32(packed).unwrap_or(c));
    }
    out
}

/// Decodes a stored stream name; the flag reports a table stream.
#[must_use]
pub fn decode_stream_name(encoded: &str) -> (String, bool) {
    let (body, is_table) = match encoded.strip_prefix(TABLE_PREFIX) {
        Some(rest) => (rest, true),
        None => (encoded, false),
    };
    let mut out = String::with_capacity(body.len() * 2);
    for c in body.chars() {
        let v = c as u32;
        if (0x3800..0x4800).contains(&v) {
            let v = v - 0x3800;
            out.push(mime2utf(v & 0x3F));
            out.push(mime2utf((v >> 6) & 0x3F));
        } else if (0x4800..0x4840).contains(&v) {
            out.push(mime2utf(v - 0x4800));
        } else {
            out.push(c);
        }
    }
    (out, is_table)
}
