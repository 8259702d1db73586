//! ASCII-safe compact JSON serialization.
//!
//! serde_json emits UTF-8 without escaping non-ASCII characters. The wire
//! contract requires ASCII-safe frames, so string fragments are re-escaped
//! as `\uXXXX` (surrogate pairs for astral code points). All other
//! formatting falls through to the default compact formatter behavior.

use std::io;

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};

#[derive(Default)]
pub struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (idx, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            if start < idx {
                writer.write_all(fragment[start..idx].as_bytes())?;
            }
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = idx + ch.len_utf8();
        }
        if start < fragment.len() {
            writer.write_all(fragment[start..].as_bytes())?;
        }
        Ok(())
    }
}

/// Serialize to a compact JSON string with all non-ASCII escaped.
pub fn to_ascii_json<T: Serialize>(value: &T) -> String {
    let mut out = Vec::with_capacity(128);
    let mut ser = Serializer::with_formatter(&mut out, AsciiFormatter);
    value
        .serialize(&mut ser)
        .expect("JSON serialization of wire types cannot fail");
    // The formatter only ever writes ASCII or valid UTF-8 slices
    String::from_utf8(out).expect("ASCII JSON output is valid UTF-8")
}
