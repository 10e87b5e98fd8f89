//! Byte-preserving text for the FTP control and data channels.
//!
//! Servers send names in whatever encoding their filesystem uses. Every
//! byte is mapped to the char with the same value (ISO-8859-1), so a name
//! read from a listing goes back out in `CWD` exactly as the server sent
//! it. Turning a path into readable text happens only when it is written
//! out, through [`to_display`].

use std::borrow::Cow;

pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`decode`]. Chars above U+00FF cannot come from the wire and
/// are sent as UTF-8.
pub fn encode(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match u8::try_from(c) {
            Ok(b) => out.push(b),
            Err(_) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

/// The UTF-8 reading of the original bytes when they are valid UTF-8,
/// otherwise their ISO-8859-1 reading.
pub fn to_display(text: &str) -> Cow<'_, str> {
    if text.is_ascii() {
        return Cow::Borrowed(text);
    }
    match String::from_utf8(encode(text)) {
        Ok(utf8) => Cow::Owned(utf8),
        Err(_) => Cow::Borrowed(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_utf8_bytes_survive_a_round_trip() {
        let raw = b"/caf\xe9/\xcf\xf0\xe8\xe2\xe5\xf2";
        let text = decode(raw);
        assert_eq!(encode(&text), raw.to_vec());
    }

    #[test]
    fn display_prefers_utf8() {
        assert_eq!(to_display(&decode("/café".as_bytes())), "/café");
        assert_eq!(to_display(&decode(b"/caf\xe9")), "/café");
        assert_eq!(to_display("/plain"), "/plain");
    }
}
