use core::ffi::{CStr, c_char};

/// Text encoding a caller picks for text crossing the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8 without byte-order mark.
    Utf8,
    /// UTF-16 in the platform's native byte order.
    Utf16,
}

impl Encoding {
    /// Width of the NUL terminator in this encoding.
    pub const fn terminator_len(self) -> usize {
        match self {
            Encoding::Utf8 => 1,
            Encoding::Utf16 => 2,
        }
    }

    /// `SQLITE_UTF8` / `SQLITE_UTF16LE` / `SQLITE_UTF16BE` code for this encoding.
    pub const fn engine_code(self) -> i32 {
        match self {
            Encoding::Utf8 => 1,
            Encoding::Utf16 if cfg!(target_endian = "little") => 2,
            Encoding::Utf16 => 3,
        }
    }
}

/// Text representation code reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextRep {
    /// `SQLITE_UTF8`.
    Utf8,
    /// `SQLITE_UTF16LE`.
    Utf16Le,
    /// `SQLITE_UTF16BE`.
    Utf16Be,
    /// `SQLITE_UTF16` (native order) or `SQLITE_UTF16_ALIGNED`.
    Utf16,
    /// Any code the layer does not know.
    Other(i32),
}

impl TextRep {
    /// Decode an `eTextRep` value.
    pub const fn from_code(code: i32) -> TextRep {
        match code {
            1 => TextRep::Utf8,
            2 => TextRep::Utf16Le,
            3 => TextRep::Utf16Be,
            4 | 8 => TextRep::Utf16,
            other => TextRep::Other(other),
        }
    }
}

/// Encode `text` without a terminator.
pub fn encode(text: &str, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Utf8 => text.as_bytes().to_vec(),
        Encoding::Utf16 => {
            let mut out = Vec::with_capacity(text.len() * 2);
            for unit in text.encode_utf16() {
                out.extend_from_slice(&unit.to_ne_bytes());
            }
            out
        }
    }
}

/// Encode `text` and append the encoding's NUL terminator.
pub fn encode_terminated(text: &str, encoding: Encoding) -> Vec<u8> {
    let mut out = encode(text, encoding);
    out.resize(out.len() + encoding.terminator_len(), 0);
    out
}

/// Decode `bytes` with lossy replacement of malformed input.
///
/// An odd trailing byte in UTF-16 input decodes as U+FFFD.
pub fn decode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Utf16 => {
            let chunks = bytes.chunks_exact(2);
            let odd = !chunks.remainder().is_empty();
            let units: Vec<u16> = chunks
                .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                .collect();
            let mut text = String::from_utf16_lossy(&units);
            if odd {
                text.push(char::REPLACEMENT_CHARACTER);
            }
            text
        }
    }
}

/// Encoded text together with its explicit byte length.
///
/// `byte_len` never counts the terminator, whether one is present or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedText {
    bytes: Vec<u8>,
    encoding: Encoding,
    terminated: bool,
}

impl EncodedText {
    /// Encode without terminator, for explicit-length APIs.
    pub fn new(text: &str, encoding: Encoding) -> Self {
        Self {
            bytes: encode(text, encoding),
            encoding,
            terminated: false,
        }
    }

    /// Encode with terminator, for length-less APIs.
    pub fn terminated(text: &str, encoding: Encoding) -> Self {
        Self {
            bytes: encode_terminated(text, encoding),
            encoding,
            terminated: true,
        }
    }

    /// Wrap already-encoded bytes; `bytes` must not include a terminator.
    pub fn from_encoded(bytes: Vec<u8>, encoding: Encoding) -> Self {
        Self {
            bytes,
            encoding,
            terminated: false,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Length in bytes of the encoded form, excluding any terminator.
    pub fn byte_len(&self) -> usize {
        if self.terminated {
            self.bytes.len() - self.encoding.terminator_len()
        } else {
            self.bytes.len()
        }
    }

    /// Encoded bytes without the terminator.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.byte_len()]
    }

    /// Every byte held, terminator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode back to host text.
    pub fn decode(&self) -> String {
        decode(self.payload(), self.encoding)
    }
}

/// Decode a NUL-terminated engine string with the same lossy rules as
/// [`decode`], so names and messages read exactly like column text.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated buffer valid for the call.
pub(crate) unsafe fn c_str_lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
    Some(decode(bytes, Encoding::Utf8))
}

#[cfg(test)]
mod tests {
    use super::{EncodedText, Encoding, TextRep, c_str_lossy, decode, encode, encode_terminated};

    #[test]
    fn utf16_round_trip_in_native_order() {
        let text = "héllo \u{1f600}";
        let bytes = encode(text, Encoding::Utf16);
        assert_eq!(bytes.len(), text.encode_utf16().count() * 2);
        assert_eq!(decode(&bytes, Encoding::Utf16), text);
    }

    #[test]
    fn terminators_match_encoding_width() {
        assert_eq!(encode_terminated("ab", Encoding::Utf8), b"ab\0".to_vec());
        let wide = encode_terminated("ab", Encoding::Utf16);
        assert_eq!(wide.len(), 6);
        assert_eq!(&wide[4..], &[0, 0]);
    }

    #[test]
    fn byte_len_excludes_terminator() {
        let plain = EncodedText::new("abc", Encoding::Utf16);
        let terminated = EncodedText::terminated("abc", Encoding::Utf16);
        assert_eq!(plain.byte_len(), 6);
        assert_eq!(terminated.byte_len(), 6);
        assert_eq!(terminated.as_bytes().len(), 8);
        assert_eq!(terminated.payload(), plain.payload());
        assert_eq!(terminated.decode(), "abc");
    }

    #[test]
    fn malformed_input_is_replaced() {
        assert_eq!(decode(&[0x61, 0xff], Encoding::Utf8), "a\u{fffd}");
        let lone_surrogate = 0xd800_u16.to_ne_bytes();
        assert_eq!(decode(&lone_surrogate, Encoding::Utf16), "\u{fffd}");
        assert_eq!(decode(&[0x61, 0x00, 0x62], Encoding::Utf16).chars().last(), Some('\u{fffd}'));
    }

    #[test]
    fn engine_c_strings_decode_like_column_text() {
        let raw = b"a\xc0\x80b\xff\0";
        let from_c = unsafe { c_str_lossy(raw.as_ptr().cast()) };
        assert_eq!(from_c.as_deref(), Some(decode(&raw[..5], Encoding::Utf8).as_str()));
        assert!(!from_c.unwrap_or_default().contains('\0'));
        assert_eq!(unsafe { c_str_lossy(core::ptr::null()) }, None);
    }

    #[test]
    fn text_rep_codes() {
        assert_eq!(TextRep::from_code(Encoding::Utf8.engine_code()), TextRep::Utf8);
        assert_eq!(TextRep::from_code(8), TextRep::Utf16);
        assert_eq!(TextRep::from_code(77), TextRep::Other(77));
    }
}
