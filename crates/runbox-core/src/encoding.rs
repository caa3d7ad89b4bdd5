//! Text encodings accepted for inline input files and output files.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// One byte per char, as Node's `latin1`/`binary`.
    Latin1,
}

impl TextEncoding {
    /// Unknown names fall back to UTF-8.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("latin1") | Some("binary") | Some("iso-8859-1") => TextEncoding::Latin1,
            _ => TextEncoding::Utf8,
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_maps_bytes_to_chars() {
        let enc = TextEncoding::from_name(Some("binary"));
        assert_eq!(enc, TextEncoding::Latin1);
        assert_eq!(enc.decode(&[0x63, 0xe9]), "c\u{e9}");
        assert_eq!(enc.encode("c\u{e9}\u{2603}"), vec![0x63, 0xe9, b'?']);
    }

    #[test]
    fn test_unknown_encoding_is_utf8() {
        assert_eq!(TextEncoding::from_name(Some("utf-8")), TextEncoding::Utf8);
        assert_eq!(TextEncoding::from_name(None), TextEncoding::Utf8);
        assert_eq!(TextEncoding::Utf8.decode(b"ok"), "ok");
    }
}
