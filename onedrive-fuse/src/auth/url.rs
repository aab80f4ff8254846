//! Percent-encoding for URIs embedded as query-string values.

/// Characters that must be escaped when the redirect URI travels inside
/// another URL's query string.
const RESERVED: &[u8] = b"!#$&'()*+,/:;=?@[]";

fn is_reserved(byte: u8) -> bool {
    RESERVED.contains(&byte)
}

/// Escape every reserved character as `%xx`; everything else is passed
/// through untouched.
pub fn percent_encode(input: &str) -> String {
    let mut encoded = Vec::with_capacity(input.len());

    for byte in input.bytes() {
        if is_reserved(byte) {
            encoded.extend_from_slice(format!("%{byte:02x}").as_bytes());
        } else {
            encoded.push(byte);
        }
    }

    // the reserved set is ASCII, so multi-byte UTF-8 sequences pass through
    // intact
    String::from_utf8_lossy(&encoded).into_owned()
}

/// Reverse of [`percent_encode`]. Malformed escapes are passed through
/// verbatim rather than rejected; the identity provider controls the inputs
/// this sees, and dropping bytes would corrupt the captured code.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(value) = hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied()) {
                decoded.push(value);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_pair(high: Option<u8>, low: Option<u8>) -> Option<u8> {
    let high = (high? as char).to_digit(16)?;
    let low = (low? as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reserved_characters_are_escaped_as_hex() {
        for &byte in RESERVED {
            let input = (byte as char).to_string();
            let encoded = percent_encode(&input);
            assert_eq!(encoded, format!("%{byte:02x}"));
        }
    }

    #[test]
    fn unreserved_ascii_passes_through() {
        for byte in 0x20u8..0x7f {
            if is_reserved(byte) {
                continue;
            }
            let input = (byte as char).to_string();
            assert_eq!(percent_encode(&input), input);
        }
    }

    #[test]
    fn redirect_uri_encoding() {
        assert_eq!(
            percent_encode("http://localhost:2300/authorization-code"),
            "http%3a%2f%2flocalhost%3a2300%2fauthorization-code"
        );
    }

    #[test]
    fn encoding_round_trips() {
        let original = "http://localhost:2300/authorization-code?x=[1;2]&y='z'";
        assert_eq!(percent_decode(&percent_encode(original)), original);
    }

    #[test]
    fn non_ascii_input_passes_through_byte_for_byte() {
        assert_eq!(percent_encode("häuser/straße"), "häuser%2fstraße");
        assert_eq!(percent_decode(&percent_encode("häuser/straße")), "häuser/straße");
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode("abc%2"), "abc%2");
        assert_eq!(percent_decode("abc%zz"), "abc%zz");
        assert_eq!(percent_decode("%"), "%");
    }
}
