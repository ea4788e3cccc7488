//! One pass of URL and HTML-entity decoding before pattern matching.

use std::borrow::Cow;

/// Percent-decode then entity-decode `raw` exactly once.
pub fn normalize(raw: &str) -> String {
    decode_entities(&percent_decode(raw))
}

pub fn percent_decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(_) => {
            let bytes = urlencoding::decode_binary(raw.as_bytes());
            Cow::Owned(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Decode named, decimal and hex character references. Unknown or malformed
/// references are kept verbatim.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start + 1..];
        match candidate.find(';').filter(|end| *end <= 10) {
            Some(end) => match entity(&candidate[..end]) {
                Some(c) => {
                    out.push(c);
                    rest = &candidate[end + 1..];
                }
                None => {
                    out.push('&');
                    rest = candidate;
                }
            },
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }

    let c = match name.to_ascii_lowercase().as_str() {
        "lt" => '<',
        "gt" => '>',
        "amp" => '&',
        "quot" => '"',
        "apos" => '\'',
        "sol" => '/',
        "bsol" => '\\',
        "colon" => ':',
        "semi" => ';',
        "lpar" => '(',
        "rpar" => ')',
        "equals" => '=',
        "period" => '.',
        "tab" => '\t',
        "newline" => '\n',
        "nbsp" => ' ',
        _ => return None,
    };
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_then_entities() {
        assert_eq!(normalize("%3Cscript%3E"), "<script>");
        assert_eq!(normalize("&lt;script&gt;"), "<script>");
        assert_eq!(normalize("&#60;svg&#x3E;"), "<svg>");
        assert_eq!(normalize("%2e%2e%2fetc%2fpasswd"), "../etc/passwd");
    }

    #[test]
    fn test_decodes_only_once() {
        // %253C -> %3C, not <
        assert_eq!(normalize("%253Cscript"), "%3Cscript");
    }

    #[test]
    fn test_leaves_plain_ampersands() {
        assert_eq!(decode_entities("fish & chips"), "fish & chips");
        assert_eq!(decode_entities("a=1&b=2"), "a=1&b=2");
        assert_eq!(decode_entities("&unknown;"), "&unknown;");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        assert_eq!(normalize("%FF../"), "\u{FFFD}../");
    }
}
