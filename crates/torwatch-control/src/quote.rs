//! Quoting and parsing primitives for torrc values and control-port replies.
//!
//! Three pure functions:
//!
//! - [`escape_value`] renders arbitrary bytes in torrc's quoted-or-bare
//!   syntax, producing US-ASCII output only.
//! - [`parse_quoted`] recognizes the control connection's C-style
//!   quoted-string notation, including octal escapes.
//! - [`parse_key_value`] recognizes a `keyword=value` pair whose value may
//!   be bare or quoted.
//!
//! None of these touch sockets or the filesystem; they operate on literal
//! slices and report failures by index.

/// Position of the first byte a parser could not make sense of.
///
/// `at` may equal the `end` bound when the input ran out before the grammar
/// was satisfied (for example a quoted string with no closing quote).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("syntax error at index {at}")]
pub struct QuoteError {
    pub at: usize,
}

/// A parsed `keyword=value` pair.
///
/// `next` is the index of the first byte not consumed: either the `end`
/// bound passed to [`parse_key_value`], or one past a trailing space that
/// terminated the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub keyword: String,
    pub value: Vec<u8>,
    pub next: usize,
}

// Tor treats leading SPC/TAB as the name/value separator and `\` LF as a
// continuation line, so the escape set covers all nonprintables plus SPC,
// `"`, `#`, and `\`.
fn must_escape(b: u8) -> bool {
    b <= 0x20 || b == b'"' || b == b'#' || b == b'\\' || b >= 0x7f
}

/// Escape arbitrary bytes in torrc's format, returning a US-ASCII-only
/// string.
///
/// Bytes outside the escape set pass through verbatim; if nothing needs
/// escaping the value is returned bare, otherwise it is wrapped in double
/// quotes. Inside quotes, space and `#` need no escape, `"` and `\` get
/// backslash escapes, and everything else in the escape set becomes a
/// lowercase `\xHH`. Empty input produces `""` so the value stays
/// unambiguous on its configuration line.
pub fn escape_value(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    if bytes.is_empty() {
        return "\"\"".to_string();
    }
    if !bytes.iter().copied().any(must_escape) {
        return bytes.iter().map(|&b| b as char).collect();
    }

    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b' ' => out.push(' '),
            b'#' => out.push('#'),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            _ if must_escape(b) => {
                out.push('\\');
                out.push('x');
                out.push(HEX[usize::from(b >> 4)] as char);
                out.push(HEX[usize::from(b & 0xf)] as char);
            }
            _ => out.push(b as char),
        }
    }
    out.push('"');
    out
}

#[derive(Clone, Copy)]
enum QuotedState {
    Start,
    Body,
    Backslash,
    Octal1,
    Octal2,
}

/// Parse a quoted string, in the control connection's C-style notation,
/// from `input[start..end]`.
///
/// On success returns the decoded body and the first index after the
/// closing quote. On failure the [`QuoteError`] carries the first index
/// where something went wrong, equal to `end` if the input ended before
/// the closing quote.
///
/// Escapes recognized in the body: `\n`, `\r`, `\t`, `\\`, `\"`, `\'`,
/// and exactly three octal digits composing one byte (values above 0o377
/// wrap, matching the C unsigned-char behavior the daemon exhibits).
pub fn parse_quoted(input: &str, start: usize, end: usize) -> Result<(Vec<u8>, usize), QuoteError> {
    let bytes = input.as_bytes();
    let mut body = Vec::with_capacity(end.saturating_sub(start));
    let mut octal: u32 = 0;
    let mut state = QuotedState::Start;

    for i in start..end {
        let Some(&ch) = bytes.get(i) else { break };
        state = match state {
            QuotedState::Start => {
                if ch != b'"' {
                    return Err(QuoteError { at: i });
                }
                QuotedState::Body
            }
            QuotedState::Body => match ch {
                b'\\' => QuotedState::Backslash,
                b'"' => return Ok((body, i + 1)),
                _ => {
                    body.push(ch);
                    QuotedState::Body
                }
            },
            QuotedState::Backslash => match ch {
                b'0'..=b'7' => {
                    octal = u32::from(ch - b'0') << 6;
                    QuotedState::Octal1
                }
                b'n' => {
                    body.push(b'\n');
                    QuotedState::Body
                }
                b'r' => {
                    body.push(b'\r');
                    QuotedState::Body
                }
                b't' => {
                    body.push(b'\t');
                    QuotedState::Body
                }
                b'\\' | b'"' | b'\'' => {
                    body.push(ch);
                    QuotedState::Body
                }
                _ => return Err(QuoteError { at: i }),
            },
            QuotedState::Octal1 => match ch {
                b'0'..=b'7' => {
                    octal |= u32::from(ch - b'0') << 3;
                    QuotedState::Octal2
                }
                _ => return Err(QuoteError { at: i }),
            },
            QuotedState::Octal2 => match ch {
                b'0'..=b'7' => {
                    octal |= u32::from(ch - b'0');
                    body.push((octal & 0xff) as u8);
                    octal = 0;
                    QuotedState::Body
                }
                _ => return Err(QuoteError { at: i }),
            },
        };
    }
    Err(QuoteError { at: end })
}

/// Parse a `keyword=value` pair from `input[start..end]`, where the value
/// is either quoted (per [`parse_quoted`]) or bare.
///
/// A bare value runs to the first space (which is consumed) or to `end`;
/// an embedded `"` in a bare value is a failure at the quote's index. The
/// slice must contain no CR or LF.
pub fn parse_key_value(input: &str, start: usize, end: usize) -> Result<KeyValue, QuoteError> {
    let bytes = input.as_bytes();

    let eq = match (start..end).find(|&i| bytes.get(i) == Some(&b'=')) {
        Some(i) => i,
        None => return Err(QuoteError { at: end }),
    };
    let keyword: String = bytes[start..eq].iter().map(|&b| b as char).collect();

    let vstart = eq + 1;
    if vstart == end {
        return Ok(KeyValue {
            keyword,
            value: Vec::new(),
            next: end,
        });
    }

    if bytes.get(vstart) != Some(&b'"') {
        let mut vend = end;
        let mut next = end;
        if let Some(i) = (vstart..end).find(|&i| bytes.get(i) == Some(&b' ')) {
            // Stop at the delimiter, and consume it.
            vend = i;
            next = i + 1;
        }
        if let Some(i) = (vstart..vend).find(|&i| bytes.get(i) == Some(&b'"')) {
            // Forbid internal quotes.
            return Err(QuoteError { at: i });
        }
        return Ok(KeyValue {
            keyword,
            value: bytes[vstart..vend].to_vec(),
            next,
        });
    }

    let (value, j) = parse_quoted(input, vstart, end)?;
    let mut next = end;
    if j < end {
        next = j;
        if bytes.get(j) == Some(&b' ') {
            next = j + 1;
        }
    }
    Ok(KeyValue {
        keyword,
        value,
        next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_bare_passthrough() {
        assert_eq!(escape_value(b"foobar"), "foobar");
    }

    #[test]
    fn test_escape_leading_space_quotes() {
        assert_eq!(escape_value(b" foobar"), "\" foobar\"");
    }

    #[test]
    fn test_escape_tab_hex() {
        assert_eq!(escape_value(b"\tfoobar"), "\"\\x09foobar\"");
    }

    #[test]
    fn test_escape_backslash_then_newline() {
        assert_eq!(escape_value(b"foo\\\nbar"), "\"foo\\\\\\x0abar\"");
    }

    #[test]
    fn test_escape_interior_space() {
        assert_eq!(escape_value(b"foo bar"), "\"foo bar\"");
    }

    #[test]
    fn test_escape_hash_literal_inside_quotes() {
        assert_eq!(escape_value(b"foo#bar"), "\"foo#bar\"");
    }

    #[test]
    fn test_escape_double_quote() {
        assert_eq!(escape_value(b"foo\"bar"), "\"foo\\\"bar\"");
    }

    #[test]
    fn test_escape_backslash() {
        assert_eq!(escape_value(b"foo\\bar"), "\"foo\\\\bar\"");
    }

    #[test]
    fn test_escape_utf8_bytes() {
        // "fnörd" with a combining diaeresis, UTF-8 encoded.
        assert_eq!(escape_value("fno\u{308}rd".as_bytes()), "\"fno\\xcc\\x88rd\"");
    }

    #[test]
    fn test_escape_windows_path() {
        assert_eq!(
            escape_value("C:\\Ronald\u{2019}s laptop's disk".as_bytes()),
            "\"C:\\\\Ronald\\xe2\\x80\\x99s laptop's disk\""
        );
    }

    #[test]
    fn test_escape_byte_extremes() {
        assert_eq!(
            escape_value(&[0, 1, 31, 32, 127, 128, 254, 255]),
            "\"\\x00\\x01\\x1f \\x7f\\x80\\xfe\\xff\""
        );
    }

    #[test]
    fn test_escape_empty_input_is_quoted() {
        assert_eq!(escape_value(b""), "\"\"");
    }

    #[test]
    fn test_parse_quoted_plain() {
        assert_eq!(
            parse_quoted("\"127.0.0.1:41159\"", 0, 17),
            Ok((b"127.0.0.1:41159".to_vec(), 17))
        );
        assert_eq!(
            parse_quoted("\"unix:/a b/c\"", 0, 13),
            Ok((b"unix:/a b/c".to_vec(), 13))
        );
    }

    #[test]
    fn test_parse_quoted_letter_escapes() {
        assert_eq!(
            parse_quoted("\"unix:/a\\rb/c\"", 0, 14),
            Ok((b"unix:/a\rb/c".to_vec(), 14))
        );
        assert_eq!(
            parse_quoted("\"unix:/a\\nb/c\"", 0, 14),
            Ok((b"unix:/a\nb/c".to_vec(), 14))
        );
        assert_eq!(
            parse_quoted("\"unix:/a\\tb/c\"", 0, 14),
            Ok((b"unix:/a\tb/c".to_vec(), 14))
        );
        assert_eq!(
            parse_quoted("\"unix:/a\\\\b/c\"", 0, 14),
            Ok((b"unix:/a\\b/c".to_vec(), 14))
        );
        assert_eq!(
            parse_quoted("\"unix:/a\\\"b/c\"", 0, 14),
            Ok((b"unix:/a\"b/c".to_vec(), 14))
        );
        assert_eq!(
            parse_quoted("\"unix:/a\\'b/c\"", 0, 14),
            Ok((b"unix:/a'b/c".to_vec(), 14))
        );
    }

    #[test]
    fn test_parse_quoted_octal() {
        assert_eq!(parse_quoted("\"\\101\"", 0, 6), Ok((b"A".to_vec(), 6)));
        assert_eq!(parse_quoted("\"\\000\"", 0, 6), Ok((vec![0u8], 6)));
        // 0o777 wraps into a byte.
        assert_eq!(parse_quoted("\"\\777\"", 0, 6), Ok((vec![0xffu8], 6)));
    }

    #[test]
    fn test_parse_quoted_octal_must_have_three_digits() {
        assert_eq!(parse_quoted("\"\\7x\"", 0, 5), Err(QuoteError { at: 3 }));
        assert_eq!(parse_quoted("\"\\77\"", 0, 5), Err(QuoteError { at: 4 }));
    }

    #[test]
    fn test_parse_quoted_stops_at_closing_quote() {
        assert_eq!(
            parse_quoted("\"unix:/a b/c\" \"127.0.0.1:9050\"", 0, 30),
            Ok((b"unix:/a b/c".to_vec(), 13))
        );
    }

    #[test]
    fn test_parse_quoted_unterminated() {
        assert_eq!(parse_quoted("\"unix:/a b/c", 0, 12), Err(QuoteError { at: 12 }));
    }

    #[test]
    fn test_parse_quoted_bad_escape() {
        assert_eq!(parse_quoted("\"unix:/a\\fb/c\"", 0, 13), Err(QuoteError { at: 9 }));
    }

    #[test]
    fn test_parse_quoted_missing_open_quote() {
        assert_eq!(parse_quoted("unix:/a", 0, 7), Err(QuoteError { at: 0 }));
    }

    #[test]
    fn test_parse_key_value_bare() {
        assert_eq!(
            parse_key_value("xfoo=bary", 1, 8),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"bar".to_vec(),
                next: 8,
            })
        );
    }

    #[test]
    fn test_parse_key_value_quoted() {
        assert_eq!(
            parse_key_value("xfoo=\"bar\"y", 1, 10),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"bar".to_vec(),
                next: 10,
            })
        );
        assert_eq!(
            parse_key_value("xfoo=\"bar baz\"y", 1, 14),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"bar baz".to_vec(),
                next: 14,
            })
        );
        assert_eq!(
            parse_key_value("xfoo=\"bar\\\"baz\"y", 1, 15),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"bar\"baz".to_vec(),
                next: 15,
            })
        );
    }

    #[test]
    fn test_parse_key_value_consumes_trailing_space() {
        assert_eq!(
            parse_key_value("xfoo=\"bar\\\"baz\" quux=\"zot\"y", 1, 26),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"bar\"baz".to_vec(),
                next: 16,
            })
        );
        assert_eq!(
            parse_key_value("xfoo=barbaz quux=zoty", 1, 20),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: b"barbaz".to_vec(),
                next: 12,
            })
        );
    }

    #[test]
    fn test_parse_key_value_empty_value() {
        assert_eq!(
            parse_key_value("foo=", 0, 4),
            Ok(KeyValue {
                keyword: "foo".to_string(),
                value: Vec::new(),
                next: 4,
            })
        );
    }

    #[test]
    fn test_parse_key_value_missing_equals() {
        assert_eq!(parse_key_value("foobar", 0, 6), Err(QuoteError { at: 6 }));
    }

    #[test]
    fn test_parse_key_value_bare_embedded_quote() {
        assert_eq!(parse_key_value("foo=ba\"r", 0, 8), Err(QuoteError { at: 6 }));
    }

    #[test]
    fn test_escape_round_trips_through_parse_quoted() {
        let cases: &[&[u8]] = &[
            b"",
            b"plain",
            b" leading",
            b"trailing ",
            b"has\ttab",
            b"quote\"inside",
            b"back\\slash",
            &[0x00, 0x1f, 0x7f, 0x80, 0xff],
            "sm\u{f6}rg\u{e5}sbord".as_bytes(),
        ];
        for &input in cases {
            let escaped = escape_value(input);
            if escaped.starts_with('"') {
                let octal_free = unescape_hex(&escaped);
                let (body, consumed) = parse_quoted(&octal_free, 0, octal_free.len())
                    .expect("escaped form must reparse");
                assert_eq!(consumed, octal_free.len());
                assert_eq!(body, input);
            } else {
                assert_eq!(escaped.as_bytes(), input);
            }
        }
    }

    // The control parser speaks octal escapes while the torrc escaper
    // emits hex, so rewrite \xHH into \OOO before reparsing. Other
    // backslash pairs pass through whole so their second byte is never
    // mistaken for an `x`.
    fn unescape_hex(s: &str) -> String {
        let bytes = s.as_bytes();
        let mut out = String::with_capacity(s.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
                let hi = (bytes[i + 2] as char).to_digit(16).expect("hex digit");
                let lo = (bytes[i + 3] as char).to_digit(16).expect("hex digit");
                let v = hi * 16 + lo;
                out.push('\\');
                out.push(char::from_digit(v >> 6, 8).expect("octal digit"));
                out.push(char::from_digit((v >> 3) & 7, 8).expect("octal digit"));
                out.push(char::from_digit(v & 7, 8).expect("octal digit"));
                i += 4;
            } else if bytes[i] == b'\\' && i + 1 < bytes.len() {
                out.push('\\');
                out.push(bytes[i + 1] as char);
                i += 2;
            } else {
                out.push(bytes[i] as char);
                i += 1;
            }
        }
        out
    }
}
