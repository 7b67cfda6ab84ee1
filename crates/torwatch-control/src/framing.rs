//! CRLF line framing for the control stream.
//!
//! [`LineScanner`] is a pure incremental machine: the session's socket
//! reader feeds it whatever chunks arrive and it hands back complete
//! lines, so chunk boundaries can never change what comes out. Framing
//! violations are unrecoverable; the scanner stops and surrenders every
//! byte it had not consumed so the caller loses nothing.

use std::mem;

/// One framed line, terminator excluded.
///
/// `truncated` is set when the line was flushed early because it reached
/// the scanner's maximum length without a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedLine {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// A framing violation. Carries the unconsumed remainder of the stream:
/// the partial line buffered so far, a pending CR if one was seen, the
/// offending byte, and everything after it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// A line feed arrived without a preceding carriage return.
    #[error("stray line feed in control stream")]
    StrayLineFeed { remainder: Vec<u8> },
    /// A carriage return was not immediately followed by a line feed.
    #[error("stray carriage return in control stream")]
    StrayCarriageReturn { remainder: Vec<u8> },
}

impl FramingError {
    /// The bytes the scanner had not consumed when it stopped.
    pub fn remainder(&self) -> &[u8] {
        match self {
            FramingError::StrayLineFeed { remainder } => remainder,
            FramingError::StrayCarriageReturn { remainder } => remainder,
        }
    }
}

/// A failed [`push`](LineScanner::push).
///
/// Lines completed earlier in the same chunk are real protocol lines
/// and must reach the caller even though the chunk ends in a violation;
/// otherwise what the caller sees would depend on how the stream
/// happened to be split into chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    /// Lines completed before the scanner stopped.
    pub completed: Vec<ScannedLine>,
    pub error: FramingError,
}

/// Incremental CRLF line scanner with a maximum line length.
///
/// Once stopped, by [`finish`](LineScanner::finish) or by a framing
/// error, the scanner ignores further input; it cannot be reused.
#[derive(Debug)]
pub struct LineScanner {
    max_line: usize,
    buf: Vec<u8>,
    cr_seen: bool,
    stopped: bool,
}

impl LineScanner {
    /// Create a scanner that flushes unterminated lines at `max_line`
    /// bytes. `max_line` must be at least 1.
    pub fn new(max_line: usize) -> Self {
        assert!(max_line >= 1, "max_line must be at least 1");
        LineScanner {
            max_line,
            buf: Vec::new(),
            cr_seen: false,
            stopped: false,
        }
    }

    /// Feed one chunk, returning the lines it completed.
    ///
    /// When the accumulated line reaches `max_line` bytes before a
    /// terminator, it is flushed with `truncated` set and the byte that
    /// would have exceeded the limit starts a fresh line. On a framing
    /// violation the failure still carries the lines the chunk
    /// completed before the offending byte. A stopped scanner returns
    /// no lines.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ScannedLine>, ScanFailure> {
        if self.stopped {
            return Ok(Vec::new());
        }
        let mut lines = Vec::new();
        for (i, &byte) in chunk.iter().enumerate() {
            if self.cr_seen {
                if byte != b'\n' {
                    let error = self.fail(chunk, i, true);
                    return Err(ScanFailure {
                        completed: lines,
                        error,
                    });
                }
                self.cr_seen = false;
                lines.push(ScannedLine {
                    bytes: mem::take(&mut self.buf),
                    truncated: false,
                });
            } else if byte == b'\r' {
                self.cr_seen = true;
            } else if byte == b'\n' {
                let error = self.fail(chunk, i, false);
                return Err(ScanFailure {
                    completed: lines,
                    error,
                });
            } else {
                if self.buf.len() == self.max_line {
                    lines.push(ScannedLine {
                        bytes: mem::take(&mut self.buf),
                        truncated: true,
                    });
                }
                self.buf.push(byte);
            }
        }
        Ok(lines)
    }

    /// Signal end-of-stream. A remaining partial line is returned once,
    /// untruncated; a dangling lone CR is dropped. The scanner stops.
    pub fn finish(&mut self) -> Option<ScannedLine> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        self.cr_seen = false;
        if self.buf.is_empty() {
            None
        } else {
            Some(ScannedLine {
                bytes: mem::take(&mut self.buf),
                truncated: false,
            })
        }
    }

    /// True once a framing error or `finish` has stopped the scanner.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn fail(&mut self, chunk: &[u8], at: usize, after_cr: bool) -> FramingError {
        self.stopped = true;
        self.cr_seen = false;
        let mut remainder = mem::take(&mut self.buf);
        if after_cr {
            remainder.push(b'\r');
        }
        remainder.extend_from_slice(&chunk[at..]);
        if after_cr {
            FramingError::StrayCarriageReturn { remainder }
        } else {
            FramingError::StrayLineFeed { remainder }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn line(bytes: &[u8], truncated: bool) -> ScannedLine {
        ScannedLine {
            bytes: bytes.to_vec(),
            truncated,
        }
    }

    #[test]
    fn test_single_complete_line() {
        let mut scanner = LineScanner::new(64);
        let lines = scanner.push(b"250 OK\r\n").unwrap();
        assert_eq!(lines, vec![line(b"250 OK", false)]);
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut scanner = LineScanner::new(64);
        let lines = scanner.push(b"250-a\r\n250-b\r\n250 OK\r\n").unwrap();
        assert_eq!(
            lines,
            vec![line(b"250-a", false), line(b"250-b", false), line(b"250 OK", false)]
        );
    }

    #[test]
    fn test_chunk_boundaries_never_change_output() {
        let stream = b"250-one\r\n650 CIRC LAUNCHED\r\n250 OK\r\n";
        let mut expected = None;
        for split in 0..=stream.len() {
            let mut scanner = LineScanner::new(64);
            let mut lines = scanner.push(&stream[..split]).unwrap();
            lines.extend(scanner.push(&stream[split..]).unwrap());
            assert_eq!(scanner.finish(), None);
            match &expected {
                None => expected = Some(lines),
                Some(want) => assert_eq!(&lines, want, "split at {split}"),
            }
        }
        assert_eq!(
            expected.unwrap(),
            vec![
                line(b"250-one", false),
                line(b"650 CIRC LAUNCHED", false),
                line(b"250 OK", false)
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_stream() {
        let stream = b"250 first\r\n250 second\r\n";
        let mut scanner = LineScanner::new(64);
        let mut lines = Vec::new();
        for byte in stream {
            lines.extend(scanner.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(lines, vec![line(b"250 first", false), line(b"250 second", false)]);
    }

    #[test]
    fn test_truncates_at_exactly_max_line() {
        let mut scanner = LineScanner::new(4);
        let lines = scanner.push(b"abcdefghij").unwrap();
        assert_eq!(lines, vec![line(b"abcd", true), line(b"efgh", true)]);
        assert_eq!(scanner.finish(), Some(line(b"ij", false)));
    }

    #[test]
    fn test_truncation_continues_from_following_byte() {
        let mut scanner = LineScanner::new(4);
        let lines = scanner.push(b"abcdef\r\n").unwrap();
        assert_eq!(lines, vec![line(b"abcd", true), line(b"ef", false)]);
    }

    #[test]
    fn test_exact_max_line_with_terminator_is_not_truncated() {
        let mut scanner = LineScanner::new(4);
        let lines = scanner.push(b"abcd\r\n").unwrap();
        assert_eq!(lines, vec![line(b"abcd", false)]);
    }

    #[test]
    fn test_truncation_across_chunk_boundary() {
        let mut scanner = LineScanner::new(4);
        assert_eq!(scanner.push(b"abcd").unwrap(), vec![]);
        assert_eq!(scanner.push(b"e").unwrap(), vec![line(b"abcd", true)]);
        assert_eq!(scanner.finish(), Some(line(b"e", false)));
    }

    #[test]
    fn test_stray_line_feed() {
        let mut scanner = LineScanner::new(64);
        let failure = scanner.push(b"foo\nbar").unwrap_err();
        assert_eq!(failure.completed, vec![]);
        assert_eq!(
            failure.error,
            FramingError::StrayLineFeed {
                remainder: b"foo\nbar".to_vec()
            }
        );
        assert!(scanner.is_stopped());
    }

    #[test]
    fn test_stray_carriage_return() {
        let mut scanner = LineScanner::new(64);
        let failure = scanner.push(b"foo\rXbar").unwrap_err();
        assert_eq!(failure.completed, vec![]);
        assert_eq!(
            failure.error,
            FramingError::StrayCarriageReturn {
                remainder: b"foo\rXbar".to_vec()
            }
        );
    }

    #[test]
    fn test_stray_carriage_return_across_chunks() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"foo\r").unwrap(), vec![]);
        let failure = scanner.push(b"X").unwrap_err();
        assert_eq!(failure.error.remainder(), b"foo\rX");
    }

    #[test]
    fn test_remainder_spans_buffered_chunks() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"par").unwrap(), vec![]);
        assert_eq!(scanner.push(b"tial").unwrap(), vec![]);
        let failure = scanner.push(b"\nrest").unwrap_err();
        assert_eq!(failure.error.remainder(), b"partial\nrest");
    }

    #[test]
    fn test_completed_lines_survive_a_violation_in_the_same_chunk() {
        let mut scanner = LineScanner::new(64);
        let failure = scanner.push(b"250 OK\r\njunk\nrest").unwrap_err();
        assert_eq!(failure.completed, vec![line(b"250 OK", false)]);
        assert_eq!(
            failure.error,
            FramingError::StrayLineFeed {
                remainder: b"junk\nrest".to_vec()
            }
        );
        assert!(scanner.is_stopped());
    }

    #[test]
    fn test_chunk_boundaries_never_change_lines_before_a_violation() {
        let stream = b"250-a\r\n250 OK\r\njunk\nrest";
        let mut expected = None;
        for split in 0..=stream.len() {
            let mut scanner = LineScanner::new(64);
            let mut lines = Vec::new();
            let mut stray = false;
            for part in [&stream[..split], &stream[split..]] {
                match scanner.push(part) {
                    Ok(more) => lines.extend(more),
                    Err(failure) => {
                        lines.extend(failure.completed);
                        assert!(matches!(
                            failure.error,
                            FramingError::StrayLineFeed { .. }
                        ));
                        stray = true;
                    }
                }
            }
            assert!(stray, "split at {split}");
            match &expected {
                None => expected = Some(lines),
                Some(want) => assert_eq!(&lines, want, "split at {split}"),
            }
        }
        assert_eq!(
            expected.unwrap(),
            vec![line(b"250-a", false), line(b"250 OK", false)]
        );
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"abc\r").unwrap(), vec![]);
        assert_eq!(
            scanner.push(b"\ndef\r\n").unwrap(),
            vec![line(b"abc", false), line(b"def", false)]
        );
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"no terminator").unwrap(), vec![]);
        assert_eq!(scanner.finish(), Some(line(b"no terminator", false)));
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_finish_drops_dangling_cr() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"abc\r").unwrap(), vec![]);
        assert_eq!(scanner.finish(), Some(line(b"abc", false)));
    }

    #[test]
    fn test_stopped_scanner_ignores_input() {
        let mut scanner = LineScanner::new(64);
        let _ = scanner.push(b"bad\nstream");
        assert_eq!(scanner.push(b"250 OK\r\n").unwrap(), vec![]);
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_empty_line() {
        let mut scanner = LineScanner::new(64);
        assert_eq!(scanner.push(b"\r\n").unwrap(), vec![line(b"", false)]);
    }
}
