//! Server reply values and the reply stream parser.

/// A reply received from the smtp server.
///
/// A reply is one or more lines all carrying the same three digit
/// status code; the text of the continuation lines is kept in order.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Response {
    code: u16,
    lines: Vec<String>,
}

impl Response {
    /// Creates a response from a status code and its text lines.
    pub fn new(code: u16, lines: Vec<String>) -> Self {
        Response { code, lines }
    }

    /// The status code shared by all lines of the reply.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// true for 2xx codes
    pub fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// true for 3xx codes, i.e. the server expects a continuation
    pub fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// The text lines of the reply, without code and separator.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// First whitespace delimited token of the first text line.
    ///
    /// The greeting and the first EHLO line lead with the server's
    /// domain, which is what this is used for. Returns an empty string
    /// for a reply without text.
    pub fn domain(&self) -> &str {
        self.lines
            .first()
            .and_then(|line| line.split_whitespace().next())
            .unwrap_or("")
    }

    /// All text lines joined with `\n`.
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

pub mod parser {
    use std::collections::VecDeque;
    use std::error::Error;
    use std::fmt::{self, Display};
    use std::mem;
    use std::str::{self, Utf8Error};

    use super::Response;

    /// Error produced when the byte stream is not a valid reply stream.
    ///
    /// Any of these is unrecoverable, the buffered bytes are abandoned
    /// and the caller is expected to drop the connection.
    #[derive(Debug, Clone)]
    pub enum ParseError {
        /// a line shorter than the three digit code
        LineTooShort,
        /// the first three bytes of a line were not a non-zero number
        BadCode([u8; 3]),
        /// the byte after the code was not `-`, ` ` or CR
        BadSeparator(u8),
        /// a continuation line switched to a different code
        CodeMismatch { expected: u16, got: u16 },
        /// data after a completed reply while pipelining is off
        UnexpectedData,
        /// the text of a line was not valid UTF-8
        Utf8(Utf8Error),
    }

    impl Display for ParseError {
        fn fmt(&self, fter: &mut fmt::Formatter) -> fmt::Result {
            use self::ParseError::*;
            match self {
                LineTooShort => write!(fter, "line too short for a reply code"),
                BadCode(raw) => write!(fter, "malformed reply code {:?}", raw),
                BadSeparator(byte) => write!(fter, "invalid code separator {:?}", byte),
                CodeMismatch { expected, got } => write!(
                    fter,
                    "continuation line code {} differs from first line code {}",
                    got, expected
                ),
                UnexpectedData => write!(fter, "unsolicited data after reply"),
                Utf8(err) => write!(fter, "reply text is not utf-8: {}", err),
            }
        }
    }

    impl Error for ParseError {}

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    enum Scan {
        /// next byte starts a fresh reply
        Start,
        /// inside the first line, the code is not fixed yet
        First,
        /// inside continuation lines
        Next,
    }

    /// Incremental decoder for (possibly pipelined) smtp replies.
    ///
    /// Bytes go in through [`feed`](ResponseParser::feed), complete
    /// replies come out through [`take`](ResponseParser::take). An
    /// incomplete reply stays buffered and parsing resumes on the next
    /// `feed` call.
    #[derive(Debug)]
    pub struct ResponseParser {
        pipelining: bool,
        buffer: Vec<u8>,
        last_index: usize,
        scan: Scan,
        code: u16,
        lines: Vec<String>,
        ready: VecDeque<Response>,
    }

    impl Default for ResponseParser {
        fn default() -> Self {
            ResponseParser::new()
        }
    }

    impl ResponseParser {
        pub fn new() -> Self {
            ResponseParser {
                pipelining: false,
                buffer: Vec::new(),
                last_index: 0,
                scan: Scan::Start,
                code: 0,
                lines: Vec::new(),
                ready: VecDeque::new(),
            }
        }

        /// Allows a completed reply to be followed by further replies
        /// in the same buffer.
        ///
        /// Toggled from the EHLO extension table; without it leftover
        /// bytes after a completed reply are [`ParseError::UnexpectedData`].
        pub fn set_pipelining(&mut self, enabled: bool) {
            self.pipelining = enabled;
        }

        pub fn has_response(&self) -> bool {
            !self.ready.is_empty()
        }

        /// Removes and returns the oldest completely parsed reply.
        pub fn take(&mut self) -> Option<Response> {
            self.ready.pop_front()
        }

        /// Consumes more bytes from the wire.
        ///
        /// Zero or more replies become available through `take`
        /// afterwards. On error the buffered data is abandoned.
        pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
            match self.feed_inner(data) {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.buffer.clear();
                    self.last_index = 0;
                    self.scan = Scan::Start;
                    self.lines.clear();
                    Err(err)
                }
            }
        }

        fn feed_inner(&mut self, data: &[u8]) -> Result<(), ParseError> {
            if self.buffer.is_empty() {
                self.scan = Scan::Start;
                self.last_index = 0;
            }
            self.buffer.extend_from_slice(data);
            loop {
                if self.scan == Scan::Start {
                    self.scan = Scan::First;
                    self.code = 0;
                    self.lines.clear();
                }
                let eol = match find_crlf(&self.buffer, self.last_index) {
                    Some(index) => index,
                    None => return Ok(()),
                };
                let line = &self.buffer[self.last_index..eol];
                if line.len() < 3 {
                    return Err(ParseError::LineTooShort);
                }
                let code = parse_code(&line[..3])?;
                if self.scan != Scan::First && code != self.code {
                    return Err(ParseError::CodeMismatch {
                        expected: self.code,
                        got: code,
                    });
                }
                self.code = code;
                // a bare `NNN\r\n` line has no separator byte of its own,
                // the CR of the line ending stands in for it
                let separator = if line.len() == 3 { b'\r' } else { line[3] };
                match separator {
                    b'-' | b' ' | b'\r' => (),
                    other => return Err(ParseError::BadSeparator(other)),
                }
                if line.len() > 4 && separator != b'\r' {
                    let text = str::from_utf8(&line[4..]).map_err(ParseError::Utf8)?;
                    self.lines.push(text.to_owned());
                }
                if separator == b'-' {
                    self.last_index = eol + 2;
                    self.scan = Scan::Next;
                    continue;
                }
                // space or standalone CR finish the reply
                let lines = mem::replace(&mut self.lines, Vec::new());
                self.ready.push_back(Response::new(self.code, lines));
                if eol + 2 != self.buffer.len() {
                    if !self.pipelining {
                        return Err(ParseError::UnexpectedData);
                    }
                    self.last_index = eol + 2;
                    self.scan = Scan::Start;
                    continue;
                }
                self.buffer.clear();
                self.last_index = 0;
                self.scan = Scan::Start;
                return Ok(());
            }
        }
    }

    fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
        if from >= buffer.len() {
            return None;
        }
        buffer[from..]
            .windows(2)
            .position(|pair| pair == b"\r\n")
            .map(|index| index + from)
    }

    fn parse_code(raw: &[u8]) -> Result<u16, ParseError> {
        let mut code: u16 = 0;
        for &byte in raw {
            if !byte.is_ascii_digit() {
                return Err(ParseError::BadCode([raw[0], raw[1], raw[2]]));
            }
            code = code * 10 + u16::from(byte - b'0');
        }
        if code == 0 {
            return Err(ParseError::BadCode([raw[0], raw[1], raw[2]]));
        }
        Ok(code)
    }
}

#[cfg(test)]
mod test {
    #![allow(non_snake_case)]

    mod Response {
        use crate::response::Response;

        #[test]
        fn domain_is_the_first_token() {
            let response = Response::new(220, vec!["mail.test ESMTP ready".to_owned()]);
            assert_eq!(response.domain(), "mail.test");
        }

        #[test]
        fn domain_of_a_single_token_line() {
            let response = Response::new(250, vec!["mail.test".to_owned()]);
            assert_eq!(response.domain(), "mail.test");
        }

        #[test]
        fn domain_of_an_empty_reply() {
            let response = Response::new(250, vec![]);
            assert_eq!(response.domain(), "");
        }

        #[test]
        fn joined_uses_newlines() {
            let response = Response::new(250, vec!["a".to_owned(), "b".to_owned()]);
            assert_eq!(response.joined(), "a\nb");
        }

        #[test]
        fn code_classification() {
            assert!(Response::new(250, vec![]).is_positive());
            assert!(!Response::new(354, vec![]).is_positive());
            assert!(Response::new(354, vec![]).is_intermediate());
            assert!(!Response::new(550, vec![]).is_positive());
        }
    }

    mod ResponseParser {
        use crate::response::parser::{ParseError, ResponseParser};

        #[test]
        fn parses_a_single_line_reply() {
            let mut parser = ResponseParser::new();
            parser.feed(b"220 mail.test ready\r\n").unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.code(), 220);
            assert_eq!(response.lines(), ["mail.test ready"]);
            assert!(parser.take().is_none());
        }

        #[test]
        fn parses_a_multi_line_reply() {
            let mut parser = ResponseParser::new();
            parser
                .feed(b"250-mail.test greets you\r\n250-SIZE 1000000\r\n250 PIPELINING\r\n")
                .unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.code(), 250);
            assert_eq!(
                response.lines(),
                ["mail.test greets you", "SIZE 1000000", "PIPELINING"]
            );
        }

        #[test]
        fn split_feeding_is_equivalent_to_one_feed() {
            let wire = b"250-mail.test greets you\r\n250-SIZE 1000000\r\n250 ok\r\n";
            let mut whole = ResponseParser::new();
            whole.feed(wire).unwrap();
            let expected = whole.take().unwrap();

            for split_at in 1..wire.len() {
                let mut parser = ResponseParser::new();
                parser.feed(&wire[..split_at]).unwrap();
                parser.feed(&wire[split_at..]).unwrap();
                assert_eq!(parser.take().unwrap(), expected, "split at {}", split_at);
            }

            let mut bytewise = ResponseParser::new();
            for byte in wire.iter() {
                bytewise.feed(&[*byte]).unwrap();
            }
            assert_eq!(bytewise.take().unwrap(), expected);
        }

        #[test]
        fn incomplete_reply_stays_pending() {
            let mut parser = ResponseParser::new();
            parser.feed(b"250-first\r\n250 seco").unwrap();
            assert!(!parser.has_response());
            parser.feed(b"nd\r\n").unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.lines(), ["first", "second"]);
        }

        #[test]
        fn mismatched_codes_are_an_error() {
            let mut parser = ResponseParser::new();
            let err = parser.feed(b"250-first\r\n251 second\r\n").unwrap_err();
            match err {
                ParseError::CodeMismatch { expected, got } => {
                    assert_eq!(expected, 250);
                    assert_eq!(got, 251);
                }
                other => panic!("unexpected error: {:?}", other),
            }
            // the buffer was abandoned, a fresh reply parses fine
            parser.feed(b"220 hi\r\n").unwrap();
            assert_eq!(parser.take().unwrap().code(), 220);
        }

        #[test]
        fn zero_code_is_an_error() {
            let mut parser = ResponseParser::new();
            assert!(parser.feed(b"000 nope\r\n").is_err());
        }

        #[test]
        fn non_numeric_code_is_an_error() {
            let mut parser = ResponseParser::new();
            assert!(parser.feed(b"2x0 nope\r\n").is_err());
        }

        #[test]
        fn bad_separator_is_an_error() {
            let mut parser = ResponseParser::new();
            match parser.feed(b"250+nope\r\n").unwrap_err() {
                ParseError::BadSeparator(byte) => assert_eq!(byte, b'+'),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[test]
        fn bare_code_line_completes_a_reply() {
            let mut parser = ResponseParser::new();
            parser.feed(b"250\r\n").unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.code(), 250);
            assert!(response.lines().is_empty());
        }

        #[test]
        fn code_with_trailing_space_has_no_text_line() {
            let mut parser = ResponseParser::new();
            parser.feed(b"334 \r\n").unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.code(), 334);
            assert!(response.lines().is_empty());
        }

        #[test]
        fn trailing_data_without_pipelining_is_an_error() {
            let mut parser = ResponseParser::new();
            match parser.feed(b"250 ok\r\n220 hi\r\n").unwrap_err() {
                ParseError::UnexpectedData => (),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[test]
        fn trailing_data_with_pipelining_starts_the_next_reply() {
            let mut parser = ResponseParser::new();
            parser.set_pipelining(true);
            parser.feed(b"250 ok\r\n550 no\r\n250 fine\r\n").unwrap();
            assert_eq!(parser.take().unwrap().code(), 250);
            assert_eq!(parser.take().unwrap().code(), 550);
            assert_eq!(parser.take().unwrap().code(), 250);
            assert!(parser.take().is_none());
        }

        #[test]
        fn pipelined_partial_reply_resumes() {
            let mut parser = ResponseParser::new();
            parser.set_pipelining(true);
            parser.feed(b"250 ok\r\n550 n").unwrap();
            assert_eq!(parser.take().unwrap().code(), 250);
            assert!(!parser.has_response());
            parser.feed(b"o\r\n").unwrap();
            let response = parser.take().unwrap();
            assert_eq!(response.code(), 550);
            assert_eq!(response.lines(), ["no"]);
        }
    }
}
