//! Wire format assembly: RFC 5322 headers with RFC 2047 encoded-words,
//! quoted-printable text bodies and base64 attachment parts.

use std::io;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::message::{is_multipart_type, Attachment, Message, RecipientKind};

/// folding limit for header lines
const MAX_HEADER_LINE: usize = 76;
/// an encoded-word is at most 75 chars, `=?utf-8?B?` + `?=` take 12 of
/// them, leaving 63 for base64, i.e. 45 input bytes
const ENCODED_WORD_INPUT: usize = 45;
/// 57 input bytes base64-encode to a full 76 char line
const BASE64_LINE_INPUT: usize = 57;
/// multipart preambles are emitted as raw 7bit lines
const PREAMBLE_LINE: usize = 73;

/// Headers the renderer emits itself; occurrences in the extra header
/// table are skipped.
const COMPOSED_HEADERS: &[&str] = &[
    "date",
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
];

impl Message {
    /// Renders the complete DATA payload.
    ///
    /// Every line is CRLF terminated; the `.` end-of-data sequence and
    /// dot-stuffing are applied by the transport, not here. `allow_8bit`
    /// reflects whether the server advertised `8BITMIME` and switches
    /// the text body from quoted-printable to raw 8bit.
    pub fn render(&mut self, allow_8bit: bool) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        if !self.has_extra_header("date") {
            fold_header(&mut out, "Date", &Utc::now().to_rfc2822());
        } else if let Some(date) = self.extra_header("date") {
            fold_header(&mut out, "Date", date);
        }
        fold_header(&mut out, "From", self.sender());
        fold_header(&mut out, "To", &self.recipients(RecipientKind::To).join(", "));
        if !self.recipients(RecipientKind::Cc).is_empty() {
            fold_header(&mut out, "Cc", &self.recipients(RecipientKind::Cc).join(", "));
        }
        fold_header(&mut out, "Subject", self.subject());
        out.extend_from_slice(b"MIME-Version: 1.0\r\n");
        for (key, value) in self.extra_headers() {
            if COMPOSED_HEADERS.contains(&key.as_str()) {
                continue;
            }
            fold_header(&mut out, key, value);
        }

        if self.attachments().is_empty() {
            text_part_headers(&mut out, allow_8bit);
            out.extend_from_slice(b"\r\n");
            let body = self.body().to_owned();
            text_body(&mut out, &body, allow_8bit);
            return Ok(out);
        }

        let boundary = gen_boundary();
        fold_header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary={}", boundary),
        );
        out.extend_from_slice(b"\r\n");

        // the message text travels as the first sub-part
        boundary_line(&mut out, &boundary, false);
        text_part_headers(&mut out, allow_8bit);
        out.extend_from_slice(b"\r\n");
        let body = self.body().to_owned();
        text_body(&mut out, &body, allow_8bit);

        for (_, attachment) in self.attachments_mut() {
            boundary_line(&mut out, &boundary, false);
            attachment.render_part(&mut out)?;
        }
        boundary_line(&mut out, &boundary, true);
        Ok(out)
    }
}

impl Attachment {
    /// Renders this part: headers, blank line, payload, and for
    /// multipart containers the children between boundary lines.
    pub(crate) fn render_part(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        // children force a container type
        if !self.children().is_empty() && !is_multipart_type(self.content_type()) {
            self.set_content_type("multipart/mixed");
        }
        let multipart = is_multipart_type(self.content_type());

        fold_header(out, "Content-Type", self.content_type());
        if !multipart {
            out.extend_from_slice(b"Content-Transfer-Encoding: base64\r\n");
        }
        for (key, value) in self.extra_headers() {
            fold_header(out, key, value);
        }
        out.extend_from_slice(b"\r\n");

        {
            let data = self.raw_data()?;
            if multipart {
                // the preamble is expected to be 7bit text already
                for chunk in data.chunks(PREAMBLE_LINE) {
                    out.extend_from_slice(chunk);
                    out.extend_from_slice(b"\r\n");
                }
            } else {
                base64_lines(out, data);
            }
        }

        if multipart {
            let boundary = self.boundary().to_owned();
            for (_, child) in self.children_mut() {
                boundary_line(out, &boundary, false);
                child.render_part(out)?;
            }
            boundary_line(out, &boundary, true);
        }
        Ok(())
    }
}

fn boundary_line(out: &mut Vec<u8>, boundary: &str, closing: bool) {
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    if closing {
        out.extend_from_slice(b"--");
    }
    out.extend_from_slice(b"\r\n");
}

fn text_part_headers(out: &mut Vec<u8>, allow_8bit: bool) {
    out.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    if allow_8bit {
        out.extend_from_slice(b"Content-Transfer-Encoding: 8bit\r\n");
    } else {
        out.extend_from_slice(b"Content-Transfer-Encoding: quoted-printable\r\n");
    }
}

fn text_body(out: &mut Vec<u8>, body: &str, allow_8bit: bool) {
    let normalized = normalize_crlf(body.as_bytes());
    if allow_8bit {
        out.extend_from_slice(&normalized);
    } else {
        out.extend_from_slice(&quoted_printable::encode(&normalized));
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
}

/// Rewrites lone CR or LF line endings to CRLF.
fn normalize_crlf(data: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(data.len());
    let mut index = 0;
    while index < data.len() {
        match data[index] {
            b'\r' => {
                normalized.extend_from_slice(b"\r\n");
                if data.get(index + 1) == Some(&b'\n') {
                    index += 1;
                }
            }
            b'\n' => normalized.extend_from_slice(b"\r\n"),
            byte => normalized.push(byte),
        }
        index += 1;
    }
    normalized
}

/// Base64 encodes `data` in lines of 57 input bytes, 76 output chars.
fn base64_lines(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(BASE64_LINE_INPUT) {
        out.extend_from_slice(base64::encode(chunk).as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Emits `Key: value` folded to lines of at most 76 chars.
///
/// A short all-ASCII value is emitted verbatim. Otherwise the value is
/// split at whitespace (long tokens additionally after commas), tokens
/// containing non-ASCII become RFC 2047 encoded-words, and continuation
/// lines start with a single space.
fn fold_header(out: &mut Vec<u8>, key: &str, value: &str) {
    let plain = value
        .bytes()
        .all(|byte| byte >= 0x20 && byte < 0x7f);
    if plain && key.len() + 2 + value.len() <= MAX_HEADER_LINE {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
        return;
    }

    let mut words: Vec<String> = Vec::new();
    for token in value.split_whitespace() {
        if !token.is_ascii() {
            words.extend(encoded_words(token));
        } else if token.len() > MAX_HEADER_LINE {
            words.extend(comma_chunks(token));
        } else {
            words.push(token.to_owned());
        }
    }

    let mut line = String::with_capacity(MAX_HEADER_LINE);
    line.push_str(key);
    line.push_str(": ");
    let mut line_has_words = false;
    for word in words {
        let needed = line.len() + word.len() + if line_has_words { 1 } else { 0 };
        if line_has_words && needed > MAX_HEADER_LINE {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
            line.clear();
            line.push(' ');
            line_has_words = false;
        }
        if line_has_words {
            line.push(' ');
        }
        line.push_str(&word);
        line_has_words = true;
    }
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Splits an overlong ASCII token after its commas.
fn comma_chunks(token: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in token.chars() {
        current.push(ch);
        if ch == ',' {
            chunks.push(current);
            current = String::new();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Encodes one token as `=?utf-8?B?..?=` words, chunked so every word
/// stays within the 75 char limit and can be folded onto its own line.
fn encoded_words(token: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in token.chars() {
        if chunk.len() + ch.len_utf8() > ENCODED_WORD_INPUT {
            words.push(format!("=?utf-8?B?{}?=", base64::encode(&chunk)));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", base64::encode(&chunk)));
    }
    words
}

/// A fresh multipart boundary: fixed marker plus 24 random
/// alphanumerics. Random enough that collision checks are pointless.
pub(crate) fn gen_boundary() -> String {
    let mut rng = thread_rng();
    let mut boundary = String::from("----=_NextPart_");
    let tail: String = rng.sample_iter(&Alphanumeric).take(24).collect();
    boundary.push_str(&tail);
    boundary
}

/// Extracts the bare address from a display-name form, e.g.
/// `"Alice <a@b.c>"` gives `a@b.c`.
///
/// Tracks comment parens and quoted strings so a `<` inside either does
/// not open an address. Input without an angle address is returned
/// unchanged.
pub fn extract_address(address: &str) -> &str {
    let mut paren_depth = 0usize;
    let mut in_quote = false;
    let mut addr_start = None;
    for (index, ch) in address.char_indices() {
        if in_quote {
            if ch == '"' {
                in_quote = false;
            }
        } else if let Some(start) = addr_start {
            if ch == '>' {
                return &address[start..index];
            }
        } else if ch == '(' {
            paren_depth += 1;
        } else if ch == ')' {
            paren_depth = paren_depth.saturating_sub(1);
        } else if ch == '"' {
            if paren_depth == 0 {
                in_quote = true;
            }
        } else if ch == '<' && paren_depth == 0 {
            addr_start = Some(index + ch.len_utf8());
        }
    }
    address
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{Attachment, Message, RecipientKind};

    fn decode_word(word: &str) -> String {
        assert!(word.starts_with("=?utf-8?B?") && word.ends_with("?="), "{}", word);
        let inner = &word["=?utf-8?B?".len()..word.len() - 2];
        String::from_utf8(base64::decode(inner).unwrap()).unwrap()
    }

    mod extract_address {
        use super::super::extract_address;

        #[test]
        fn display_name_form() {
            assert_eq!(extract_address("Alice <a@b.c>"), "a@b.c");
        }

        #[test]
        fn bare_address() {
            assert_eq!(extract_address("a@b.c"), "a@b.c");
        }

        #[test]
        fn angle_inside_quoted_string() {
            assert_eq!(extract_address("\"x<y\" <a@b.c>"), "a@b.c");
        }

        #[test]
        fn angle_inside_comment() {
            assert_eq!(extract_address("(comment <nope@x>) <a@b.c>"), "a@b.c");
        }
    }

    mod fold_header {
        use super::super::fold_header;
        use super::decode_word;

        fn fold(key: &str, value: &str) -> String {
            let mut out = Vec::new();
            fold_header(&mut out, key, value);
            String::from_utf8(out).unwrap()
        }

        #[test]
        fn short_ascii_is_verbatim() {
            assert_eq!(fold("Subject", "hello world"), "Subject: hello world\r\n");
            assert_eq!(fold("Subject", "two  spaces"), "Subject: two  spaces\r\n");
        }

        #[test]
        fn long_ascii_folds_at_whitespace() {
            let value = "word ".repeat(40);
            let folded = fold("Subject", value.trim());
            for line in folded.split("\r\n") {
                assert!(line.len() <= 76, "line too long: {:?}", line);
            }
            assert!(folded.ends_with("\r\n"));
            assert!(folded.contains("\r\n word"));
            let unfolded = folded.replace("\r\n ", " ");
            assert_eq!(unfolded.trim_end(), format!("Subject: {}", value.trim()));
        }

        #[test]
        fn non_ascii_becomes_encoded_words() {
            let folded = fold("Subject", "grüße aus köln");
            assert!(folded.starts_with("Subject: "));
            let value = folded["Subject: ".len()..].trim_end().replace("\r\n ", " ");
            let decoded: Vec<String> = value
                .split(' ')
                .map(|word| {
                    if word.starts_with("=?") {
                        decode_word(word)
                    } else {
                        word.to_owned()
                    }
                })
                .collect();
            assert_eq!(decoded.join(" "), "grüße aus köln");
        }

        #[test]
        fn encoded_words_stay_within_the_limit() {
            let long = "ä".repeat(120);
            let folded = fold("Subject", &long);
            let mut decoded = String::new();
            for word in folded["Subject: ".len()..].split_whitespace() {
                assert!(word.len() <= 75, "encoded word too long: {}", word);
                decoded.push_str(&decode_word(word));
            }
            assert_eq!(decoded, long);
        }
    }

    mod render {
        use super::*;

        fn lines_of(data: &[u8]) -> Vec<String> {
            String::from_utf8_lossy(data)
                .split("\r\n")
                .map(str::to_owned)
                .collect()
        }

        fn plain_message() -> Message {
            let mut message = Message::new();
            message.set_sender("Alice <alice@sender.test>");
            message.add_recipient(RecipientKind::To, "bob@rcpt.test");
            message.add_recipient(RecipientKind::Bcc, "hidden@rcpt.test");
            message.set_subject("greetings");
            message.set_body("hello\nbye\n");
            message
        }

        #[test]
        fn every_line_is_crlf_terminated() {
            let rendered = plain_message().render(false).unwrap();
            assert!(rendered.ends_with(b"\r\n"));
            let text = String::from_utf8(rendered).unwrap();
            for line in text.split("\r\n") {
                assert!(!line.contains('\r') && !line.contains('\n'));
            }
        }

        #[test]
        fn bcc_is_not_rendered() {
            let rendered = plain_message().render(false).unwrap();
            let text = String::from_utf8(rendered).unwrap();
            assert!(!text.contains("hidden@rcpt.test"));
            assert!(text.contains("To: bob@rcpt.test\r\n"));
        }

        #[test]
        fn plain_body_is_quoted_printable() {
            let rendered = plain_message().render(false).unwrap();
            let text = String::from_utf8(rendered).unwrap();
            assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
            assert!(text.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
            assert!(text.contains("hello\r\nbye\r\n"));
        }

        #[test]
        fn eight_bit_body_when_allowed() {
            let mut message = plain_message();
            message.set_body("grüße\n");
            let rendered = message.render(true).unwrap();
            let text = String::from_utf8(rendered).unwrap();
            assert!(text.contains("Content-Transfer-Encoding: 8bit\r\n"));
            assert!(text.contains("grüße\r\n"));
        }

        #[test]
        fn header_block_contains_the_canonical_headers() {
            let rendered = plain_message().render(false).unwrap();
            let text = String::from_utf8(rendered).unwrap();
            assert!(text.contains("Date: "));
            assert!(text.contains("From: Alice <alice@sender.test>\r\n"));
            assert!(text.contains("Subject: greetings\r\n"));
            assert!(text.contains("MIME-Version: 1.0\r\n"));
        }

        #[test]
        fn attachments_render_as_multipart_mixed() {
            let mut message = plain_message();
            let mut attachment = Attachment::with_type(vec![0u8; 100], "application/octet-stream");
            attachment.set_extra_header("Content-Disposition", "attachment; filename=\"data.bin\"");
            message.add_attachment("data.bin", attachment);
            let rendered = message.render(false).unwrap();
            let text = String::from_utf8(rendered).unwrap();

            let boundary_start = text.find("boundary=").unwrap() + "boundary=".len();
            let boundary: String = text[boundary_start..]
                .chars()
                .take_while(|ch| !ch.is_whitespace() && *ch != ';')
                .collect();
            assert!(boundary.len() >= 20);
            assert!(text.contains(&format!("--{}\r\n", boundary)));
            assert!(text.contains(&format!("--{}--\r\n", boundary)));
            assert!(text.contains("Content-Type: application/octet-stream\r\n"));
            assert!(text.contains("Content-Transfer-Encoding: base64\r\n"));
            // per-part headers are stored lowercased and rendered as-is
            assert!(text.contains("content-disposition: attachment; filename=\"data.bin\"\r\n"));
        }

        #[test]
        fn base64_lines_are_at_most_76_chars() {
            let mut message = plain_message();
            message.add_attachment("data.bin", Attachment::with_type(vec![0xAAu8; 500], "application/octet-stream"));
            let rendered = message.render(false).unwrap();
            let mut saw_full_line = false;
            for line in lines_of(&rendered) {
                assert!(line.len() <= 76, "line too long: {:?}", line);
                if line.len() == 76 {
                    saw_full_line = true;
                }
            }
            assert!(saw_full_line);
        }

        #[test]
        fn nested_multipart_renders_children() {
            let mut container = Attachment::with_type(
                &b"This is a multi-part message in MIME format."[..],
                "multipart/mixed; boundary=inner-boundary-1234567890",
            );
            container.add_child("one.txt", Attachment::new("first"));
            container.add_child("two.txt", Attachment::new("second"));

            let mut out = Vec::new();
            container.render_part(&mut out).unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.contains("--inner-boundary-1234567890\r\n"));
            assert!(text.contains("--inner-boundary-1234567890--\r\n"));
            assert!(text.contains("This is a multi-part message in MIME format.\r\n"));
            // "first" and "second" are base64 encoded leaf parts
            assert!(text.contains(&base64::encode("first")));
            assert!(text.contains(&base64::encode("second")));
        }

        #[test]
        fn children_force_a_container_type() {
            let mut attachment = Attachment::new("preamble");
            attachment.add_child("inner.txt", Attachment::new("payload"));
            let mut out = Vec::new();
            attachment.render_part(&mut out).unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.contains("Content-Type: multipart/mixed; boundary="));
        }
    }
}
