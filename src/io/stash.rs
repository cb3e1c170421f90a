//! Dot-stuffing for the DATA payload (RFC 5321 section 4.5.2).

use bytes::BufMut;

use super::Transport;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CrLf {
    None,
    HitCr,
    HitLf,
}

impl Transport {
    /// Appends `payload` to the output buffer with every line-leading
    /// `.` doubled, followed by the `.` end-of-data sequence.
    ///
    /// A payload not ending in CRLF gets one before the terminator so
    /// the `.` always sits on a line of its own.
    pub fn write_stashed(&mut self, payload: &[u8]) {
        #[cfg(feature = "log")]
        log_facade::trace!("C: <{} bytes of mail data>", payload.len());

        // worst case every payload line is a lone dot
        let out = self.out_buffer(payload.len() * 2 + 5);

        // the first payload byte starts a fresh line on the wire
        let mut state = CrLf::HitLf;
        for &byte in payload {
            let (stash, next) = match (byte, state) {
                (b'\r', _) => (false, CrLf::HitCr),
                (b'\n', CrLf::HitCr) => (false, CrLf::HitLf),
                (b'.', CrLf::HitLf) => (true, CrLf::None),
                // orphan CR or LF, legacy servers cope, so do we
                (_, _) => (false, CrLf::None),
            };
            state = next;
            if stash {
                out.put_u8(b'.');
            }
            out.put_u8(byte);
        }

        if state != CrLf::HitLf {
            out.put("\r\n");
        }
        out.put(".\r\n");
    }
}
