//! Outbound mail messages and their attachments.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::mime;

/// Which recipient list an address belongs to.
///
/// `Bcc` recipients are part of the envelope but are never rendered
/// into the message headers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

/// An outbound e-mail.
///
/// Addresses may use the `Name <addr>` display form, the envelope
/// extracts the bare address. The message is moved into the session
/// queue on `send` and owned by it until delivered or dropped.
#[derive(Debug, Default)]
pub struct Message {
    sender: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    body: String,
    extra_headers: HashMap<String, String>,
    attachments: Vec<(String, Attachment)>,
}

impl Message {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn set_sender<I: Into<String>>(&mut self, sender: I) {
        self.sender = sender.into();
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn set_subject<I: Into<String>>(&mut self, subject: I) {
        self.subject = subject.into();
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body<I: Into<String>>(&mut self, body: I) {
        self.body = body.into();
    }

    pub fn add_recipient<I: Into<String>>(&mut self, kind: RecipientKind, address: I) {
        self.recipient_list_mut(kind).push(address.into());
    }

    pub fn recipients(&self, kind: RecipientKind) -> &[String] {
        match kind {
            RecipientKind::To => &self.to,
            RecipientKind::Cc => &self.cc,
            RecipientKind::Bcc => &self.bcc,
        }
    }

    /// To, Cc and Bcc concatenated in that order, as used for RCPT.
    pub(crate) fn envelope_recipients(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(self.to.len() + self.cc.len() + self.bcc.len());
        all.extend_from_slice(&self.to);
        all.extend_from_slice(&self.cc);
        all.extend_from_slice(&self.bcc);
        all
    }

    /// Sets a header next to the canonical ones the renderer emits.
    ///
    /// Keys are stored lowercased; a key the renderer produces itself
    /// (`From`, `To`, `Subject`, ...) is ignored at render time.
    pub fn set_extra_header<K: AsRef<str>, V: Into<String>>(&mut self, key: K, value: V) {
        self.extra_headers
            .insert(key.as_ref().to_lowercase(), value.into());
    }

    pub fn extra_header(&self, key: &str) -> Option<&str> {
        self.extra_headers
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    pub fn has_extra_header(&self, key: &str) -> bool {
        self.extra_headers.contains_key(&key.to_lowercase())
    }

    pub fn remove_extra_header(&mut self, key: &str) {
        self.extra_headers.remove(&key.to_lowercase());
    }

    pub(crate) fn extra_headers(&self) -> &HashMap<String, String> {
        &self.extra_headers
    }

    /// Adds an attachment under the given file name.
    ///
    /// A name already in use is changed to `name.1`, `name.2` and so on, so no
    /// attachment is ever silently replaced.
    pub fn add_attachment<I: Into<String>>(&mut self, filename: I, attachment: Attachment) {
        insert_part(&mut self.attachments, filename.into(), attachment);
    }

    pub fn attachment(&self, filename: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(_, attachment)| attachment)
    }

    pub fn remove_attachment(&mut self, filename: &str) {
        self.attachments.retain(|(name, _)| name != filename);
    }

    pub fn attachments(&self) -> &[(String, Attachment)] {
        &self.attachments
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut [(String, Attachment)] {
        &mut self.attachments
    }

    fn recipient_list_mut(&mut self, kind: RecipientKind) -> &mut Vec<String> {
        match kind {
            RecipientKind::To => &mut self.to,
            RecipientKind::Cc => &mut self.cc,
            RecipientKind::Bcc => &mut self.bcc,
        }
    }
}

/// A message part: either a leaf payload or a multipart container.
///
/// Leaf payloads are base64 encoded when rendered. A `multipart/*`
/// content type carries a boundary and the part renders its children
/// between boundary lines instead.
pub struct Attachment {
    content_type: String,
    boundary: String,
    content: Content,
    extra_headers: HashMap<String, String>,
    children: Vec<(String, Attachment)>,
}

enum Content {
    None,
    Buffer(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

impl Attachment {
    /// A `text/plain` part over an in-memory buffer.
    pub fn new<B: Into<Vec<u8>>>(content: B) -> Self {
        Attachment::with_type(content, "text/plain")
    }

    pub fn with_type<B: Into<Vec<u8>>>(content: B, content_type: &str) -> Self {
        let mut attachment = Attachment::bare();
        attachment.set_content_type(content_type);
        attachment.content = Content::Buffer(content.into());
        attachment
    }

    /// A part whose payload is pulled from `reader` and cached on
    /// first use.
    pub fn from_reader(reader: Box<dyn Read + Send>, content_type: &str) -> Self {
        let mut attachment = Attachment::bare();
        attachment.set_content_type(content_type);
        attachment.content = Content::Stream(reader);
        attachment
    }

    /// A part streaming a file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P, content_type: &str) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Attachment::from_reader(Box::new(file), content_type))
    }

    fn bare() -> Self {
        Attachment {
            content_type: "text/plain".to_owned(),
            boundary: String::new(),
            content: Content::None,
            extra_headers: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Sets the content type of the part.
    ///
    /// For a `multipart/*` type the `boundary=` parameter is picked out
    /// of the value; without one a boundary is generated and appended
    /// to the stored type.
    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_owned();
        if is_multipart_type(content_type) {
            match parse_boundary(content_type) {
                Some(boundary) => self.boundary = boundary,
                None => {
                    let boundary = mime::gen_boundary();
                    self.content_type.push_str("; boundary=");
                    self.content_type.push_str(&boundary);
                    self.boundary = boundary;
                }
            }
        }
    }

    pub(crate) fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Sets a per-part header.
    ///
    /// `Content-Type` is routed to [`set_content_type`](Attachment::set_content_type),
    /// everything else is stored with a lowercased key.
    pub fn set_extra_header<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) {
        if key.as_ref().eq_ignore_ascii_case("content-type") {
            self.set_content_type(value.as_ref());
        } else {
            self.extra_headers
                .insert(key.as_ref().to_lowercase(), value.as_ref().to_owned());
        }
    }

    pub fn extra_header(&self, key: &str) -> Option<&str> {
        self.extra_headers
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    pub fn has_extra_header(&self, key: &str) -> bool {
        self.extra_headers.contains_key(&key.to_lowercase())
    }

    pub fn remove_extra_header(&mut self, key: &str) {
        self.extra_headers.remove(&key.to_lowercase());
    }

    pub(crate) fn extra_headers(&self) -> &HashMap<String, String> {
        &self.extra_headers
    }

    /// Nests a child part, for `multipart/*` containers.
    ///
    /// Duplicate names are renamed `name.1`, `name.2` and so on, like message
    /// level attachments.
    pub fn add_child<I: Into<String>>(&mut self, filename: I, attachment: Attachment) {
        insert_part(&mut self.children, filename.into(), attachment);
    }

    pub fn children(&self) -> &[(String, Attachment)] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut [(String, Attachment)] {
        &mut self.children
    }

    pub fn is_multipart(&self) -> bool {
        !self.children.is_empty() || is_multipart_type(&self.content_type)
    }

    /// Hint whether the content type denotes textual data.
    ///
    /// `false` means "unsure", not "binary".
    pub fn is_text(&self) -> bool {
        let content_type = self.content_type.to_lowercase();
        let bare = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        bare.starts_with("text/")
            || bare == "application/xml"
            || bare == "application/json"
            || bare.ends_with("+xml")
    }

    /// The payload bytes.
    ///
    /// A stream source is drained into an owned buffer on the first
    /// call and the cache is served afterwards.
    pub fn raw_data(&mut self) -> io::Result<&[u8]> {
        let cached = match self.content {
            Content::Stream(ref mut reader) => {
                let mut cache = Vec::new();
                reader.read_to_end(&mut cache)?;
                Some(cache)
            }
            _ => None,
        };
        if let Some(cache) = cached {
            self.content = Content::Buffer(cache);
        }
        match self.content {
            Content::Buffer(ref data) => Ok(data),
            _ => Ok(b""),
        }
    }
}

impl Debug for Attachment {
    fn fmt(&self, fter: &mut fmt::Formatter) -> fmt::Result {
        let content = match self.content {
            Content::None => "none".to_owned(),
            Content::Buffer(ref data) => format!("{} buffered bytes", data.len()),
            Content::Stream(_) => "unread stream".to_owned(),
        };
        fter.debug_struct("Attachment")
            .field("content_type", &self.content_type)
            .field("content", &content)
            .field("children", &self.children.len())
            .finish()
    }
}

pub(crate) fn is_multipart_type(content_type: &str) -> bool {
    content_type.len() >= 9 && content_type[..9].eq_ignore_ascii_case("multipart")
}

/// Picks the value of a `boundary=` parameter out of a content type,
/// everything up to the next space, semicolon or CR.
fn parse_boundary(content_type: &str) -> Option<String> {
    let needle = b"boundary=";
    let start = content_type
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))?
        + needle.len();
    let rest = &content_type[start..];
    let end = rest
        .find(|ch| ch == ' ' || ch == ';' || ch == '\r')
        .unwrap_or_else(|| rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_owned())
}

fn insert_part(list: &mut Vec<(String, Attachment)>, filename: String, attachment: Attachment) {
    let taken = |list: &[(String, Attachment)], name: &str| {
        list.iter().any(|(existing, _)| existing == name)
    };
    let name = if taken(list, &filename) {
        #[cfg(feature = "log")]
        log_facade::warn!("attachment name {:?} already in use", filename);
        let mut counter = 1;
        loop {
            let candidate = format!("{}.{}", filename, counter);
            if !taken(list, &candidate) {
                break candidate;
            }
            counter += 1;
        }
    } else {
        filename
    };
    list.push((name, attachment));
}
