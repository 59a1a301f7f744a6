//! # Multipart Form Data
//!
//! Incremental `multipart/form-data` parser. Bytes are fed as they arrive
//! from the connection and every ceiling is checked on arrival, so an
//! oversized upload is refused before it is fully buffered.
//!
//! ```text
//! --boundary\r\n
//! Content-Disposition: form-data; name="field1"\r\n
//! \r\n
//! value1\r\n
//! --boundary\r\n
//! Content-Disposition: form-data; name="file"; filename="example.txt"\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! file contents...\r\n
//! --boundary--\r\n
//! ```
//!
//! Dropping a [`MultipartStream`] releases everything it holds.

use crate::decode::{Format, MediaType};
use crate::error::DecodeError;
use hyper::body::Bytes;
use serde::Deserialize;
use std::collections::HashMap;

/// Default maximum file size (10MB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum total upload size (50MB).
pub const DEFAULT_MAX_TOTAL_SIZE: usize = 50 * 1024 * 1024;

/// Default maximum size of a non-file field (64KB).
pub const DEFAULT_MAX_FIELD_SIZE: usize = 64 * 1024;

/// Default maximum number of files.
pub const DEFAULT_MAX_FILES: usize = 16;

/// Default maximum number of non-file fields.
pub const DEFAULT_MAX_FIELDS: usize = 100;

/// Maximum size of one part's header block.
const MAX_PART_HEADER_SIZE: usize = 8 * 1024;

/// Ceilings for multipart parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultipartOptions {
    /// Maximum size per file in bytes
    pub max_file_size: usize,
    /// Maximum size per non-file field in bytes
    pub max_field_size: usize,
    /// Maximum total upload size in bytes
    pub max_total_size: usize,
    /// Maximum number of files
    pub max_files: usize,
    /// Maximum number of non-file fields
    pub max_fields: usize,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            max_files: DEFAULT_MAX_FILES,
            max_fields: DEFAULT_MAX_FIELDS,
        }
    }
}

impl MultipartOptions {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum file size.
    #[must_use]
    pub const fn max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set the maximum non-file field size.
    #[must_use]
    pub const fn max_field_size(mut self, size: usize) -> Self {
        self.max_field_size = size;
        self
    }

    /// Set the maximum total upload size.
    #[must_use]
    pub const fn max_total_size(mut self, size: usize) -> Self {
        self.max_total_size = size;
        self
    }

    /// Set the maximum number of files.
    #[must_use]
    pub const fn max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    /// Set the maximum number of non-file fields.
    #[must_use]
    pub const fn max_fields(mut self, count: usize) -> Self {
        self.max_fields = count;
        self
    }
}

/// An uploaded file with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// The field name.
    pub field_name: String,
    /// The original filename.
    pub filename: String,
    /// Content-Type of the file.
    pub content_type: String,
    /// File contents.
    pub data: Bytes,
}

impl UploadedFile {
    /// Get the file size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Parsed multipart form data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    /// Text fields in arrival order
    pub fields: Vec<(String, String)>,
    /// Uploaded files in arrival order
    pub files: Vec<UploadedFile>,
}

impl MultipartForm {
    /// First value of a text field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// First file uploaded under a field name
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field_name == name)
    }
}

#[derive(Debug)]
struct PartMeta {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug)]
enum State {
    /// Skipping bytes before the first boundary
    Preamble,
    /// Just consumed a boundary, expecting CRLF or the closing `--`
    AfterBoundary,
    /// Reading a part's header block
    Headers,
    /// Reading a part's payload
    Body(PartMeta),
    /// Closing boundary seen, epilogue is discarded
    Done,
}

/// Streaming multipart parser
#[derive(Debug)]
pub struct MultipartStream {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    options: MultipartOptions,
    state: State,
    buffer: Vec<u8>,
    current: Vec<u8>,
    received: usize,
    form: MultipartForm,
}

/// Find `needle` in `haystack`
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn malformed(message: impl ToString) -> DecodeError {
    DecodeError::malformed(Format::FormData, message)
}

impl MultipartStream {
    /// Create a parser for the given boundary
    #[must_use]
    pub fn new(boundary: &str, options: MultipartOptions) -> Self {
        Self {
            dash_boundary: format!("--{boundary}").into_bytes(),
            delimiter: format!("\r\n--{boundary}").into_bytes(),
            options,
            state: State::Preamble,
            buffer: Vec::new(),
            current: Vec::new(),
            received: 0,
            form: MultipartForm::default(),
        }
    }

    /// Create a parser from a parsed `Content-Type`
    ///
    /// # Errors
    ///
    /// `MalformedPayload` when the boundary parameter is missing, empty or
    /// longer than 70 characters.
    pub fn from_media_type(
        media: &MediaType,
        options: MultipartOptions,
    ) -> Result<Self, DecodeError> {
        let boundary = media
            .param("boundary")
            .ok_or_else(|| malformed("missing boundary in multipart Content-Type"))?;
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(malformed("invalid multipart boundary"));
        }
        Ok(Self::new(boundary, options))
    }

    /// Bytes fed so far
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    /// Feed the next chunk of the body
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` as soon as any ceiling is crossed, `MalformedPayload`
    /// for framing errors.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        self.received += chunk.len();
        if self.received > self.options.max_total_size {
            return Err(DecodeError::PayloadTooLarge {
                scope: "total",
                limit: self.options.max_total_size,
                actual: self.received,
            });
        }
        if matches!(self.state, State::Done) {
            return Ok(());
        }
        self.buffer.extend_from_slice(chunk);

        while self.step()? {}
        Ok(())
    }

    /// Finish parsing after the last chunk
    ///
    /// # Errors
    ///
    /// `MalformedPayload` if the closing boundary was never seen.
    pub fn finish(self) -> Result<MultipartForm, DecodeError> {
        match self.state {
            State::Done => Ok(self.form),
            _ => Err(malformed("unexpected end of multipart body")),
        }
    }

    /// Advance the state machine; returns whether progress was made
    fn step(&mut self) -> Result<bool, DecodeError> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Preamble => {
                if let Some(pos) = find(&self.buffer, &self.dash_boundary) {
                    self.buffer.drain(..pos + self.dash_boundary.len());
                    self.state = State::AfterBoundary;
                    return Ok(true);
                }
                let keep = self.dash_boundary.len() - 1;
                let discard = self.buffer.len().saturating_sub(keep);
                self.buffer.drain(..discard);
                self.state = State::Preamble;
                Ok(false)
            }
            State::AfterBoundary => {
                if self.buffer.len() < 2 {
                    self.state = State::AfterBoundary;
                    return Ok(false);
                }
                if self.buffer.starts_with(b"--") {
                    self.buffer.clear();
                    self.state = State::Done;
                    return Ok(false);
                }
                if !self.buffer.starts_with(b"\r\n") {
                    return Err(malformed("expected CRLF after boundary"));
                }
                self.buffer.drain(..2);
                self.state = State::Headers;
                Ok(true)
            }
            State::Headers => {
                let end = if self.buffer.starts_with(b"\r\n") {
                    Some(0)
                } else {
                    find(&self.buffer, b"\r\n\r\n").map(|p| p + 2)
                };
                let Some(end) = end else {
                    if self.buffer.len() > MAX_PART_HEADER_SIZE {
                        return Err(DecodeError::PayloadTooLarge {
                            scope: "headers",
                            limit: MAX_PART_HEADER_SIZE,
                            actual: self.buffer.len(),
                        });
                    }
                    self.state = State::Headers;
                    return Ok(false);
                };
                let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
                let meta = self.begin_part(&block[..end])?;
                self.state = State::Body(meta);
                Ok(true)
            }
            State::Body(meta) => {
                if let Some(pos) = find(&self.buffer, &self.delimiter) {
                    self.append(&meta, pos)?;
                    self.buffer.drain(..self.delimiter.len());
                    self.end_part(meta)?;
                    self.state = State::AfterBoundary;
                    return Ok(true);
                }
                // Hold back a possible partial delimiter
                let keep = self.delimiter.len() - 1;
                let safe = self.buffer.len().saturating_sub(keep);
                self.append(&meta, safe)?;
                self.state = State::Body(meta);
                Ok(false)
            }
            State::Done => {
                self.buffer.clear();
                Ok(false)
            }
        }
    }

    /// Move `len` buffered bytes into the current part, enforcing its ceiling
    fn append(&mut self, meta: &PartMeta, len: usize) -> Result<(), DecodeError> {
        let size = self.current.len() + len;
        let (scope, limit) = if meta.filename.is_some() {
            ("file", self.options.max_file_size)
        } else {
            ("field", self.options.max_field_size)
        };
        if size > limit {
            return Err(DecodeError::PayloadTooLarge {
                scope,
                limit,
                actual: size,
            });
        }
        self.current.extend(self.buffer.drain(..len));
        Ok(())
    }

    fn begin_part(&self, block: &[u8]) -> Result<PartMeta, DecodeError> {
        let headers = parse_part_headers(block)?;
        let disposition = headers
            .get("content-disposition")
            .ok_or_else(|| malformed("missing Content-Disposition header in part"))?;
        let (name, filename) = parse_content_disposition(disposition)?;

        if filename.is_some() {
            if self.form.files.len() >= self.options.max_files {
                return Err(DecodeError::PayloadTooLarge {
                    scope: "files",
                    limit: self.options.max_files,
                    actual: self.form.files.len() + 1,
                });
            }
        } else if self.form.fields.len() >= self.options.max_fields {
            return Err(DecodeError::PayloadTooLarge {
                scope: "fields",
                limit: self.options.max_fields,
                actual: self.form.fields.len() + 1,
            });
        }

        Ok(PartMeta {
            name,
            filename,
            content_type: headers.get("content-type").cloned(),
        })
    }

    fn end_part(&mut self, meta: PartMeta) -> Result<(), DecodeError> {
        let data = std::mem::take(&mut self.current);
        match meta.filename {
            Some(filename) => self.form.files.push(UploadedFile {
                field_name: meta.name,
                filename,
                content_type: meta
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                data: Bytes::from(data),
            }),
            None => {
                let value = String::from_utf8(data)
                    .map_err(|_| malformed(format!("field '{}' is not valid UTF-8", meta.name)))?;
                self.form.fields.push((meta.name, value));
            }
        }
        Ok(())
    }
}

/// Parse a part's header block (without the blank line)
fn parse_part_headers(block: &[u8]) -> Result<HashMap<String, String>, DecodeError> {
    let text =
        std::str::from_utf8(block).map_err(|_| malformed("invalid UTF-8 in part headers"))?;
    let mut headers = HashMap::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("invalid part header line '{line}'")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

/// Parse Content-Disposition header value.
///
/// Format: `form-data; name="field"; filename="file.txt"`
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), DecodeError> {
    let mut name = None;
    let mut filename = None;

    for part in value.split(';').map(str::trim) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(unquote(raw)),
            "filename" => filename = Some(unquote(raw)),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| malformed("Content-Disposition is missing the name parameter"))?;
    Ok((name, filename))
}

/// Remove quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "XyZ123";

    fn body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, data) in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(f) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    fn parse_in_chunks(
        payload: &[u8],
        chunk: usize,
        options: MultipartOptions,
    ) -> Result<MultipartForm, DecodeError> {
        let mut stream = MultipartStream::new(BOUNDARY, options);
        for piece in payload.chunks(chunk) {
            stream.feed(piece)?;
        }
        stream.finish()
    }

    #[test]
    fn test_parse_fields_and_files() {
        let payload = body(&[
            ("title", None, b"quarterly report"),
            ("doc", Some("q3.txt"), b"line one\r\nline two"),
        ]);
        let form = parse_in_chunks(&payload, payload.len(), MultipartOptions::default()).unwrap();
        assert_eq!(form.field("title"), Some("quarterly report"));

        let file = form.file("doc").unwrap();
        assert_eq!(file.filename, "q3.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.data.as_ref(), b"line one\r\nline two");
    }

    #[test]
    fn test_result_is_independent_of_chunking() {
        let payload = body(&[
            ("a", None, b"1"),
            ("b", Some("b.bin"), b"--XyZ12 almost a boundary"),
        ]);
        let whole = parse_in_chunks(&payload, payload.len(), MultipartOptions::default()).unwrap();
        for size in [1, 3, 7, 16] {
            let chunked = parse_in_chunks(&payload, size, MultipartOptions::default()).unwrap();
            assert_eq!(chunked, whole, "chunk size {size}");
        }
    }

    #[test]
    fn test_file_ceiling_trips_before_full_buffering() {
        let big = vec![b'x'; 4096];
        let payload = body(&[("upload", Some("big.bin"), &big)]);
        let options = MultipartOptions::new().max_file_size(1024);

        let mut stream = MultipartStream::new(BOUNDARY, options);
        let mut fed = 0;
        let mut failure = None;
        for piece in payload.chunks(256) {
            fed += piece.len();
            if let Err(e) = stream.feed(piece) {
                failure = Some(e);
                break;
            }
        }
        assert!(matches!(
            failure,
            Some(DecodeError::PayloadTooLarge { scope: "file", limit: 1024, .. })
        ));
        assert!(fed < payload.len());
        assert!(stream.received() < big.len());
    }

    #[test]
    fn test_total_ceiling() {
        let payload = body(&[("a", None, b"0123456789")]);
        let err = parse_in_chunks(&payload, 8, MultipartOptions::new().max_total_size(32))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "total", .. }
        ));
    }

    #[test]
    fn test_field_and_file_counts() {
        let payload = body(&[("a", None, b"1"), ("b", None, b"2")]);
        let err = parse_in_chunks(&payload, 64, MultipartOptions::new().max_fields(1))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "fields", .. }
        ));

        let payload = body(&[("a", Some("a.txt"), b"1"), ("b", Some("b.txt"), b"2")]);
        let err =
            parse_in_chunks(&payload, 64, MultipartOptions::new().max_files(1)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadTooLarge { scope: "files", .. }
        ));
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let payload = body(&[("a", None, b"1")]);
        let truncated = &payload[..payload.len() - 12];
        let err = parse_in_chunks(truncated, 64, MultipartOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_missing_disposition() {
        let payload = format!("--{BOUNDARY}\r\nContent-Type: text/plain\r\n\r\nx\r\n--{BOUNDARY}--");
        let err = parse_in_chunks(payload.as_bytes(), 64, MultipartOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_boundary_from_media_type() {
        let media = MediaType::parse("multipart/form-data; boundary=\"abc\"");
        assert!(MultipartStream::from_media_type(&media, MultipartOptions::default()).is_ok());

        let media = MediaType::parse("multipart/form-data");
        assert!(MultipartStream::from_media_type(&media, MultipartOptions::default()).is_err());
    }

    #[test]
    fn test_parse_content_disposition() {
        let (name, filename) =
            parse_content_disposition("form-data; name=\"avatar\"; filename=\"me.png\"").unwrap();
        assert_eq!(name, "avatar");
        assert_eq!(filename.as_deref(), Some("me.png"));
        assert!(parse_content_disposition("form-data; filename=\"x\"").is_err());
    }
}
