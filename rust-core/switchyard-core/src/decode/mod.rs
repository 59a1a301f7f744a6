//! # Content Dispatch
//!
//! Selects a format decoder from the request's `Content-Type` and runs it
//! under that format's resource ceilings.
//!
//! | media type | format |
//! |---|---|
//! | `application/json` | json |
//! | `text/csv`, `application/csv` | csv |
//! | `application/xml`, `text/xml` | xml |
//! | `application/x-yaml`, `text/yaml` | yaml |
//! | `multipart/form-data` | formdata |
//! | anything else, body present | binary |
//! | no body | none |
//!
//! Every decoder reports failures as [`DecodeError`]; nothing format
//! specific escapes this module.

pub mod csv;
pub mod json;
pub mod multipart;
pub mod xml;
pub mod yaml;

use crate::error::{DecodeError, Error, Result};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;

pub use self::csv::{CsvOptions, CsvTable, FieldPredicate};
pub use self::json::JsonOptions;
pub use self::multipart::{MultipartForm, MultipartOptions, MultipartStream, UploadedFile};
pub use self::xml::{XmlElement, XmlNode, XmlOptions};

/// Boxed error produced by request body sources
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased request body consumed by the dispatcher
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Default ceiling for non-multipart bodies (1 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Wrap in-memory bytes as a request body
pub fn full_body(bytes: impl Into<Bytes>) -> RequestBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

/// Detected wire format of a request body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// `application/json`
    Json,
    /// `text/csv`
    Csv,
    /// `application/xml`
    Xml,
    /// `application/x-yaml`
    Yaml,
    /// `multipart/form-data`
    FormData,
    /// Unrecognised media type with a body
    Binary,
    /// No body
    None,
}

impl Format {
    /// Look up a media type essence in the static table
    ///
    /// Returns `None` for types outside the table; the caller decides
    /// between `Binary` and `None` from body presence.
    #[must_use]
    pub fn from_media_type(essence: &str) -> Option<Self> {
        match essence {
            "application/json" => Some(Self::Json),
            "text/csv" | "application/csv" => Some(Self::Csv),
            "application/xml" | "text/xml" => Some(Self::Xml),
            "application/x-yaml" | "text/yaml" => Some(Self::Yaml),
            "multipart/form-data" => Some(Self::FormData),
            _ => None,
        }
    }

    /// Lowercase tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xml => "xml",
            Self::Yaml => "yaml",
            Self::FormData => "formdata",
            Self::Binary => "binary",
            Self::None => "none",
        }
    }

    const fn is_text(self) -> bool {
        matches!(self, Self::Json | Self::Csv | Self::Xml | Self::Yaml)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded request body, tagged by format
#[derive(Debug, Clone, Default)]
pub enum DecodedBody {
    /// No body present
    #[default]
    None,
    /// JSON document
    Json(serde_json::Value),
    /// Tabular data
    Csv(CsvTable),
    /// Markup tree
    Xml(XmlElement),
    /// YAML document
    Yaml(serde_yaml::Value),
    /// Form fields and uploaded files
    FormData(MultipartForm),
    /// Raw bytes of an unrecognised media type
    Binary(Bytes),
}

impl DecodedBody {
    /// Format tag of this body
    #[must_use]
    pub const fn format(&self) -> Format {
        match self {
            Self::None => Format::None,
            Self::Json(_) => Format::Json,
            Self::Csv(_) => Format::Csv,
            Self::Xml(_) => Format::Xml,
            Self::Yaml(_) => Format::Yaml,
            Self::FormData(_) => Format::FormData,
            Self::Binary(_) => Format::Binary,
        }
    }

    /// JSON value, if this is a JSON body
    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Form data, if this is a multipart body
    #[must_use]
    pub const fn as_form(&self) -> Option<&MultipartForm> {
        match self {
            Self::FormData(f) => Some(f),
            _ => None,
        }
    }
}

/// Per-format decode configuration
///
/// Defaults are safe: XML external entities and DTDs are refused and every
/// ceiling is finite. Routes may carry their own copy; otherwise the
/// pipeline-wide options apply.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Ceiling for json, csv, xml, yaml and binary bodies
    pub max_body_size: usize,
    /// JSON settings
    pub json: JsonOptions,
    /// CSV settings
    pub csv: CsvOptions,
    /// XML settings
    pub xml: XmlOptions,
    /// Multipart settings (has its own byte ceilings)
    pub multipart: MultipartOptions,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            json: JsonOptions::default(),
            csv: CsvOptions::default(),
            xml: XmlOptions::default(),
            multipart: MultipartOptions::default(),
        }
    }
}

impl DecodeOptions {
    /// Create options with safe defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ceiling for non-multipart bodies
    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Replace the JSON settings
    #[must_use]
    pub fn json(mut self, json: JsonOptions) -> Self {
        self.json = json;
        self
    }

    /// Replace the CSV settings
    #[must_use]
    pub fn csv(mut self, csv: CsvOptions) -> Self {
        self.csv = csv;
        self
    }

    /// Replace the XML settings
    #[must_use]
    pub fn xml(mut self, xml: XmlOptions) -> Self {
        self.xml = xml;
        self
    }

    /// Replace the multipart settings
    #[must_use]
    pub fn multipart(mut self, multipart: MultipartOptions) -> Self {
        self.multipart = multipart;
        self
    }
}

/// Parsed `Content-Type` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lowercased `type/subtype`
    pub essence: String,
    /// Parameters with lowercased names and unquoted values
    pub params: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a header value such as `text/csv; charset="utf-8"`
    #[must_use]
    pub fn parse(header: &str) -> Self {
        let mut parts = header.split(';');
        let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let params = parts
            .filter_map(|p| {
                let (name, value) = p.split_once('=')?;
                let value = value.trim().trim_matches('"');
                Some((name.trim().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Self { essence, params }
    }

    fn default_multipart() -> Self {
        Self {
            essence: "multipart/form-data".to_string(),
            params: Vec::new(),
        }
    }

    /// Look up a parameter by (lowercase) name
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Resolve the format a request declares
fn detect(media: Option<&MediaType>, has_body: bool) -> Format {
    if !has_body {
        return Format::None;
    }
    media
        .and_then(|m| Format::from_media_type(&m.essence))
        .unwrap_or(Format::Binary)
}

fn check_charset(media: &MediaType) -> std::result::Result<(), DecodeError> {
    match media.param("charset").map(str::to_ascii_lowercase) {
        None => Ok(()),
        Some(cs) if matches!(cs.as_str(), "utf-8" | "utf8" | "us-ascii") => Ok(()),
        Some(cs) => Err(DecodeError::UnsupportedFormat {
            media_type: media.essence.clone(),
            reason: format!("charset '{cs}' is not supported"),
        }),
    }
}

/// Decode an in-memory body
///
/// # Errors
///
/// Returns a `DecodeError` when the body violates a ceiling or is not
/// valid for its declared format.
pub fn dispatch_bytes(
    content_type: Option<&str>,
    bytes: &[u8],
    options: &DecodeOptions,
) -> std::result::Result<(DecodedBody, Format), DecodeError> {
    let media = content_type.map(MediaType::parse);
    let format = detect(media.as_ref(), !bytes.is_empty());

    if format == Format::FormData {
        let media = media.as_ref().map_or_else(MediaType::default_multipart, Clone::clone);
        let mut stream = MultipartStream::from_media_type(&media, options.multipart)?;
        stream.feed(bytes)?;
        return Ok((DecodedBody::FormData(stream.finish()?), format));
    }

    if bytes.len() > options.max_body_size {
        return Err(DecodeError::PayloadTooLarge {
            scope: "body",
            limit: options.max_body_size,
            actual: bytes.len(),
        });
    }

    decode_buffered(format, media.as_ref(), bytes, options)
}

fn decode_buffered(
    format: Format,
    media: Option<&MediaType>,
    bytes: &[u8],
    options: &DecodeOptions,
) -> std::result::Result<(DecodedBody, Format), DecodeError> {
    if format.is_text() {
        if let Some(media) = media {
            check_charset(media)?;
        }
    }

    let body = match format {
        Format::None => DecodedBody::None,
        Format::Json => DecodedBody::Json(json::decode(bytes, &options.json)?),
        Format::Csv => DecodedBody::Csv(csv::decode(bytes, &options.csv)?),
        Format::Xml => DecodedBody::Xml(xml::decode(bytes, &options.xml)?),
        Format::Yaml => DecodedBody::Yaml(yaml::decode(bytes)?),
        Format::Binary => DecodedBody::Binary(Bytes::copy_from_slice(bytes)),
        Format::FormData => unreachable!("multipart bodies are streamed"),
    };
    Ok((body, format))
}

/// Read and decode a streaming request body
///
/// `Content-Length` is checked against the ceiling before any byte is
/// read; the body is then consumed chunk by chunk with a running total.
/// Multipart bodies go through [`MultipartStream`] so file ceilings trip
/// as bytes arrive.
///
/// # Errors
///
/// `Error::Decode` for format and ceiling failures, `Error::PipelineFatal`
/// when the body source itself fails.
pub async fn dispatch(
    content_type: Option<&str>,
    content_length: Option<usize>,
    mut body: RequestBody,
    options: &DecodeOptions,
) -> Result<(DecodedBody, Format)> {
    let media = content_type.map(MediaType::parse);
    let declared = media
        .as_ref()
        .and_then(|m| Format::from_media_type(&m.essence));

    if declared == Some(Format::FormData) {
        let limit = options.multipart.max_total_size;
        check_declared_length(content_length, limit)?;
        let media = media.as_ref().map_or_else(MediaType::default_multipart, Clone::clone);
        let mut stream = MultipartStream::from_media_type(&media, options.multipart)?;
        let mut seen = 0usize;
        while let Some(chunk) = next_chunk(&mut body).await? {
            seen += chunk.len();
            stream.feed(&chunk)?;
        }
        if seen == 0 {
            return Ok((DecodedBody::None, Format::None));
        }
        return Ok((DecodedBody::FormData(stream.finish()?), Format::FormData));
    }

    check_declared_length(content_length, options.max_body_size)?;
    let bytes = collect_limited(&mut body, options.max_body_size).await?;
    let format = detect(media.as_ref(), !bytes.is_empty());
    Ok(decode_buffered(format, media.as_ref(), &bytes, options)?)
}

fn check_declared_length(content_length: Option<usize>, limit: usize) -> Result<()> {
    match content_length {
        Some(len) if len > limit => Err(DecodeError::PayloadTooLarge {
            scope: "body",
            limit,
            actual: len,
        }
        .into()),
        _ => Ok(()),
    }
}

async fn next_chunk(body: &mut RequestBody) -> Result<Option<Bytes>> {
    loop {
        match body.frame().await {
            None => return Ok(None),
            Some(Err(e)) => {
                return Err(Error::PipelineFatal {
                    message: format!("failed to read request body: {e}"),
                })
            }
            Some(Ok(frame)) => {
                // Trailers carry no payload
                if let Ok(data) = frame.into_data() {
                    return Ok(Some(data));
                }
            }
        }
    }
}

async fn collect_limited(body: &mut RequestBody, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = next_chunk(body).await? {
        let total = buf.len() + chunk.len();
        if total > limit {
            return Err(DecodeError::PayloadTooLarge {
                scope: "body",
                limit,
                actual: total,
            }
            .into());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}
