//! Multipart upload planning and wire models

use crate::database::{BackupError, Result};

/// Byte range of one multipart part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into contiguous parts of `part_size`; only the last may be short
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartRange> {
    if part_size == 0 {
        return Vec::new();
    }

    let count = size.div_ceil(part_size);
    (1..=count)
        .map(|n| {
            let offset = (n - 1) * part_size;
            PartRange {
                number: u32::try_from(n).unwrap_or(u32::MAX),
                offset,
                len: part_size.min(size - offset),
            }
        })
        .collect()
}

/// A part acknowledged by the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Request body of the complete-multipart-upload call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartUpload {
    pub parts: Vec<CompletedPart>,
}

impl CompleteMultipartUpload {
    pub fn push(&mut self, part_number: u32, etag: String) {
        self.parts.push(CompletedPart { part_number, etag });
    }

    /// Render the manifest with parts in ascending order
    pub fn to_xml(&self) -> String {
        let mut parts: Vec<&CompletedPart> = self.parts.iter().collect();
        parts.sort_by_key(|p| p.part_number);

        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number,
                escape_xml(&part.etag)
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        xml
    }
}

/// Response body of the initiate-multipart-upload call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateMultipartUploadResult {
    pub upload_id: String,
}

impl InitiateMultipartUploadResult {
    pub fn parse(body: &str) -> Result<Self> {
        match element_text(body, "UploadId") {
            Some(upload_id) if !upload_id.is_empty() => Ok(Self { upload_id }),
            _ => Err(BackupError::Upload(
                "initiate multipart upload response carried no UploadId".to_string(),
            )),
        }
    }
}

/// Whether a response body is an S3 error document.
///
/// Complete-multipart-upload can answer 200 and still fail.
pub fn is_error_document(body: &str) -> bool {
    body.contains("<Error>")
}

/// Extract `<Code>` and `<Message>` from an error document, when present
pub fn error_summary(body: &str) -> Option<String> {
    let code = element_text(body, "Code")?;
    match element_text(body, "Message") {
        Some(message) => Some(format!("{}: {}", code, message)),
        None => Some(code),
    }
}

fn element_text(body: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(unescape_xml(body[start..end].trim()))
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
