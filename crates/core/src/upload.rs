//! Upload intake: accepted files, their display names and validation.

use crate::config::LimitsConfig;
use crate::error::PipelineError;

/// Multipart field carrying the PDF parts.
pub const UPLOAD_FIELD: &str = "pdf";
pub const PDF_MAGIC: &[u8; 4] = b"%PDF";
pub const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const FALLBACK_NAME: &str = "document.pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Display name only; never used to build a filesystem path.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(raw_name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: display_name(raw_name),
            bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn has_pdf_magic(&self) -> bool {
        has_pdf_magic(&self.bytes)
    }
}

pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Last path segment of a client-supplied name. Browsers on Windows send
/// `C:\fakepath\name.pdf`, so both separators are honoured.
pub fn display_name(raw: &str) -> String {
    let segment = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(char::is_control);

    if segment.is_empty() || segment == "." || segment == ".." {
        FALLBACK_NAME.to_string()
    } else {
        segment.to_string()
    }
}

/// `report.pdf` -> `report.docx`; names without a `.pdf` suffix get
/// `.docx` appended.
pub fn docx_name(name: &str) -> String {
    let stem = match name.len().checked_sub(4) {
        Some(split) if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(".pdf") => {
            &name[..split]
        }
        _ => name,
    };
    let stem = if stem.is_empty() { "document" } else { stem };
    format!("{stem}.docx")
}

/// Request-level checks run before any job is created. One bad file rejects
/// the whole batch.
pub fn validate_batch(files: &[UploadedFile], limits: &LimitsConfig) -> Result<(), PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::NoFileProvided);
    }

    if limits.max_files > 0 && files.len() > limits.max_files {
        return Err(PipelineError::TooManyFiles {
            count: files.len(),
            max: limits.max_files,
        });
    }

    for file in files {
        check_size(&file.name, file.size_bytes(), limits)?;
        if !file.has_pdf_magic() {
            return Err(PipelineError::InvalidPdf {
                file: file.name.clone(),
            });
        }
    }

    Ok(())
}

pub fn check_size(name: &str, size_bytes: u64, limits: &LimitsConfig) -> Result<(), PipelineError> {
    if size_bytes > limits.max_file_bytes {
        return Err(PipelineError::FileTooLarge {
            file: name.to_string(),
            limit_mb: limits.max_file_bytes / (1024 * 1024),
        });
    }
    Ok(())
}
