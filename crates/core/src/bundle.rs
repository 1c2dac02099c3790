//! Response payloads: one DOCX for a single upload, a zip bundle with a
//! per-file report when several files were uploaded.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::batch::BatchResult;
use crate::error::PipelineError;
use crate::job::JobOutcome;

pub const BUNDLE_FILE_NAME: &str = "converted-documents.zip";
pub const REPORT_FILE_NAME: &str = "report.json";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug)]
pub enum ConversionPayload {
    Document {
        file_name: String,
        bytes: Vec<u8>,
    },
    Archive {
        file_name: String,
        bytes: Vec<u8>,
        converted: usize,
        failed: usize,
    },
}

impl ConversionPayload {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Document { file_name, .. } | Self::Archive { file_name, .. } => file_name,
        }
    }
}

#[derive(Debug, Serialize)]
struct BundleReport<'a> {
    request_id: &'a str,
    converted: usize,
    failed: usize,
    files: &'a [JobOutcome],
}

/// Turns a finished batch into what the client downloads.
///
/// A single upload yields its DOCX or its own error. Several uploads yield
/// a zip as long as at least one converted; otherwise `BatchFailed`.
pub fn build_payload(mut result: BatchResult) -> Result<ConversionPayload, PipelineError> {
    if result.reports.len() == 1 {
        let report = result.reports.remove(0);
        return match (report.document, report.error) {
            (Some(bytes), _) => Ok(ConversionPayload::Document {
                file_name: report.job.output_name,
                bytes,
            }),
            (None, Some(error)) => Err(error),
            (None, None) => Err(PipelineError::ServerFault(format!(
                "job for '{}' finished without output or error",
                report.job.source_name
            ))),
        };
    }

    let converted = result.converted();
    if converted == 0 {
        return Err(PipelineError::BatchFailed {
            outcomes: result.outcomes(),
        });
    }

    let bytes = write_bundle(&result).context("failed to build zip bundle")?;
    Ok(ConversionPayload::Archive {
        file_name: BUNDLE_FILE_NAME.to_string(),
        bytes,
        converted,
        failed: result.failed(),
    })
}

fn write_bundle(result: &BatchResult) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    let mut names = UniqueNames::default();
    names.reserve(REPORT_FILE_NAME);
    for report in &result.reports {
        let Some(document) = &report.document else {
            continue;
        };
        let entry = names.claim(&report.job.output_name);
        writer
            .start_file(entry.as_str(), options)
            .with_context(|| format!("failed to add '{entry}' to bundle"))?;
        writer.write_all(document)?;
    }

    let outcomes = result.outcomes();
    let report = BundleReport {
        request_id: &result.request_id,
        converted: result.converted(),
        failed: result.failed(),
        files: &outcomes,
    };
    writer.start_file(REPORT_FILE_NAME, options)?;
    writer.write_all(&serde_json::to_vec_pretty(&report)?)?;

    Ok(writer.finish()?.into_inner())
}

/// Hands out entry names, suffixing repeats as `name (2).docx`.
#[derive(Default)]
struct UniqueNames {
    taken: HashSet<String>,
}

impl UniqueNames {
    fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_lowercase());
    }

    fn claim(&mut self, name: &str) -> String {
        if self.taken.insert(name.to_lowercase()) {
            return name.to_string();
        }
        let (stem, ext) = match name.rfind('.') {
            Some(idx) if idx > 0 => name.split_at(idx),
            _ => (name, ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{stem} ({n}){ext}");
            if self.taken.insert(candidate.to_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// `attachment` disposition with an ASCII fallback plus the RFC 5987
/// `filename*` form for non-ASCII names.
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        percent_encode(file_name)
    )
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::Path;

    use super::*;
    use crate::batch::JobReport;
    use crate::job::{ConversionJob, JobStatus};

    fn succeeded(name: &str, body: &[u8]) -> JobReport {
        let mut job = ConversionJob::new("req", Path::new("/w"), name);
        job.mark_running();
        job.mark_succeeded();
        JobReport {
            job,
            error: None,
            document: Some(body.to_vec()),
        }
    }

    fn failed(name: &str) -> JobReport {
        let mut job = ConversionJob::new("req", Path::new("/w"), name);
        job.mark_running();
        job.mark_failed("conversion_process_failed", "broken xref".to_string());
        JobReport {
            job,
            error: Some(PipelineError::ConversionProcessFailed {
                file: name.to_string(),
                detail: "broken xref".to_string(),
            }),
            document: None,
        }
    }

    fn batch(reports: Vec<JobReport>) -> BatchResult {
        BatchResult {
            request_id: "req".to_string(),
            reports,
        }
    }

    fn read_entry(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("open zip");
        let mut entry = archive.by_name(name).expect("zip entry");
        let mut out = Vec::new();
        entry.read_to_end(&mut out).expect("read entry");
        out
    }

    #[test]
    fn single_success_is_the_bare_document() {
        let payload = build_payload(batch(vec![succeeded("report.pdf", b"docx")])).expect("payload");
        match payload {
            ConversionPayload::Document { file_name, bytes } => {
                assert_eq!(file_name, "report.docx");
                assert_eq!(bytes, b"docx");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn single_failure_surfaces_its_own_error() {
        let err = build_payload(batch(vec![failed("report.pdf")])).unwrap_err();
        assert_eq!(err.kind(), "conversion_process_failed");
    }

    #[test]
    fn all_failed_batch_lists_every_file() {
        let err = build_payload(batch(vec![failed("a.pdf"), failed("b.pdf")])).unwrap_err();
        match err {
            PipelineError::BatchFailed { outcomes } => {
                assert_eq!(outcomes.len(), 2);
                assert!(outcomes.iter().all(|o| o.status == JobStatus::Failed));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn partial_success_bundles_documents_and_report() {
        let payload = build_payload(batch(vec![
            succeeded("a.pdf", b"first"),
            failed("b.pdf"),
            succeeded("a.pdf", b"second"),
        ]))
        .expect("payload");

        let ConversionPayload::Archive {
            file_name,
            bytes,
            converted,
            failed,
        } = payload
        else {
            panic!("expected archive");
        };
        assert_eq!(file_name, BUNDLE_FILE_NAME);
        assert_eq!((converted, failed), (2, 1));
        assert_eq!(read_entry(&bytes, "a.docx"), b"first");
        assert_eq!(read_entry(&bytes, "a (2).docx"), b"second");

        let report: serde_json::Value =
            serde_json::from_slice(&read_entry(&bytes, REPORT_FILE_NAME)).expect("report json");
        assert_eq!(report["converted"], 2);
        assert_eq!(report["files"][1]["status"], "failed");
        assert_eq!(report["files"][1]["error"], "broken xref");
    }

    #[test]
    fn unique_names_are_case_insensitive_and_avoid_report() {
        let mut names = UniqueNames::default();
        names.reserve(REPORT_FILE_NAME);
        assert_eq!(names.claim("Report.docx"), "Report.docx");
        assert_eq!(names.claim("report.docx"), "report (2).docx");
        assert_eq!(names.claim("report.json"), "report (2).json");
        assert_eq!(names.claim("noext"), "noext");
        assert_eq!(names.claim("noext"), "noext (2)");
    }

    #[test]
    fn disposition_escapes_non_ascii_names() {
        assert_eq!(
            content_disposition("report.docx"),
            "attachment; filename=\"report.docx\"; filename*=UTF-8''report.docx"
        );
        assert_eq!(
            content_disposition("résumé \"v2\".docx"),
            "attachment; filename=\"r_sum_ _v2_.docx\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22v2%22.docx"
        );
    }
}
