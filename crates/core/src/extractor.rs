use crate::error::IngestError;
use lopdf::Document;
use regex::Regex;
use std::fs;
use std::io::Read;
use std::path::Path;

/// File formats the reader knows how to turn into plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
}

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["pdf", "docx", "txt"];

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path, max_pages: Option<usize>) -> Result<Vec<String>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path, max_pages: Option<usize>) -> Result<Vec<String>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let limit = max_pages.unwrap_or(usize::MAX);
        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages().into_iter().take(limit) {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;
            pages.push(text);
        }

        Ok(pages)
    }
}

/// Extracts normalized text from `path` according to `kind`.
///
/// An empty string is a valid result (scanned PDFs, blank documents); the
/// caller decides what to do with it.
pub fn extract_text(
    path: &Path,
    kind: DocumentKind,
    max_pages: Option<usize>,
) -> Result<String, IngestError> {
    match kind {
        DocumentKind::Pdf => read_pdf_text(&LopdfExtractor, path, max_pages),
        DocumentKind::Docx => read_docx_text(path),
        DocumentKind::Text => read_text_file(path),
    }
}

pub fn read_pdf_text(
    extractor: &impl PdfExtractor,
    path: &Path,
    max_pages: Option<usize>,
) -> Result<String, IngestError> {
    let pages = extractor.extract_pages(path, max_pages)?;
    Ok(pages.join("\n").trim().to_string())
}

pub fn read_docx_text(path: &Path) -> Result<String, IngestError> {
    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")?
        .read_to_string(&mut xml)?;

    Ok(docx_paragraphs(&xml)?.join("\n").trim().to_string())
}

/// Reads a text file, dropping byte sequences that are not valid UTF-8.
pub fn read_text_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    Ok(decode_utf8_ignoring_errors(&bytes).trim().to_string())
}

fn decode_utf8_ignoring_errors(mut bytes: &[u8]) -> String {
    let mut decoded = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                decoded.push_str(valid);
                return decoded;
            }
            Err(error) => {
                let (valid, rest) = bytes.split_at(error.valid_up_to());
                decoded.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let skip = error.error_len().unwrap_or(rest.len());
                bytes = &rest[skip..];
            }
        }
    }
}

const PARAGRAPH_PATTERN: &str = r"(?s)<w:p(?:\s[^>]*[^/])?>(.*?)</w:p>";
const RUN_TEXT_PATTERN: &str = r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|<w:tab/>";

/// Non-empty, trimmed paragraph texts of a WordprocessingML body.
fn docx_paragraphs(xml: &str) -> Result<Vec<String>, IngestError> {
    let paragraph_re = Regex::new(PARAGRAPH_PATTERN)?;
    let run_re = Regex::new(RUN_TEXT_PATTERN)?;

    let paragraphs = paragraph_re
        .captures_iter(xml)
        .filter_map(|paragraph| {
            let body = paragraph.get(1)?.as_str();
            let text: String = run_re
                .captures_iter(body)
                .map(|run| match run.get(1) {
                    Some(text) => unescape_xml(text.as_str()),
                    None => "\t".to_string(),
                })
                .collect();
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
        .collect();

    Ok(paragraphs)
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
