use crate::error::IngestError;
use lopdf::Document;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Turns a file persisted in the scratch directory into plain text.
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, path: &Path) -> Result<String, IngestError>;
}

/// PDF text extraction through lopdf. Pages are joined with a blank line so
/// the whole document stays one text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn parse(&self, path: &Path) -> Result<String, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::ParseFailure(error.to_string()))?;

        let mut pages = Vec::new();
        for page_no in document.get_pages().keys() {
            let text = document
                .extract_text(&[*page_no])
                .map_err(|error| IngestError::ParseFailure(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(text);
            }
        }

        if pages.is_empty() {
            return Err(IngestError::ParseFailure(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages.join("\n\n"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn parse(&self, path: &Path) -> Result<String, IngestError> {
        let bytes = std::fs::read(path)?;
        String::from_utf8(bytes).map_err(|error| {
            IngestError::ParseFailure(format!("{} is not utf-8: {error}", path.display()))
        })
    }
}

/// Picks a parser from the object key's extension. Anything that isn't a PDF
/// is read as UTF-8 text.
pub fn parser_for_key(key: &str) -> Box<dyn DocumentParser> {
    let is_pdf = Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

    if is_pdf {
        Box::new(PdfParser)
    } else {
        Box::new(PlainTextParser)
    }
}

struct CleanupPatterns {
    trailing: Regex,
    blank_runs: Regex,
}

/// Compiled once per process.
fn cleanup_patterns() -> Result<&'static CleanupPatterns, IngestError> {
    static PATTERNS: OnceLock<Result<CleanupPatterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok(CleanupPatterns {
                trailing: Regex::new(r"(?m)[ \t\u{a0}]+$")?,
                blank_runs: Regex::new(r"\n{3,}")?,
            })
        })
        .as_ref()
        .map_err(|error| IngestError::InvalidArgument(error.to_string()))
}

/// Drops trailing spaces and collapses runs of blank lines to one, keeping
/// paragraph breaks intact.
pub fn clean_extracted_text(text: &str) -> Result<String, IngestError> {
    let patterns = cleanup_patterns()?;
    let normalized = text.replace("\r\n", "\n");
    let stripped = patterns.trailing.replace_all(&normalized, "");
    Ok(patterns
        .blank_runs
        .replace_all(&stripped, "\n\n")
        .trim()
        .to_string())
}
