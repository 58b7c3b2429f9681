//! Media-type driven text extraction for uploaded documents.
//!
//! Pipeline-layer: the object store supplies bytes plus the declared media
//! type; this module returns plain UTF-8 text. Image media types are never
//! extractable here — the analysis step consumes image bytes directly.

use std::io::Read;

use thiserror::Error;

use crate::error::Error as CoreError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_JSON: &str = "application/json";
pub const MIME_CSV: &str = "text/csv";

/// Code media types accepted for pass-through decoding.
const CODE_MIME_TYPES: &[&str] = &[
    "text/javascript",
    "text/typescript",
    "application/javascript",
    "application/typescript",
    "text/x-python",
    "text/x-java",
    "text/x-go",
    "text/x-rust",
];

/// Maximum sheets to process in an xlsx workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from one ZIP entry (zip-bomb bound).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("media type {0} is not text-extractable")]
    NotExtractable(String),
    #[error("content is not valid UTF-8: {0}")]
    Encoding(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl ExtractError {
    /// Extraction is a pure transform over bytes already in hand, so every
    /// failure is a malformed-document failure. The orchestrator treats
    /// these as fatal rather than retrying.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<ExtractError> for CoreError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::UnsupportedMediaType(mt) | ExtractError::NotExtractable(mt) => {
                CoreError::UnsupportedMediaType(mt)
            }
            other => CoreError::Extraction(other.to_string()),
        }
    }
}

/// Whether this media type's bytes skip extraction and go straight to the
/// image analyzer.
pub fn is_image_media_type(media_type: &str) -> bool {
    media_type.starts_with("image/")
}

/// Extract plain text from document bytes according to the declared media
/// type.
pub fn extract_text(bytes: &[u8], media_type: &str) -> Result<String, ExtractError> {
    if is_image_media_type(media_type) {
        return Err(ExtractError::NotExtractable(media_type.to_string()));
    }

    match media_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_JSON | MIME_CSV => decode_utf8(bytes),
        mt if mt.starts_with("text/") => decode_utf8(bytes),
        mt if CODE_MIME_TYPES.contains(&mt) => decode_utf8(bytes),
        other => Err(ExtractError::UnsupportedMediaType(other.to_string())),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

// ============ DOCX ============

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    if archive.by_name("word/document.xml").is_err() {
        return Err(ExtractError::Ooxml(
            "word/document.xml not found".to_string(),
        ));
    }
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    extract_docx_runs(&doc_xml)
}

/// Collect `<w:t>` text runs; paragraph ends become newlines, all other
/// formatting is discarded.
fn extract_docx_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

// ============ XLSX ============

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = read_workbook_sheet_names(&mut archive)?;
    let sheet_files = list_worksheet_files(&mut archive)?;

    let mut out = String::new();
    for (idx, file) in sheet_files.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &file)?;
        let body = extract_sheet_rows(&sheet_xml, &shared_strings)?;

        if idx > 0 {
            out.push_str("\n\n");
        }
        let heading = sheet_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        out.push_str("## ");
        out.push_str(&heading);
        out.push('\n');
        out.push_str(&body);
    }
    Ok(out)
}

/// Sheet display names in workbook order, from `xl/workbook.xml`.
fn read_workbook_sheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = match read_zip_entry_bounded(archive, "xl/workbook.xml") {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };
    let mut names = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"name" {
                            names.push(String::from_utf8_lossy(attr.value.as_ref()).into_owned());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    // Workbooks with no string cells carry no sharedStrings part.
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml") {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_files(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    Ok(names)
}

/// Serialize one worksheet: cells joined by tabs, rows by newlines.
/// Shared-string cells are resolved through the shared-strings table;
/// numeric cells keep their literal value.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut lines: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if cell_is_shared_str {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(text) = resolved {
                        row.push(text);
                        cell_count += 1;
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => cell_is_shared_str = false,
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join("\t"));
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_text_passes_through() {
        let text = extract_text(b"hello world", "text/plain").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn json_and_code_pass_through() {
        assert_eq!(
            extract_text(b"{\"a\":1}", MIME_JSON).unwrap(),
            "{\"a\":1}"
        );
        assert_eq!(
            extract_text(b"fn main() {}", "text/x-rust").unwrap(),
            "fn main() {}"
        );
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let err = extract_text(&[0xff, 0xfe, 0x01], "text/plain").unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    #[test]
    fn images_are_not_extractable() {
        let err = extract_text(b"\x89PNG", "image/png").unwrap_err();
        assert!(matches!(err, ExtractError::NotExtractable(_)));
    }

    #[test]
    fn unknown_media_type_is_unsupported() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedMediaType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn extraction_errors_are_never_retryable() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(!err.is_retryable());
    }

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn docx_runs_concatenate_with_paragraph_breaks() {
        let doc = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let bytes = build_zip(&[("word/document.xml", doc)]);
        let text = extract_text(&bytes, MIME_DOCX).unwrap();
        assert_eq!(text, "First paragraph.\nSecond paragraph.");
    }

    #[test]
    fn xlsx_sheets_get_headings_and_flat_rows() {
        let workbook = r#"<?xml version="1.0"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheets>
    <sheet name="Budget" sheetId="1"/>
    <sheet name="Notes" sheetId="2"/>
  </sheets>
</workbook>"#;
        let shared = r#"<?xml version="1.0"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <si><t>item</t></si>
  <si><t>cost</t></si>
  <si><t>laptop</t></si>
  <si><t>remember receipts</t></si>
</sst>"#;
        let sheet1 = r#"<?xml version="1.0"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
    <row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>1200</v></c></row>
  </sheetData>
</worksheet>"#;
        let sheet2 = r#"<?xml version="1.0"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>3</v></c></row>
  </sheetData>
</worksheet>"#;

        let bytes = build_zip(&[
            ("xl/workbook.xml", workbook),
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet1),
            ("xl/worksheets/sheet2.xml", sheet2),
        ]);

        let text = extract_text(&bytes, MIME_XLSX).unwrap();
        assert!(text.contains("## Budget"));
        assert!(text.contains("item\tcost"));
        assert!(text.contains("laptop\t1200"));
        assert!(text.contains("## Notes"));
        assert!(text.contains("remember receipts"));
        // Sheets separated, Budget before Notes.
        let budget = text.find("## Budget").unwrap();
        let notes = text.find("## Notes").unwrap();
        assert!(budget < notes);
    }
}
