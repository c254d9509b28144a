use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use globwalk::GlobWalkerBuilder;
use lopdf::{Dictionary, Document, Object};
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed positional schema of a gifts-register worksheet. The source
/// header row is discarded and these names are assigned by position.
pub const GIFT_COLUMNS: [&str; 11] = [
    "RegistrationNumber",
    "NameOfMEP",
    "Capacity",
    "NameOfDonor",
    "DescriptionOfGift",
    "EstimatedValue",
    "LinkToPhoto",
    "DateOfReception",
    "DateOfNotification",
    "Location",
    "Miscellaneous",
];

pub const COL_REGISTRATION_NUMBER: usize = 0;
pub const COL_NAME_OF_MEP: usize = 1;
pub const COL_NAME_OF_DONOR: usize = 3;
pub const COL_DESCRIPTION_OF_GIFT: usize = 4;
pub const COL_LINK_TO_PHOTO: usize = 6;
pub const COL_DATE_OF_RECEPTION: usize = 7;
pub const COL_DATE_OF_NOTIFICATION: usize = 8;

/// One worksheet cell. Carrying the type tag through the pipeline lets the
/// renderer decide quoting per value, not per column.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
    Empty,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Unquoted rendering used in document bodies and for non-text
    /// front-matter values.
    pub fn literal(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
            Cell::Date(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            Cell::Empty => "null".to_string(),
        }
    }
}

/// Replace embedded line breaks in text cells with single spaces.
/// Non-text cells pass through unchanged.
pub fn normalize_text(cell: Cell) -> Cell {
    match cell {
        Cell::Text(s) => Cell::Text(s.replace(['\n', '\r'], " ")),
        other => other,
    }
}

/// Remove artifact rows from a schema-assigned table:
/// 1. sparse rows (merged title rows): more than `ncols - 2` empty cells;
/// 2. header-echo rows: the first row remaining after step 1 is assumed to
///    be a repeated column header and every row equal to it is dropped,
///    the template row included.
pub fn filter_artifact_rows(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let rows: Vec<Vec<Cell>> = rows
        .into_iter()
        .filter(|row| {
            let empties = row.iter().filter(|c| c.is_empty()).count();
            empties <= row.len().saturating_sub(2)
        })
        .collect();

    let template = match rows.first() {
        Some(first) => first.clone(),
        None => return rows,
    };
    rows.into_iter().filter(|row| *row != template).collect()
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("OpenFailed: {0}")]
    OpenFailed(String),
    #[error("NoWorksheet")]
    NoWorksheet,
    #[error("ColumnCount: expected 11, found {found}")]
    ColumnCount { found: usize },
}

static ROW_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"G(\d+)[-_]\d\d").unwrap());

/// Join key from a RegistrationNumber cell, e.g. "G12-23" -> "12".
pub fn extract_row_id(registration_number: &str) -> Option<String> {
    ROW_ID_RE
        .captures(registration_number)
        .map(|c| c[1].to_string())
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => dt.as_datetime().map(Cell::Date).unwrap_or(Cell::Empty),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// Coerce one cell of a known date column. Anything unparseable becomes the
/// explicit no-value marker rather than an error.
fn coerce_date(cell: Cell) -> Cell {
    match cell {
        Cell::Date(dt) => Cell::Date(dt),
        Cell::Text(s) => {
            let s = s.trim();
            for fmt in DATETIME_FORMATS {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Cell::Date(dt);
                }
            }
            for fmt in DATE_FORMATS {
                if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                    return Cell::Date(d.and_hms_opt(0, 0, 0).unwrap_or_default());
                }
            }
            Cell::Empty
        }
        _ => Cell::Empty,
    }
}

/// A loaded register: 11 fixed columns, or 12 with the appended "Id" join
/// column in the PDF-aware variant.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl GiftTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Build a table from raw worksheet rows (source header row included).
/// Order matters: discard the raw header, filter artifact rows, coerce the
/// two date columns, optionally extract the "Id" join column, then
/// normalize text and flatten dates to ISO-8601 strings.
pub fn build_gift_table(raw_rows: Vec<Vec<Cell>>, with_id: bool) -> GiftTable {
    let mut columns: Vec<String> = GIFT_COLUMNS.iter().map(|c| c.to_string()).collect();

    let data_rows: Vec<Vec<Cell>> = raw_rows.into_iter().skip(1).collect();
    let mut rows = filter_artifact_rows(data_rows);

    for row in rows.iter_mut() {
        for idx in [COL_DATE_OF_RECEPTION, COL_DATE_OF_NOTIFICATION] {
            row[idx] = coerce_date(row[idx].clone());
        }
    }

    if with_id {
        columns.push("Id".to_string());
        for row in rows.iter_mut() {
            let id = match &row[COL_REGISTRATION_NUMBER] {
                Cell::Text(reg) => extract_row_id(reg),
                _ => None,
            };
            row.push(id.map(Cell::Text).unwrap_or(Cell::Empty));
        }
    }

    for row in rows.iter_mut() {
        for cell in row.iter_mut() {
            *cell = match normalize_text(cell.clone()) {
                Cell::Date(dt) => Cell::Text(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
                other => other,
            };
        }
    }

    GiftTable { columns, rows }
}

/// Load one .xlsx register. Reads the first worksheet, enforces the fixed
/// 11-column width, and runs the cleaning pipeline. Failures are meant to be
/// caught at the driver and skip the file, never abort the batch.
pub fn load_gift_table(path: &Path, with_id: bool) -> Result<GiftTable, LoadError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| LoadError::OpenFailed(e.to_string()))?;
    let sheet = workbook
        .sheet_names()
        .to_owned()
        .first()
        .cloned()
        .ok_or(LoadError::NoWorksheet)?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| LoadError::OpenFailed(e.to_string()))?;

    let (n_rows, n_cols) = range.get_size();
    if n_rows == 0 {
        return Ok(build_gift_table(Vec::new(), with_id));
    }
    if n_cols != GIFT_COLUMNS.len() {
        return Err(LoadError::ColumnCount { found: n_cols });
    }

    let raw_rows: Vec<Vec<Cell>> = range
        .rows()
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect();
    Ok(build_gift_table(raw_rows, with_id))
}

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("OpenFailed: {0}")]
    OpenFailed(String),
}

/// One URI annotation discovered in a companion PDF. `id` is absent when no
/// pattern of the cascade matched; such records survive extraction and are
/// simply never joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfLink {
    pub id: Option<String>,
    pub url: String,
}

// Percent-encode everything except alphanumerics, the URL delimiters the
// join patterns rely on, and the unreserved marks.
const URL_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'#')
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'&')
    .remove(b'=')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_link_url(raw: &str) -> String {
    utf8_percent_encode(raw, URL_KEEP).to_string()
}

static URL_ID_RES: Lazy<[Regex; 4]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)G(\d+)[_-]\d\d").unwrap(),
        Regex::new(r"(?i)G(\d+)").unwrap(),
        Regex::new(r"(?i)(\d+)[_-]\d\d").unwrap(),
        Regex::new(r"(?i)(\d+)\.jpg").unwrap(),
    ]
});

/// Join key from a photo URL. URLs do not carry the RegistrationNumber
/// format directly, so a fixed-priority cascade of patterns is tried and the
/// first match wins.
pub fn extract_url_id(url: &str) -> Option<String> {
    URL_ID_RES
        .iter()
        .find_map(|re| re.captures(url).map(|c| c[1].to_string()))
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        _ => None,
    }
}

fn resolve_array<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Vec<Object>> {
    match obj {
        Object::Array(a) => Some(a),
        Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_array().ok()),
        _ => None,
    }
}

fn dict_string(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    let obj = dict.get(key).ok()?;
    let obj = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    obj.as_str()
        .ok()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .filter(|s| !s.is_empty())
}

/// Collect every URI link from a PDF's page annotations, in page order.
/// URLs are percent-encoded and keyed via the join-key cascade.
pub fn extract_pdf_links(path: &Path) -> Result<Vec<PdfLink>, PdfError> {
    let doc = Document::load(path).map_err(|e| PdfError::OpenFailed(e.to_string()))?;
    let mut links = Vec::new();

    for (_page_no, page_id) in doc.get_pages() {
        let page = match doc.get_dictionary(page_id) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let annots = match page.get(b"Annots").ok().and_then(|o| resolve_array(&doc, o)) {
            Some(a) => a,
            None => continue,
        };
        for annot in annots {
            let annot = match resolve_dict(&doc, annot) {
                Some(d) => d,
                None => continue,
            };
            let action = match annot.get(b"A").ok().and_then(|o| resolve_dict(&doc, o)) {
                Some(d) => d,
                None => continue,
            };
            if let Some(uri) = dict_string(&doc, action, b"URI") {
                let url = encode_link_url(&uri);
                let id = extract_url_id(&url);
                links.push(PdfLink { id, url });
            }
        }
    }

    Ok(links)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinOutcome {
    pub matched: usize,
    pub dropped: usize,
}

/// Inner-join the table's "Id" column against the PDF links, writing each
/// match into LinkToPhoto. Rows without a matching link are dropped; row
/// order is preserved. On duplicate link ids the first link wins.
pub fn join_photo_links(table: &mut GiftTable, links: &[PdfLink]) -> JoinOutcome {
    let id_col = match table.column_index("Id") {
        Some(idx) => idx,
        None => return JoinOutcome::default(),
    };

    let mut by_id: HashMap<&str, &str> = HashMap::new();
    for link in links {
        if let Some(id) = &link.id {
            by_id.entry(id.as_str()).or_insert(link.url.as_str());
        }
    }

    let mut outcome = JoinOutcome::default();
    table.rows.retain_mut(|row| match &row[id_col] {
        Cell::Text(id) => match by_id.get(id.as_str()) {
            Some(url) => {
                row[COL_LINK_TO_PHOTO] = Cell::Text(url.to_string());
                outcome.matched += 1;
                true
            }
            None => {
                outcome.dropped += 1;
                false
            }
        },
        _ => {
            outcome.dropped += 1;
            false
        }
    });
    outcome
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("MissingRegistrationNumber")]
    MissingRegistrationNumber,
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

fn front_matter_line(column: &str, cell: &Cell) -> String {
    match cell {
        Cell::Text(s) if column == "NameOfMEP" || column == "NameOfDonor" => {
            format!("{}: \"[[{}]]\"", column, escape_quotes(s))
        }
        Cell::Text(s) => format!("{}: \"{}\"", column, escape_quotes(s)),
        other => format!("{}: {}", column, other.literal()),
    }
}

/// Render one gift row into `(relative_path, content)`. The year directory
/// comes from the last "-"-delimited segment of RegistrationNumber, prefixed
/// with "20".
pub fn render_gift(columns: &[String], row: &[Cell]) -> Result<(PathBuf, String), RenderError> {
    let registration = match &row[COL_REGISTRATION_NUMBER] {
        Cell::Text(s) if !s.is_empty() => s,
        _ => return Err(RenderError::MissingRegistrationNumber),
    };
    let segment = registration
        .rsplit('-')
        .next()
        .ok_or(RenderError::MissingRegistrationNumber)?;
    let year = format!("20{}", segment);
    let rel_path = PathBuf::from(year).join(format!("{}.md", registration));

    let mut content = String::from("---\n");
    for (column, cell) in columns.iter().zip(row.iter()) {
        content.push_str(&front_matter_line(column, cell));
        content.push('\n');
    }
    content.push_str("---\n\n");

    content.push_str(&format!("# {}\n\n", row[COL_DESCRIPTION_OF_GIFT].literal()));
    content.push_str(&format!("Received by: {}\n", row[COL_NAME_OF_MEP].literal()));
    content.push_str(&format!("From: {}\n", row[COL_NAME_OF_DONOR].literal()));

    Ok((rel_path, content))
}

/// Render a per-entity index stub. Path separators in the name are replaced
/// so the name is usable as a filename; entities sanitizing to the same
/// filename silently overwrite each other.
pub fn render_index(name: &str) -> (PathBuf, String) {
    let filename = format!("{}.md", name.replace(['/', '\\'], "-"));
    (PathBuf::from(filename), format!("# {}\n\n", name))
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("WriteFailed: {0}")]
    WriteFailed(String),
}

/// Write a document below `root`, creating directories as needed. Writes are
/// unconditional: reruns clobber prior output.
pub fn emit_document(root: &Path, rel_path: &Path, content: &str) -> Result<PathBuf, EmitError> {
    let full = root.join(rel_path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    }
    std::fs::write(&full, content).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    Ok(full)
}

/// Distinct non-empty text values of one column, in first-seen row order.
pub fn distinct_names(table: &GiftTable, column_index: usize) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut names = Vec::new();
    for row in &table.rows {
        if let Some(Cell::Text(name)) = row.get(column_index) {
            if !name.is_empty() && seen.insert(name.as_str()) {
                names.push(name.clone());
            }
        }
    }
    names
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_meps_dir")]
    pub meps_dir: String,
    #[serde(default = "default_donors_dir")]
    pub donors_dir: String,
}

fn default_input_dir() -> String {
    "gifts_register".to_string()
}
fn default_output_dir() -> String {
    "gifts".to_string()
}
fn default_meps_dir() -> String {
    "meps".to_string()
}
fn default_donors_dir() -> String {
    "donors".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            meps_dir: default_meps_dir(),
            donors_dir: default_donors_dir(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read and validate the pipeline config once at start.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let cfg: PipelineConfig =
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

    for (field, value) in [
        ("input_dir", &cfg.input_dir),
        ("output_dir", &cfg.output_dir),
        ("meps_dir", &cfg.meps_dir),
        ("donors_dir", &cfg.donors_dir),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("empty {}", field)));
        }
    }
    Ok(cfg)
}

/// Enumerate files with the given extension directly under `dir`, sorted.
/// A missing or empty directory yields an empty list, not an error.
pub fn enumerate_inputs(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let pattern = format!("*.{}", extension);
    let mut paths: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(dir, &[pattern.as_str()])
        .case_insensitive(false)
        .follow_links(false)
        .max_depth(1)
        .build()
        .map(|walker| {
            walker
                .filter_map(|e| e.ok())
                .map(|e| e.path().to_path_buf())
                .collect()
        })
        .unwrap_or_default();
    paths.retain(|p| p.is_file());
    paths.sort();
    paths
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub spreadsheets_processed: usize,
    pub spreadsheets_skipped: usize,
    pub pdfs_processed: usize,
    pub pdfs_skipped: usize,
    pub gifts_written: usize,
    pub indexes_written: usize,
    pub rows_dropped_by_join: usize,
}

/// Run the whole batch: PDFs first into a basename -> links map, then every
/// spreadsheet, joining where a companion PDF exists, rendering every row
/// and every distinct MEP/donor name. Per-file load failures are logged and
/// skipped; filesystem write failures terminate the batch.
pub fn run_pipeline(cfg: &PipelineConfig) -> Result<RunSummary, EmitError> {
    let input_dir = Path::new(&cfg.input_dir);
    let output_root = Path::new(&cfg.output_dir);
    let meps_root = Path::new(&cfg.meps_dir);
    let donors_root = Path::new(&cfg.donors_dir);

    let mut summary = RunSummary::default();

    let mut links_by_stem: HashMap<String, Vec<PdfLink>> = HashMap::new();
    for pdf in enumerate_inputs(input_dir, "pdf") {
        match extract_pdf_links(&pdf) {
            Ok(links) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "extract_pdf_links",
                        "file": pdf,
                        "links": links.len(),
                    })
                );
                summary.pdfs_processed += 1;
                links_by_stem.insert(file_stem(&pdf), links);
            }
            Err(err) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "extract_pdf_links",
                        "file": pdf,
                        "error": err.to_string(),
                    })
                );
                summary.pdfs_skipped += 1;
            }
        }
    }

    for xlsx in enumerate_inputs(input_dir, "xlsx") {
        let stem = file_stem(&xlsx);
        let pdf_links = links_by_stem.get(&stem);

        let mut table = match load_gift_table(&xlsx, pdf_links.is_some()) {
            Ok(table) if !table.is_empty() => table,
            Ok(_) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_gift_table",
                        "file": xlsx,
                        "skipped": "no rows",
                    })
                );
                summary.spreadsheets_skipped += 1;
                continue;
            }
            Err(err) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_gift_table",
                        "file": xlsx,
                        "error": err.to_string(),
                    })
                );
                summary.spreadsheets_skipped += 1;
                continue;
            }
        };

        if let Some(links) = pdf_links {
            let outcome = join_photo_links(&mut table, links);
            summary.rows_dropped_by_join += outcome.dropped;
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "join_photo_links",
                    "file": xlsx,
                    "matched": outcome.matched,
                    "dropped": outcome.dropped,
                })
            );
        }

        for row in &table.rows {
            match render_gift(&table.columns, row) {
                Ok((rel_path, content)) => {
                    emit_document(output_root, &rel_path, &content)?;
                    summary.gifts_written += 1;
                }
                Err(err) => {
                    eprintln!(
                        "{}",
                        serde_json::json!({
                            "tool": "render_gift",
                            "file": xlsx,
                            "error": err.to_string(),
                        })
                    );
                }
            }
        }

        for (root, column) in [(meps_root, COL_NAME_OF_MEP), (donors_root, COL_NAME_OF_DONOR)] {
            for name in distinct_names(&table, column) {
                let (rel_path, content) = render_index(&name);
                emit_document(root, &rel_path, &content)?;
                summary.indexes_written += 1;
            }
        }

        eprintln!(
            "{}",
            serde_json::json!({
                "tool": "process_register",
                "file": xlsx,
                "rows": table.rows.len(),
            })
        );
        summary.spreadsheets_processed += 1;
    }

    Ok(summary)
}
