//! Writing harvested records to disk.
//!
//! Files are named `tweets_{keyword}_{mode}_{YYYYMMDD}-{YYYYMMDD}.{ext}`
//! with every non-alphanumeric character stripped from the keyword. CSV
//! output starts with a UTF-8 byte order mark so spreadsheet tools detect
//! the encoding. Excel workbooks hold one sheet with the CSV columns.

use chrono::NaiveDate;
use rust_xlsxwriter::{Format, Workbook};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::csv_escape_text;
use crate::error::{HarvestError, Result, ResultExt};
use crate::model::{ExportFormat, Record, SearchMode};

const UTF8_BOM: &str = "\u{feff}";
const SHEET_NAME: &str = "tweets";

/// CSV header, in column order.
pub const CSV_COLUMNS: [&str; 8] = [
    "author_name",
    "author_handle",
    "posted_at",
    "text",
    "url",
    "reply_count",
    "repost_count",
    "like_count",
];

/// Templated export file name.
#[must_use]
pub fn export_filename(
    keyword: &str,
    mode: SearchMode,
    start: NaiveDate,
    end: NaiveDate,
    format: ExportFormat,
) -> String {
    let safe_keyword: String = keyword.chars().filter(|c| c.is_alphanumeric()).collect();
    format!(
        "tweets_{safe_keyword}_{mode}_{}-{}.{}",
        start.format("%Y%m%d"),
        end.format("%Y%m%d"),
        format.extension()
    )
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", csv_escape_text(value))
}

/// Record fields in [`CSV_COLUMNS`] order.
fn columns(r: &Record) -> [&str; 8] {
    [
        &r.author_name,
        &r.author_handle,
        &r.posted_at,
        &r.text,
        &r.url,
        &r.reply_count,
        &r.repost_count,
        &r.like_count,
    ]
}

/// Write records as CSV with a BOM and a header row.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_csv<W: Write>(records: &[Record], mut writer: W) -> Result<()> {
    write!(writer, "{UTF8_BOM}")?;
    writeln!(writer, "{}", CSV_COLUMNS.join(","))?;
    for r in records {
        let row = columns(r)
            .iter()
            .map(|v| csv_field(v))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(writer, "{row}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write records as a pretty-printed JSON array.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_json<W: Write>(records: &[Record], mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, records).context("serializing records")?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Write records to an `.xlsx` workbook at `path`: a bold header row, then
/// one row per record, every cell stored as text.
///
/// # Errors
///
/// Returns an error if the workbook cannot be built or saved.
pub fn write_excel(records: &[Record], path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, name) in (0u16..).zip(CSV_COLUMNS) {
        sheet.write_string_with_format(0, col, name, &header)?;
    }
    for (row, r) in (1u32..).zip(records) {
        for (col, value) in (0u16..).zip(columns(r)) {
            sheet.write_string(row, col, value)?;
        }
    }
    sheet.set_freeze_panes(1, 0)?;

    workbook.save(path)?;
    Ok(())
}

/// Write `records` to `path` in `format`.
///
/// # Errors
///
/// Returns I/O, serialization or workbook errors.
pub fn export_records(records: &[Record], format: ExportFormat, path: &Path) -> Result<()> {
    let write: fn(&[Record], BufWriter<File>) -> Result<()> = match format {
        ExportFormat::Csv => write_csv,
        ExportFormat::Json => write_json,
        ExportFormat::Excel => {
            write_excel(records, path)?;
            info!(path = %path.display(), count = records.len(), "Exported records");
            return Ok(());
        }
    };

    let file = File::create(path).map_err(|e| HarvestError::path_error("create", path, e))?;
    write(records, BufWriter::new(file))?;
    info!(path = %path.display(), count = records.len(), "Exported records");
    Ok(())
}

/// Where and how a harvest is exported.
#[derive(Debug, Clone)]
pub struct ExportTarget {
    pub dir: PathBuf,
    pub format: ExportFormat,
    pub keyword: String,
    pub mode: SearchMode,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExportTarget {
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(export_filename(
            &self.keyword,
            self.mode,
            self.start,
            self.end,
            self.format,
        ))
    }

    /// Create the directory if needed and write the file.
    ///
    /// # Errors
    ///
    /// See [`export_records`].
    pub fn write(&self, records: &[Record]) -> Result<PathBuf> {
        if !self.dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&self.dir)
                .map_err(|e| HarvestError::path_error("create directory", &self.dir, e))?;
        }
        let path = self.path();
        export_records(records, self.format, &path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample() -> Vec<Record> {
        vec![
            Record::new("https://x.com/a/status/1", "said \"hi\"\nthere")
                .with_author("Ani")
                .with_handle("@ani"),
            Record::new("https://x.com/b/status/2", "plain"),
        ]
    }

    #[test]
    fn filename_strips_keyword_punctuation() {
        let name = export_filename(
            "#banjir jakarta!",
            SearchMode::Latest,
            day(2024, 1, 1),
            day(2024, 1, 31),
            ExportFormat::Csv,
        );
        assert_eq!(name, "tweets_banjirjakarta_latest_20240101-20240131.csv");
    }

    #[test]
    fn csv_has_bom_header_and_escaped_rows() {
        let mut buf = Vec::new();
        write_csv(&sample(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.starts_with('\u{feff}'));
        let lines: Vec<&str> = text.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_COLUMNS.join(","));
        assert!(lines[1].contains("\"said \"\"hi\"\" there\""));
        assert!(lines[1].contains("\"https://x.com/a/status/1\""));
    }

    #[test]
    fn json_is_an_array_of_records() {
        let mut buf = Vec::new();
        write_json(&sample(), &mut buf).unwrap();
        let parsed: Vec<Record> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn excel_writes_a_workbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        export_records(&sample(), ExportFormat::Excel, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PK"), "xlsx is a zip container");
        let contains = |needle: &[u8]| bytes.windows(needle.len()).any(|w| w == needle);
        assert!(contains(b"xl/worksheets/sheet1.xml"));
        assert!(contains(b"xl/sharedStrings.xml"));
    }

    #[test]
    fn excel_target_creates_its_directory() {
        let dir = TempDir::new().unwrap();
        let target = ExportTarget {
            dir: dir.path().join("nested").join("exports"),
            format: ExportFormat::Excel,
            keyword: "banjir".into(),
            mode: SearchMode::Latest,
            start: day(2024, 3, 1),
            end: day(2024, 3, 2),
        };
        let path = target.write(&[]).unwrap();
        assert!(path.ends_with("tweets_banjir_latest_20240301-20240302.xlsx"));
        assert!(path.exists());
    }

    #[test]
    fn target_writes_into_directory() {
        let dir = TempDir::new().unwrap();
        let target = ExportTarget {
            dir: dir.path().join("exports"),
            format: ExportFormat::Json,
            keyword: "kopi".into(),
            mode: SearchMode::Top,
            start: day(2024, 2, 1),
            end: day(2024, 2, 7),
        };
        let path = target.write(&sample()).unwrap();
        assert!(path.ends_with("tweets_kopi_top_20240201-20240207.json"));
        assert!(path.exists());
    }
}
