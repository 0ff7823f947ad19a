//! Spreadsheet output for the accumulated dataset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use oph_core::{Dataset, ProductRecord};
use rust_xlsxwriter::{Format, FormatAlign, Workbook};

pub const CRATE_NAME: &str = "oph-sheet";

const SHEET_NAME: &str = "Products";
const WIDTH_PADDING: usize = 2;

/// Receiver for periodic full-dataset flushes. Every flush carries the whole
/// dataset accumulated so far, not a delta.
pub trait DatasetSink: Send {
    fn flush(&mut self, dataset: &Dataset) -> Result<()>;
}

/// Writes the dataset to a single-sheet xlsx workbook, replacing the file on
/// every flush. A flush of an empty dataset leaves the file untouched.
#[derive(Debug, Clone)]
pub struct XlsxSink {
    path: PathBuf,
}

impl XlsxSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetSink for XlsxSink {
    fn flush(&mut self, dataset: &Dataset) -> Result<()> {
        if dataset.is_empty() {
            return Ok(());
        }

        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(SHEET_NAME).context("naming worksheet")?;

        let header = Format::new().set_bold().set_align(FormatAlign::Center);
        for (col, title) in ProductRecord::COLUMNS.iter().enumerate() {
            worksheet
                .write_with_format(0, col as u16, *title, &header)
                .with_context(|| format!("writing header cell {title}"))?;
        }

        for (row, record) in dataset.records().enumerate() {
            let row = row as u32 + 1;
            for (col, value) in record.values().iter().enumerate() {
                if let Some(value) = value {
                    worksheet
                        .write_string(row, col as u16, *value)
                        .with_context(|| format!("writing row {row}"))?;
                }
            }
        }

        for (col, width) in column_widths(dataset).into_iter().enumerate() {
            worksheet
                .set_column_width(col as u16, width)
                .with_context(|| format!("sizing column {col}"))?;
        }

        workbook
            .save(&self.path)
            .with_context(|| format!("saving workbook {}", self.path.display()))?;
        Ok(())
    }
}

/// Column widths sized to the longest cell, header included, plus padding.
fn column_widths(dataset: &Dataset) -> Vec<f64> {
    let mut widths: Vec<usize> = ProductRecord::COLUMNS
        .iter()
        .map(|title| title.chars().count())
        .collect();
    for record in dataset.records() {
        for (col, value) in record.values().iter().enumerate() {
            if let Some(value) = value {
                widths[col] = widths[col].max(value.chars().count());
            }
        }
    }
    widths
        .into_iter()
        .map(|width| (width + WIDTH_PADDING) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(sku: &str, name: &str) -> ProductRecord {
        let mut record = ProductRecord::absent(format!("https://ozon.ru/product/{sku}"));
        record.sku = Some(sku.to_string());
        record.name = Some(name.to_string());
        record
    }

    #[test]
    fn widths_track_longest_cell_per_column() {
        let mut dataset = Dataset::new();
        dataset.insert(record("A1", "a rather long product name"));
        dataset.insert(record("B2", "short"));

        let widths = column_widths(&dataset);
        assert_eq!(widths.len(), ProductRecord::COLUMNS.len());
        // SKU column: header "SKU" is longer than "A1"/"B2".
        assert_eq!(widths[0], ("SKU".len() + WIDTH_PADDING) as f64);
        // Name column: the longest record value wins over the header.
        assert_eq!(
            widths[1],
            ("a rather long product name".len() + WIDTH_PADDING) as f64
        );
    }

    #[test]
    fn flush_writes_and_rewrites_the_workbook() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("products.xlsx");
        let mut sink = XlsxSink::new(&path);

        let mut dataset = Dataset::new();
        dataset.insert(record("A1", "first"));
        sink.flush(&dataset).expect("first flush");
        assert!(path.exists());
        let first_len = std::fs::metadata(&path).expect("metadata").len();
        assert!(first_len > 0);

        dataset.insert(record("B2", "second"));
        sink.flush(&dataset).expect("second flush");
        assert!(path.exists());
    }

    #[test]
    fn empty_dataset_flush_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("products.xlsx");
        let mut sink = XlsxSink::new(&path);
        sink.flush(&Dataset::new()).expect("flush");
        assert!(!path.exists());
    }
}
