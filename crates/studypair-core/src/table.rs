use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

/// Shape violations raised by in-memory table mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("row {row} has {got} cells but the table has {expected} columns")]
    RaggedRow {
        row: usize,
        got: usize,
        expected: usize,
    },
    #[error("column `{column}` has {got} values but the table has {expected} rows")]
    ColumnLength {
        column: String,
        got: usize,
        expected: usize,
    },
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
}

/// Row-major string table with an explicit, ordered column list.
///
/// All pipeline stages exchange data through this shape: the warehouse query
/// produces one, extraction appends columns to it, and selection splits it
/// into selected/audit outputs. Keeping the column order explicit is what
/// makes the flattened extraction schema stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Create an empty table with the given column headers.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from pre-existing rows, rejecting ragged input.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell lookup by row index and column name. `None` when either is absent.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RaggedRow {
                row: self.rows.len(),
                got: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a new column, one value per existing row.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) -> Result<(), TableError> {
        if self.column_index(name).is_some() {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if values.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                column: name.to_string(),
                got: values.len(),
                expected: self.rows.len(),
            });
        }
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Keep only the first `n` rows.
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    /// New table with the same columns and only the rows at `indices`.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let rows = indices
            .iter()
            .filter_map(|&i| self.rows.get(i).cloned())
            .collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Read a headered CSV file. Ragged rows are an error.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open CSV at {}", path.display()))?;
        let columns: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read CSV header at {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut table = Self::new(columns);
        for (idx, record) in reader.records().enumerate() {
            let record = record
                .with_context(|| format!("failed to read CSV row {} at {}", idx + 1, path.display()))?;
            table.push_row(record.iter().map(str::to_string).collect())?;
        }
        Ok(table)
    }

    /// Write the table as a headered CSV file.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create CSV at {}", path.display()))?;
        writer
            .write_record(&self.columns)
            .context("failed to write CSV header")?;
        for row in &self.rows {
            writer.write_record(row).context("failed to write CSV row")?;
        }
        writer.flush().context("failed to flush CSV writer")?;
        Ok(())
    }
}
