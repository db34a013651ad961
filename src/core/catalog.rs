use calamine::{Data, Reader, open_workbook_auto};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::identity::RawIdentity;
use crate::config::CatalogConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to open workbook {path}: {message}")]
    Open { path: String, message: String },

    #[error("Worksheet {sheet:?} not found in {path}")]
    MissingSheet { path: String, sheet: String },

    #[error("Header row {row} not found")]
    MissingHeader { row: usize },

    #[error("Required column {column:?} not found in header row")]
    MissingColumn { column: String },
}

/// A catalog line with the fields the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogRow {
    /// 1-based row number as shown by spreadsheet software.
    pub row_number: usize,
    pub raw: RawIdentity,
}

/// A catalog line that could not become a [`CatalogRow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowDefect {
    pub row_number: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogSheet {
    pub rows: Vec<CatalogRow>,
    pub defects: Vec<RowDefect>,
}

struct Columns {
    name: usize,
    fallback_name: Option<usize>,
    size: usize,
    surface: Option<usize>,
}

pub struct CatalogReader {
    config: CatalogConfig,
}

impl CatalogReader {
    pub fn new(config: CatalogConfig) -> Self {
        Self { config }
    }

    pub fn read(&self, path: &Path) -> Result<CatalogSheet, CatalogError> {
        let mut workbook = open_workbook_auto(path).map_err(|e| CatalogError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let sheet = match &self.config.sheet {
            Some(sheet) => sheet.clone(),
            None => workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| CatalogError::MissingSheet {
                    path: path.display().to_string(),
                    sheet: "<first>".to_string(),
                })?,
        };

        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|_| CatalogError::MissingSheet {
                path: path.display().to_string(),
                sheet: sheet.clone(),
            })?;

        // Range coordinates are relative to the first used cell.
        let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);
        let rows = range
            .rows()
            .map(|cells| cells.iter().map(cell_text).collect::<Vec<_>>());

        let sheet = self.parse_rows(first_row, rows)?;
        tracing::info!(
            "Read {} catalog rows from {} ({} rejected)",
            sheet.rows.len(),
            path.display(),
            sheet.defects.len()
        );
        Ok(sheet)
    }

    /// Validates a grid of cell texts whose first line is sheet row `first_row` (0-based).
    pub fn parse_rows(
        &self,
        first_row: usize,
        rows: impl IntoIterator<Item = Vec<String>>,
    ) -> Result<CatalogSheet, CatalogError> {
        let header_row = self.config.header_row;
        let mut rows = rows.into_iter().enumerate().map(|(i, cells)| (first_row + i, cells));

        let header = loop {
            match rows.next() {
                Some((index, cells)) if index == header_row => break cells,
                Some((index, _)) if index < header_row => continue,
                _ => return Err(CatalogError::MissingHeader { row: header_row + 1 }),
            }
        };
        let columns = self.locate_columns(&header)?;

        let mut sheet = CatalogSheet::default();
        for (index, cells) in rows {
            let row_number = index + 1;
            let cell = |column: usize| cells.get(column).map(|s| s.trim()).unwrap_or("");

            if cells.iter().all(|c| c.trim().is_empty()) {
                continue;
            }

            let mut name = cell(columns.name);
            if name.is_empty() {
                if let Some(fallback) = columns.fallback_name {
                    name = cell(fallback);
                }
            }
            let size = cell(columns.size);
            let surface = columns.surface.map(cell).unwrap_or("");

            let missing: Vec<&str> = [("name", name), ("size", size)]
                .iter()
                .filter(|(_, value)| value.is_empty())
                .map(|(field, _)| *field)
                .collect();
            if !missing.is_empty() {
                let reason = format!("missing {}", missing.join(" and "));
                tracing::warn!("Catalog row {}: {}", row_number, reason);
                sheet.defects.push(RowDefect { row_number, reason });
                continue;
            }

            sheet.rows.push(CatalogRow {
                row_number,
                raw: RawIdentity::new(name, size, surface),
            });
        }

        Ok(sheet)
    }

    fn locate_columns(&self, header: &[String]) -> Result<Columns, CatalogError> {
        let find = |column: &str| {
            header
                .iter()
                .position(|cell| cell.trim().to_lowercase() == column.trim().to_lowercase())
        };
        let require = |column: &str| {
            find(column).ok_or_else(|| CatalogError::MissingColumn {
                column: column.to_string(),
            })
        };

        let surface = find(&self.config.surface_column);
        if surface.is_none() {
            tracing::warn!(
                "Surface column {:?} not found; every row falls back to the OTHER surface",
                self.config.surface_column
            );
        }

        Ok(Columns {
            name: require(&self.config.name_column)?,
            fallback_name: self.config.fallback_name_column.as_deref().and_then(find),
            size: require(&self.config.size_column)?,
            surface,
        })
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        other => other.to_string(),
    }
}

/// Source spreadsheets, by path, in the order they were given.
pub fn read_all(reader: &CatalogReader, paths: &[PathBuf]) -> Result<Vec<(PathBuf, CatalogSheet)>, CatalogError> {
    paths
        .iter()
        .map(|path| Ok((path.clone(), reader.read(path)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn reader() -> CatalogReader {
        CatalogReader::new(CatalogConfig {
            sheet: None,
            header_row: 1,
            name_column: "Product".into(),
            fallback_name_column: Some("Stock Name".into()),
            size_column: "Size".into(),
            surface_column: "Finish".into(),
        })
    }

    #[test]
    fn test_rows_after_header_are_validated() {
        let rows = grid(&[
            &["Price list 2025", "", "", ""],
            &["Product", "Stock Name", "Size", "Finish"],
            &["ABACO BAMBU", "", "60 x 120", "Mat"],
            &["", "ZEUS GREY STOCK", "30X60", ""],
            &["", "", "", ""],
            &["NO SIZE", "", "", "Mat"],
            &["", "", "", "Mat"],
        ]);

        let sheet = reader().parse_rows(0, rows).unwrap();

        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].row_number, 3);
        assert_eq!(sheet.rows[0].raw, RawIdentity::new("ABACO BAMBU", "60 x 120", "Mat"));
        assert_eq!(sheet.rows[1].raw.name, "ZEUS GREY STOCK");
        assert_eq!(sheet.rows[1].raw.surface, "");

        assert_eq!(sheet.defects.len(), 2);
        assert_eq!(sheet.defects[0], RowDefect { row_number: 6, reason: "missing size".into() });
        assert_eq!(sheet.defects[1].reason, "missing name and size");
    }

    #[test]
    fn test_header_match_is_case_insensitive() {
        let rows = grid(&[&["x"], &["PRODUCT", "size", "finish"], &["A", "60X60", "MAT"]]);
        let sheet = reader().parse_rows(0, rows).unwrap();
        assert_eq!(sheet.rows.len(), 1);
    }

    #[test]
    fn test_range_offset_is_respected() {
        // Range starts at sheet row 1, which is the header.
        let rows = grid(&[&["Product", "Size", "Finish"], &["A", "60X60", "MAT"]]);
        let sheet = reader().parse_rows(1, rows).unwrap();
        assert_eq!(sheet.rows[0].row_number, 3);
    }

    #[test]
    fn test_missing_required_column() {
        let rows = grid(&[&["x"], &["Product", "Finish"]]);
        let result = reader().parse_rows(0, rows);
        assert!(matches!(result, Err(CatalogError::MissingColumn { column }) if column == "Size"));
    }

    #[test]
    fn test_missing_header_row() {
        let rows = grid(&[&["only one row"]]);
        assert!(matches!(
            reader().parse_rows(0, rows),
            Err(CatalogError::MissingHeader { row: 2 })
        ));
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::String("MAT".into())), "MAT");
        assert_eq!(cell_text(&Data::Int(60)), "60");
    }
}
