//! Tabular file I/O for uploaded trajectory/link files and generated result
//! workbooks. CSV via `csv`, XLSX/XLS via `calamine`, output workbooks via
//! `rust_xlsxwriter`.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unsupported file format: {0}. Supported: .csv, .xlsx, .xls")]
    Unsupported(String),

    #[error("File is empty")]
    Empty,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Workbook error: {0}")]
    Workbook(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed table: header row plus data rows of JSON scalars.
#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as column-keyed JSON objects, the shape tools and previews use.
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// Read a table from disk, dispatching on the file extension.
pub fn read_table(path: &Path) -> Result<Table, TableError> {
    if !path.exists() {
        return Err(TableError::NotFound(path.display().to_string()));
    }
    let ext = extension_of(path)?;
    match ext.as_str() {
        "csv" => read_csv(std::fs::File::open(path)?),
        "xlsx" | "xls" => {
            let mut workbook = calamine::open_workbook_auto(path)
                .map_err(|e| TableError::Workbook(e.to_string()))?;
            read_first_sheet(&mut workbook)
        }
        other => Err(TableError::Unsupported(format!(".{other}"))),
    }
}

/// Read a table from an in-memory upload; `filename` supplies the extension.
pub fn read_table_from_bytes(bytes: &[u8], filename: &str) -> Result<Table, TableError> {
    let ext = extension_of(Path::new(filename))?;
    match ext.as_str() {
        "csv" => read_csv(Cursor::new(bytes)),
        "xlsx" | "xls" => {
            let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
                .map_err(|e| TableError::Workbook(e.to_string()))?;
            read_first_sheet(&mut workbook)
        }
        other => Err(TableError::Unsupported(format!(".{other}"))),
    }
}

fn read_first_sheet<RS, R>(workbook: &mut R) -> Result<Table, TableError>
where
    RS: std::io::Read + std::io::Seek,
    R: Reader<RS>,
{
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(TableError::Empty)?
        .map_err(|e| TableError::Workbook(format!("{e:?}")))?;

    let mut iter = range.rows();
    let header = iter.next().ok_or(TableError::Empty)?;
    let columns: Vec<String> = header
        .iter()
        .map(|c| match c {
            Data::String(s) => s.trim().to_string(),
            other => other.to_string().trim().to_string(),
        })
        .collect();

    let mut rows = Vec::new();
    for row in iter {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let mut cells: Vec<Value> = row.iter().map(cell_to_value).collect();
        // Pad short rows so records() stays rectangular.
        while cells.len() < columns.len() {
            cells.push(Value::Null);
        }
        rows.push(cells);
    }
    if rows.is_empty() {
        return Err(TableError::Empty);
    }

    debug!(rows = rows.len(), cols = columns.len(), "parsed workbook sheet");
    Ok(Table { columns, rows })
}

fn extension_of(path: &Path) -> Result<String, TableError> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .ok_or_else(|| TableError::Unsupported(path.display().to_string()))
}

fn read_csv<R: std::io::Read>(reader: R) -> Result<Table, TableError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let columns: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if columns.is_empty() {
        return Err(TableError::Empty);
    }

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(record.iter().map(parse_scalar).collect());
    }
    if rows.is_empty() {
        return Err(TableError::Empty);
    }

    debug!(rows = rows.len(), cols = columns.len(), "parsed CSV table");
    Ok(Table { columns, rows })
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => number_value(*f),
        Data::Bool(b) => Value::from(*b),
        Data::String(s) => Value::from(s.trim().to_string()),
        Data::DateTime(dt) => number_value(dt.as_f64()),
        other => Value::from(other.to_string()),
    }
}

fn parse_scalar(field: &str) -> Value {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return number_value(f);
    }
    Value::from(trimmed.to_string())
}

fn number_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Output filename for a result workbook: original stem + timestamp.
pub fn stamped_output_path(input_path: &Path, outputs_dir: &Path) -> (PathBuf, String) {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("result");
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("{stem}_result_{stamp}.xlsx");
    (outputs_dir.join(&filename), filename)
}

/// Write a result workbook: header row plus JSON-scalar data rows.
pub fn write_xlsx(path: &Path, columns: &[String], rows: &[Vec<Value>]) -> Result<(), TableError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col, name) in columns.iter().enumerate() {
        sheet
            .write_string(0, col as u16, name)
            .map_err(|e| TableError::Workbook(e.to_string()))?;
    }
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            let (r, c) = ((r + 1) as u32, c as u16);
            match cell {
                Value::Number(n) => {
                    sheet
                        .write_number(r, c, n.as_f64().unwrap_or(0.0))
                        .map_err(|e| TableError::Workbook(e.to_string()))?;
                }
                Value::Null => {}
                Value::String(s) => {
                    sheet
                        .write_string(r, c, s)
                        .map_err(|e| TableError::Workbook(e.to_string()))?;
                }
                other => {
                    sheet
                        .write_string(r, c, &other.to_string())
                        .map_err(|e| TableError::Workbook(e.to_string()))?;
                }
            }
        }
    }

    workbook
        .save(path)
        .map_err(|e| TableError::Workbook(e.to_string()))?;
    debug!(path = %path.display(), rows = rows.len(), "wrote result workbook");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_round_trip_types() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "t,speed_kph,label").unwrap();
        writeln!(file, "0,42.5,a").unwrap();
        writeln!(file, "1,43,b").unwrap();
        file.flush().unwrap();

        let table = read_table(file.path()).unwrap();
        assert_eq!(table.columns, vec!["t", "speed_kph", "label"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "t"), Some(&Value::from(0)));
        assert_eq!(table.cell(0, "speed_kph"), Some(&Value::from(42.5)));
        assert_eq!(table.cell(1, "label"), Some(&Value::from("b")));
    }

    #[test]
    fn empty_csv_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "a,b").unwrap();
        file.flush().unwrap();
        assert!(matches!(read_table(file.path()), Err(TableError::Empty)));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".parquet").tempfile().unwrap();
        assert!(matches!(
            read_table(file.path()),
            Err(TableError::Unsupported(_))
        ));
    }

    #[test]
    fn xlsx_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let columns = vec!["t".to_string(), "CO2_g".to_string(), "note".to_string()];
        let rows = vec![
            vec![Value::from(0), Value::from(1.5), Value::from("x")],
            vec![Value::from(1), Value::from(2.25), Value::Null],
        ];
        write_xlsx(&path, &columns, &rows).unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.columns, columns);
        assert_eq!(table.row_count(), 2);
        assert_eq!(
            table.cell(1, "CO2_g").and_then(|v| v.as_f64()),
            Some(2.25)
        );
    }

    #[test]
    fn stamped_name_keeps_stem_and_xlsx_suffix() {
        let (path, filename) =
            stamped_output_path(Path::new("/tmp/traj_01.csv"), Path::new("/out"));
        assert!(filename.starts_with("traj_01_result_"));
        assert!(filename.ends_with(".xlsx"));
        assert!(path.starts_with("/out"));
    }

    #[test]
    fn records_are_column_keyed() {
        let table = Table {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![Value::from(1), Value::from("x")]],
        };
        let records = table.records();
        assert_eq!(records[0]["a"], Value::from(1));
        assert_eq!(records[0]["b"], Value::from("x"));
    }
}
