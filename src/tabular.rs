use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

/// Extensions the previewer is asked about. Only CSV is decoded natively;
/// the spreadsheet formats are named in errors so the UI can say why.
const TABULAR_EXTS: &[&str] = &["csv", "xlsx", "xls", "xlsm", "xlsb"];

pub fn is_tabular_extension(ext: &str) -> bool {
    TABULAR_EXTS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Inferred column type, coarse on purpose: enough for the UI and the
/// metadata summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    Str,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Str => "str",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "dtype")]
    pub dtype: ColumnType,
}

/// One page of a decoded tabular file, in the shape the browser's dataframe
/// viewer consumes.
#[derive(Debug, Serialize)]
pub struct DataframePage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub columns: Vec<String>,
    #[serde(rename = "columnInfo")]
    pub column_info: Vec<ColumnInfo>,
    pub data: Vec<Vec<Value>>,
    #[serde(rename = "totalRows")]
    pub total_rows: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sort {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// Read a page of rows from a tabular file.
pub fn preview(path: &Path, offset: usize, limit: usize) -> Result<DataframePage> {
    query(path, &[], None, offset, limit)
}

/// Read rows with optional filters and sort applied before pagination.
pub fn query(
    path: &Path,
    filters: &[Filter],
    sort: Option<&Sort>,
    offset: usize,
    limit: usize,
) -> Result<DataframePage> {
    let ext = crate::policy::extension_of(path).unwrap_or_default();
    if ext != "csv" {
        bail!("unsupported tabular format: .{ext}");
    }
    let limit = if limit == 0 { DEFAULT_PREVIEW_LIMIT } else { limit };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .context("read csv header")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.context("read csv record")?;
        let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        row.resize(columns.len(), String::new());
        rows.push(row);
    }

    let column_info = infer_columns(&columns, &rows);

    if !filters.is_empty() {
        let indices: Vec<Option<usize>> = filters
            .iter()
            .map(|f| columns.iter().position(|c| c == &f.column))
            .collect();
        rows.retain(|row| {
            filters.iter().zip(&indices).all(|(filter, idx)| match idx {
                Some(i) => matches_filter(&row[*i], filter),
                None => false,
            })
        });
    }

    if let Some(sort) = sort {
        if let Some(idx) = columns.iter().position(|c| c == &sort.column) {
            rows.sort_by(|a, b| compare_cells(&a[idx], &b[idx]));
            if sort.descending {
                rows.reverse();
            }
        }
    }

    let total_rows = rows.len();
    let data: Vec<Vec<Value>> = rows
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|row| {
            row.iter()
                .zip(&column_info)
                .map(|(cell, info)| cell_to_value(cell, info.dtype))
                .collect()
        })
        .collect();

    Ok(DataframePage {
        kind: "dataframe",
        columns,
        column_info,
        data,
        total_rows,
        offset,
        limit,
    })
}

/// Row count and typed column list, for the metadata summaries.
pub fn summarize(path: &Path) -> Result<(usize, Vec<ColumnInfo>)> {
    let page = query(path, &[], None, 0, usize::MAX)?;
    Ok((page.total_rows, page.column_info))
}

fn infer_columns(columns: &[String], rows: &[Vec<String>]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut dtype: Option<ColumnType> = None;
            for row in rows {
                let cell = row[i].trim();
                if cell.is_empty() {
                    continue;
                }
                let this = infer_cell(cell);
                dtype = Some(match (dtype, this) {
                    (None, t) => t,
                    (Some(a), b) if a == b => a,
                    // ints widen to floats; everything else collapses to str
                    (Some(ColumnType::Int), ColumnType::Float)
                    | (Some(ColumnType::Float), ColumnType::Int) => ColumnType::Float,
                    _ => ColumnType::Str,
                });
                if dtype == Some(ColumnType::Str) {
                    break;
                }
            }
            ColumnInfo {
                name: name.clone(),
                dtype: dtype.unwrap_or(ColumnType::Str),
            }
        })
        .collect()
}

fn infer_cell(cell: &str) -> ColumnType {
    if cell.parse::<i64>().is_ok() {
        ColumnType::Int
    } else if cell.parse::<f64>().is_ok() {
        ColumnType::Float
    } else if cell.eq_ignore_ascii_case("true") || cell.eq_ignore_ascii_case("false") {
        ColumnType::Bool
    } else {
        ColumnType::Str
    }
}

fn cell_to_value(cell: &str, dtype: ColumnType) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match dtype {
        ColumnType::Int => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(cell.to_string())),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(cell.to_string())),
        ColumnType::Bool => Value::Bool(trimmed.eq_ignore_ascii_case("true")),
        ColumnType::Str => Value::String(cell.to_string()),
    }
}

fn matches_filter(cell: &str, filter: &Filter) -> bool {
    let cell = cell.trim();
    let wanted = filter.value.trim();
    match filter.op.as_str() {
        "eq" => compare_cells(cell, wanted) == std::cmp::Ordering::Equal,
        "neq" => compare_cells(cell, wanted) != std::cmp::Ordering::Equal,
        "contains" => cell.to_lowercase().contains(&wanted.to_lowercase()),
        "gt" => compare_cells(cell, wanted) == std::cmp::Ordering::Greater,
        "lt" => compare_cells(cell, wanted) == std::cmp::Ordering::Less,
        "gte" => compare_cells(cell, wanted) != std::cmp::Ordering::Less,
        "lte" => compare_cells(cell, wanted) != std::cmp::Ordering::Greater,
        _ => false,
    }
}

/// Numeric comparison when both sides parse; lexicographic otherwise.
fn compare_cells(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::SystemTime;

    fn write_csv(name: &str, body: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("vibefoundry-tabular-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn preview_infers_types_and_paginates() {
        let path = write_csv(
            "sales.csv",
            "region,units,price,active\nwest,3,9.5,true\neast,7,1.25,false\nnorth,2,4.0,true\n",
        );
        let page = preview(&path, 1, 1).unwrap();
        assert_eq!(page.kind, "dataframe");
        assert_eq!(page.columns, ["region", "units", "price", "active"]);
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0][0], Value::String("east".into()));
        assert_eq!(page.data[0][1], Value::from(7));
        assert_eq!(page.data[0][3], Value::Bool(false));

        let dtypes: Vec<&str> = page.column_info.iter().map(|c| c.dtype.as_str()).collect();
        assert_eq!(dtypes, ["str", "int", "float", "bool"]);
    }

    #[test]
    fn int_column_with_float_entry_widens() {
        let path = write_csv("mix.csv", "v\n1\n2.5\n3\n");
        let page = preview(&path, 0, 10).unwrap();
        assert_eq!(page.column_info[0].dtype, ColumnType::Float);
    }

    #[test]
    fn filters_and_sort_apply_before_pagination() {
        let path = write_csv(
            "units.csv",
            "name,units\na,5\nb,12\nc,7\nd,1\n",
        );
        let filters = vec![Filter {
            column: "units".into(),
            op: "gt".into(),
            value: "4".into(),
        }];
        let sort = Sort {
            column: "units".into(),
            descending: true,
        };
        let page = query(&path, &filters, Some(&sort), 0, 10).unwrap();
        assert_eq!(page.total_rows, 3);
        let names: Vec<&Value> = page.data.iter().map(|r| &r[0]).collect();
        assert_eq!(
            names,
            [
                &Value::String("b".into()),
                &Value::String("c".into()),
                &Value::String("a".into())
            ]
        );
    }

    #[test]
    fn unknown_filter_column_matches_nothing() {
        let path = write_csv("u.csv", "a\n1\n2\n");
        let filters = vec![Filter {
            column: "nope".into(),
            op: "eq".into(),
            value: "1".into(),
        }];
        let page = query(&path, &filters, None, 0, 10).unwrap();
        assert_eq!(page.total_rows, 0);
    }

    #[test]
    fn spreadsheet_formats_are_named_in_error() {
        let path = write_csv("book.xlsx", "not-a-real-workbook");
        let err = preview(&path, 0, 10).unwrap_err();
        assert!(err.to_string().contains("xlsx"));
    }

    #[test]
    fn summarize_reports_rows_and_columns() {
        let path = write_csv("s.csv", "x,y\n1,a\n2,b\n");
        let (rows, cols) = summarize(&path).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].dtype, ColumnType::Int);
    }
}
