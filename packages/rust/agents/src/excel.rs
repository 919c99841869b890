//! Spreadsheet to JSON conversion.

use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, Range, Reader, open_workbook_auto_from_rs};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tdpflow_shared::{Result, TdpFlowError};

use crate::step::{AgentType, StepHeader, TransformStep, to_json};

/// Workbook JSON: `{"sheets": [{"name", "columns", "rows"}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

/// One worksheet. The first non-empty row provides the column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

/// Reads xlsx/xls/ods workbooks into [`Workbook`] JSON.
pub struct ExcelToJsonAgent {
    header: StepHeader,
}

impl AgentType for ExcelToJsonAgent {
    const NAME: &'static str = "ExcelToJsonAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl ExcelToJsonAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for ExcelToJsonAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(content.to_vec()))
            .map_err(|e| TdpFlowError::content(format!("unreadable workbook: {e}")))?;

        let mut sheets = Vec::new();
        for name in workbook.sheet_names().to_vec() {
            match workbook.worksheet_range(&name) {
                Ok(range) => sheets.push(range_to_sheet(&name, &range)),
                Err(e) => tracing::warn!(sheet = %name, error = %e, "skipping unreadable sheet"),
            }
        }

        if sheets.is_empty() {
            return Err(TdpFlowError::content("workbook contains no readable sheets"));
        }
        to_json(&Workbook { sheets })
    }
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.trim().to_string()),
        Data::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Data::Int(i) => Value::from(*i),
        Data::Bool(b) => Value::Bool(*b),
        Data::Error(e) => Value::String(format!("#ERR:{e:?}")),
        Data::DateTime(dt) => Value::String(dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
    }
}

fn cell_to_header(cell: &Data, position: usize) -> String {
    let name = match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    };
    if name.is_empty() {
        format!("column_{}", position + 1)
    } else {
        name
    }
}

/// Convert a worksheet range: header row first, blank rows skipped.
pub(crate) fn range_to_sheet(name: &str, range: &Range<Data>) -> Sheet {
    let mut rows = range
        .rows()
        .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)));

    let columns: Vec<String> = rows
        .next()
        .map(|header| {
            header
                .iter()
                .enumerate()
                .map(|(i, cell)| cell_to_header(cell, i))
                .collect()
        })
        .unwrap_or_default();

    let rows = rows
        .map(|row| {
            columns
                .iter()
                .zip(row.iter())
                .filter(|(_, cell)| !matches!(cell, Data::Empty))
                .map(|(column, cell)| (column.clone(), cell_to_value(cell)))
                .collect()
        })
        .collect();

    Sheet {
        name: name.to_string(),
        columns,
        rows,
    }
}
