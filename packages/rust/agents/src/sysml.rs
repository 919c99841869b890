//! SysML v2 textual notation: generation from tabular and diagram JSON,
//! a small reader for the subset we emit, and definition-level chunking.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tdpflow_shared::{Result, TdpFlowError};

use crate::chunk::Chunk;
use crate::excel::Workbook;
use crate::step::{AgentType, StepHeader, TransformStep, to_json, utf8};
use crate::visio::Diagram;

const DEFAULT_PACKAGE: &str = "Model";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysmlModel {
    pub packages: Vec<SysmlPackage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysmlPackage {
    pub name: String,
    pub definitions: Vec<SysmlDefinition>,
    pub connections: Vec<SysmlConnection>,
}

/// A `<kind> def <name>` element, e.g. `part def Wheel { ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysmlDefinition {
    pub kind: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Source text of the whole definition.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysmlConnection {
    pub label: Option<String>,
    pub from: String,
    pub to: String,
}

impl SysmlModel {
    pub fn definition_count(&self) -> usize {
        self.packages.iter().map(|p| p.definitions.len()).sum()
    }

    fn package_mut(&mut self, name: &str) -> &mut SysmlPackage {
        if let Some(i) = self.packages.iter().position(|p| p.name == name) {
            return &mut self.packages[i];
        }
        self.packages.push(SysmlPackage {
            name: name.to_string(),
            definitions: Vec::new(),
            connections: Vec::new(),
        });
        let last = self.packages.len() - 1;
        &mut self.packages[last]
    }
}

// ---------------------------------------------------------------------------
// Names and values
// ---------------------------------------------------------------------------

/// Render a name, quoting it unless it is a plain identifier.
pub fn sysml_name(name: &str) -> String {
    static IDENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

    if IDENT_RE.is_match(name) {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn unquote(name: &str) -> String {
    match name.strip_prefix('\'').and_then(|n| n.strip_suffix('\'')) {
        Some(inner) => inner.replace("\\'", "'").replace("\\\\", "\\"),
        None => name.to_string(),
    }
}

fn sysml_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
        other => Some(format!(
            "\"{}\"",
            other.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

fn value_to_label(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

const NAME: &str = r"'(?:[^'\\]|\\.)*'|[A-Za-z_][A-Za-z0-9_]*";

/// Parse the SysML subset used across the pipeline: packages, `* def`
/// elements with attributes, and `connect ... to ...` statements.
pub fn parse_sysml(text: &str) -> Result<SysmlModel> {
    static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(r"^\s*package\s+({NAME})\s*\{{")).expect("valid regex")
    });
    static DEF_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(
            r"^\s*((?:abstract\s+)?[a-z]+\s+def)\s+({NAME})\s*(?::>\s*\S+\s*)?([{{;])?"
        ))
        .expect("valid regex")
    });
    static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(
            r"^\s*attribute\s+({NAME})\s*(?::\s*[^=;]+?)?\s*(?:=\s*(.+?))?\s*;"
        ))
        .expect("valid regex")
    });
    static CONNECT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(
            r"^\s*(?:connection\s+({NAME})\s+)?connect\s+({NAME})\s+to\s+({NAME})\s*;"
        ))
        .expect("valid regex")
    });

    let mut model = SysmlModel::default();
    let mut package: Option<(String, i32)> = None;
    let mut open_def: Option<(SysmlDefinition, i32)> = None;
    let mut depth: i32 = 0;

    for line in text.lines() {
        let opens = line.matches('{').count() as i32;
        let closes = line.matches('}').count() as i32;

        if let Some((def, def_depth)) = open_def.as_mut() {
            def.text.push('\n');
            def.text.push_str(line);
            if let Some(caps) = ATTR_RE.captures(line) {
                let value = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
                def.attributes.push((unquote(&caps[1]), value));
            }
            depth += opens - closes;
            if depth <= *def_depth {
                let package_name = package
                    .as_ref()
                    .map_or(DEFAULT_PACKAGE, |(name, _)| name.as_str())
                    .to_string();
                if let Some((def, _)) = open_def.take() {
                    model.package_mut(&package_name).definitions.push(def);
                }
            }
            continue;
        }

        if let Some(caps) = PACKAGE_RE.captures(line) {
            package = Some((unquote(&caps[1]), depth));
            model.package_mut(&unquote(&caps[1]));
            depth += opens - closes;
            continue;
        }

        let package_name = package
            .as_ref()
            .map_or(DEFAULT_PACKAGE, |(name, _)| name.as_str())
            .to_string();

        if let Some(caps) = DEF_RE.captures(line) {
            let def = SysmlDefinition {
                kind: caps[1].split_whitespace().collect::<Vec<_>>().join(" "),
                name: unquote(&caps[2]),
                attributes: Vec::new(),
                text: line.trim_end().to_string(),
            };
            if opens > closes {
                open_def = Some((def, depth));
            } else {
                model.package_mut(&package_name).definitions.push(def);
            }
            depth += opens - closes;
            continue;
        }

        if let Some(caps) = CONNECT_RE.captures(line) {
            model
                .package_mut(&package_name)
                .connections
                .push(SysmlConnection {
                    label: caps.get(1).map(|m| unquote(m.as_str())),
                    from: unquote(&caps[2]),
                    to: unquote(&caps[3]),
                });
        }

        depth += opens - closes;
        if let Some((_, package_depth)) = &package {
            if depth <= *package_depth {
                package = None;
            }
        }
    }

    if let Some((def, _)) = open_def {
        return Err(TdpFlowError::content(format!(
            "unterminated definition '{}'",
            def.name
        )));
    }
    model
        .packages
        .retain(|p| !p.definitions.is_empty() || !p.connections.is_empty());
    if model.packages.is_empty() {
        return Err(TdpFlowError::content("no SysML definitions found"));
    }
    Ok(model)
}

// ---------------------------------------------------------------------------
// JsonToSysmlAgent
// ---------------------------------------------------------------------------

/// Renders workbook JSON (or a bare array of objects) as SysML `part def`s.
///
/// Each sheet becomes a package; each row a part definition named by its
/// first column, with the remaining columns as attributes.
pub struct JsonToSysmlAgent {
    header: StepHeader,
}

impl AgentType for JsonToSysmlAgent {
    const NAME: &'static str = "JsonToSysmlAgent";
    const OUTPUT_EXT: &'static str = "sysml";
}

impl JsonToSysmlAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for JsonToSysmlAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let value: Value = serde_json::from_slice(content)
            .map_err(|e| TdpFlowError::content(format!("expected JSON input: {e}")))?;

        let tables: Vec<(String, Vec<String>, Vec<Map<String, Value>>)> =
            if value.get("sheets").is_some() {
                let workbook: Workbook = serde_json::from_value(value)
                    .map_err(|e| TdpFlowError::content(format!("malformed workbook JSON: {e}")))?;
                workbook
                    .sheets
                    .into_iter()
                    .map(|s| (s.name, s.columns, s.rows))
                    .collect()
            } else if let Value::Array(items) = value {
                let rows: Vec<Map<String, Value>> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect();
                let columns = rows
                    .first()
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default();
                vec![(DEFAULT_PACKAGE.to_string(), columns, rows)]
            } else {
                return Err(TdpFlowError::content(
                    "expected workbook JSON or an array of objects",
                ));
            };

        let mut out = String::new();
        for (name, columns, rows) in &tables {
            render_table(&mut out, name, columns, rows);
        }
        if out.is_empty() {
            return Err(TdpFlowError::content("no rows to convert"));
        }
        Ok(out.into_bytes())
    }
}

fn render_table(out: &mut String, name: &str, columns: &[String], rows: &[Map<String, Value>]) {
    if rows.is_empty() {
        return;
    }
    let _ = writeln!(out, "package {} {{", sysml_name(name));
    let mut seen = HashSet::new();
    for (i, row) in rows.iter().enumerate() {
        let base = columns
            .first()
            .and_then(|c| value_to_label(row.get(c)))
            .unwrap_or_else(|| format!("Row{}", i + 1));
        let mut part = base.clone();
        let mut n = 2;
        while !seen.insert(part.clone()) {
            part = format!("{base}_{n}");
            n += 1;
        }

        let _ = writeln!(out, "    part def {} {{", sysml_name(&part));
        for column in columns {
            if let Some(value) = row.get(column).and_then(sysml_value) {
                let _ = writeln!(out, "        attribute {} = {value};", sysml_name(column));
            }
        }
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");
}

// ---------------------------------------------------------------------------
// VisioJsonToSysmlAgent
// ---------------------------------------------------------------------------

/// Renders diagram JSON as one package per page: a `part def` per shape and
/// a `connect` statement per edge.
pub struct VisioJsonToSysmlAgent {
    header: StepHeader,
}

impl AgentType for VisioJsonToSysmlAgent {
    const NAME: &'static str = "VisioJsonToSysmlAgent";
    const OUTPUT_EXT: &'static str = "sysml";
}

impl VisioJsonToSysmlAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for VisioJsonToSysmlAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let diagram: Diagram = serde_json::from_slice(content)
            .map_err(|e| TdpFlowError::content(format!("expected diagram JSON: {e}")))?;

        let mut out = String::new();
        for page in &diagram.pages {
            if page.shapes.is_empty() {
                continue;
            }
            let _ = writeln!(out, "package {} {{", sysml_name(&format!("Page {}", page.number)));
            let mut seen = HashSet::new();
            for shape in &page.shapes {
                if seen.insert(shape.text.as_str()) {
                    let _ = writeln!(out, "    part def {};", sysml_name(&shape.text));
                }
            }
            for edge in &page.edges {
                let _ = match &edge.label {
                    Some(label) => writeln!(
                        out,
                        "    connection {} connect {} to {};",
                        sysml_name(label),
                        sysml_name(&edge.from),
                        sysml_name(&edge.to)
                    ),
                    None => writeln!(
                        out,
                        "    connect {} to {};",
                        sysml_name(&edge.from),
                        sysml_name(&edge.to)
                    ),
                };
            }
            let _ = writeln!(out, "}}");
        }

        if out.is_empty() {
            return Err(TdpFlowError::content("diagram has no labelled shapes"));
        }
        Ok(out.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// SysmlChunkAgent
// ---------------------------------------------------------------------------

/// One chunk per SysML definition, titled `<package>::<name>`.
pub struct SysmlChunkAgent {
    header: StepHeader,
}

impl AgentType for SysmlChunkAgent {
    const NAME: &'static str = "SysmlChunkAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl SysmlChunkAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for SysmlChunkAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let model = parse_sysml(utf8(content)?)?;
        let mut chunks = Vec::new();
        for package in &model.packages {
            for def in &package.definitions {
                chunks.push(Chunk {
                    index: chunks.len(),
                    title: Some(format!("{}::{}", package.name, def.name)),
                    page: None,
                    text: format!("package {} {{\n{}\n}}", sysml_name(&package.name), def.text),
                });
            }
            for connection in &package.connections {
                chunks.push(Chunk {
                    index: chunks.len(),
                    title: Some(format!(
                        "{}::{} -> {}",
                        package.name, connection.from, connection.to
                    )),
                    page: None,
                    text: format!(
                        "{} {} {}",
                        connection.from,
                        connection.label.as_deref().unwrap_or("connects to"),
                        connection.to
                    ),
                });
            }
        }
        to_json(&chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::parse_chunks;
    use crate::visio::{DiagramEdge, DiagramPage, DiagramShape};

    #[test]
    fn names_are_quoted_when_needed() {
        assert_eq!(sysml_name("Wheel"), "Wheel");
        assert_eq!(sysml_name("Sensor & Bus"), "'Sensor & Bus'");
        assert_eq!(sysml_name("it's"), r"'it\'s'");
        assert_eq!(unquote(r"'it\'s'"), "it's");
    }

    #[tokio::test]
    async fn workbook_rows_become_part_defs() {
        let agent = JsonToSysmlAgent::new(2).unwrap();
        let workbook = serde_json::json!({
            "sheets": [{
                "name": "Parts",
                "columns": ["Part", "Mass", "Supplier"],
                "rows": [
                    {"Part": "Wheel", "Mass": 2.5, "Supplier": "Acme \"West\""},
                    {"Part": "Wheel", "Mass": 3},
                    {"Mass": 1}
                ]
            }]
        });
        let out = agent
            .process_content(workbook.to_string().as_bytes())
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("package Parts {"));
        assert!(text.contains("part def Wheel {"));
        assert!(text.contains("part def Wheel_2 {"));
        assert!(text.contains("part def Row3 {"));
        assert!(text.contains(r#"attribute Supplier = "Acme \"West\"";"#));

        let model = parse_sysml(&text).unwrap();
        assert_eq!(model.definition_count(), 3);
        let wheel = &model.packages[0].definitions[0];
        assert_eq!(wheel.kind, "part def");
        assert!(wheel.attributes.contains(&("Mass".to_string(), "2.5".to_string())));
    }

    #[tokio::test]
    async fn array_of_objects_uses_default_package() {
        let agent = JsonToSysmlAgent::new(2).unwrap();
        let out = agent
            .process_content(br#"[{"name": "Pump", "flow": 10}]"#)
            .await
            .unwrap();
        let model = parse_sysml(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(model.packages[0].name, "Model");
        assert_eq!(model.packages[0].definitions[0].name, "Pump");
    }

    #[tokio::test]
    async fn scalar_json_is_rejected() {
        let agent = JsonToSysmlAgent::new(2).unwrap();
        assert!(agent.process_content(b"42").await.is_err());
        assert!(agent.process_content(b"not json").await.is_err());
    }

    fn diagram() -> Diagram {
        Diagram {
            pages: vec![DiagramPage {
                number: 1,
                shapes: vec![
                    DiagramShape {
                        id: "1".into(),
                        text: "Flight Computer".into(),
                        master: None,
                        x: None,
                        y: None,
                    },
                    DiagramShape {
                        id: "2".into(),
                        text: "Bus".into(),
                        master: None,
                        x: None,
                        y: None,
                    },
                ],
                edges: vec![DiagramEdge {
                    from: "Flight Computer".into(),
                    to: "Bus".into(),
                    label: Some("data link".into()),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn diagram_becomes_package_with_connections() {
        let agent = VisioJsonToSysmlAgent::new(2).unwrap();
        let input = serde_json::to_vec(&diagram()).unwrap();
        let out = agent.process_content(&input).await.unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("package 'Page 1' {"));
        assert!(text.contains("connection 'data link' connect 'Flight Computer' to Bus;"));

        let model = parse_sysml(&text).unwrap();
        let package = &model.packages[0];
        assert_eq!(package.name, "Page 1");
        assert_eq!(package.definitions.len(), 2);
        assert_eq!(
            package.connections,
            vec![SysmlConnection {
                label: Some("data link".into()),
                from: "Flight Computer".into(),
                to: "Bus".into(),
            }]
        );
    }

    #[tokio::test]
    async fn sysml_chunks_per_definition() {
        let agent = SysmlChunkAgent::new(3).unwrap();
        let text = "package Vehicle {\n    part def Engine {\n        attribute power = 120;\n    }\n    part def Wheel;\n    connect Engine to Wheel;\n}\n";
        let out = agent.process_content(text.as_bytes()).await.unwrap();
        let chunks = parse_chunks(&out).unwrap();

        let titles: Vec<&str> = chunks.iter().filter_map(|c| c.title.as_deref()).collect();
        assert_eq!(
            titles,
            vec!["Vehicle::Engine", "Vehicle::Wheel", "Vehicle::Engine -> Wheel"]
        );
        assert!(chunks[0].text.contains("attribute power = 120;"));
        assert_eq!(chunks[2].text, "Engine connects to Wheel");
    }

    #[test]
    fn parse_rejects_text_without_definitions() {
        assert!(parse_sysml("just some prose").is_err());
        assert!(parse_sysml("package P {\n part def A {\n").is_err());
    }
}
