//! Visio (`.vsdx`) diagram extraction.
//!
//! A vsdx file is a zip archive; each `visio/pages/page*.xml` holds the
//! page's `<Shape>` elements and a `<Connects>` block wiring connector
//! shapes to the shapes at either end.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use tdpflow_shared::{Result, TdpFlowError};
use zip::ZipArchive;

use crate::step::{AgentType, StepHeader, TransformStep, to_json};

/// Diagram JSON produced by [`VisioAgent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    pub pages: Vec<DiagramPage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramPage {
    pub number: usize,
    pub shapes: Vec<DiagramShape>,
    pub edges: Vec<DiagramEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramShape {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// A resolved connection between two labelled shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Extracts shapes and connector edges from a vsdx archive.
pub struct VisioAgent {
    header: StepHeader,
}

impl AgentType for VisioAgent {
    const NAME: &'static str = "VisioAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl VisioAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for VisioAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let diagram = parse_vsdx(content)?;
        tracing::debug!(pages = diagram.pages.len(), "visio diagram parsed");
        to_json(&diagram)
    }
}

/// Read every page of a vsdx archive, in page-number order.
pub(crate) fn parse_vsdx(content: &[u8]) -> Result<Diagram> {
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| TdpFlowError::content(format!("not a vsdx archive: {e}")))?;

    let mut pages: BTreeMap<usize, String> = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| TdpFlowError::content(format!("corrupt vsdx entry: {e}")))?;
        let Some(number) = page_number(file.name()) else {
            continue;
        };
        let mut xml = String::new();
        file.read_to_string(&mut xml)
            .map_err(|e| TdpFlowError::content(format!("unreadable page xml: {e}")))?;
        pages.insert(number, xml);
    }

    if pages.is_empty() {
        return Err(TdpFlowError::content("vsdx archive contains no pages"));
    }

    pages
        .into_iter()
        .map(|(number, xml)| parse_page(number, &xml))
        .collect::<Result<Vec<_>>>()
        .map(|pages| Diagram { pages })
}

/// `visio/pages/page3.xml` -> 3.
fn page_number(entry: &str) -> Option<usize> {
    entry
        .strip_prefix("visio/pages/page")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

#[derive(Debug, Default)]
struct ShapeState {
    id: String,
    master: Option<String>,
    text: String,
    x: Option<f64>,
    y: Option<f64>,
}

#[derive(Debug)]
struct Connect {
    connector: String,
    shape: String,
    begin: bool,
}

fn attr(e: &BytesStart<'_>, reader: &Reader<&[u8]>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.decode_and_unescape_value(reader).ok())
        .map(|v| v.to_string())
}

fn parse_page(number: usize, xml: &str) -> Result<DiagramPage> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut shapes: Vec<ShapeState> = Vec::new();
    // Nested group shapes push onto the stack.
    let mut stack: Vec<ShapeState> = Vec::new();
    let mut in_text = false;
    let mut connects = Vec::new();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| TdpFlowError::content(format!("page {number} xml error: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    b"Shape" => {
                        let shape = ShapeState {
                            id: attr(e, &reader, b"ID").unwrap_or_default(),
                            master: attr(e, &reader, b"Master"),
                            ..Default::default()
                        };
                        if empty {
                            shapes.push(shape);
                        } else {
                            stack.push(shape);
                        }
                    }
                    b"Text" if !empty && !stack.is_empty() => in_text = true,
                    b"Cell" => {
                        if let (Some(shape), Some(n), Some(v)) = (
                            stack.last_mut(),
                            attr(e, &reader, b"N"),
                            attr(e, &reader, b"V"),
                        ) {
                            match n.as_str() {
                                "PinX" => shape.x = v.parse().ok(),
                                "PinY" => shape.y = v.parse().ok(),
                                _ => {}
                            }
                        }
                    }
                    b"Connect" => {
                        let from_cell = attr(e, &reader, b"FromCell").unwrap_or_default();
                        if let (Some(connector), Some(shape)) =
                            (attr(e, &reader, b"FromSheet"), attr(e, &reader, b"ToSheet"))
                        {
                            connects.push(Connect {
                                connector,
                                shape,
                                begin: from_cell.starts_with("Begin"),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(e) if in_text => {
                let text = e
                    .unescape()
                    .map_err(|e| TdpFlowError::content(format!("page {number} text: {e}")))?;
                if let Some(shape) = stack.last_mut() {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        if !shape.text.is_empty() {
                            shape.text.push(' ');
                        }
                        shape.text.push_str(trimmed);
                    }
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"Text" => in_text = false,
                b"Shape" => {
                    if let Some(shape) = stack.pop() {
                        shapes.push(shape);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(assemble_page(number, shapes, connects))
}

/// Keep labelled shapes and resolve connectors into edges.
///
/// A connector contributes an edge when both its begin and end are glued to
/// labelled shapes; the connector's own text becomes the edge label.
fn assemble_page(number: usize, shapes: Vec<ShapeState>, connects: Vec<Connect>) -> DiagramPage {
    let labels: HashMap<&str, &str> = shapes
        .iter()
        .filter(|s| !s.text.is_empty())
        .map(|s| (s.id.as_str(), s.text.as_str()))
        .collect();

    let mut ends: BTreeMap<&str, (Option<&str>, Option<&str>)> = BTreeMap::new();
    for connect in &connects {
        let entry = ends.entry(connect.connector.as_str()).or_default();
        if connect.begin {
            entry.0 = Some(connect.shape.as_str());
        } else {
            entry.1 = Some(connect.shape.as_str());
        }
    }

    let mut edges = Vec::new();
    for (connector, (begin, end)) in &ends {
        let (Some(from), Some(to)) = (
            begin.and_then(|id| labels.get(id)),
            end.and_then(|id| labels.get(id)),
        ) else {
            continue;
        };
        let edge = DiagramEdge {
            from: from.to_string(),
            to: to.to_string(),
            label: labels.get(connector).map(|l| l.to_string()),
        };
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    }

    let connectors: Vec<&str> = ends.keys().copied().collect();
    let shapes = shapes
        .iter()
        .filter(|s| !s.text.is_empty() && !connectors.contains(&s.id.as_str()))
        .map(|s| DiagramShape {
            id: s.id.clone(),
            text: s.text.clone(),
            master: s.master.clone(),
            x: s.x,
            y: s.y,
        })
        .collect();

    DiagramPage {
        number,
        shapes,
        edges,
    }
}
