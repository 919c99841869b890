//! The transform step contract and the derivative naming helper.
//!
//! A step is a pure `bytes -> bytes` transformation positioned at a fixed
//! ordinal within its pipeline. Document bookkeeping (derivative creation,
//! status changes, persistence) is never a step's concern; the workflow
//! runner owns it.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tdpflow_shared::{Result, TdpFlowError};

// ---------------------------------------------------------------------------
// Type-level declaration
// ---------------------------------------------------------------------------

/// Name and output file type of a concrete step type.
pub trait AgentType {
    /// Agent name recorded on every derivative this step produces.
    const NAME: &'static str;
    /// File extension of the step's output, without the dot.
    const OUTPUT_EXT: &'static str;
}

/// Per-instance identity of a step: name, pipeline position and output type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepHeader {
    name: String,
    step_num: u32,
    output_ext: String,
}

impl StepHeader {
    /// Header for a step of type `T` at `step_num`.
    pub fn of<T: AgentType>(step_num: u32) -> Result<Self> {
        Self::new(T::NAME, step_num, T::OUTPUT_EXT)
    }

    /// Header for a step declared at runtime. Fails when `output_ext` is blank.
    pub fn new(name: impl Into<String>, step_num: u32, output_ext: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let output_ext = output_ext.into();
        if output_ext.trim().is_empty() {
            return Err(TdpFlowError::construction(
                name,
                "output extension not provided",
            ));
        }
        Ok(Self {
            name,
            step_num,
            output_ext: output_ext.trim_start_matches('.').to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_num(&self) -> u32 {
        self.step_num
    }

    pub fn output_ext(&self) -> &str {
        &self.output_ext
    }
}

// ---------------------------------------------------------------------------
// Step contract
// ---------------------------------------------------------------------------

/// A unit of work in a pipeline.
#[async_trait]
pub trait TransformStep: Send + Sync {
    fn header(&self) -> &StepHeader;

    /// Agent name recorded as `AgentName` on produced derivatives.
    fn name(&self) -> &str {
        self.header().name()
    }

    fn step_num(&self) -> u32 {
        self.header().step_num()
    }

    fn output_ext(&self) -> &str {
        self.header().output_ext()
    }

    /// Name of the derivative this step produces from `source_file_name`.
    fn compute_output_filename(&self, source_file_name: &str) -> String {
        compute_output_filename(source_file_name, self.step_num(), self.output_ext())
    }

    /// Transform `content`. Errors are turned into step failures by the runner.
    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Derive an output file name: `<base>_<step_num>.<ext>`.
///
/// An existing `_<digits>` suffix on the base name is replaced rather than
/// extended, so re-running a step never accumulates suffixes. A name without
/// a `.` is all base name; a dot-file such as `.env` has an empty base.
pub fn compute_output_filename(source_file_name: &str, step_num: u32, output_ext: &str) -> String {
    let base = STEP_SUFFIX_RE.replace(base_name(source_file_name), "");
    format!("{base}_{step_num}.{output_ext}")
}

/// The step number encoded in a derivative file name, if any.
pub fn step_num_of(file_name: &str) -> Option<u32> {
    STEP_SUFFIX_RE
        .captures(base_name(file_name))
        .and_then(|caps| caps[1].parse().ok())
}

static STEP_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)$").expect("valid regex"));

fn base_name(file_name: &str) -> &str {
    file_name.rsplit_once('.').map_or(file_name, |(base, _)| base)
}

// ---------------------------------------------------------------------------
// Content helpers shared by the text steps
// ---------------------------------------------------------------------------

/// Interpret step input as UTF-8 text.
pub(crate) fn utf8(content: &[u8]) -> Result<&str> {
    std::str::from_utf8(content)
        .map_err(|e| TdpFlowError::content(format!("input is not valid UTF-8: {e}")))
}

/// Serialize a step's JSON output.
pub(crate) fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value)
        .map_err(|e| TdpFlowError::content(format!("failed to serialize output: {e}")))
}
