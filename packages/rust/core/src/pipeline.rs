//! Declarative pipelines and the generic executor that runs them.
//!
//! A [`PipelineSpec`] is an ordered list of steps, each naming what to run
//! and where its input content and provenance parent come from. One
//! executor ([`AgentGroup`]) interprets every pipeline with fail-fast semantics.

use async_trait::async_trait;
use tracing::{debug, info};

use tdpflow_agents::{
    AgentRegistry, BuildContext, StepHeader, StepKind, TransformStep, compute_output_filename,
};
use tdpflow_shared::{Document, Result, TdpFlowError};

use crate::groups::GroupCatalog;
use crate::runner::{StepOutcome, WorkflowRunner};

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// What a pipeline step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    /// A built-in step.
    Agent(StepKind),
    /// A nested group, by catalogue name.
    Group(String),
    /// A step registered on the agent registry under this name.
    Custom(String),
}

/// Where a step's input content comes from. Step numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Output of the immediately preceding step (the group input for step 1).
    Previous,
    /// Output of an earlier step.
    Step(usize),
    /// The stored raw content of the group's source document.
    Source,
}

/// Which document a step's output is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Previous,
    Step(usize),
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub target: StepTarget,
    pub input: Input,
    pub parent: Parent,
    /// Step whose output configures this step at construction.
    pub configure_from: Option<usize>,
}

impl StepSpec {
    pub fn agent(kind: StepKind) -> Self {
        Self::new(StepTarget::Agent(kind))
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(StepTarget::Group(name.into()))
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::new(StepTarget::Custom(name.into()))
    }

    fn new(target: StepTarget) -> Self {
        Self {
            target,
            input: Input::Previous,
            parent: Parent::Previous,
            configure_from: None,
        }
    }

    pub fn input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    pub fn parent(mut self, parent: Parent) -> Self {
        self.parent = parent;
        self
    }

    /// Re-fan-out: take input from step `n` and derive from its document.
    pub fn from_step(self, n: usize) -> Self {
        self.input(Input::Step(n)).parent(Parent::Step(n))
    }

    /// Re-derive from the group's source document.
    pub fn from_source(self) -> Self {
        self.input(Input::Source).parent(Parent::Source)
    }

    pub fn configured_by(mut self, n: usize) -> Self {
        self.configure_from = Some(n);
        self
    }

    fn target_name(&self) -> &str {
        match &self.target {
            StepTarget::Agent(kind) => kind.name(),
            StepTarget::Group(name) | StepTarget::Custom(name) => name,
        }
    }
}

/// A named, statically ordered pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    /// Extension of the group's final output.
    pub output_ext: String,
    pub steps: Vec<StepSpec>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, output_ext: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            output_ext: output_ext.into(),
            steps,
        }
    }

    /// Check the wiring: references point backwards, source input pairs
    /// with a source parent.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| TdpFlowError::construction(&self.name, message);

        if self.name.trim().is_empty() {
            return Err(TdpFlowError::construction("pipeline", "name not provided"));
        }
        if self.output_ext.trim().is_empty() {
            return Err(invalid("output extension not provided".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("pipeline has no steps".into()));
        }

        for (i, step) in self.steps.iter().enumerate() {
            let step_num = i + 1;
            let check = |what: &str, n: usize| {
                if n == 0 || n >= step_num {
                    Err(invalid(format!(
                        "step {step_num} {what} refers to step {n}, which does not precede it"
                    )))
                } else {
                    Ok(())
                }
            };
            if let Input::Step(n) = step.input {
                check("input", n)?;
            }
            if let Parent::Step(n) = step.parent {
                check("parent", n)?;
            }
            if let Some(n) = step.configure_from {
                check("configuration", n)?;
            }
            if step.input == Input::Source && step.parent != Parent::Source {
                return Err(invalid(format!(
                    "step {step_num} reads the source but derives from another document"
                )));
            }
            if let StepTarget::Group(name) = &step.target {
                if *name == self.name {
                    return Err(invalid(format!("step {step_num} nests the group in itself")));
                }
            }
        }
        Ok(())
    }

    /// How many step numbers a run of this pipeline occupies. A nested
    /// group counts every step it runs.
    pub fn span(&self, groups: &GroupCatalog) -> Result<u32> {
        let mut total = 0;
        for step in &self.steps {
            total += match &step.target {
                StepTarget::Group(name) => groups
                    .get(name)
                    .ok_or_else(|| TdpFlowError::construction(name, "unknown agent group"))?
                    .span(groups)?,
                _ => 1,
            };
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A pipeline bound to its registry and catalogue, ready to run.
///
/// Satisfies [`TransformStep`] so groups nest: `process_content` evaluates
/// the wiring in memory, while [`AgentGroup::run`] executes every step
/// through the runner with full bookkeeping.
pub struct AgentGroup<'a> {
    header: StepHeader,
    spec: PipelineSpec,
    registry: &'a AgentRegistry,
    groups: &'a GroupCatalog,
    context: BuildContext,
}

impl<'a> AgentGroup<'a> {
    pub fn new(
        spec: PipelineSpec,
        step_num: u32,
        registry: &'a AgentRegistry,
        groups: &'a GroupCatalog,
        context: BuildContext,
    ) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            header: StepHeader::new(spec.name.clone(), step_num, spec.output_ext.clone())?,
            spec,
            registry,
            groups,
            context,
        })
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    fn output_ext_of(&self, target: &StepTarget) -> Result<String> {
        match target {
            StepTarget::Agent(kind) => Ok(kind.output_ext().to_string()),
            StepTarget::Custom(name) => self
                .registry
                .output_ext(name)
                .ok_or_else(|| TdpFlowError::construction(name, "unknown agent")),
            StepTarget::Group(name) => self
                .groups
                .get(name)
                .map(|spec| spec.output_ext.clone())
                .ok_or_else(|| TdpFlowError::construction(name, "unknown agent group")),
        }
    }

    fn build_leaf(
        &self,
        target: &StepTarget,
        step_num: u32,
        configuration: Option<Vec<u8>>,
    ) -> Result<Box<dyn TransformStep + 'a>> {
        let ctx = self.context.clone().with_configuration(configuration);
        match target {
            StepTarget::Agent(kind) => self.registry.build(*kind, step_num, &ctx),
            StepTarget::Custom(name) => self.registry.build_named(name, step_num, &ctx),
            StepTarget::Group(name) => {
                let spec = self
                    .groups
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TdpFlowError::construction(name, "unknown agent group"))?;
                Ok(Box::new(AgentGroup::new(
                    spec,
                    step_num,
                    self.registry,
                    self.groups,
                    ctx,
                )?))
            }
        }
    }

    /// Execute every step in order, stopping at the first failure.
    ///
    /// `input` is the content handed to step 1 (the stored content of
    /// `source` when absent). A failed step's outcome is returned unchanged;
    /// misconfiguration surfaces as `Err`.
    ///
    /// Steps are numbered from this group's own step number onwards and a
    /// nested group takes one number per step it runs, so every derivative
    /// of one run gets a distinct name.
    pub async fn run(
        &self,
        runner: &WorkflowRunner<'a>,
        source: &Document,
        input: Option<&[u8]>,
    ) -> Result<StepOutcome> {
        info!(group = %self.spec.name, steps = self.spec.steps.len(), "running group");
        let mut produced: Vec<(Option<Vec<u8>>, Document)> = Vec::with_capacity(self.spec.steps.len());
        let mut last: Option<StepOutcome> = None;
        let mut step_num = self.header.step_num();

        for (i, spec) in self.spec.steps.iter().enumerate() {
            let content: Option<&[u8]> = match spec.input {
                Input::Previous if i == 0 => input,
                Input::Previous => produced[i - 1].0.as_deref(),
                Input::Step(n) => produced[n - 1].0.as_deref(),
                Input::Source => None,
            };
            let parent: &Document = match spec.parent {
                Parent::Previous if i == 0 => source,
                Parent::Previous => &produced[i - 1].1,
                Parent::Step(n) => &produced[n - 1].1,
                Parent::Source => source,
            };
            let configuration = spec
                .configure_from
                .and_then(|n| produced[n - 1].0.clone());

            debug!(
                step = step_num,
                agent = spec.target_name(),
                parent = parent.file_name(),
                "wiring step"
            );

            let outcome = match &spec.target {
                StepTarget::Group(name) => {
                    let group = runner.group(name, step_num, parent)?;
                    let outcome = Box::pin(group.run(runner, parent, content)).await?;
                    step_num += group.spec().span(self.groups)?;
                    outcome
                }
                target => {
                    let outcome = match self.build_leaf(target, step_num, configuration) {
                        Ok(step) => runner.execute_step(step.as_ref(), content, parent).await?,
                        Err(e) if e.is_construction() => return Err(e),
                        Err(e) => {
                            let ext = self.output_ext_of(target)?;
                            let output_name =
                                compute_output_filename(parent.file_name(), step_num, &ext);
                            runner
                                .record_failure(&output_name, spec.target_name(), parent, e.to_string())
                                .await?
                        }
                    };
                    step_num += 1;
                    outcome
                }
            };

            if !outcome.success {
                return Ok(outcome);
            }
            produced.push((outcome.content.clone(), outcome.document.clone()));
            last = Some(outcome);
        }

        last.ok_or_else(|| TdpFlowError::construction(&self.spec.name, "pipeline has no steps"))
    }
}

#[async_trait]
impl<'a> TransformStep for AgentGroup<'a> {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let mut outputs: Vec<Vec<u8>> = Vec::with_capacity(self.spec.steps.len());
        let mut step_num = self.header.step_num();

        for (i, spec) in self.spec.steps.iter().enumerate() {
            let input: &[u8] = match spec.input {
                Input::Previous if i == 0 => content,
                Input::Previous => &outputs[i - 1],
                Input::Step(n) => &outputs[n - 1],
                Input::Source => content,
            };
            let configuration = spec.configure_from.map(|n| outputs[n - 1].clone());
            let step = self.build_leaf(&spec.target, step_num, configuration)?;
            step_num += match &spec.target {
                StepTarget::Group(name) => self
                    .groups
                    .get(name)
                    .ok_or_else(|| TdpFlowError::construction(name, "unknown agent group"))?
                    .span(self.groups)?,
                _ => 1,
            };
            let output = step.process_content(input).await?;
            outputs.push(output);
        }

        outputs
            .pop()
            .ok_or_else(|| TdpFlowError::construction(&self.spec.name, "pipeline has no steps"))
    }
}
