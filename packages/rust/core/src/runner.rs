//! Workflow runner: executes one transform step as a managed unit.
//!
//! Every per-step side effect (derivative creation, status changes,
//! persistence, the source cascade) happens here. Step errors never escape
//! [`WorkflowRunner::execute_step`]; they become a failed [`StepOutcome`].
//! The only `Err` it returns is a derivation whose output name equals its
//! source's, which would overwrite the source and point it at itself.

use std::sync::LazyLock;

use tracing::{error, info, instrument, warn};

use tdpflow_agents::{AgentRegistry, BuildContext, TransformStep, compute_output_filename, step_num_of};
use tdpflow_shared::{Document, PersistenceService, Result, Scenario, TdpFlowError};

use crate::groups::GroupCatalog;
use crate::pipeline::AgentGroup;

static BUILTIN_GROUPS: LazyLock<GroupCatalog> = LazyLock::new(GroupCatalog::builtin);

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of executing a step or a group.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    /// Output bytes on success.
    pub content: Option<Vec<u8>>,
    /// The new derivative on success; the caller-supplied source on failure.
    pub document: Document,
    /// The `ERROR` derivative recorded for a failed step.
    pub failure: Option<Document>,
}

impl StepOutcome {
    fn succeeded(content: Vec<u8>, document: Document) -> Self {
        Self {
            success: true,
            content: Some(content),
            document,
            failure: None,
        }
    }

    fn failed(source: &Document, failure: Document) -> Self {
        Self {
            success: false,
            content: None,
            document: source.clone(),
            failure: Some(failure),
        }
    }

    /// Error message of the failing step, if any.
    pub fn error(&self) -> Option<&str> {
        self.failure.as_ref().map(|d| d.error.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for step execution.
pub trait ProgressReporter: Send + Sync {
    /// Called before a step starts processing.
    fn step_started(&self, step_num: u32, agent: &str, output: &str);
    /// Called once a step has succeeded or failed.
    fn step_finished(&self, outcome: &StepOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn step_started(&self, _step_num: u32, _agent: &str, _output: &str) {}
    fn step_finished(&self, _outcome: &StepOutcome) {}
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes steps and groups for one scenario.
pub struct WorkflowRunner<'a> {
    scenario: Scenario,
    store: &'a dyn PersistenceService,
    registry: &'a AgentRegistry,
    groups: &'a GroupCatalog,
    progress: &'a dyn ProgressReporter,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(
        scenario: Scenario,
        store: &'a dyn PersistenceService,
        registry: &'a AgentRegistry,
    ) -> Self {
        Self {
            scenario,
            store,
            registry,
            groups: &BUILTIN_GROUPS,
            progress: &SilentProgress,
        }
    }

    /// Use a custom group catalogue instead of the built-in one.
    pub fn with_groups(mut self, groups: &'a GroupCatalog) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// The scenario this runner works in.
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn store(&self) -> &'a dyn PersistenceService {
        self.store
    }

    pub fn registry(&self) -> &'a AgentRegistry {
        self.registry
    }

    pub fn groups(&self) -> &'a GroupCatalog {
        self.groups
    }

    /// Content of `doc` under the current scenario.
    pub async fn get_content(&self, doc: &Document) -> Result<Vec<u8>> {
        doc.get_content(self.store, &self.scenario.id).await
    }

    /// Build context for steps consuming `source`.
    pub fn build_context(&self, source: &Document) -> BuildContext {
        let instructions = Some(source.special_instructions.clone()).filter(|i| !i.is_empty());
        BuildContext::new(self.scenario.id.clone()).with_special_instructions(instructions)
    }

    /// Run `step` over `input` (or the stored content of `source`).
    ///
    /// The derivative is created and persisted before processing starts, so
    /// a failed attempt still leaves an `ERROR` record behind. Nothing is
    /// written when the output name would collide with the source's.
    #[instrument(skip_all, fields(
        scenario = %self.scenario.id,
        step = step.step_num(),
        agent = step.name(),
        file_name = source.file_name(),
    ))]
    pub async fn execute_step(
        &self,
        step: &dyn TransformStep,
        input: Option<&[u8]>,
        source: &Document,
    ) -> Result<StepOutcome> {
        let scenario = &self.scenario.id;
        let output_name = step.compute_output_filename(source.file_name());
        check_output_name(&output_name, step.name(), source)?;
        let mut derivative = Document::derivative(&output_name, source, step.name());
        derivative.special_instructions = source.special_instructions.clone();

        self.progress
            .step_started(step.step_num(), step.name(), &output_name);

        if let Err(e) = derivative.set_processing(self.store, scenario).await {
            return Ok(self.finish_failed(derivative, source, e.to_string()).await);
        }

        let content = match input {
            Some(bytes) => bytes.to_vec(),
            None => match self.get_content(source).await {
                Ok(bytes) => bytes,
                Err(e) => return Ok(self.finish_failed(derivative, source, e.to_string()).await),
            },
        };

        let output = match step.process_content(&content).await {
            Ok(output) => output,
            Err(e) => return Ok(self.finish_failed(derivative, source, e.to_string()).await),
        };

        if let Err(e) = derivative
            .set_processed(self.store, scenario, Some(&output))
            .await
        {
            return Ok(self.finish_failed(derivative, source, e.to_string()).await);
        }

        info!(
            output = derivative.file_name(),
            bytes = output.len(),
            "step processed"
        );
        let outcome = StepOutcome::succeeded(output, derivative);
        self.progress.step_finished(&outcome);
        Ok(outcome)
    }

    /// Record a step that failed before or during processing.
    pub async fn record_failure(
        &self,
        output_name: &str,
        agent_name: &str,
        source: &Document,
        message: String,
    ) -> Result<StepOutcome> {
        check_output_name(output_name, agent_name, source)?;
        let derivative = Document::derivative(output_name, source, agent_name);
        Ok(self.finish_failed(derivative, source, message).await)
    }

    async fn finish_failed(
        &self,
        mut derivative: Document,
        source: &Document,
        message: String,
    ) -> StepOutcome {
        error!(
            output = derivative.file_name(),
            agent = derivative.agent_name().unwrap_or_default(),
            error = %message,
            "step failed"
        );
        if let Err(e) = derivative
            .set_error(self.store, &self.scenario.id, message.clone())
            .await
        {
            warn!(output = derivative.file_name(), error = %e, "could not persist step failure");
            derivative.error = message;
        }
        let outcome = StepOutcome::failed(source, derivative);
        self.progress.step_finished(&outcome);
        outcome
    }

    /// Create the derivative `agent_name` would produce at `step_num` and
    /// mark it `MOCKED` without running anything.
    pub async fn mock_step(
        &self,
        agent_name: &str,
        step_num: u32,
        source: &Document,
    ) -> Result<Document> {
        let ext = self
            .registry
            .output_ext(agent_name)
            .ok_or_else(|| TdpFlowError::construction(agent_name, "unknown agent"))?;
        let name = compute_output_filename(source.file_name(), step_num, &ext);
        let mut mocked = Document::derivative(name, source, agent_name);
        mocked
            .set_mocked(self.store, &self.scenario.id, source, agent_name)
            .await?;
        info!(output = mocked.file_name(), agent = agent_name, "step mocked");
        Ok(mocked)
    }

    /// Re-run the agent that produced `derivative_name` against its source.
    ///
    /// Steps that need a configuration payload from a sibling step cannot be
    /// rebuilt on their own and fail construction.
    #[instrument(skip_all, fields(scenario = %self.scenario.id, derivative = derivative_name))]
    pub async fn reprocess(&self, derivative_name: &str) -> Result<StepOutcome> {
        let scenario = &self.scenario.id;
        let derivative = self.store.get_derivative_ref(scenario, derivative_name).await?;
        let agent_name = derivative.agent_name().ok_or_else(|| {
            TdpFlowError::validation(format!("'{derivative_name}' has no agent name"))
        })?;
        let source = derivative.source_ref(self.store, scenario).await?;
        let step_num = step_num_of(derivative.file_name()).unwrap_or(1);

        let step = self
            .registry
            .build_named(agent_name, step_num, &self.build_context(&source))?;
        info!(agent = agent_name, source = source.file_name(), "reprocessing");
        self.execute_step(step.as_ref(), None, &source).await
    }

    /// Build the named group at `step_num` for `source`.
    pub fn group(&self, name: &str, step_num: u32, source: &Document) -> Result<AgentGroup<'a>> {
        let spec = self
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| TdpFlowError::construction(name, "unknown agent group"))?;
        AgentGroup::new(
            spec,
            step_num,
            self.registry,
            self.groups,
            self.build_context(source),
        )
    }

    /// Run a named group over the stored content of `source`.
    #[instrument(skip_all, fields(scenario = %self.scenario.id, group = name, file_name = source.file_name()))]
    pub async fn run_group(&self, name: &str, source: &Document) -> Result<StepOutcome> {
        let group = self.group(name, 1, source)?;
        let outcome = group.run(self, source, None).await?;
        if outcome.success {
            info!(output = outcome.document.file_name(), "group finished");
        } else {
            warn!(error = outcome.error().unwrap_or_default(), "group halted");
        }
        Ok(outcome)
    }
}

/// A derivative must never share its source's name.
fn check_output_name(output_name: &str, agent_name: &str, source: &Document) -> Result<()> {
    if output_name == source.file_name() {
        return Err(TdpFlowError::construction(
            agent_name,
            format!("output '{output_name}' would replace its own source"),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tdpflow_agents::{StepHeader, step_factory};
    use tdpflow_shared::{MemoryStore, ScenarioId, Status};

    use super::*;

    // -----------------------------------------------------------------------
    // Scripted steps
    // -----------------------------------------------------------------------

    /// Appends a marker to its input, or fails with a fixed message.
    pub(crate) struct Scripted {
        header: StepHeader,
        fail_with: Option<String>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransformStep for Scripted {
        fn header(&self) -> &StepHeader {
            &self.header
        }

        async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}#{}", self.header.name(), self.header.step_num()));
            match &self.fail_with {
                Some(message) => Err(TdpFlowError::backend("scripted", message.clone())),
                None => {
                    let mut out = content.to_vec();
                    out.extend_from_slice(format!("|{}", self.header.name()).as_bytes());
                    Ok(out)
                }
            }
        }
    }

    /// Registry with `ExtractAgent` (txt), `ChunkAgent` (json) and
    /// `StoreAgent` (index, always fails with a connection error).
    pub(crate) fn scripted_registry(seen: Arc<Mutex<Vec<String>>>) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for (name, ext, fail) in [
            ("ExtractAgent", "txt", None),
            ("ChunkAgent", "json", None),
            ("StoreAgent", "index", Some("connection refused")),
        ] {
            let seen = seen.clone();
            registry
                .register(
                    name,
                    ext,
                    step_factory(move |n, _ctx| {
                        Ok(Box::new(Scripted {
                            header: StepHeader::new(name, n, ext)?,
                            fail_with: fail.map(String::from),
                            seen: seen.clone(),
                        }))
                    }),
                )
                .unwrap();
        }
        registry
    }

    pub(crate) fn scenario() -> Scenario {
        Scenario::new(ScenarioId::new("scenario-1").unwrap())
    }

    pub(crate) async fn ingest(store: &MemoryStore, name: &str, content: &[u8]) -> Document {
        let mut doc = Document::source(name, "ingested").with_status(Status::Queued);
        doc.write(store, &scenario().id, Some(content)).await.unwrap();
        doc
    }

    fn build(registry: &AgentRegistry, name: &str, n: u32) -> Box<dyn TransformStep> {
        registry
            .build_named(name, n, &BuildContext::new(scenario().id))
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // execute_step
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_step_persists_derivative_and_cascades() {
        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;

        let outcome = runner
            .execute_step(build(&registry, "ExtractAgent", 1).as_ref(), None, &source)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.content.as_deref(), Some(&b"raw|ExtractAgent"[..]));
        assert_eq!(outcome.document.file_name(), "spec_1.txt");
        assert_eq!(outcome.document.status(), Status::Processed);
        assert_eq!(outcome.document.agent_name(), Some("ExtractAgent"));

        let id = &scenario().id;
        let stored = store.get_derivative_ref(id, "spec_1.txt").await.unwrap();
        assert_eq!(stored.status(), Status::Processed);
        assert_eq!(store.read_derivative(id, "spec_1.txt").await.unwrap(), b"raw|ExtractAgent");

        let source = store.get_source_ref(id, "spec.pdf").await.unwrap();
        assert_eq!(source.status(), Status::Transformed);
        assert_eq!(source.consuming_derivative_names(), ["spec_1.txt".to_string()]);
    }

    #[tokio::test]
    async fn failed_step_returns_source_and_records_error() {
        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;

        let outcome = runner
            .execute_step(build(&registry, "StoreAgent", 3).as_ref(), Some(b"chunks"), &source)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.content.is_none());
        assert_eq!(outcome.document.file_name(), "spec.pdf");
        assert!(outcome.error().unwrap().contains("connection refused"));

        let id = &scenario().id;
        let failed = store.get_derivative_ref(id, "spec_3.index").await.unwrap();
        assert_eq!(failed.status(), Status::Error);
        assert!(failed.error.contains("connection refused"));

        let source = store.get_source_ref(id, "spec.pdf").await.unwrap();
        assert_eq!(source.status(), Status::Queued);
    }

    #[tokio::test]
    async fn missing_source_content_is_a_step_failure() {
        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let ghost = Document::source("ghost.pdf", "never written");

        let outcome = runner
            .execute_step(build(&registry, "ExtractAgent", 1).as_ref(), None, &ghost)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn rerunning_a_step_keeps_the_same_name() {
        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;
        let step = build(&registry, "ExtractAgent", 2);

        let first = runner.execute_step(step.as_ref(), None, &source).await.unwrap();
        let second = runner.execute_step(step.as_ref(), None, &source).await.unwrap();

        assert_eq!(first.document.file_name(), second.document.file_name());
        let source = store.get_source_ref(&scenario().id, "spec.pdf").await.unwrap();
        assert_eq!(source.consuming_derivative_names().len(), 1);
    }

    #[tokio::test]
    async fn step_cannot_overwrite_its_own_source() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = scripted_registry(seen.clone());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;
        let chunks = runner
            .execute_step(build(&registry, "ChunkAgent", 1).as_ref(), None, &source)
            .await
            .unwrap()
            .document;

        let err = runner
            .execute_step(build(&registry, "ChunkAgent", 1).as_ref(), None, &chunks)
            .await
            .unwrap_err();
        assert!(err.is_construction());
        assert!(err.to_string().contains("spec_1.json"));

        let err = runner
            .record_failure("spec_1.json", "ChunkAgent", &chunks, "boom".into())
            .await
            .unwrap_err();
        assert!(err.is_construction());

        let id = &scenario().id;
        let stored = store.get_derivative_ref(id, "spec_1.json").await.unwrap();
        assert_eq!(stored.status(), Status::Processed);
        assert_eq!(stored.source_file_name(), Some("spec.pdf"));
        assert!(stored.consuming_derivative_names().is_empty());
        assert_eq!(store.read_derivative(id, "spec_1.json").await.unwrap(), b"raw|ChunkAgent");
        assert_eq!(*seen.lock().unwrap(), vec!["ChunkAgent#1"]);
    }

    // -----------------------------------------------------------------------
    // mock / reprocess
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn mock_step_records_mocked_derivative() {
        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;

        let mocked = runner.mock_step("ChunkAgent", 2, &source).await.unwrap();

        assert_eq!(mocked.file_name(), "spec_2.json");
        assert_eq!(mocked.status(), Status::Mocked);
        assert_eq!(mocked.source_file_name(), Some("spec.pdf"));
        let stored = store.get_derivative_ref(&scenario().id, "spec_2.json").await.unwrap();
        assert_eq!(stored.agent_name(), Some("ChunkAgent"));

        let err = runner.mock_step("NoSuchAgent", 2, &source).await.unwrap_err();
        assert!(err.is_construction());
    }

    #[tokio::test]
    async fn reprocess_reruns_the_recorded_agent() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = scripted_registry(seen.clone());
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "spec.pdf", b"raw").await;

        let first = runner
            .execute_step(build(&registry, "ChunkAgent", 4).as_ref(), None, &source)
            .await
            .unwrap();
        let again = runner.reprocess(first.document.file_name()).await.unwrap();

        assert!(again.success);
        assert_eq!(again.document.file_name(), "spec_4.json");
        assert_eq!(*seen.lock().unwrap(), vec!["ChunkAgent#4", "ChunkAgent#4"]);

        let err = runner.reprocess("missing_1.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn progress_sees_every_step() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        impl ProgressReporter for Recorder {
            fn step_started(&self, step_num: u32, agent: &str, _output: &str) {
                self.0.lock().unwrap().push(format!("start {agent}#{step_num}"));
            }
            fn step_finished(&self, outcome: &StepOutcome) {
                self.0.lock().unwrap().push(format!("done {}", outcome.success));
            }
        }

        let store = MemoryStore::new();
        let registry = scripted_registry(Arc::default());
        let recorder = Recorder::default();
        let runner = WorkflowRunner::new(scenario(), &store, &registry).with_progress(&recorder);
        let source = ingest(&store, "spec.pdf", b"raw").await;

        runner
            .execute_step(build(&registry, "StoreAgent", 1).as_ref(), None, &source)
            .await
            .unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["start StoreAgent#1", "done false"]
        );
    }
}
