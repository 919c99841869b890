//! The catalogue of named agent groups.

use std::collections::BTreeMap;

use tdpflow_agents::StepKind;
use tdpflow_shared::{Result, TdpFlowError};

use crate::pipeline::{Input, Parent, PipelineSpec, StepSpec, StepTarget};

/// Named pipelines available to `run_group` and to nesting.
#[derive(Debug, Clone, Default)]
pub struct GroupCatalog {
    groups: BTreeMap<String, PipelineSpec>,
}

impl GroupCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in document pipelines.
    pub fn builtin() -> Self {
        use StepKind::*;

        let groups = [
            PipelineSpec::new(
                "image-chunk",
                "json",
                vec![
                    StepSpec::agent(ImageDocument),
                    StepSpec::agent(TextChunk),
                    StepSpec::agent(SearchIndex).from_step(2),
                    StepSpec::agent(VectorStore).from_step(2),
                ],
            ),
            PipelineSpec::new(
                "section-chunk",
                "json",
                vec![
                    StepSpec::agent(SectionChunk),
                    StepSpec::agent(SearchIndex),
                    StepSpec::agent(VectorStore).from_step(1),
                ],
            ),
            PipelineSpec::new(
                "section-chunk-toc",
                "json",
                vec![
                    StepSpec::agent(PageChunk),
                    StepSpec::agent(TableOfContentsExtraction),
                    StepSpec::agent(SectionChunkWithTableOfContents)
                        .from_source()
                        .configured_by(2),
                    StepSpec::agent(SearchIndex),
                    StepSpec::agent(VectorStore).from_step(3),
                ],
            ),
            PipelineSpec::new(
                "section-requirements",
                "json",
                vec![
                    StepSpec::agent(SectionChunk),
                    StepSpec::agent(SectionToRequirements),
                    StepSpec::agent(SearchIndex).from_step(2),
                    StepSpec::agent(VectorStore).input(Input::Step(2)).parent(Parent::Step(3)),
                    StepSpec::agent(SearchIndex).input(Input::Step(1)).parent(Parent::Step(4)),
                    StepSpec::agent(VectorStore).input(Input::Step(1)).parent(Parent::Step(5)),
                ],
            ),
            PipelineSpec::new(
                "excel-sysml",
                "sysml",
                vec![
                    StepSpec::agent(ExcelToJson),
                    StepSpec::agent(JsonToSysml).input(Input::Step(1)).parent(Parent::Source),
                    StepSpec::agent(SearchIndex).input(Input::Step(2)).parent(Parent::Source),
                    StepSpec::agent(VectorStore).input(Input::Step(2)).parent(Parent::Source),
                    StepSpec::agent(GraphStore).input(Input::Step(2)).parent(Parent::Source),
                ],
            ),
            PipelineSpec::new(
                "visio-sysml",
                "json",
                vec![
                    StepSpec::agent(Visio),
                    StepSpec::agent(VisioJsonToSysml).input(Input::Step(1)).parent(Parent::Source),
                    StepSpec::agent(SysmlChunk).input(Input::Step(2)).parent(Parent::Source),
                    StepSpec::agent(SearchIndex).input(Input::Step(3)).parent(Parent::Source),
                    StepSpec::agent(VectorStore).input(Input::Step(3)).parent(Parent::Source),
                ],
            ),
        ];

        Self {
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PipelineSpec> {
        self.groups.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineSpec> {
        self.groups.values()
    }

    /// Add a group. Nested groups must already be registered.
    pub fn register(&mut self, spec: PipelineSpec) -> Result<()> {
        spec.validate()?;
        if self.groups.contains_key(&spec.name) {
            return Err(TdpFlowError::construction(
                &spec.name,
                "agent group already registered",
            ));
        }
        for step in &spec.steps {
            if let StepTarget::Group(name) = &step.target {
                if !self.groups.contains_key(name) {
                    return Err(TdpFlowError::construction(
                        &spec.name,
                        format!("unknown nested group '{name}'"),
                    ));
                }
            }
        }
        self.groups.insert(spec.name.clone(), spec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tdpflow_agents::{AgentRegistry, HashingEmbedder, SearchIndex, VectorStore};
    use tdpflow_agents::sinks::{IndexDocument, RecordFailure, VectorPoint};
    use tdpflow_shared::{MemoryStore, PersistenceService, Status};

    use super::*;
    use crate::runner::WorkflowRunner;
    use crate::runner::tests::{ingest, scenario};

    #[test]
    fn builtin_groups_are_valid() {
        let catalog = GroupCatalog::builtin();
        let names: Vec<_> = catalog.names().collect();
        assert_eq!(
            names,
            [
                "excel-sysml",
                "image-chunk",
                "section-chunk",
                "section-chunk-toc",
                "section-requirements",
                "visio-sysml",
            ]
        );
        for spec in catalog.iter() {
            spec.validate().unwrap();
        }
        assert_eq!(catalog.get("excel-sysml").unwrap().output_ext, "sysml");
        let toc = catalog.get("section-chunk-toc").unwrap();
        assert_eq!(toc.steps[2].configure_from, Some(2));
        assert_eq!(toc.steps[2].input, Input::Source);
    }

    #[test]
    fn register_checks_duplicates_and_nesting() {
        let mut catalog = GroupCatalog::builtin();
        let dup = PipelineSpec::new("section-chunk", "json", vec![StepSpec::agent(StepKind::TextChunk)]);
        assert!(catalog.register(dup).unwrap_err().is_construction());

        let orphan = PipelineSpec::new("outer", "json", vec![StepSpec::group("missing")]);
        assert!(catalog.register(orphan).unwrap_err().to_string().contains("missing"));

        let nested = PipelineSpec::new(
            "outer",
            "json",
            vec![StepSpec::agent(StepKind::TextChunk), StepSpec::group("section-chunk")],
        );
        catalog.register(nested).unwrap();
        assert!(catalog.get("outer").is_some());
    }

    #[derive(Default)]
    struct Collecting {
        indexed: Mutex<Vec<IndexDocument>>,
        points: Mutex<Vec<VectorPoint>>,
    }

    #[async_trait::async_trait]
    impl SearchIndex for Collecting {
        fn backend(&self) -> &str {
            "collecting"
        }

        async fn ensure_collection(&self, _collection: &str) -> tdpflow_shared::Result<()> {
            Ok(())
        }

        async fn upsert(
            &self,
            _collection: &str,
            docs: &[IndexDocument],
        ) -> tdpflow_shared::Result<Vec<RecordFailure>> {
            self.indexed.lock().unwrap().extend_from_slice(docs);
            Ok(Vec::new())
        }
    }

    #[async_trait::async_trait]
    impl VectorStore for Collecting {
        fn backend(&self) -> &str {
            "collecting"
        }

        async fn ensure_collection(&self, _collection: &str, _dimensions: usize) -> tdpflow_shared::Result<()> {
            Ok(())
        }

        async fn upsert(
            &self,
            _collection: &str,
            points: &[VectorPoint],
        ) -> tdpflow_shared::Result<()> {
            self.points.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    #[tokio::test]
    async fn section_chunk_group_indexes_and_embeds_sections() {
        let store = MemoryStore::new();
        let backend = Arc::new(Collecting::default());
        let registry = AgentRegistry::new()
            .with_search_index(backend.clone())
            .with_vector_store(backend.clone())
            .with_embedder(Arc::new(HashingEmbedder::new(16).unwrap()));
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let text = b"# Scope\nThe system shall log events.\n\n# Safety\nThe system shall stop on fault.\n";
        let source = ingest(&store, "manual.md", text).await;

        let outcome = runner.run_group("section-chunk", &source).await.unwrap();

        assert!(outcome.success, "{:?}", outcome.error());
        assert_eq!(outcome.document.file_name(), "manual_3.vector");
        assert_eq!(outcome.document.source_file_name(), Some("manual_1.json"));

        {
            let indexed = backend.indexed.lock().unwrap();
            let points = backend.points.lock().unwrap();
            assert!(!indexed.is_empty());
            assert_eq!(indexed.len(), points.len());
            assert!(points.iter().all(|p| p.vector.len() == 16));
        }

        let id = &scenario().id;
        let chunks = store.get_derivative_ref(id, "manual_1.json").await.unwrap();
        assert_eq!(chunks.status(), Status::Transformed);
        let index = store.get_derivative_ref(id, "manual_2.index").await.unwrap();
        assert_eq!(index.source_file_name(), Some("manual_1.json"));
    }

    #[tokio::test]
    async fn builtin_group_without_backend_is_misconfigured() {
        let store = MemoryStore::new();
        let registry = AgentRegistry::new();
        let runner = WorkflowRunner::new(scenario(), &store, &registry);
        let source = ingest(&store, "manual.md", b"# Scope\ntext\n").await;

        let err = runner.run_group("section-chunk", &source).await.unwrap_err();
        assert!(err.is_construction());
        assert!(err.to_string().contains("no search index configured"));
    }
}
