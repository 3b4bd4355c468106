use async_trait::async_trait;
use plugin_registry_core::config::{LocalLayout, PipelineConfig, PublishConfig, RegistryMode};
use plugin_registry_core::contract::{
    BundleOutput, BundleRequest, MockBundler, MockObjectStore, ObjectInfo, ObjectStore,
    PutObjectRequest, StoreError,
};
use plugin_registry_core::error::{CompileError, LoadError, PipelineError};
use plugin_registry_core::pipeline::{run_pipeline, PipelineOutcome};
use plugin_registry_core::publish::{ArtifactStatus, PublishReport};
use plugin_registry_core::registry::{self, RegistryRecord};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn plugin_source(class: &str, name: &str, version: &str) -> String {
    format!(
        r#"import {{FDO_SDK, FDOInterface, PluginMetadata}} from '@anikitenko/fdo-sdk';

class {class} extends FDO_SDK implements FDOInterface {{
    private readonly _metadata: PluginMetadata = {{
        name: "{name}",
        version: "{version}",
        author: "Test Author",
        description: "Plugin {name}",
        icon: "COG",
    }};

    constructor() {{
        super();
    }}

    get metadata(): PluginMetadata {{
        return this._metadata;
    }}

    init(): void {{
        console.log("{name} ready");
    }}

    render(): string {{
        return "<h1>{name}</h1>";
    }}
}}

export default {class};
"#
    )
}

fn write_source(base: &Path, file: &str, contents: &str) {
    let src = base.join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join(file), contents).unwrap();
}

fn test_config(base: &Path) -> PipelineConfig {
    PipelineConfig {
        sources: vec!["src/*.ts".to_string()],
        base_dir: base.to_path_buf(),
        output_dir: base.join("dist"),
        publish: PublishConfig {
            download_base_url: Some("https://cdn.example.com".to_string()),
            retry_base_delay_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Copies each staged entry point to `<stem>.js`, like a bundler with nothing to inline.
fn copying_bundler() -> MockBundler {
    let mut bundler = MockBundler::new();
    bundler.expect_bundle().returning(|req: &BundleRequest| {
        let mut outputs = Vec::new();
        for entry in &req.entry_points {
            let stem = entry.file_stem().unwrap().to_string_lossy().to_string();
            let out = req.out_dir.join(format!("{stem}.js"));
            fs::copy(entry, &out).unwrap();
            outputs.push(out);
        }
        Ok(BundleOutput { outputs })
    });
    bundler
}

/// In-memory store honouring create-only writes. Records every written key.
fn memory_store(objects: Arc<Mutex<HashSet<String>>>, writes: Arc<Mutex<Vec<String>>>) -> MockObjectStore {
    let mut store = MockObjectStore::new();
    let put_objects = objects.clone();
    store
        .expect_put_object()
        .returning(move |req: PutObjectRequest| {
            let mut objects = put_objects.lock().unwrap();
            if req.if_none_match && objects.contains(&req.key) {
                return Err(StoreError::PreconditionFailed(req.key));
            }
            writes.lock().unwrap().push(req.key.clone());
            objects.insert(req.key);
            Ok(())
        });
    store.expect_head_object().returning(move |key: &str| {
        if objects.lock().unwrap().contains(key) {
            Ok(Some(ObjectInfo {
                last_modified: Some("Mon, 19 Oct 2026 10:00:00 GMT".to_string()),
                content_length: Some(128),
            }))
        } else {
            Ok(None)
        }
    });
    store.expect_get_object().returning(|_key: &str| Ok(None));
    store
}

fn completed(outcome: PipelineOutcome) -> PublishReport {
    match outcome {
        PipelineOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

fn release_names(records: &[RegistryRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| format!("{}@{}", r.name, r.version))
        .collect()
}

#[tokio::test]
async fn test_publishes_one_record_per_artifact_in_sorted_order() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "zeta.ts", &plugin_source("Zeta", "Zeta", "2.0.0"));
    write_source(dir.path(), "alpha.ts", &plugin_source("Alpha", "Alpha", "1.0.0"));
    let config = test_config(dir.path());

    let writes = Arc::new(Mutex::new(Vec::new()));
    let store = memory_store(Arc::new(Mutex::new(HashSet::new())), writes.clone());

    let outcome = run_pipeline(&config, &copying_bundler(), Some(&store))
        .await
        .expect("pipeline should run");
    assert!(outcome.is_success());
    let report = completed(outcome);

    assert_eq!(release_names(&report.records), vec!["Alpha@1.0.0", "Zeta@2.0.0"]);
    assert!(report.registry_uploaded);

    let alpha = &report.records[0];
    assert_eq!(alpha.download_url, "https://cdn.example.com/Alpha/1.0.0/alpha.js");
    assert_eq!(alpha.author.as_deref(), Some("Test Author"));
    assert_eq!(alpha.icon.as_deref(), Some("COG"));
    assert_eq!(alpha.content_length, Some(128));
    assert!(alpha.last_modified.is_some());

    let mut written = writes.lock().unwrap().clone();
    written.sort();
    assert_eq!(
        written,
        vec!["Alpha/1.0.0/alpha.js", "Zeta/2.0.0/zeta.js", "registry.json"]
    );

    let on_disk = registry::read_local(&config.output_dir.join("registry.json"))
        .expect("registry document should be written locally");
    assert_eq!(on_disk, report.records);
}

#[tokio::test]
async fn test_empty_selection_never_invokes_bundler() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.sources = vec!["src/*.ts".to_string(), "missing.ts".to_string()];

    let mut bundler = MockBundler::new();
    bundler.expect_bundle().never();
    let mut store = MockObjectStore::new();
    store.expect_put_object().never();

    let outcome = run_pipeline(&config, &bundler, Some(&store))
        .await
        .expect("empty selection is not an error");
    assert!(outcome.is_success());
    match outcome {
        PipelineOutcome::NothingToBuild { missing } => {
            assert_eq!(missing, vec!["src/*.ts", "missing.ts"]);
        }
        other => panic!("expected NothingToBuild, got {other:?}"),
    }
    assert!(!config.output_dir.exists());
}

#[tokio::test]
async fn test_compile_failure_publishes_nothing() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    write_source(dir.path(), "b.ts", "class B extends {\n  render( {\n");
    let config = test_config(dir.path());

    let mut bundler = MockBundler::new();
    bundler.expect_bundle().never();
    let mut store = MockObjectStore::new();
    store.expect_put_object().never();
    store.expect_get_object().never();

    let err = run_pipeline(&config, &bundler, Some(&store))
        .await
        .expect_err("a broken source must fail the batch");
    match err {
        PipelineError::Compile(CompileError::Diagnostics(diagnostics)) => {
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(
                diagnostics[0].file.as_deref(),
                Some(dir.path().join("src/b.ts").as_path())
            );
        }
        other => panic!("expected compile diagnostics, got {other:?}"),
    }
    assert!(!config.output_dir.join("registry.json").exists());
    assert!(!config.output_dir.join("a.js").exists());
}

#[tokio::test]
async fn test_local_run_writes_registry_without_store() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    let config = test_config(dir.path());

    let outcome = run_pipeline(&config, &copying_bundler(), None)
        .await
        .expect("pipeline should run");
    let report = completed(outcome);

    assert!(!report.has_failures());
    assert!(!report.registry_uploaded);
    assert!(matches!(
        &report.outcomes[0].status,
        ArtifactStatus::Local { path } if path == &config.output_dir.join("a.js")
    ));
    assert_eq!(
        report.registry_path.as_deref(),
        Some(config.output_dir.join("registry.json").as_path())
    );
    assert_eq!(
        report.records[0].download_url,
        "https://cdn.example.com/A/1.0.0/a.js"
    );
    assert!(report.records[0].last_modified.is_none());
}

#[tokio::test]
async fn test_second_identical_run_skips_uploads_but_rewrites_registry() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    let config = test_config(dir.path());

    let objects = Arc::new(Mutex::new(HashSet::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let store = memory_store(objects, writes.clone());

    let first = completed(
        run_pipeline(&config, &copying_bundler(), Some(&store))
            .await
            .unwrap(),
    );
    let second = completed(
        run_pipeline(&config, &copying_bundler(), Some(&store))
            .await
            .unwrap(),
    );

    assert!(matches!(first.outcomes[0].status, ArtifactStatus::Published { .. }));
    assert!(matches!(
        second.outcomes[0].status,
        ArtifactStatus::AlreadyPublished { .. }
    ));
    assert!(!second.has_failures());
    assert_eq!(first.records, second.records);
    assert_eq!(
        *writes.lock().unwrap(),
        vec!["A/1.0.0/a.js", "registry.json", "registry.json"]
    );
}

#[tokio::test]
async fn test_invalid_plugins_are_reported_and_others_still_publish() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "good.ts", &plugin_source("Good", "Good", "1.0.0"));
    write_source(
        dir.path(),
        "headless.ts",
        &plugin_source("Headless", "Headless", "1.0.0").replace("render(): string", "draw(): string"),
    );
    write_source(dir.path(), "nameless.ts", "export default class Nameless { init() {} render() {} }\n");
    let config = test_config(dir.path());

    let writes = Arc::new(Mutex::new(Vec::new()));
    let store = memory_store(Arc::new(Mutex::new(HashSet::new())), writes.clone());

    let outcome = run_pipeline(&config, &copying_bundler(), Some(&store))
        .await
        .unwrap();
    assert!(!outcome.is_success());
    let report = completed(outcome);

    assert_eq!(release_names(&report.records), vec!["Good@1.0.0"]);
    let failed: Vec<&str> = report.failures().map(|o| o.artifact.as_str()).collect();
    assert_eq!(failed, vec!["headless.js", "nameless.js"]);
    assert!(matches!(
        &report.outcomes[1].status,
        ArtifactStatus::LoadFailed(LoadError::MissingCapability { capability, .. }) if capability == "render"
    ));
    assert!(matches!(
        &report.outcomes[2].status,
        ArtifactStatus::LoadFailed(LoadError::MissingManifest(_))
    ));
    assert!(!writes.lock().unwrap().iter().any(|k| k.starts_with("Headless/")));
}

#[tokio::test]
async fn test_duplicate_release_keeps_first_artifact() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "one.ts", &plugin_source("One", "Same", "1.0.0"));
    write_source(dir.path(), "two.ts", &plugin_source("Two", "Same", "1.0.0"));
    let config = test_config(dir.path());

    let report = completed(run_pipeline(&config, &copying_bundler(), None).await.unwrap());

    assert_eq!(report.records.len(), 1);
    assert_eq!(
        report.records[0].download_url,
        "https://cdn.example.com/Same/1.0.0/one.js"
    );
    assert!(matches!(
        &report.outcomes[1].status,
        ArtifactStatus::LoadFailed(LoadError::DuplicateRelease { first, .. }) if first == "one.js"
    ));
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    let config = test_config(dir.path());

    let attempts = Arc::new(Mutex::new(0u32));
    let counter = attempts.clone();
    let mut store = MockObjectStore::new();
    store.expect_put_object().returning(move |req: PutObjectRequest| {
        if req.key == "A/1.0.0/a.js" {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                return Err(StoreError::Transport("connection reset".to_string()));
            }
        }
        Ok(())
    });
    store.expect_head_object().returning(|_key: &str| Ok(None));

    let report = completed(run_pipeline(&config, &copying_bundler(), Some(&store)).await.unwrap());

    assert!(!report.has_failures());
    assert_eq!(*attempts.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_artifact() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    let mut config = test_config(dir.path());
    config.publish.max_retries = 2;

    let mut store = MockObjectStore::new();
    store
        .expect_put_object()
        .withf(|req: &PutObjectRequest| req.key == "A/1.0.0/a.js")
        .times(3)
        .returning(|_| Err(StoreError::Transport("503 Slow Down".to_string())));
    store
        .expect_put_object()
        .withf(|req: &PutObjectRequest| req.key == "registry.json")
        .returning(|_| Ok(()));

    let report = completed(run_pipeline(&config, &copying_bundler(), Some(&store)).await.unwrap());

    assert!(report.has_failures());
    assert!(report.records.is_empty());
    assert!(matches!(
        &report.outcomes[0].status,
        ArtifactStatus::UploadFailed { error: StoreError::Transport(_), .. }
    ));
}

#[tokio::test]
async fn test_merge_mode_keeps_previous_versions_locally() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.0.0"));
    let mut config = test_config(dir.path());
    config.publish.registry_mode = RegistryMode::Merge;
    config.publish.local_layout = LocalLayout::Versioned;

    let first = completed(run_pipeline(&config, &copying_bundler(), None).await.unwrap());
    assert!(matches!(
        &first.outcomes[0].status,
        ArtifactStatus::Local { path } if path == &config.output_dir.join("A/1.0.0/a.js")
    ));

    write_source(dir.path(), "a.ts", &plugin_source("A", "A", "1.1.0"));
    let second = completed(run_pipeline(&config, &copying_bundler(), None).await.unwrap());

    assert_eq!(release_names(&second.records), vec!["A@1.0.0", "A@1.1.0"]);
    for record in &second.records {
        assert_eq!(
            record.versions.as_deref(),
            Some(&["1.0.0".to_string(), "1.1.0".to_string()][..])
        );
    }
    assert!(config.output_dir.join("A/1.1.0/a.js").is_file());
}

#[tokio::test]
async fn test_merge_mode_uses_published_registry() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "b.ts", &plugin_source("B", "B", "1.0.0"));
    let mut config = test_config(dir.path());
    config.publish.registry_mode = RegistryMode::Merge;

    let published = registry::to_json(&[RegistryRecord {
        name: "Other".to_string(),
        version: "0.3.0".to_string(),
        author: None,
        description: None,
        icon: None,
        download_url: "https://cdn.example.com/Other/0.3.0/other.js".to_string(),
        last_modified: None,
        content_length: None,
        versions: None,
    }])
    .unwrap();

    let mut store = MockObjectStore::new();
    store
        .expect_get_object()
        .times(1)
        .returning(move |key: &str| {
            assert_eq!(key, "registry.json");
            Ok(Some(published.clone()))
        });
    store.expect_put_object().returning(|_| Ok(()));
    store.expect_head_object().returning(|_key: &str| Ok(None));

    let report = completed(run_pipeline(&config, &copying_bundler(), Some(&store)).await.unwrap());

    assert_eq!(release_names(&report.records), vec!["B@1.0.0", "Other@0.3.0"]);
    assert!(report.registry_uploaded);
}

/// Counts puts in flight; each put holds its slot briefly so overlap is observable.
#[derive(Default)]
struct InFlightStore {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    puts: AtomicUsize,
}

#[async_trait]
impl ObjectStore for InFlightStore {
    async fn put_object(&self, _request: PutObjectRequest) -> Result<(), StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn head_object(&self, _key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        Ok(None)
    }

    async fn get_object(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_uploads_respect_max_concurrency() {
    let dir = tempdir().unwrap();
    for i in 0..6 {
        let class = format!("P{i}");
        write_source(dir.path(), &format!("p{i}.ts"), &plugin_source(&class, &class, "1.0.0"));
    }
    let mut config = test_config(dir.path());
    config.publish.max_concurrency = 2;

    let store = InFlightStore::default();
    let outcome = run_pipeline(&config, &copying_bundler(), Some(&store as &dyn ObjectStore))
        .await
        .expect("pipeline should run");
    assert!(outcome.is_success());
    let report = completed(outcome);

    assert_eq!(report.records.len(), 6);
    assert!(report
        .outcomes
        .iter()
        .all(|o| matches!(o.status, ArtifactStatus::Published { .. })));
    // Six artifacts plus the registry document.
    assert_eq!(store.puts.load(Ordering::SeqCst), 7);
    let max = store.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 2, "at most two uploads may overlap, saw {max}");
}

#[tokio::test]
async fn test_output_dir_equal_to_base_dir_is_refused() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "alpha.ts", &plugin_source("Alpha", "Alpha", "1.0.0"));
    let mut config = test_config(dir.path());
    config.output_dir = dir.path().to_path_buf();

    let mut bundler = MockBundler::new();
    bundler.expect_bundle().never();

    let err = run_pipeline(&config, &bundler, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::UnsafeOutputDir { .. }), "{err:?}");
    assert!(dir.path().join("src/alpha.ts").is_file());
}
