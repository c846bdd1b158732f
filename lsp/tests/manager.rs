//! Manager orchestration against fake server definitions.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{FakeBehavior, FakeDefinition};
use polyglot_lsp::{
    Installer, LspConfig, LspEvent, LspManager, Registry, ServerDefinition, ServerSpec,
};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    manager: LspManager,
}

impl Fixture {
    fn new(definitions: Vec<Arc<FakeDefinition>>) -> Self {
        Self::with_config(definitions, LspConfig::default())
    }

    fn with_config(definitions: Vec<Arc<FakeDefinition>>, config: LspConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::from_definitions(
            definitions
                .into_iter()
                .map(|d| d as Arc<dyn ServerDefinition>)
                .collect(),
        );
        let installer = Installer::new(dir.path().join("cache")).unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        let manager = LspManager::with_registry(registry, installer, config, &project);
        Self { dir, manager }
    }

    fn project(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.project().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }
}

fn ts_definition(id: &str, behavior: FakeBehavior) -> Arc<FakeDefinition> {
    Arc::new(FakeDefinition::new(
        ServerSpec::new(id, id, &["ts", "tsx"]).roots(&["package.json"]),
        behavior,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_touches_spawn_once() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("src/app.ts", "export {};\n");

    let touches = (0..10).map(|_| {
        let manager = fx.manager.clone();
        let file = file.clone();
        tokio::spawn(async move { manager.touch_file(&file, false).await })
    });
    for handle in futures_util::future::join_all(touches).await {
        handle.unwrap();
    }

    assert_eq!(ts.spawn_count(), 1);
    let status = fx.manager.status();
    assert_eq!(status[0].running, vec![fx.project()]);
    assert_eq!(status[0].instances(), 1);
}

#[tokio::test]
async fn root_is_directory_holding_package_json() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("web/package.json", "{}");
    let file = fx.write("web/src/app.ts", "export {};\n");

    fx.manager.touch_file(&file, false).await;

    let web = fx.project().join("web");
    assert_eq!(ts.spawned_roots(), vec![web.clone()]);
    assert_eq!(fx.manager.status()[0].running, vec![web]);
}

#[tokio::test]
async fn file_without_root_marker_spawns_nothing() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    let file = fx.write("loose/app.ts", "export {};\n");

    fx.manager.touch_file(&file, false).await;
    assert_eq!(ts.spawn_count(), 0);
}

#[tokio::test]
async fn hover_without_applicable_server_is_none() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("notes.txt", "hello");

    assert!(fx.manager.hover(&file, 0, 0).await.is_none());
    assert!(fx.manager.completion(&file, 0, 0).await.is_empty());
    assert_eq!(ts.spawn_count(), 0);
}

#[tokio::test]
async fn hover_is_first_match_and_completion_concatenates() {
    let mut silent = FakeBehavior::named("first");
    silent.hover = false;
    let first = ts_definition("first", silent);
    let second = ts_definition("second", FakeBehavior::named("second"));
    let fx = Fixture::new(vec![first.clone(), second.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("src/app.ts", "export {};\n");

    let hover = fx.manager.hover(&file, 0, 0).await.unwrap();
    assert_eq!(hover.contents, "second hover");

    let labels: Vec<String> = fx
        .manager
        .completion(&file, 0, 0)
        .await
        .into_iter()
        .map(|item| item.label)
        .collect();
    assert_eq!(labels, vec!["first_item", "second_item"]);

    let definition = fx.manager.definition(&file, 0, 0).await.unwrap();
    assert_eq!(definition.len(), 1);
    assert_eq!(fx.manager.references(&file, 0, 0).await.len(), 2);
}

#[tokio::test]
async fn diagnostics_are_unioned_and_tagged_with_server() {
    let first = ts_definition("first", FakeBehavior::named("first"));
    let second = ts_definition("second", FakeBehavior::named("second"));
    let fx = Fixture::new(vec![first, second]);
    fx.write("package.json", "{}");
    let file = fx.write("src/app.ts", "export {};\n");

    fx.manager.touch_file(&file, true).await;

    let for_file = fx.manager.diagnostics_for_file(&file);
    let mut sources: Vec<&str> = for_file.iter().filter_map(|d| d.source()).collect();
    sources.sort_unstable();
    assert_eq!(sources, vec!["first", "second"]);

    let snapshot = fx.manager.all_diagnostics();
    assert_eq!(snapshot.error_count(), 2);
    assert_eq!(snapshot.files().len(), 1);
    assert_eq!(snapshot.files()[0].0, file);
}

#[tokio::test]
async fn relative_paths_resolve_against_project() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("src/app.ts", "export {};\n");

    fx.manager.touch_file(Path::new("src/app.ts"), true).await;
    assert_eq!(ts.spawn_count(), 1);
    assert_eq!(fx.manager.diagnostics_for_file(Path::new("src/app.ts")).len(), 1);
    assert_eq!(fx.manager.diagnostics_for_file(&file).len(), 1);
}

#[tokio::test]
async fn unavailable_server_is_not_retried() {
    let missing = Arc::new(FakeDefinition::unavailable(
        ServerSpec::new("missing", "Missing", &["ts"]).roots(&["package.json"]),
    ));
    let fx = Fixture::new(vec![missing.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "");

    fx.manager.touch_file(&file, false).await;
    fx.manager.touch_file(&file, false).await;
    assert!(fx.manager.hover(&file, 0, 0).await.is_none());
    assert_eq!(missing.spawn_count(), 1);

    // Toggling forgets the failure.
    fx.manager.set_server_enabled("missing", true).await;
    fx.manager.touch_file(&file, false).await;
    assert_eq!(missing.spawn_count(), 2);
}

#[tokio::test]
async fn disabling_shuts_down_and_enabling_is_lazy() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "");
    let mut events = fx.manager.subscribe();

    fx.manager.touch_file(&file, false).await;
    assert!(fx.manager.status()[0].is_running());

    fx.manager.set_server_enabled("fake-ts", false).await;
    let status = &fx.manager.status()[0];
    assert!(!status.enabled);
    assert!(!status.is_running());
    assert!(
        ts.transcript(0)
            .messages()
            .iter()
            .any(|m| m["method"] == "shutdown")
    );

    fx.manager.touch_file(&file, false).await;
    assert_eq!(ts.spawn_count(), 1);

    fx.manager.set_server_enabled("fake-ts", true).await;
    assert!(!fx.manager.status()[0].is_running());
    fx.manager.touch_file(&file, false).await;
    assert_eq!(ts.spawn_count(), 2);

    let mut toggles = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if let LspEvent::ServerStatusChanged { server, enabled } = event {
            assert_eq!(server, "fake-ts");
            toggles.push(enabled);
        }
    }
    assert_eq!(toggles, vec![false, true]);
}

#[tokio::test]
async fn disabled_in_config_is_skipped() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let config = LspConfig {
        disabled: vec!["fake-ts".to_string()],
        ..LspConfig::default()
    };
    let fx = Fixture::with_config(vec![ts.clone()], config);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "");

    fx.manager.touch_file(&file, false).await;
    assert_eq!(ts.spawn_count(), 0);
    assert!(!fx.manager.status()[0].enabled);
}

#[tokio::test]
async fn started_and_closed_events_reach_host() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts]);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "");
    let mut events = fx.manager.subscribe();

    fx.manager.touch_file(&file, false).await;
    fx.manager.shutdown().await;

    let mut started = Vec::new();
    let mut closed = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        match event {
            LspEvent::ServerStarted { key } => started.push(key),
            LspEvent::ServerClosed { key, state } => {
                assert!(state.is_terminal());
                closed.push(key);
            }
            _ => {}
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].server_id, "fake-ts");
    assert_eq!(started[0].root, fx.project());
    assert_eq!(closed, started);
    assert!(!fx.manager.status()[0].is_running());
}

#[tokio::test]
async fn file_closed_clears_diagnostics() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts]);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "");

    fx.manager.touch_file(&file, true).await;
    assert_eq!(fx.manager.diagnostics_for_file(&file).len(), 1);

    fx.manager.file_closed(&file).await;
    assert!(fx.manager.diagnostics_for_file(&file).is_empty());
    assert!(fx.manager.all_diagnostics().is_empty());
}

#[tokio::test]
async fn file_changed_uses_supplied_content() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("app.ts", "on disk");

    fx.manager.touch_file(&file, false).await;
    fx.manager
        .file_changed(&file, Some("in memory".to_string()))
        .await;
    fx.manager.file_saved(&file).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transcript = ts.transcript(0);
    let changes = transcript.params_of("textDocument/didChange");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["textDocument"]["version"], 2);
    assert_eq!(changes[0]["contentChanges"][0]["text"], "in memory");
    assert_eq!(transcript.params_of("textDocument/didSave").len(), 1);
}

#[tokio::test]
async fn dotted_paths_share_one_identity() {
    let ts = ts_definition("fake-ts", FakeBehavior::named("ts"));
    let fx = Fixture::new(vec![ts.clone()]);
    fx.write("package.json", "{}");
    let file = fx.write("src/app.ts", "export {};\n");
    let dotted = fx.project().join("src/../src/./app.ts");

    let started = std::time::Instant::now();
    fx.manager.touch_file(&dotted, true).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let opens = ts.transcript(0).params_of("textDocument/didOpen");
    let uri = opens[0]["textDocument"]["uri"].as_str().unwrap().to_string();
    assert!(!uri.contains(".."), "{uri}");
    assert_eq!(fx.manager.diagnostics_for_file(&dotted).len(), 1);
    assert_eq!(fx.manager.diagnostics_for_file(&file).len(), 1);

    fx.manager.file_closed(&dotted).await;
    assert!(fx.manager.diagnostics_for_file(&file).is_empty());
    assert!(fx.manager.all_diagnostics().is_empty());
}
