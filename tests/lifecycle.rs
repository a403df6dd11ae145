mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{EngineLab, FakeLoader, Script, StallingExecutor, WritingExecutor};
use edge_gallery::download::{DownloadEvent, DownloadExecutor};
use edge_gallery::{
    Dispatcher, DownloadOrchestrator, Events, InferenceSessionManager, MethodCall, ProgressState,
    Resolver, Subscription,
};

struct Harness {
    _root: tempfile::TempDir,
    lab: Arc<EngineLab>,
    events: Arc<Events>,
    dispatcher: Dispatcher,
}

fn harness(executor: Arc<dyn DownloadExecutor>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let lab = EngineLab::new();
    let events = Events::new(32);

    let downloads = Arc::new(DownloadOrchestrator::new(root.path(), executor, Arc::clone(&events)));
    let inference = Arc::new(InferenceSessionManager::new(
        Arc::new(FakeLoader(Arc::clone(&lab))),
        Arc::clone(&events),
    ));
    let dispatcher = Dispatcher::new(Resolver::new(common::catalog()), downloads, inference)
        .download_base("https://models.example.com");

    Harness {
        _root: root,
        lab,
        events,
        dispatcher,
    }
}

async fn until_terminal(sub: &mut Subscription<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("progress channel closed");
        let terminal = event.state.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_download_initialize_generate_dispose() {
    let h = harness(Arc::new(WritingExecutor));
    let mut progress = h.events.progress.subscribe();
    let mut tokens = h.events.tokens.subscribe();

    let present = h
        .dispatcher
        .handle(MethodCall::new("isModelDownloaded", json!({ "modelId": "m1" })))
        .await
        .unwrap();
    assert_eq!(present, json!(false));

    let started = h
        .dispatcher
        .handle(MethodCall::new("downloadModel", json!({ "modelName": "m1" })))
        .await
        .unwrap();
    assert_eq!(started["tag"], "model_download");

    let seen = until_terminal(&mut progress).await;
    let last = seen.last().unwrap();
    assert_eq!(last.state, ProgressState::Completed);
    assert_eq!(last.received_bytes, 16);
    assert_eq!(last.task_id.to_string(), started["taskId"].as_str().unwrap());
    let received: Vec<u64> = seen.iter().map(|e| e.received_bytes).collect();
    assert!(received.windows(2).all(|w| w[0] <= w[1]));

    let present = h
        .dispatcher
        .handle(MethodCall::new("isModelDownloaded", json!({ "modelId": "m1" })))
        .await
        .unwrap();
    assert_eq!(present, json!(true));

    let by_layout = h
        .dispatcher
        .handle(MethodCall::new(
            "isModelDownloaded",
            json!({ "fileName": "m1.bin", "modelDir": "m1", "version": "main", "totalBytes": 16 }),
        ))
        .await
        .unwrap();
    assert_eq!(by_layout, json!(true));

    h.dispatcher
        .handle(MethodCall::new("initializeModel", json!({ "modelId": "m1", "topK": 8 })))
        .await
        .unwrap();
    assert_eq!(h.lab.sessions.lock()[0].top_k, 8);
    assert!(h.lab.loaded.lock()[0].model_path.ends_with("m1/main/m1.bin"));

    h.lab.push_script(Script::tokens(&[("Hi", false), (" there", true)]));
    h.dispatcher
        .handle(MethodCall::new("generateResponse", json!({ "prompt": "hello" })))
        .await
        .unwrap();

    let first = tokens.recv().await.unwrap();
    let second = tokens.recv().await.unwrap();
    assert_eq!((first.partial_result.as_str(), first.is_done), ("Hi", false));
    assert_eq!((second.partial_result.as_str(), second.is_done), (" there", true));

    h.dispatcher
        .handle(MethodCall::new("disposeModel", json!(null)))
        .await
        .unwrap();
    let err = h
        .dispatcher
        .handle(MethodCall::new("generateResponse", json!({ "prompt": "again" })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_MODEL");
}

#[tokio::test]
async fn test_cancel_download() {
    let h = harness(Arc::new(StallingExecutor));
    let mut progress = h.events.progress.subscribe();

    h.dispatcher
        .handle(MethodCall::new("downloadModel", json!({ "modelName": "m1" })))
        .await
        .unwrap();
    let first = progress.recv().await.unwrap();
    assert_eq!(first.state, ProgressState::Downloading);

    let cancelled = h
        .dispatcher
        .handle(MethodCall::new("cancelDownload", json!(null)))
        .await
        .unwrap();
    assert_eq!(cancelled["cancelled"], 1);

    let seen = until_terminal(&mut progress).await;
    assert_eq!(seen.last().unwrap().state, ProgressState::Cancelled);
    let terminal = seen.iter().filter(|e| e.state.is_terminal()).count();
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn test_unknown_model_without_layout() {
    let h = harness(Arc::new(WritingExecutor));

    let err = h
        .dispatcher
        .handle(MethodCall::new("downloadModel", json!({ "modelName": "nope" })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGS");

    let err = h
        .dispatcher
        .handle(MethodCall::new("isModelDownloaded", json!({ "modelId": "nope" })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let err = h
        .dispatcher
        .handle(MethodCall::new("initializeModel", json!({ "modelId": "nope" })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_argument_errors() {
    let h = harness(Arc::new(WritingExecutor));

    let err = h
        .dispatcher
        .handle(MethodCall::new("generateResponse", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_PROMPT");

    let err = h
        .dispatcher
        .handle(MethodCall::new("downloadModel", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGS");

    let err = h
        .dispatcher
        .handle(MethodCall::new(
            "downloadModel",
            json!({ "modelName": "m1", "modelUrl": "not a url" }),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGS");

    let err = h
        .dispatcher
        .handle(MethodCall::new("warmUp", json!(null)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_IMPLEMENTED");
}
