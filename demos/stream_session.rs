//! Stream a generation session end to end without any model server.
//!
//! A scripted local client stands in for the model. The demo schedules a
//! streamed draft and a file-set task on one session and prints every frame
//! as a server-sent event.
//!
//! ```sh
//! RUST_LOG=llm_relay=debug cargo run --example stream_session
//! ```

use futures::StreamExt;
use llm_relay::backend::{ChatMessage, ScriptedClient, ScriptedFactory};
use llm_relay::config::{MapEnv, RoutingConfig, StreamConfig};
use llm_relay::provider::StaticProbe;
use llm_relay::{
    ArtifactKind, DraftTask, FileSetTask, InvocationRequest, Purpose, QueuePayload, Relay,
    RelayConfig, StatusPhase, StreamFrame,
};
use std::sync::Arc;
use std::time::Duration;

const FILE_SET: &str = r#"Here is the project:
```json
{
  "summary": "Minimal greeting CLI",
  "files": [
    {"path": "src/main.rs", "content": "fn main() {\n    println!(\"hello\");\n}\n", "requirement_refs": ["REQ-1"]},
    {"path": "Cargo.toml", "content": "[package]\nname = \"hello\"\nversion = \"0.1.0\"\n"}
  ]
}
```"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    llm_relay::telemetry::init_tracing();

    let local = ScriptedClient::new("scripted-local")
        .then_tokens(["# Plan\n", "1. Parse args\n", "2. Print greeting\n", "3. Exit\n"])
        .then_text(FILE_SET);
    let factory = ScriptedFactory::new().with_client("ollama", Arc::new(local));

    let config = RelayConfig::default()
        .with_routing(RoutingConfig {
            local_enabled: true,
            ..RoutingConfig::default()
        })
        .with_stream(StreamConfig {
            heartbeat_interval: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            ..StreamConfig::default()
        });

    let relay = Relay::builder(config)
        .env(Arc::new(MapEnv::new()))
        .probe(Arc::new(StaticProbe(true)))
        .factory(Arc::new(factory))
        .build()?;

    let session = relay.create_session();
    let mut frames = relay.stream(&session, 0)?;

    let plan = InvocationRequest::new(
        Purpose::Generation,
        vec![ChatMessage::user("Plan a greeting CLI")],
    );
    let draft = DraftTask::new("PLAN.md", ArtifactKind::Summary, plan).draft_every(2);
    let mut first_worker = Some(relay.schedule(&session, Box::new(draft))?);

    while let Some(frame) = frames.next().await {
        print!("{}", frame.to_event()?);

        let StreamFrame::Updates { updates, .. } = &frame else {
            continue;
        };
        let finished = updates.iter().any(|entry| {
            matches!(
                &entry.payload,
                QueuePayload::Status(s) if matches!(s.phase, StatusPhase::Completed | StatusPhase::Failed)
            )
        });
        if !finished {
            continue;
        }
        if let Some(worker) = first_worker.take() {
            // the writer slot frees up once the worker has fully returned
            worker.await?;
            let files = InvocationRequest::new(
                Purpose::Generation,
                vec![ChatMessage::user("Now write the files")],
            );
            relay.schedule(&session, Box::new(FileSetTask::new(files)))?;
        } else {
            break;
        }
    }

    let snapshot = relay.store().snapshot(&session)?;
    println!("-- session {} at revision {}", snapshot.id, snapshot.revision);
    for artifact in &snapshot.artifacts {
        println!(
            "{:<14} v{} {:<8} {}",
            artifact.path,
            artifact.version,
            artifact.kind,
            artifact.diff_summary.lines().next().unwrap_or("")
        );
    }
    Ok(())
}
