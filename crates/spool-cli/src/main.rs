use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use spool_core::{
    CreateOptions, InMemoryStore, ListenOptions, SpoolError, TaskClient, TaskHandle, TaskHandler,
    TaskStatus, TaskType,
};

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

struct GreetHandler;

#[async_trait]
impl TaskHandler for GreetHandler {
    async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
        let payload: GreetPayload = serde_json::from_value(task.payload())
            .map_err(|e| SpoolError::Store(format!("json decode: {e}")))?;

        println!("Hello, {}! (task {})", payload.name, task.id());
        task.update_payload(|p| p["greeted"] = serde_json::json!(true));
        task.complete().await
    }
}

struct TickHandler;

#[async_trait]
impl TaskHandler for TickHandler {
    async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
        println!("tick at {}", task.record().next_run_at);
        task.complete().await
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // (A) Wire the client to the in-memory store. A real deployment swaps
    // in a document-store adapter here; nothing else changes.
    let client = TaskClient::new(Arc::new(InMemoryStore::new()));
    let greetings = TaskType::new("greetings");
    let ticks = TaskType::new("ticks");

    // (B) Start one listener per task type.
    let options = ListenOptions {
        poll_interval: Duration::from_millis(100),
        ..ListenOptions::default()
    };
    let greet_listener = client.listen(&greetings, Arc::new(GreetHandler), options.clone());
    let tick_listener = client.listen(&ticks, Arc::new(TickHandler), options);
    println!(
        "listening for {} as {}",
        greet_listener.task_type(),
        greet_listener.owner()
    );

    // (C) A one-shot task, due immediately.
    let created = client
        .create(
            &greetings,
            serde_json::json!({ "name": "spool" }),
            CreateOptions::default(),
        )
        .await
        .expect("create greeting task");
    println!("created one-shot task {}", created.id);

    // (D) A recurring task firing every second.
    let recurring = client
        .create(
            &ticks,
            serde_json::json!({}),
            CreateOptions::recurring("* * * * * *"),
        )
        .await
        .expect("create tick task");
    println!(
        "created recurring task {} (first fire {})",
        recurring.id, recurring.next_run_at
    );

    // (E) Poll the one-shot to completion while the ticks run.
    loop {
        let status = client
            .get(&greetings, &created.id)
            .await
            .expect("task exists")
            .status;
        if status == TaskStatus::Completed {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    sleep(Duration::from_secs(3)).await;

    // (F) Cooperative shutdown: in-flight work finishes, loops exit.
    client
        .disable(&ticks, &recurring.id)
        .await
        .expect("disable tick task");
    greet_listener.stop_and_join().await;
    tick_listener.stop_and_join().await;

    let counts = client.counts(&greetings).await.expect("counts");
    println!("greetings: {counts:?}");
}
