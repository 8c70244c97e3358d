use std::{sync::Arc, time::Duration};

use tracing::info;

use sync_core::{
    ContentType, EngineError, Message, MessageMetadata, MessageRole, ProcessingStatus,
};
use sync_engine::{EngineTransports, SyncEngine};
use sync_transport::memory::{InMemoryChannel, InMemoryHistoryLoader, ScriptedSendEndpoint};

mod config;
mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match config::SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: config::SmokeConfig) -> Result<(), EngineError> {
    let conversation_id = config.conversation_id.clone();
    let topic = format!("messages:{conversation_id}");

    let channel = InMemoryChannel::new();
    let loader = InMemoryHistoryLoader::with_messages(vec![
        history_message("m1", &conversation_id, MessageRole::User, "hi there"),
        history_message("m2", &conversation_id, MessageRole::Assistant, "hello!"),
    ]);
    let endpoint = ScriptedSendEndpoint::new();
    endpoint.enqueue_success("m3");

    let engine = Arc::new(SyncEngine::new(
        config.engine,
        conversation_id.clone(),
        EngineTransports {
            channel: Arc::new(channel.clone()),
            loader: Arc::new(loader),
            endpoint: Arc::new(endpoint),
            auth_token: config.auth_token,
        },
    ));

    engine.init().await?;
    info!(state = ?engine.connection_state(), "engine initialized");

    engine.send_message("how are you?", "smoke").await?;

    let mut reply = history_message("m4", &conversation_id, MessageRole::Assistant, "doing well");
    reply.created_at_ms += 1;
    channel.push_insert(&topic, reply);

    // Let the reader task apply the inbound event.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for message in engine.messages().await {
        println!(
            "[{:?}] {}: {}",
            message.role, message.id, message.content
        );
    }
    info!(state = ?engine.connection_state(), "smoke run complete");

    engine.shutdown().await;
    Ok(())
}

fn history_message(id: &str, conversation_id: &str, role: MessageRole, body: &str) -> Message {
    Message {
        id: id.to_owned(),
        conversation_id: conversation_id.to_owned(),
        interface: "smoke".to_owned(),
        role,
        content: body.to_owned(),
        content_type: ContentType::Text,
        reply_to_message_id: None,
        metadata: MessageMetadata::default(),
        processing_status: ProcessingStatus::Sent,
        created_at_ms: 1_760_000_000_000,
    }
}
