//! scholaris-chat - terminal driver for the chat core
//!
//! Usage: `scholaris-chat <conversation-id>`
//!
//! Uses the session saved under the platform config directory, connects the
//! chat socket, prints the conversation history and sends every
//! stdin line to it (an empty line sends a typing signal). EOF exits.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use scholaris_client::{
    load_session, logging, ChatConfig, ChatSocket, ChatStore, Coordinator, Storage,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("chat=debug,scholaris_client=info");

    let conversation_id: i64 = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid conversation id: {arg}"))?,
        None => bail!("usage: scholaris-chat <conversation-id>"),
    };

    let storage = Storage::platform().context("no config directory on this platform")?;
    let session = load_session(&storage).context("no saved session; log in first")?;
    let config = ChatConfig::from_env();

    let (socket, events) = ChatSocket::new(config.reconnect.clone());
    let socket = Arc::new(socket);
    let api = Arc::new(session.client(&config));
    let store = ChatStore::shared();
    let coordinator = Arc::new(Coordinator::for_session(
        &session,
        store.clone(),
        socket.clone(),
        api,
        config.clone(),
    )?);

    let mut state = socket.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            scholaris_client::log_info!("Connection: {:?}", current);
        }
    });

    let mut notices = coordinator.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            scholaris_client::log_warn!("{:?}", notice);
        }
    });

    socket.connect(&session, &config);
    coordinator.load_conversations().await?;
    coordinator.open_conversation(conversation_id).await?;

    {
        let store = store.read().await;
        for message in store.messages(conversation_id) {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M"),
                message.sender_id,
                message.body.as_deref().unwrap_or("<media>")
            );
        }
    }

    let inbound = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(events).await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            coordinator.send_typing(conversation_id);
            continue;
        }
        if let Err(e) = coordinator.send_message(conversation_id, &line).await {
            scholaris_client::log_error!("Send failed: {}", e);
        }
    }

    coordinator.shutdown().await;
    inbound.abort();
    Ok(())
}
