//! Basic DataBox Example
//!
//! Two workers share one in-process exchange. A socket attached on the first
//! worker receives a change made on the second one.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use databox_core::{
    ConnectionContext, CudOptions, DataBoxConfig, DataBoxDefinition, DataBoxEnv, DataBoxHooks, DataBoxRegistry,
    LocalExchange, SessionTarget, Socket,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("DataBox Basic Example\n");

    let exchange = Arc::new(LocalExchange::new());
    let definitions = || {
        let hooks = DataBoxHooks::new().on_fetch(|request| async move {
            let page = request.counter;
            Ok(request.reply(json!({ "page": page, "messages": [] })))
        });
        vec![DataBoxDefinition::family("chat").default_variant(DataBoxConfig::new().with_hooks(hooks))]
    };

    let worker_a = DataBoxRegistry::prepare(
        definitions(),
        &DataBoxEnv::new("worker-a", exchange.clone(), "demo-secret"),
    )
    .await?;
    let worker_b = DataBoxRegistry::prepare(
        definitions(),
        &DataBoxEnv::new("worker-b", exchange.clone(), "demo-secret"),
    )
    .await?;

    let chat_a = worker_a.get_data_box("chat", 1)?;
    let chat_b = worker_b.get_data_box("chat", 1)?;
    let (Some(chat_a), Some(chat_b)) = (chat_a.as_family(), chat_b.as_family()) else {
        return Err("chat is declared as a family".into());
    };

    // Attach a socket to member "room42" on worker A
    let (socket, mut events) = Socket::new(1, ConnectionContext::new("web", 1.0));
    let attachment = chat_a.register_socket("room42", &socket, None)?;
    println!("Attached: in={} out={}", attachment.input_key, attachment.output_key);

    let reply = chat_a.get_data("room42", socket.id(), SessionTarget::Main).await?;
    println!("First page: {}", reply.data);

    // Change the member on worker B
    let package = chat_b
        .insert("room42", ["messages", "m1"], json!({ "text": "hello" }), CudOptions::default())
        .await?;
    println!("Published cud package {}", package.cud_id());

    while let Ok(event) = events.try_recv() {
        println!("Socket received {}: {}", event.event, event.payload);
    }
    println!("Last cud id on worker A: {}", chat_a.last_cud_id("room42"));

    // Dropping the last socket releases the member
    socket.disconnect();
    println!("Active members on worker A: {}", chat_a.member_count());

    Ok(())
}
