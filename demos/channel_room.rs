//! A chat room run: claims `stream:general`, merges incoming messages with a
//! membership feed, publishes its state, and a local subscriber follows along.
//!
//! Run with: cargo run --example channel_room

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use runstate::client::{SubscribeOptions, SubscriptionRegistry};
use runstate::{RunState, RunStateConfig, TagFilter, TagOptions, mux_events};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Room {
    name: String,
    members: Vec<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    from: String,
    text: String,
}

#[derive(Debug)]
enum RoomEvent {
    Joined(String),
    Said(String, String),
}

fn paced<T: Send + 'static>(items: Vec<T>, every: Duration) -> BoxStream<'static, T> {
    stream::iter(items)
        .then(move |item| async move {
            tokio::time::sleep(every).await;
            item
        })
        .boxed()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🛰  runstate channel room demo\n");

    let rs = RunState::in_memory(RunStateConfig::default())?;
    let run = rs.host().start_run()?;

    rs.tags()
        .set_tag_for_run(&run, "stream:general", None, TagOptions::unique())
        .await?;
    rs.tags()
        .set_tag_for_run(&run, "name", Some("general"), TagOptions::default())
        .await?;
    rs.tags().add_run_to_tag("channel", &run).await?;
    rs.tags().add_run_to_tag("auth:public", &run).await?;

    let public = rs
        .tags()
        .list_runs_by_tag(&["channel"], &TagFilter::new().any_of(["auth:public"]))
        .await?;
    println!("public channels: {public:?}");

    let mut room = rs.channel(
        &run,
        Room {
            name: "general".to_string(),
            ..Room::default()
        },
    )?;
    room.commit().await?;

    let registry = SubscriptionRegistry::new(Arc::new(rs.local_connector()));
    let mut watcher = registry.subscribe("general", SubscribeOptions::new())?;

    let follower = tokio::spawn(async move {
        while let Ok(view) = watcher.changed().await {
            println!("  [subscriber] offset {} -> {}", view.event_count, view.state);
            if view.event_count >= 5 {
                break;
            }
        }
    });

    let joins = paced(
        vec![
            RoomEvent::Joined("ada".to_string()),
            RoomEvent::Joined("grace".to_string()),
        ],
        Duration::from_millis(30),
    );
    let chat = paced(
        vec![
            RoomEvent::Said("ada".to_string(), "hello".to_string()),
            RoomEvent::Said("grace".to_string(), "hi ada".to_string()),
        ],
        Duration::from_millis(45),
    );

    let mut events = mux_events(vec![("joins", joins), ("chat", chat)]);
    while let Some(event) = events.next().await {
        match event.value {
            RoomEvent::Joined(who) => room.members.push(who),
            RoomEvent::Said(from, text) => room.messages.push(Message { from, text }),
        }
        if let Some(offset) = room.commit().await? {
            println!("[{}] committed offset {offset}", event.source);
        }
    }

    tokio::time::timeout(Duration::from_secs(2), follower).await??;

    let snapshot = rs.resolver().get_stream_state("general", None).await?;
    println!(
        "\ncatch-up read: startIndex={} state={}",
        snapshot.start_index, snapshot.state
    );

    rs.host().complete_run(&run)?;
    registry.shutdown()?;
    Ok(())
}
