use futures::StreamExt;
use futures::stream::{self, BoxStream};
use runstate::journal::MessageReader;
use runstate::stream::{apply_raw, consume_stream_state};
use runstate::{OutputLog, RunState, RunStateConfig, create_channel, mux_events};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize)]
struct Board {
    title: String,
    cards: Vec<String>,
    votes: std::collections::BTreeMap<String, u32>,
}

#[tokio::test]
async fn test_replaying_log_reproduces_state() {
    let log = OutputLog::new("board");
    let mut board = create_channel(
        Arc::new(log.clone()),
        Board {
            title: "retro".to_string(),
            cards: vec![],
            votes: Default::default(),
        },
    );

    board.commit().await.unwrap();
    board.cards.push("ship it".to_string());
    board.commit().await.unwrap();
    board.cards.insert(0, "tests".to_string());
    board.votes.insert("tests".to_string(), 3);
    board.commit().await.unwrap();
    board.cards.pop();
    board.title = "retro #2".to_string();
    board.commit().await.unwrap();

    let mut replayed = json!({});
    let mut reader = log.reader(0);
    while let Some(raw) = reader.try_read().unwrap() {
        apply_raw(&mut replayed, &raw).unwrap();
    }

    assert_eq!(replayed, serde_json::to_value(board.state()).unwrap());
    assert_eq!(board.offset(), 4);
}

#[tokio::test]
async fn test_second_commit_without_change_is_silent() {
    let rs = RunState::in_memory(RunStateConfig::default()).unwrap();
    let run = rs.host().start_run().unwrap();
    let mut channel = rs.channel(&run, json!({"n": 0})).unwrap();

    assert_eq!(channel.commit().await.unwrap(), Some(0));
    assert_eq!(channel.commit().await.unwrap(), None);

    let log = rs.host().log(&run, "stream-state").unwrap();
    assert_eq!(log.entry_count(), 1);
}

#[tokio::test]
async fn test_replace_resets_baseline_mid_log() {
    let log = OutputLog::new("l");
    log.push(json!({"type": "replace", "state": {"a": 1}})).unwrap();
    log.push(json!({"type": "patch", "patch": [{"op": "add", "path": "/b", "value": 2}]}))
        .unwrap();
    log.push(json!({"type": "replace", "state": {"c": 3}})).unwrap();
    log.close();

    let caught = consume_stream_state(&mut log.reader(0), None, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(caught.state, json!({"c": 3}));
    assert_eq!(caught.count, 3);
}

#[tokio::test]
async fn test_fan_in_keeps_per_source_order() {
    let sources: Vec<(&str, BoxStream<'static, &str>)> = vec![
        ("a", stream::iter(vec!["a1", "a2"]).boxed()),
        ("b", stream::iter(vec!["b1"]).boxed()),
        ("c", stream::iter(Vec::<&str>::new()).boxed()),
    ];

    let merged: Vec<(&str, &str)> = mux_events(sources)
        .map(|event| (event.source, event.value))
        .collect()
        .await;

    assert_eq!(merged.len(), 3);
    let a: Vec<_> = merged.iter().filter(|(s, _)| *s == "a").map(|(_, v)| *v).collect();
    assert_eq!(a, vec!["a1", "a2"]);
    assert_eq!(merged.iter().filter(|(_, v)| *v == "b1").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_returns_after_one_quiet_window() {
    let log = OutputLog::new("l");
    log.push(json!({"type": "replace", "state": {"items": []}})).unwrap();
    for i in 0..4 {
        log.push(json!({
            "type": "patch",
            "patch": [{"op": "add", "path": "/items/-", "value": i}]
        }))
        .unwrap();
    }

    let started = Instant::now();
    let caught = consume_stream_state(&mut log.reader(0), None, Duration::from_millis(50))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(caught.count, 5);
    assert_eq!(caught.state, json!({"items": [0, 1, 2, 3]}));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_waits_for_messages_inside_window() {
    let log = OutputLog::new("l");
    log.push(json!({"type": "replace", "state": {"n": 0}})).unwrap();

    let writer = log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer
            .push(json!({"type": "patch", "patch": [{"op": "replace", "path": "/n", "value": 1}]}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = writer.push(json!({"type": "replace", "state": {"n": 99}}));
    });

    let mut reader = log.reader(0);
    let caught = consume_stream_state(&mut reader, None, Duration::from_millis(50))
        .await
        .unwrap();

    assert_eq!(caught.state, json!({"n": 1}));
    assert_eq!(caught.count, 2);
    assert_eq!(reader.name(), "l");
}

#[tokio::test]
async fn test_resume_offset_from_catch_up() {
    let rs = RunState::in_memory(RunStateConfig::default()).unwrap();
    let run = rs.host().start_run().unwrap();
    rs.tags().claim_unique("stream:general", &run).await.unwrap();

    let mut channel = rs.channel(&run, json!({"messages": []})).unwrap();
    channel.commit().await.unwrap();
    channel.state_mut()["messages"] = json!(["hi"]);
    channel.commit().await.unwrap();

    let snapshot = rs.resolver().get_stream_state("general", None).await.unwrap();
    assert_eq!(snapshot.start_index, 2);

    channel.state_mut()["messages"] = json!(["hi", "again"]);
    channel.commit().await.unwrap();

    let log = rs.host().log(&run, "stream-state").unwrap();
    let mut state: Value = snapshot.state;
    let mut reader = log.reader(snapshot.start_index);
    while let Some(raw) = reader.try_read().unwrap() {
        apply_raw(&mut state, &raw).unwrap();
    }
    assert_eq!(state, json!({"messages": ["hi", "again"]}));
}
