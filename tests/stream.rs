//! Stream delivery, acknowledgement and recovery.

use chrono::{TimeZone, Utc};
use filespin::config::StreamConfig;
use filespin::data_file::Tags;
use filespin::registry::Engine;
use filespin::storage::memory::MemoryStorage;
use filespin::storage::StorageType;
use filespin::stream::local::LocalStream;
use filespin::stream::spool::SpoolStream;
use filespin::stream::{DataFileMessage, Delivery, Stream, stream_from_config};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn options(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn urls(set: &[&str]) -> HashSet<String> {
    set.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn test_local_stream_delivers_each_file_once() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("sub")).unwrap();
    fs::write(tmp.path().join("b.jsonl"), "{}\n").unwrap();
    fs::write(tmp.path().join("sub/a.jsonl"), "{}\n").unwrap();
    let stream = LocalStream::new("in", tmp.path(), &Map::new());

    let first = stream.get(false, None).unwrap().unwrap();
    let second = stream.get(false, None).unwrap().unwrap();
    assert!(first.file_url.ends_with("/b.jsonl"));
    assert!(second.file_url.ends_with("/sub/a.jsonl"));
    assert!(stream.get(false, None).unwrap().is_none());

    stream.task_done(&first).unwrap();
    stream.task_failed(&second).unwrap();
    assert!(stream.get(false, None).unwrap().is_none());
}

#[test]
fn test_local_stream_recover_skips_processed() {
    let tmp = TempDir::new().unwrap();
    for name in ["a.jsonl", "b.jsonl", "c.jsonl"] {
        fs::write(tmp.path().join(name), "{}\n").unwrap();
    }
    let root = tmp.path().to_string_lossy().into_owned();
    let stream = LocalStream::new("in", tmp.path(), &Map::new());
    stream
        .recover(
            &urls(&[&format!("file://{root}/a.jsonl")]),
            &urls(&[&format!("file://{root}/b.jsonl")]),
        )
        .unwrap();

    let only = stream.get(false, None).unwrap().unwrap();
    assert_eq!(only.file_url, format!("file://{root}/c.jsonl"));
    assert!(stream.get(false, None).unwrap().is_none());
}

#[test]
fn test_local_stream_watch_picks_up_new_files() {
    let tmp = TempDir::new().unwrap();
    let stream = LocalStream::new("in", tmp.path(), &options(json!({"watch": true, "poll_interval_ms": 10})));
    assert!(stream.get(true, Some(Duration::from_millis(30))).unwrap().is_none());

    fs::write(tmp.path().join("late.jsonl"), "{}\n").unwrap();
    let got = stream.get(true, Some(Duration::from_secs(2))).unwrap().unwrap();
    assert!(got.file_url.ends_with("/late.jsonl"));
}

#[test]
fn test_local_stream_cannot_publish() {
    let tmp = TempDir::new().unwrap();
    let stream = LocalStream::new("in", tmp.path(), &Map::new());
    assert!(stream.send_to_stream("/x.jsonl", &Tags::new(), StorageType::File).is_err());
}

#[test]
fn test_spool_delivers_in_order_and_acknowledges() {
    let tmp = TempDir::new().unwrap();
    let spool = SpoolStream::open("q", tmp.path(), &Map::new()).unwrap();
    let mut tags = Tags::new();
    tags.insert("app".into(), "web".into());
    let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    spool
        .publish(&DataFileMessage::new("file:///in/1.jsonl", tags.clone()).with_window(None, Some(end)))
        .unwrap();
    spool.send_to_stream("/in/2.jsonl", &Tags::new(), StorageType::File).unwrap();
    assert_eq!(spool.pending().unwrap(), 2);

    let first = spool.get(false, None).unwrap().unwrap();
    assert_eq!(first.file_url, "file:///in/1.jsonl");
    assert_eq!(first.tags, tags);
    assert_eq!(first.datetime_end, Some(end));
    let second = spool.get(false, None).unwrap().unwrap();
    assert_eq!(second.file_url, "file:///in/2.jsonl");
    assert!(spool.get(false, None).unwrap().is_none());

    spool.task_done(&first).unwrap();
    spool.task_done(&second).unwrap();
    assert_eq!(spool.pending().unwrap(), 0);
    assert_eq!(fs::read_dir(tmp.path().join("claimed")).unwrap().count(), 0);
}

#[test]
fn test_spool_failed_message_is_hidden_then_redelivered() {
    let tmp = TempDir::new().unwrap();
    let spool = SpoolStream::open("q", tmp.path(), &options(json!({"retry_delay_ms": 150, "poll_interval_ms": 10}))).unwrap();
    spool.publish(&DataFileMessage::new("file:///in/1.jsonl", Tags::new())).unwrap();

    let msg = spool.get(false, None).unwrap().unwrap();
    spool.task_failed(&msg).unwrap();
    assert_eq!(spool.pending().unwrap(), 1);
    assert!(spool.get(false, None).unwrap().is_none());

    let started = Instant::now();
    let again = spool.get(true, Some(Duration::from_secs(5))).unwrap().unwrap();
    assert_eq!(again.file_url, msg.file_url);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_spool_recover_sorts_out_stale_claims() {
    let tmp = TempDir::new().unwrap();
    {
        let spool = SpoolStream::open("q", tmp.path(), &Map::new()).unwrap();
        for n in 1..=3 {
            spool.publish(&DataFileMessage::new(format!("file:///in/{n}.jsonl"), Tags::new())).unwrap();
        }
        for _ in 0..3 {
            spool.get(false, None).unwrap().unwrap();
        }
        // Consumer dies without acknowledging.
    }
    let spool = SpoolStream::open("q", tmp.path(), &Map::new()).unwrap();
    spool
        .recover(&urls(&["file:///in/1.jsonl"]), &urls(&["file:///in/2.jsonl"]))
        .unwrap();

    assert_eq!(spool.pending().unwrap(), 1);
    let redelivered = spool.get(false, None).unwrap().unwrap();
    assert_eq!(redelivered.file_url, "file:///in/3.jsonl");

    // The resumed run's claim is still acknowledgeable.
    spool.task_done(&DataFileMessage::new("file:///in/2.jsonl", Tags::new())).unwrap();
    spool.task_done(&redelivered).unwrap();
    assert_eq!(fs::read_dir(tmp.path().join("claimed")).unwrap().count(), 0);
}

#[test]
fn test_spool_drops_unreadable_messages() {
    let tmp = TempDir::new().unwrap();
    let spool = SpoolStream::open("q", tmp.path(), &Map::new()).unwrap();
    fs::write(tmp.path().join("queue/00000000000000000000-junk.json"), "not json").unwrap();
    spool.publish(&DataFileMessage::new("file:///in/ok.jsonl", Tags::new())).unwrap();

    let got = spool.get(false, None).unwrap().unwrap();
    assert_eq!(got.file_url, "file:///in/ok.jsonl");
    assert_eq!(spool.pending().unwrap(), 0);
}

#[test]
fn test_stream_from_config_schemes() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().display();
    let local = StreamConfig {
        name: "in".into(),
        url: format!("local://{dir}/in?watch"),
        args: Map::new(),
    };
    assert_eq!(stream_from_config(&local, true).unwrap().name(), "in");

    let spool = StreamConfig {
        name: "q".into(),
        url: format!("spool://{dir}/q"),
        args: Map::new(),
    };
    stream_from_config(&spool, false).unwrap();
    assert!(tmp.path().join("q/queue").is_dir());

    let kafka = StreamConfig {
        name: "k".into(),
        url: "kafka://broker/topic".into(),
        args: Map::new(),
    };
    assert!(stream_from_config(&kafka, false).is_err());
}

#[test]
fn test_delivery_attaches_provider_for_remote_urls() {
    let bucket = MemoryStorage::named("delivery-test");
    bucket.put("events/a.jsonl", "{\"n\":1}\n{\"n\":2}\n").unwrap();
    let mut engine = Engine::new();
    engine.register_storage("lake", Arc::new(bucket));

    let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let msg = DataFileMessage::new("mem://delivery-test/events/a.jsonl", Tags::new()).with_window(None, Some(end));
    let delivery = Delivery::resolve(msg, &engine).unwrap();
    assert_eq!(delivery.timestamp(0), end.timestamp());
    let file = &delivery.files[0];
    assert_eq!(file.name(), "a");
    assert!(file.provider().is_some());
    assert_eq!(file.readlines().unwrap().count(), 2);

    let unknown = DataFileMessage::new("mem://nowhere/a.jsonl", Tags::new());
    assert!(Delivery::resolve(unknown, &engine).is_err());

    let local = Delivery::resolve(DataFileMessage::new("file:///in/x.jsonl", Tags::new()), &engine).unwrap();
    assert_eq!(local.timestamp(42), 42);
    assert!(local.files[0].provider().is_none());
}

#[test]
fn test_message_parsing() {
    let msg = DataFileMessage::parse(
        r#"{"data_format":"filespin","file_url":"s3://b/k.jsonl","tags":{"a":"1"}}"#,
    )
    .unwrap();
    assert_eq!(msg.location().unwrap().bucket, "b");
    assert!(DataFileMessage::parse(r#"{"file_url":"s3://b/k"}"#).is_err());
    assert!(DataFileMessage::parse(r#"{"data_format":"other","file_url":"s3://b/k"}"#).is_err());

    let note = DataFileMessage::parse(
        r#"{"Records":[{"s3":{"bucket":{"name":"b"},"object":{"key":"x/y.jsonl"}}}]}"#,
    )
    .unwrap();
    assert_eq!(note.file_url, "s3://b/x/y.jsonl");
}
