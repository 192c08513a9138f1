//! End-to-end runs of a data process: draining, failure, restart recovery.

use anyhow::{Result, bail};
use chrono::{TimeZone, Utc};
use filespin::config::{DataProcessConfig, SpinSettings};
use filespin::error::SpinError;
use filespin::process::{DataProcess, RunStatus};
use filespin::registry::Engine;
use filespin::storage::local::LocalStorage;
use filespin::storage::{ObjectStorage, StorageType};
use filespin::stream::local::LocalStream;
use filespin::stream::spool::SpoolStream;
use filespin::stream::{DataFileMessage, Stream};
use serde_json::{Map, Value, json};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

/// Local storage that refuses writes while `broken` is set.
struct FlakyStorage {
    inner: LocalStorage,
    broken: AtomicBool,
}

impl ObjectStorage for FlakyStorage {
    fn storage_type(&self) -> StorageType {
        self.inner.storage_type()
    }

    fn location(&self) -> &str {
        self.inner.location()
    }

    fn save(&self, key: &str, local_path: &Path) -> Result<String> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("storage offline");
        }
        self.inner.save(key, local_path)
    }

    fn save_data(&self, key: &str, lines: &[String]) -> Result<String> {
        self.inner.save_data(key, lines)
    }

    fn fetch_file(&self, stored_path: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.fetch_file(stored_path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

struct Workspace {
    _tmp: TempDir,
    input: PathBuf,
    output: PathBuf,
    settings: SpinSettings,
}

fn workspace() -> Result<Workspace> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("in");
    let output = tmp.path().join("out");
    fs::create_dir_all(&input)?;
    let settings = SpinSettings {
        working_dir: tmp.path().join("work"),
        keep_temp: false,
    };
    Ok(Workspace {
        _tmp: tmp,
        input,
        output,
        settings,
    })
}

fn process_conf(steps: Value) -> Result<DataProcessConfig> {
    Ok(serde_json::from_value(json!({
        "name": "events",
        "source": "in",
        "processes": steps,
    }))?)
}

fn flatten_then_save() -> Value {
    json!([
        { "name": "flat", "function": "flatten" },
        { "name": "out", "function": "save", "args": { "location": "out" } }
    ])
}

fn engine(ws: &Workspace, storage: Arc<dyn ObjectStorage>) -> Engine {
    let mut engine = Engine::new();
    engine
        .register_stream("in", Arc::new(LocalStream::new("in", &ws.input, &Map::new())))
        .register_storage("out", storage);
    engine
}

fn read_lines(path: &Path) -> Result<Vec<Value>> {
    fs::read_to_string(path)?
        .lines()
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}

#[test]
fn test_drains_source_through_chain() -> Result<()> {
    let ws = workspace()?;
    fs::write(ws.input.join("a.jsonl"), "{\"k\":\"a\",\"v\":{\"x\":1}}\n{\"k\":\"b\",\"v\":{\"x\":2}}\n")?;
    fs::write(ws.input.join("b.jsonl"), "{\"k\":\"a\",\"v\":{\"x\":3}}\n")?;

    let steps = json!([
        { "name": "flat", "function": "flatten" },
        { "name": "split", "function": "splitby", "args": { "key": "k", "tags": { "group": "{data.k}" } } },
        { "name": "out", "function": "save", "args": { "location": "out", "path_suffix": "{group}" } }
    ]);
    let storage = Arc::new(LocalStorage::new(&ws.output)?);
    let registry = Arc::new(engine(&ws, storage));
    let mut process = DataProcess::new(&process_conf(steps)?, registry, &ws.settings)?;

    assert!(process.recover()?.is_empty());
    let outcomes = process.run()?;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_done()));
    assert_eq!(outcomes[0].executed_steps, vec!["flat", "split", "out"]);

    let a = read_lines(&ws.output.join("a/a-flatten-group-a.jsonl"))?;
    assert_eq!(a, vec![json!({"k": "a", "v.x": 1})]);
    let b = read_lines(&ws.output.join("b/a-flatten-group-b.jsonl"))?;
    assert_eq!(b, vec![json!({"k": "b", "v.x": 2})]);
    assert!(ws.output.join("a/b-flatten-group-a.jsonl").is_file());

    let log = process.checkpoints().read_log()?;
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|c| c.success && c.steps.len() == 3));
    for c in &log {
        assert!(!c.temp_dir.exists(), "run directory should be removed");
    }
    assert_eq!(fs::read_dir(process.checkpoints().dir().join("inflight"))?.count(), 0);

    // Everything is processed; a second pass finds nothing new.
    assert!(process.run()?.is_empty());
    Ok(())
}

#[test]
fn test_failed_step_resumes_after_restart() -> Result<()> {
    let ws = workspace()?;
    let source = ws.input.join("events.jsonl");
    fs::write(&source, "{\"id\":1,\"a\":{\"b\":true}}\n")?;

    let flaky = Arc::new(FlakyStorage {
        inner: LocalStorage::new(&ws.output)?,
        broken: AtomicBool::new(true),
    });
    let conf = process_conf(flatten_then_save())?;
    let mut first = DataProcess::new(&conf, Arc::new(engine(&ws, flaky)), &ws.settings)?;
    let outcomes = first.run()?;
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0].status {
        RunStatus::Failed { step, reason } => {
            assert_eq!(step.as_deref(), Some("out"));
            assert!(reason.contains("storage offline"), "{reason}");
        }
        RunStatus::Done => panic!("save should have failed"),
    }
    assert!(first.checkpoints().read_log()?.is_empty());
    let run_id = outcomes[0].run_id.clone().unwrap();
    assert!(first.checkpoints().inflight_path(&run_id).is_file());
    drop(first);

    // Restart with the storage back online.
    let healthy = Arc::new(LocalStorage::new(&ws.output)?);
    let mut second = DataProcess::new(&conf, Arc::new(engine(&ws, healthy)), &ws.settings)?;
    let recovered = second.recover()?;
    assert_eq!(recovered.len(), 1);
    let outcome = &recovered[0];
    assert!(outcome.is_done());
    assert_eq!(outcome.run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(outcome.resumed_from, Some(1));
    assert_eq!(outcome.executed_steps, vec!["out"]);

    let saved = read_lines(&ws.output.join("events-flatten.jsonl"))?;
    assert_eq!(saved, vec![json!({"id": 1, "a.b": true})]);

    let log = second.checkpoints().read_log()?;
    assert_eq!(log.len(), 1);
    // The committed run still shows flatten once, from the first attempt.
    let flats = log[0].steps.iter().filter(|s| s.step_name == "flat").count();
    assert_eq!(flats, 1);
    assert!(!second.checkpoints().inflight_path(&run_id).exists());

    // The recovered source is not delivered again.
    assert!(second.run()?.is_empty());
    Ok(())
}

#[test]
fn test_changed_intermediate_restarts_run() -> Result<()> {
    let ws = workspace()?;
    fs::write(ws.input.join("events.jsonl"), "{\"id\":1}\n")?;
    let flaky = Arc::new(FlakyStorage {
        inner: LocalStorage::new(&ws.output)?,
        broken: AtomicBool::new(true),
    });
    let conf = process_conf(flatten_then_save())?;
    let mut first = DataProcess::new(&conf, Arc::new(engine(&ws, flaky)), &ws.settings)?;
    let failed = first.run()?;
    let run_id = failed[0].run_id.clone().unwrap();
    let checkpoint = first
        .checkpoints()
        .load_inflight(&first.checkpoints().inflight_path(&run_id))?;
    let flattened = checkpoint.steps[0].output_files[0].file_path.clone();
    fs::write(&flattened, "{\"tampered\":true}\n")?;
    drop(first);

    let healthy = Arc::new(LocalStorage::new(&ws.output)?);
    let mut second = DataProcess::new(&conf, Arc::new(engine(&ws, healthy)), &ws.settings)?;
    let recovered = second.recover()?;
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].is_done());
    assert_eq!(recovered[0].resumed_from, None);
    assert_eq!(recovered[0].executed_steps, vec!["flat", "out"]);
    assert_ne!(recovered[0].run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(read_lines(&ws.output.join("events-flatten.jsonl"))?, vec![json!({"id": 1})]);
    Ok(())
}

#[test]
fn test_redelivered_failure_resumes_in_process() -> Result<()> {
    let ws = workspace()?;
    let data = ws.input.join("events.jsonl");
    fs::write(&data, "{\"id\":1}\n")?;
    let spool = Arc::new(SpoolStream::open(
        "in",
        ws.input.join("spool"),
        &serde_json::from_value(json!({ "retry_delay_ms": 0 }))?,
    )?);
    spool.publish(&DataFileMessage::for_local_path(&data.to_string_lossy()))?;
    let flaky = Arc::new(FlakyStorage {
        inner: LocalStorage::new(&ws.output)?,
        broken: AtomicBool::new(true),
    });
    let mut engine = Engine::new();
    engine
        .register_stream("in", spool.clone())
        .register_storage("out", flaky.clone());
    let conf = process_conf(flatten_then_save())?;
    let mut process = DataProcess::new(&conf, Arc::new(engine), &ws.settings)?;

    let first = process.run_once(false, None)?.unwrap();
    assert!(!first.is_done());
    assert_eq!(spool.pending()?, 1);

    flaky.broken.store(false, Ordering::SeqCst);
    let second = process.run_once(false, None)?.unwrap();
    assert!(second.is_done());
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.executed_steps, vec!["out"]);
    assert_eq!(spool.pending()?, 0);
    Ok(())
}

#[test]
fn test_restarted_run_is_not_deduplicated_against_itself() -> Result<()> {
    let ws = workspace()?;
    let data = ws.input.join("events.jsonl");
    fs::write(&data, "{\"id\":1}\n{\"id\":2}\n{\"id\":1}\n")?;
    let spool = Arc::new(SpoolStream::open(
        "in",
        ws.input.join("spool"),
        &serde_json::from_value(json!({ "retry_delay_ms": 0 }))?,
    )?);
    spool.publish(&DataFileMessage::for_local_path(&data.to_string_lossy()))?;
    let flaky = Arc::new(FlakyStorage {
        inner: LocalStorage::new(&ws.output)?,
        broken: AtomicBool::new(true),
    });
    let mut engine = Engine::new();
    engine
        .register_stream("in", spool.clone())
        .register_storage("out", flaky.clone());
    let steps = json!([
        { "name": "dedup", "function": "deduplicate", "args": { "key": "id", "window": "1h" } },
        { "name": "out", "function": "save", "args": { "location": "out" } }
    ]);
    let mut process = DataProcess::new(&process_conf(steps)?, Arc::new(engine), &ws.settings)?;

    let first = process.run_once(false, None)?.unwrap();
    assert!(!first.is_done());
    let run_id = first.run_id.clone().unwrap();
    let checkpoint = process
        .checkpoints()
        .load_inflight(&process.checkpoints().inflight_path(&run_id))?;
    let deduplicated = checkpoint.steps[0].output_files[0].file_path.clone();
    fs::write(&deduplicated, "{\"id\":9}\n")?;

    flaky.broken.store(false, Ordering::SeqCst);
    let second = process.run_once(false, None)?.unwrap();
    assert!(second.is_done());
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.executed_steps, vec!["dedup", "out"]);
    let saved = read_lines(&ws.output.join("events-deduplicate.jsonl"))?;
    assert_eq!(saved, vec![json!({"id": 1}), json!({"id": 2})]);
    Ok(())
}

#[test]
fn test_unwritable_run_log_fails_runs_without_halting() -> Result<()> {
    let ws = workspace()?;
    fs::write(ws.input.join("a.jsonl"), "{\"id\":1}\n")?;
    fs::write(ws.input.join("b.jsonl"), "{\"id\":2}\n")?;
    let stream = Arc::new(LocalStream::new("in", &ws.input, &Map::new()));
    let mut engine = Engine::new();
    engine.register_stream("in", stream.clone());
    let steps = json!([{ "name": "flat", "function": "flatten" }]);
    let mut process = DataProcess::new(&process_conf(steps)?, Arc::new(engine), &ws.settings)?;
    // A directory where the log file belongs makes every append fail.
    fs::create_dir_all(process.checkpoints().log_path())?;

    let outcomes = process.run()?;
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        match &outcome.status {
            RunStatus::Failed { step, reason } => {
                assert_eq!(step, &None);
                assert!(reason.contains("cannot record run progress"), "{reason}");
            }
            RunStatus::Done => panic!("commit should have failed"),
        }
        assert_eq!(outcome.executed_steps, vec!["flat"]);
        let run_id = outcome.run_id.as_deref().unwrap();
        assert!(process.checkpoints().inflight_path(run_id).is_file());
    }
    // Both sources were handed back as failed, not left in flight.
    assert!(stream.get(false, None)?.is_none());
    Ok(())
}

#[test]
fn test_deduplicates_across_deliveries_by_data_time() -> Result<()> {
    let mut ws = workspace()?;
    ws.settings.keep_temp = true;
    let spool = Arc::new(SpoolStream::open("in", ws.input.join("spool"), &Map::new())?);
    let mut engine = Engine::new();
    engine.register_stream("in", spool.clone());
    let steps = json!([
        { "name": "dedup", "function": "deduplicate", "args": { "key": ["id"], "window": "60s" } }
    ]);
    let mut process = DataProcess::new(&process_conf(steps)?, Arc::new(engine), &ws.settings)?;

    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut kept = Vec::new();
    for (i, offset) in [0, 5, 130].into_iter().enumerate() {
        let path = ws.input.join(format!("part-{i}.jsonl"));
        fs::write(&path, "{\"id\":\"x\"}\n")?;
        let end = t0 + chrono::Duration::seconds(offset);
        spool.publish(&DataFileMessage::for_local_path(&path.to_string_lossy()).with_window(None, Some(end)))?;
        let outcome = process.run_once(false, None)?.unwrap();
        assert!(outcome.is_done());
        assert_eq!(outcome.output_files.len(), 1);
        kept.push(read_lines(&outcome.output_files[0])?.len());
    }
    // Seen at 0, dropped 5s later, accepted again after two windows.
    assert_eq!(kept, vec![1, 0, 1]);
    Ok(())
}

#[test]
fn test_missing_storage_fails_at_startup() -> Result<()> {
    let ws = workspace()?;
    let mut engine = Engine::new();
    engine.register_stream("in", Arc::new(LocalStream::new("in", &ws.input, &Map::new())));
    let err = match DataProcess::new(&process_conf(flatten_then_save())?, Arc::new(engine), &ws.settings) {
        Ok(_) => panic!("startup should fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<SpinError>(),
        Some(SpinError::MissingStorage(name)) if name == "out"
    ));
    Ok(())
}

#[test]
fn test_missing_source_fails_at_startup() -> Result<()> {
    let ws = workspace()?;
    let err = match DataProcess::new(&process_conf(json!([]))?, Arc::new(Engine::new()), &ws.settings) {
        Ok(_) => panic!("startup should fail"),
        Err(err) => err,
    };
    assert!(matches!(err.downcast_ref::<SpinError>(), Some(SpinError::MissingStream(_))));
    Ok(())
}

#[test]
fn test_empty_chain_commits_source() -> Result<()> {
    let ws = workspace()?;
    fs::write(ws.input.join("x.jsonl"), "{}\n")?;
    let stream = Arc::new(LocalStream::new("in", &ws.input, &Map::new()));
    let mut engine = Engine::new();
    engine.register_stream("in", stream.clone());
    let mut process = DataProcess::new(&process_conf(json!([]))?, Arc::new(engine), &ws.settings)?;
    let outcomes = process.run()?;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_done());
    assert!(stream.get(false, None)?.is_none());
    Ok(())
}
