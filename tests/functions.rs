//! Step kinds run directly against a task context.

use anyhow::Result;
use filespin::config::{DataViewConfig, ProcessFunctionConfig};
use filespin::data_file::{DataFile, FileType, Tags};
use filespin::error::{SpinError, spin_error};
use filespin::functions::FunctionStep;
use filespin::pkindex::{PkCacheRegistry, PkCacheDef};
use filespin::record::{Record, flatten, inflate};
use filespin::registry::Engine;
use filespin::schema::DataView;
use filespin::storage::ObjectStorage;
use filespin::storage::memory::MemoryStorage;
use filespin::stream::spool::SpoolStream;
use filespin::stream::{DataFileMessage, Stream};
use filespin::TaskContext;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn step(function: &str, args: Value) -> Result<FunctionStep> {
    let conf: ProcessFunctionConfig = serde_json::from_value(json!({
        "name": format!("{function}-step"),
        "function": function,
        "args": args,
    }))?;
    FunctionStep::from_config(&conf)
}

fn write_jsonl(dir: &Path, name: &str, records: &[Value]) -> Result<DataFile> {
    let path = dir.join(name);
    let body: String = records.iter().map(|r| format!("{r}\n")).collect();
    fs::write(&path, body)?;
    Ok(DataFile::table(path))
}

fn records(file: &DataFile) -> Result<Vec<Value>> {
    file.readlines()?
        .map(|item| item.map(|(r, _)| Value::Object(r)))
        .collect()
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn context<'a>(
    tmp: &TempDir,
    engine: &'a Engine,
    caches: &'a mut PkCacheRegistry,
    event_time: i64,
) -> Result<TaskContext<'a>> {
    TaskContext::new(
        "test",
        &tmp.path().join("tmp"),
        DataFileMessage::new("file:///src/source.jsonl", Tags::new()),
        Vec::new(),
        event_time,
        engine,
        caches,
    )
}

#[test]
fn test_split_by_groups_in_first_seen_order() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let input = write_jsonl(
        tmp.path(),
        "events.jsonl",
        &[json!({"k": "a", "v": 1}), json!({"k": "b", "v": 2}), json!({"k": "a", "v": 3})],
    )?;

    let split = step("splitby", json!({ "key": "k", "tags": { "group": "{data.k}" } }))?;
    let out = split.process(&input, &mut ctx)?;

    assert_eq!(out.len(), 2);
    assert_eq!(records(&out[0])?, vec![json!({"k": "a", "v": 1}), json!({"k": "a", "v": 3})]);
    assert_eq!(out[0].tags(), &tags(&[("group", "a")]));
    assert_eq!(records(&out[1])?, vec![json!({"k": "b", "v": 2})]);
    assert_eq!(out[1].tags(), &tags(&[("group", "b")]));
    assert_eq!(out[0].name(), "events-group-a");
    Ok(())
}

#[test]
fn test_split_by_partition_is_complete() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;

    let mut input = Vec::new();
    for i in 0..60 {
        let rec = match i % 9 {
            0 => json!({"n": i}),
            r => json!({"app": format!("app{}", r % 4), "region": r % 2, "n": i}),
        };
        input.push(rec);
    }
    let file = write_jsonl(tmp.path(), "mixed.jsonl", &input)?;
    let split = step("splitby", json!({ "key": ["app", "region"] }))?;
    let out = split.process(&file, &mut ctx)?;

    let mut seen = Vec::new();
    for f in &out {
        let recs = records(f)?;
        let keys: BTreeSet<(String, String)> = recs
            .iter()
            .map(|r| (r["app"].to_string(), r["region"].to_string()))
            .collect();
        assert_eq!(keys.len(), 1, "{} mixes groups", f.path().display());
        seen.extend(recs);
    }
    let expected: Vec<Value> = input.into_iter().filter(|r| r.get("app").is_some()).collect();
    assert_eq!(seen.len(), expected.len());
    let as_set = |v: &[Value]| v.iter().map(Value::to_string).collect::<BTreeSet<_>>();
    assert_eq!(as_set(&seen), as_set(&expected));
    Ok(())
}

#[test]
fn test_flatten_step_and_inflate_inverse() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let nested = vec![
        json!({"id": 1, "user": {"name": "ann", "geo": {"lat": 1.5, "lon": -3}}, "tags": ["x", "y"]}),
        json!({"id": 2, "empty": {}, "flag": null}),
    ];
    let file = write_jsonl(tmp.path(), "nested.jsonl", &nested)?;

    let out = step("flatten", json!({}))?.process(&file, &mut ctx)?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name(), "nested-flatten");
    let flat = records(&out[0])?;
    assert_eq!(flat[0]["user.geo.lat"], json!(1.5));
    assert_eq!(flat[0]["tags"], json!(["x", "y"]));

    for original in &nested {
        let rec: Record = original.as_object().cloned().unwrap();
        assert_eq!(Value::Object(inflate(&flatten(&rec))), *original);
    }
    Ok(())
}

#[test]
fn test_flatten_rejects_malformed_lines() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let path = tmp.path().join("broken.jsonl");
    fs::write(&path, "{\"ok\":1}\nnot json\n")?;
    let err = step("flatten", json!({}))?
        .process(&DataFile::table(path), &mut ctx)
        .unwrap_err();
    assert!(format!("{err:#}").contains("malformed"), "{err:#}");
    Ok(())
}

#[test]
fn test_pk_index_writes_distinct_keys() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(
        tmp.path(),
        "orders.jsonl",
        &[
            json!({"id": 1, "shop": "a", "total": 3}),
            json!({"id": 1, "shop": "a", "total": 4}),
            json!({"id": 2, "shop": "a"}),
        ],
    )?;
    let out = step("pk_index", json!({ "key": ["id", "shop"] }))?.process(&file, &mut ctx)?;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0], file);
    assert_eq!(out[1].file_type(), FileType::Index);
    assert_eq!(out[1].name(), "orders-pk-index");
    assert_eq!(records(&out[1])?, vec![json!({"id": 1, "shop": "a"}), json!({"id": 2, "shop": "a"})]);
    Ok(())
}

#[test]
fn test_deduplicate_drops_repeats_within_file_and_window() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let dedup = step("deduplicate", json!({ "key": "id", "window": "60s" }))?;

    let first = write_jsonl(tmp.path(), "a.jsonl", &[json!({"id": "x"}), json!({"id": "y"}), json!({"id": "x"})])?;
    let second = write_jsonl(tmp.path(), "b.jsonl", &[json!({"id": "x"}), json!({"id": "z"})])?;

    {
        let mut ctx = context(&tmp, &engine, &mut caches, 1_000)?;
        let out = dedup.process(&first, &mut ctx)?;
        assert_eq!(records(&out[0])?, vec![json!({"id": "x"}), json!({"id": "y"})]);
    }
    {
        let mut ctx = context(&tmp, &engine, &mut caches, 1_005)?;
        let out = dedup.process(&second, &mut ctx)?;
        assert_eq!(records(&out[0])?, vec![json!({"id": "z"})]);
    }
    let entry = caches.get("deduplicate-step").unwrap();
    assert_eq!(entry.cache().len(), 3);
    Ok(())
}

#[test]
fn test_deduplicate_keeps_key_types_apart() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(
        tmp.path(),
        "ids.jsonl",
        &[
            json!({"id": 7}),
            json!({"id": "7"}),
            json!({"id": null}),
            json!({"id": ""}),
            json!({"id": 7.5}),
            json!({"id": "7"}),
        ],
    )?;
    let out = step("deduplicate", json!({ "key": "id" }))?.process(&file, &mut ctx)?;
    assert_eq!(
        records(&out[0])?,
        vec![json!({"id": 7}), json!({"id": "7"}), json!({"id": null}), json!({"id": ""}), json!({"id": 7.5})]
    );
    Ok(())
}

#[test]
fn test_deduplicate_rejects_records_without_key() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(tmp.path(), "loose.jsonl", &[json!({"id": 1}), json!({"v": 1}), json!({"v": 2})])?;

    let err = step("deduplicate", json!({ "key": "id" }))?
        .process(&file, &mut ctx)
        .unwrap_err();
    match spin_error(&err) {
        Some(SpinError::MalformedRecord { line, .. }) => assert_eq!(*line, 2),
        other => panic!("unexpected error {other:?}: {err:#}"),
    }
    // Nothing was registered, so a corrected file is not deduplicated against the failed attempt.
    assert_eq!(caches.get("deduplicate-step").map_or(0, |e| e.cache().len()), 0);
    Ok(())
}

#[test]
fn test_pk_index_leaves_out_records_without_key() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(tmp.path(), "mixed.jsonl", &[json!({"id": 1}), json!({"v": 1}), json!({"id": null})])?;
    let out = step("pk_index", json!({ "key": "id" }))?.process(&file, &mut ctx)?;
    assert_eq!(records(&out[1])?, vec![json!({"id": 1}), json!({"id": null})]);
    Ok(())
}

#[test]
fn test_deduplicate_seeds_cache_from_index_files() -> Result<()> {
    let tmp = TempDir::new()?;
    let bucket = MemoryStorage::named("dedup-seed-test");
    // 2024-03-01T09:30:00Z
    let now = 1_709_285_400;
    bucket.put("idx/shop/2024/03/01/09/old-pk-index.jsonl", "{\"id\":\"seen\"}\n")?;
    bucket.put("idx/shop/2024/03/01/09/notes.txt", "{\"id\":\"ignored\"}\n")?;

    let mut engine = Engine::new();
    engine.register_storage("idx", Arc::new(bucket));
    engine.register_pk_cache(PkCacheDef {
        name: "orders".into(),
        storage: Some("idx".into()),
        pattern: Some("idx/{app}/{year}/{month}/{day}/{hour}/".into()),
        window: Some(3600),
        ..PkCacheDef::default()
    });
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, now)?;

    let mut file = write_jsonl(
        tmp.path(),
        "orders.jsonl",
        &[json!({"id": "seen"}), json!({"id": "ignored"}), json!({"id": "new"})],
    )?;
    file.tags_mut().insert("app".into(), "shop".into());
    let dedup = step("deduplicate", json!({ "key": ["id"], "cache": "orders" }))?;
    let out = dedup.process(&file, &mut ctx)?;
    assert_eq!(records(&out[0])?, vec![json!({"id": "ignored"}), json!({"id": "new"})]);
    assert_eq!(out[0].tags(), &tags(&[("app", "shop")]));
    Ok(())
}

#[test]
fn test_format_coerces_and_drops_misfits() -> Result<()> {
    let tmp = TempDir::new()?;
    let view: DataViewConfig = serde_json::from_value(json!({
        "name": "orders",
        "fields": [
            { "name": "id", "type": "int" },
            { "name": "paid", "type": "boolean" },
            { "name": "at", "type": "date" }
        ]
    }))?;
    let mut engine = Engine::new();
    engine.register_schema(DataView::from_config(&view)?);
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(
        tmp.path(),
        "orders.jsonl",
        &[
            json!({"id": "7", "paid": "yes", "at": "2024-03-01 09:30:00", "extra": 1}),
            json!({"id": "seven", "paid": true}),
        ],
    )?;
    let out = step("format", json!({ "table_name": "orders" }))?.process(&file, &mut ctx)?;
    assert_eq!(
        records(&out[0])?,
        vec![json!({"id": 7, "paid": true, "at": "2024-03-01T09:30:00Z", "extra": 1})]
    );

    let missing = step("format", json!({ "table_name": "nope" }))?;
    assert!(missing.check(&engine).is_err());
    Ok(())
}

#[test]
fn test_filter_routes_records_per_rule() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let file = write_jsonl(
        tmp.path(),
        "clicks.jsonl",
        &[
            json!({"country": "de", "ms": 120}),
            json!({"country": "fr", "ms": 900}),
            json!({"country": "de", "ms": 1500}),
        ],
    )?;
    let filter = step(
        "filter",
        json!({
            "filter_rules": [
                { "tags": { "speed": "slow" }, "rule": "ms >= 800" },
                { "name": "germany", "clauses": [{ "field": "country", "op": "==", "value": "de" }] },
                { "name": "broken", "rule": "ms >=" }
            ]
        }),
    )?;
    let out = filter.process(&file, &mut ctx)?;
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].name(), "clicks-filter-slow");
    assert_eq!(out[0].tags(), &tags(&[("speed", "slow")]));
    assert_eq!(records(&out[0])?.len(), 2);
    assert_eq!(out[1].name(), "clicks-filter-germany");
    assert_eq!(records(&out[1])?.len(), 2);
    assert!(records(&out[2])?.is_empty());

    let index = DataFile::create(tmp.path().join("x-pk-index.jsonl"), FileType::Index, None, Tags::new());
    assert_eq!(filter.process(&index, &mut ctx)?, vec![index]);
    Ok(())
}

#[test]
fn test_merge_groups_by_tags_and_rolls_over() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let mut files = Vec::new();
    for (i, app) in ["web", "web", "ios"].iter().enumerate() {
        let mut f = write_jsonl(
            tmp.path(),
            &format!("part{i}.jsonl"),
            &[json!({"i": i, "n": 0}), json!({"i": i, "n": 1})],
        )?;
        f.tags_mut().insert("app".into(), (*app).to_string());
        f.tags_mut().insert("part".into(), i.to_string());
        files.push(f);
    }
    let merge = step("merge", json!({ "tags": ["app"], "output_file_lines": 3 }))?;
    assert!(merge.supports_batch());
    let out = merge.process_multi(&files, &mut ctx)?;

    let names: Vec<&str> = out.iter().map(DataFile::name).collect();
    assert_eq!(names, vec!["data-merge-ios_0", "data-merge-web_0", "data-merge-web_1"]);
    assert_eq!(records(&out[0])?.len(), 2);
    assert_eq!(records(&out[1])?.len(), 3);
    assert_eq!(records(&out[2])?.len(), 1);
    assert!(out.iter().skip(1).all(|f| f.tags() == &tags(&[("app", "web")])));

    let single = step("merge", json!({}))?.process(&files[0], &mut ctx)?;
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].name(), "data-merge-default_0");
    Ok(())
}

#[test]
fn test_tag_derived_names_stay_in_run_directory() -> Result<()> {
    let tmp = TempDir::new()?;
    let engine = Engine::new();
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;
    let run_dir = ctx.temp_dir().to_path_buf();
    let mut files = Vec::new();
    for (i, app) in ["/../../../escaped", "a/b", "a_b"].iter().enumerate() {
        let mut f = write_jsonl(tmp.path(), &format!("in{i}.jsonl"), &[json!({"i": i})])?;
        f.tags_mut().insert("app".into(), (*app).to_string());
        files.push(f);
    }
    let merged = step("merge", json!({ "tags": ["app"] }))?.process_multi(&files, &mut ctx)?;
    assert_eq!(merged.len(), 3);
    assert!(merged.iter().all(|f| f.path().parent() == Some(run_dir.as_path())));
    let names: BTreeSet<&str> = merged.iter().map(DataFile::name).collect();
    assert!(names.contains("data-merge-a_b_0"));
    assert!(names.contains("data-merge-a_b-1_0"));
    assert_eq!(merged.iter().map(|f| records(f).map(|r| r.len())).sum::<Result<usize>>()?, 3);

    let filter = step(
        "filter",
        json!({
            "filter_rules": [
                { "name": "../../up", "rule": "i >= 0" },
                { "tags": { "dir": "/etc/x" }, "rule": "i >= 0" }
            ]
        }),
    )?;
    let routed = filter.process(&files[0], &mut ctx)?;
    assert_eq!(routed[0].name(), "in0-filter-.._.._up");
    assert!(routed.iter().all(|f| f.path().parent() == Some(run_dir.as_path())));
    assert_eq!(records(&routed[1])?.len(), 1);
    Ok(())
}

#[test]
fn test_save_uploads_and_publishes_pointer() -> Result<()> {
    let tmp = TempDir::new()?;
    let spool = Arc::new(SpoolStream::open("next", tmp.path().join("spool"), &Map::new())?);
    let bucket = MemoryStorage::named("save-test");
    let mut engine = Engine::new();
    engine
        .register_storage("lake", Arc::new(bucket.clone()))
        .register_stream("next", spool.clone());
    let mut caches = PkCacheRegistry::new();
    let mut ctx = context(&tmp, &engine, &mut caches, 0)?;

    let mut file = write_jsonl(tmp.path(), "daily.jsonl", &[json!({"a": 1})])?;
    file.tags_mut().insert("app".into(), "web".into());
    let save = step(
        "save",
        json!({ "location": "lake", "path_suffix": "events/{app}", "trigger": "next" }),
    )?;
    let out = save.process(&file, &mut ctx)?;
    assert_eq!(out, vec![file.clone()]);
    assert_eq!(bucket.get("events/web/daily.jsonl")?, b"{\"a\":1}\n".to_vec());

    let message = spool.get(false, None)?.unwrap();
    assert_eq!(message.file_url, "mem://save-test/events/web/daily.jsonl");
    assert_eq!(message.tags, tags(&[("app", "web")]));
    assert_eq!(bucket.list("events/")?, vec!["save-test/events/web/daily.jsonl".to_string()]);
    Ok(())
}

#[test]
fn test_unknown_function_is_configuration_error() {
    let err = step("explode", json!({})).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<filespin::SpinError>(),
        Some(filespin::SpinError::Configuration(_))
    ));
}
