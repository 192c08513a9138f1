//! Two-generation key cache behaviour over data time.

use filespin::pkindex::{Granularity, IndexSearcher, PkIndexCache};
use filespin::record::PkTuple;
use filespin::storage::memory::MemoryStorage;
use filespin::data_file::Tags;
use serde_json::{Value, json};

fn key(cache: &PkIndexCache, v: Value) -> PkTuple {
    cache.key_of(v.as_object().unwrap()).unwrap()
}

#[test]
fn test_key_expires_after_window_by_data_time() {
    let mut cache = PkIndexCache::new(vec!["id".into()], Some(60), 0);
    let x = key(&cache, json!({"id": "x"}));

    assert!(!cache.is_duplicate(&x, 0));
    cache.insert(x.clone(), 0);
    assert!(cache.is_duplicate(&x, 5));
    assert!(!cache.is_duplicate(&x, 130));
    assert_eq!(cache.baseline(), 120);
}

#[test]
fn test_key_survives_exactly_one_rollover() {
    let mut cache = PkIndexCache::new(vec!["id".into()], Some(60), 0);
    let a = key(&cache, json!({"id": "a"}));
    cache.insert(a.clone(), 10);

    // One elapsed window: the previous generation becomes current.
    assert!(cache.is_duplicate(&a, 70));
    assert_eq!(cache.baseline(), 60);
    // Not re-registered, so the next rollover forgets it.
    assert!(!cache.is_duplicate(&a, 125));
}

#[test]
fn test_recently_seen_keys_are_always_duplicates() {
    let window = 50;
    let mut cache = PkIndexCache::new(vec!["k".into()], Some(window), 1_000);
    let mut last_seen = std::collections::HashMap::new();
    let mut t = 1_000;
    for i in 0..400i64 {
        t += (i * 7) % 23;
        let name = format!("k{}", (i * 13) % 11);
        let k = key(&cache, json!({ "k": name }));
        let dup = cache.is_duplicate(&k, t);
        if let Some(&seen) = last_seen.get(&name)
            && t - seen < 50
        {
            assert!(dup, "{name} seen at {seen} not found at {t}");
        }
        cache.insert(k, t);
        last_seen.insert(name, t);
    }
}

#[test]
fn test_no_window_never_expires() {
    let mut cache = PkIndexCache::new(vec!["id".into()], None, 0);
    let x = key(&cache, json!({"id": 1}));
    cache.insert(x.clone(), 0);
    assert!(cache.is_duplicate(&x, 10_000_000));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_composite_keys_and_missing_fields() {
    let mut cache = PkIndexCache::new(vec!["a".into(), "b.c".into()], Some(60), 0);
    cache.insert(key(&cache, json!({"a": 1, "b": {"c": "x"}})), 0);
    let same = key(&cache, json!({"a": 1, "b": {"c": "x"}, "z": 0}));
    let other = key(&cache, json!({"a": 1, "b": {"c": "y"}}));
    let as_text = key(&cache, json!({"a": "1", "b": {"c": "x"}}));
    assert!(cache.is_duplicate(&same, 1));
    assert!(!cache.is_duplicate(&other, 1));
    assert!(!cache.is_duplicate(&as_text, 1));
    assert_eq!(cache.key_of(json!({"a": 1}).as_object().unwrap()), None);
}

#[test]
fn test_searcher_lists_only_index_files_in_range() {
    let bucket = MemoryStorage::named("searcher-test");
    bucket.put("idx/web/2024/03/01/08/a-pk-index.jsonl", "{}\n").unwrap();
    bucket.put("idx/web/2024/03/01/09/b-pk-index.jsonl", "{}\n").unwrap();
    bucket.put("idx/web/2024/03/01/09/b.jsonl", "{}\n").unwrap();
    bucket.put("idx/web/2024/03/01/11/c.index", "{}\n").unwrap();
    bucket.put("idx/ios/2024/03/01/09/d-pk-index.jsonl", "{}\n").unwrap();

    let searcher = IndexSearcher::new("idx/{app}/{year}/{month}/{day}/{hour}/", Granularity::Hour);
    let mut tags = Tags::new();
    tags.insert("app".into(), "web".into());
    // 2024-03-01T09:00:00Z .. 2024-03-01T10:59:59Z
    let found = searcher
        .select_index_files(&bucket, &tags, 1_709_283_600, 1_709_290_799)
        .unwrap();
    assert_eq!(found, vec!["searcher-test/idx/web/2024/03/01/09/b-pk-index.jsonl".to_string()]);
}
