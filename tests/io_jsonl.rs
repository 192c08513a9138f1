use anyhow::Result;
use filespin::error::{SpinError, spin_error};
use filespin::io::jsonl::{AtomicLineWriter, open_lines};
use filespin::io::jsonl::RecordLines;
use serde_json::json;
use std::fs;

#[test]
fn writer_commits_atomically() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dest = tmp.path().join("nested/out.jsonl");

    let mut w = AtomicLineWriter::create(&dest)?;
    w.write_line(r#"{"id":1}"#)?;
    w.write_record(json!({"id": 2, "word": "hi"}).as_object().unwrap())?;
    assert_eq!(w.lines(), 2);
    assert!(!dest.exists(), "nothing visible before commit");
    let path = w.commit()?;

    assert_eq!(path, dest);
    assert_eq!(fs::read_to_string(&dest)?, "{\"id\":1}\n{\"id\":2,\"word\":\"hi\"}\n");
    Ok(())
}

#[test]
fn dropped_writer_leaves_nothing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dest = tmp.path().join("out.jsonl");
    {
        let mut w = AtomicLineWriter::create(&dest)?;
        w.write_line("{}")?;
    }
    assert!(!dest.exists());
    assert_eq!(fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

#[test]
fn reader_reports_malformed_lines_in_place() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("in.jsonl");
    fs::write(&path, "{\"a\":1}\r\n\n[1,2]\n{broken\n{\"a\":  2}")?;

    let items: Vec<_> = RecordLines::new(open_lines(&path)?, "in.jsonl").collect();
    assert_eq!(items.len(), 4);
    let (rec, raw) = items[0].as_ref().unwrap();
    assert_eq!(rec["a"], 1);
    assert_eq!(raw, "{\"a\":1}");
    for (i, line) in [(1, 3), (2, 4)] {
        let err = items[i].as_ref().unwrap_err();
        assert!(
            matches!(spin_error(err), Some(SpinError::MalformedRecord { line: l, .. }) if *l == line),
            "{err:#}"
        );
    }
    // Raw lines are kept byte for byte.
    assert_eq!(items[3].as_ref().unwrap().1, "{\"a\":  2}");
    Ok(())
}

#[test]
fn missing_file_is_not_found() {
    let err = open_lines("/no/such/in.jsonl").err().unwrap();
    assert!(matches!(spin_error(&err), Some(SpinError::NotFound(_))));
}

#[cfg(any(feature = "compression-gzip", feature = "compression-zstd"))]
mod compressed {
    use super::*;

    fn round_trip(name: &str) -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join(name);
        let mut w = AtomicLineWriter::create(&dest)?;
        for i in 0..100 {
            w.write_record(json!({"i": i}).as_object().unwrap())?;
        }
        w.commit()?;
        assert!(!fs::read(&dest)?.starts_with(b"{"), "{name} should be compressed");

        let back: Vec<_> = RecordLines::new(open_lines(&dest)?, name).skip_malformed().collect();
        assert_eq!(back.len(), 100);
        assert_eq!(back[99].0["i"], 99);
        Ok(())
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn gzip_by_extension() -> Result<()> {
        round_trip("events.jsonl.gz")
    }

    #[cfg(feature = "compression-zstd")]
    #[test]
    fn zstd_by_extension() -> Result<()> {
        round_trip("events.jsonl.zst")
    }
}
