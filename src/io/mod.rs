//! Local file I/O: compression codecs and line-delimited JSON.

pub mod compression;
pub mod jsonl;
