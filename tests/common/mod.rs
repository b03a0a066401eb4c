#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{tempdir, TempDir};

pub const CATALOG_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Root>
  <Meta><Version>3</Version><Generated>2024-05-01</Generated></Meta>
  <Items>
    <Item id="1"><code>A</code><name>Alpha</name></Item>
    <Item id="2"><code>B</code><name>Beta</name></Item>
    <Item id="3"><code>C</code><name>Gamma</name></Item>
    <Item id="4"><code>D</code><name>Delta</name></Item>
    <Item id="5"><code>E</code><name>Epsilon</name></Item>
  </Items>
</Root>
"#;

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Reads a JSON-lines file written under the workspace.
    pub fn read_jsonl(&self, path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .expect("read jsonl")
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("parse jsonl line"))
            .collect()
    }
}
