//! Content hashing for task cache keys.
//!
//! A task hash is a pure function of the session identity, the rendered
//! script, and the ordered `(name, value)` input pairs. Files contribute
//! according to the configured [`CacheMode`].

use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::value::DataValue;

/// How file inputs contribute to a task hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Hash regular file content; directories by their sorted entry names.
    #[default]
    Standard,
    /// Recurse into directories and hash every file's content.
    Deep,
    /// Hash path + size + mtime. Cheap, survives touch-free copies only.
    Lenient,
    /// Caching off. Tasks still hash (lenient) to derive work directories.
    Disabled,
}

impl CacheMode {
    pub fn parse(s: &str) -> Option<CacheMode> {
        match s {
            "standard" | "true" => Some(CacheMode::Standard),
            "deep" => Some(CacheMode::Deep),
            "lenient" => Some(CacheMode::Lenient),
            "false" => Some(CacheMode::Disabled),
            _ => None,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, CacheMode::Disabled)
    }

    fn file_mode(&self) -> CacheMode {
        match self {
            CacheMode::Disabled => CacheMode::Lenient,
            other => *other,
        }
    }
}

/// Incremental hasher over a sequence of keyed entries.
pub struct HashBuilder {
    hasher: Sha256,
    mode: CacheMode,
}

impl HashBuilder {
    pub fn new(mode: CacheMode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([mode.file_mode() as u8]);
        Self { hasher, mode }
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.frame(b's', s.as_bytes());
        self
    }

    /// Feed one keyed entry: the name frames the value so `("ab","c")` and
    /// `("a","bc")` digest differently.
    pub fn push_entry(&mut self, name: &str, value: &DataValue) -> &mut Self {
        self.frame(b'n', name.as_bytes());
        self.push_value(value);
        self
    }

    pub fn push_value(&mut self, value: &DataValue) -> &mut Self {
        match value {
            DataValue::Null => self.frame(b'0', &[]),
            DataValue::Bool(b) => self.frame(b'b', &[*b as u8]),
            DataValue::Int(i) => self.frame(b'i', &i.to_le_bytes()),
            DataValue::Float(f) => self.frame(b'f', &f.to_le_bytes()),
            DataValue::String(s) => self.frame(b's', s.as_bytes()),
            DataValue::Path(p) => {
                if let Err(err) = self.push_path(p) {
                    // An unreadable path still has an identity.
                    tracing::debug!(path = %p.display(), %err, "hashing path metadata only");
                    self.frame(b'p', p.display().to_string().as_bytes());
                }
            }
            DataValue::List(items) => {
                self.frame(b'l', &(items.len() as u64).to_le_bytes());
                for item in items {
                    self.push_value(item);
                }
            }
        }
        self
    }

    /// Hash a filesystem path per the selected mode.
    pub fn push_path(&mut self, path: &Path) -> io::Result<()> {
        match self.mode.file_mode() {
            CacheMode::Standard => {
                if path.is_dir() {
                    let mut names: Vec<String> = fs::read_dir(path)?
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect();
                    names.sort();
                    self.frame(b'd', names.join("\n").as_bytes());
                } else {
                    let bytes = fs::read(path)?;
                    self.frame(b'F', &bytes);
                }
            }
            CacheMode::Deep => {
                if path.is_dir() {
                    let mut entries: Vec<_> = fs::read_dir(path)?
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .collect();
                    entries.sort();
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.frame(b'd', name.as_bytes());
                    for entry in entries {
                        self.push_path(&entry)?;
                    }
                } else {
                    let bytes = fs::read(path)?;
                    self.frame(b'F', &bytes);
                }
            }
            CacheMode::Lenient | CacheMode::Disabled => {
                let meta = fs::metadata(path)?;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                self.frame(b'p', path.display().to_string().as_bytes());
                self.frame(b'z', &meta.len().to_le_bytes());
                self.frame(b't', &mtime.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }

    fn frame(&mut self, tag: u8, bytes: &[u8]) {
        self.hasher.update([tag]);
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }
}

/// The hash of a single firing: `(session, script, [(name, value)…])` in
/// declared order.
pub fn task_hash(
    mode: CacheMode,
    session: &str,
    script: &str,
    inputs: &[(String, DataValue)],
) -> String {
    let mut builder = HashBuilder::new(mode);
    builder.push_str(session);
    builder.push_str(script);
    for (name, value) in inputs {
        builder.push_entry(name, value);
    }
    builder.finish()
}

/// The hash of a merge task: `(session, sorted per-firing sub-hashes)`.
pub fn merge_hash(session: &str, sub_hashes: &[String]) -> String {
    let mut sorted: Vec<&String> = sub_hashes.iter().collect();
    sorted.sort();
    let mut builder = HashBuilder::new(CacheMode::Standard);
    builder.push_str(session);
    for sub in sorted {
        builder.push_str(sub);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn inputs(pairs: &[(&str, DataValue)]) -> Vec<(String, DataValue)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hash_is_stable_for_identical_inputs() {
        let ins = inputs(&[("x", DataValue::Int(42))]);
        let a = task_hash(CacheMode::Standard, "s1", "echo $x", &ins);
        let b = task_hash(CacheMode::Standard, "s1", "echo $x", &ins);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_script_inputs_and_mode() {
        let ins = inputs(&[("x", DataValue::Int(42))]);
        let base = task_hash(CacheMode::Standard, "s1", "echo $x", &ins);

        let script_changed = task_hash(CacheMode::Standard, "s1", "echo  $x", &ins);
        assert_ne!(base, script_changed);

        let value_changed = task_hash(
            CacheMode::Standard,
            "s1",
            "echo $x",
            &inputs(&[("x", DataValue::Int(43))]),
        );
        assert_ne!(base, value_changed);

        let mode_changed = task_hash(CacheMode::Lenient, "s1", "echo $x", &ins);
        assert_ne!(base, mode_changed);
    }

    #[test]
    fn entry_name_frames_value() {
        let a = task_hash(
            CacheMode::Standard,
            "s",
            "",
            &inputs(&[("ab", DataValue::String("c".into()))]),
        );
        let b = task_hash(
            CacheMode::Standard,
            "s",
            "",
            &inputs(&[("a", DataValue::String("bc".into()))]),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn standard_mode_sees_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        fs::write(&file, "one").unwrap();

        let ins = inputs(&[("f", DataValue::Path(file.clone()))]);
        let before = task_hash(CacheMode::Standard, "s", "cat $f", &ins);
        fs::write(&file, "two").unwrap();
        let after = task_hash(CacheMode::Standard, "s", "cat $f", &ins);
        assert_ne!(before, after);
    }

    #[test]
    fn merge_hash_ignores_arrival_order() {
        let a = merge_hash("s", &["h1".into(), "h2".into()]);
        let b = merge_hash("s", &["h2".into(), "h1".into()]);
        assert_eq!(a, b);
    }
}
