//! Normalizing input values to file holders and expanding name patterns.
//!
//! A file input arrives as a bare path, a string, or a list of either. The
//! stager turns it into an ordered sequence of [`FileHolder`]s whose stored
//! names come from the declared pattern.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::StagingError;
use crate::value::DataValue;

/// One staged input: `source` is linked under `stored_name` inside the task
/// work directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHolder {
    pub source: PathBuf,
    pub stored_name: String,
}

impl FileHolder {
    pub fn new(source: impl Into<PathBuf>, stored_name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stored_name: stored_name.into(),
        }
    }
}

const COUNTER_CHARS: &[u8] = b"123456789abcdefghijklmnopqrstuvwxyz";

/// Flatten a channel value into source paths.
pub fn normalize(value: &DataValue) -> Result<Vec<PathBuf>, StagingError> {
    match value {
        DataValue::Path(p) => Ok(vec![p.clone()]),
        DataValue::String(s) => Ok(vec![PathBuf::from(s)]),
        DataValue::List(items) => {
            let mut paths = Vec::with_capacity(items.len());
            for item in items {
                paths.extend(normalize(item)?);
            }
            Ok(paths)
        }
        other => Err(StagingError::NotAFile(other.render())),
    }
}

/// Expand `pattern` over `sources`, numbering from `start` (the merge
/// processor threads a running offset so folded firings never collide).
///
/// Rules:
///   - `*` is replaced by `file<n>`; a bare or absent pattern behaves as `*`
///   - `?` is replaced by a single-character counter
///   - `dir/**` stages each source under `dir/` with its original file name
///   - a literal pattern requires exactly one source
pub fn expand(
    pattern: &str,
    sources: &[PathBuf],
    start: usize,
) -> Result<Vec<FileHolder>, StagingError> {
    let pattern = if pattern.is_empty() { "*" } else { pattern };
    let mut holders = Vec::with_capacity(sources.len());
    let mut seen = HashSet::new();

    for (offset, source) in sources.iter().enumerate() {
        let ordinal = start + offset;
        let name = stored_name(pattern, source, ordinal, sources.len())?;
        if !seen.insert(name.clone()) {
            return Err(StagingError::Conflict {
                pattern: pattern.to_string(),
                name,
            });
        }
        holders.push(FileHolder::new(source.clone(), name));
    }
    Ok(holders)
}

fn stored_name(
    pattern: &str,
    source: &PathBuf,
    ordinal: usize,
    total: usize,
) -> Result<String, StagingError> {
    if let Some(dir) = pattern.strip_suffix("/**") {
        let file_name = source
            .file_name()
            .ok_or_else(|| StagingError::Missing(source.clone()))?;
        return Ok(format!("{}/{}", dir, file_name.to_string_lossy()));
    }
    if pattern.contains('*') {
        return Ok(pattern.replacen('*', &format!("file{ordinal}"), 1));
    }
    if pattern.contains('?') {
        let index = ordinal - 1;
        let ch = COUNTER_CHARS
            .get(index)
            .copied()
            .ok_or_else(|| StagingError::CounterExhausted(pattern.to_string()))?;
        return Ok(pattern.replacen('?', &(ch as char).to_string(), 1));
    }
    // Literal name: only valid for a single file.
    if total != 1 {
        return Err(StagingError::Cardinality {
            pattern: pattern.to_string(),
            count: total,
        });
    }
    Ok(pattern.to_string())
}

/// Verify every source exists before a firing is submitted.
pub fn check_sources(holders: &[FileHolder]) -> Result<(), StagingError> {
    for holder in holders {
        if !holder.source.exists() {
            return Err(StagingError::Missing(holder.source.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn star_with_extension_keeps_extension() {
        let holders = expand("*.fa", &paths(&["/in/seq.fasta"]), 1).unwrap();
        assert_eq!(holders[0].stored_name, "file1.fa");
    }

    #[test]
    fn bare_star_enumerates() {
        let holders = expand("*", &paths(&["/a", "/b", "/c"]), 1).unwrap();
        let names: Vec<_> = holders.iter().map(|h| h.stored_name.as_str()).collect();
        assert_eq!(names, vec!["file1", "file2", "file3"]);
    }

    #[test]
    fn absent_pattern_behaves_as_star() {
        let holders = expand("", &paths(&["/x/y.txt"]), 1).unwrap();
        assert_eq!(holders[0].stored_name, "file1");
    }

    #[test]
    fn question_mark_counts_single_chars() {
        let holders = expand("?.txt", &paths(&["/a", "/b"]), 1).unwrap();
        assert_eq!(holders[0].stored_name, "1.txt");
        assert_eq!(holders[1].stored_name, "2.txt");
    }

    #[test]
    fn literal_requires_exactly_one() {
        let err = expand("input.txt", &paths(&["/a", "/b"]), 1).unwrap_err();
        assert!(matches!(err, StagingError::Cardinality { count: 2, .. }));
    }

    #[test]
    fn duplicate_names_conflict() {
        // A literal landing twice via the double-star form.
        let err = expand("data/**", &paths(&["/x/same.txt", "/y/same.txt"]), 1).unwrap_err();
        assert!(matches!(err, StagingError::Conflict { .. }));
    }

    #[test]
    fn double_star_keeps_original_names() {
        let holders = expand("data/**", &paths(&["/in/reads.fq"]), 1).unwrap();
        assert_eq!(holders[0].stored_name, "data/reads.fq");
    }

    #[test]
    fn offset_continues_enumeration() {
        let holders = expand("*", &paths(&["/c"]), 3).unwrap();
        assert_eq!(holders[0].stored_name, "file3");
    }

    #[test]
    fn normalize_flattens_lists() {
        let value = DataValue::List(vec![
            DataValue::Path(PathBuf::from("/a")),
            DataValue::String("/b".into()),
        ]);
        assert_eq!(normalize(&value).unwrap(), paths(&["/a", "/b"]));
        assert!(normalize(&DataValue::Int(1)).is_err());
    }
}
