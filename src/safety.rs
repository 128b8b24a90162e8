//! Safety checks for files the replay tool writes.
//!
//! Reports and collection dumps must never land on an input fixture or on the
//! checkpoint database (losing the database means losing resume state).

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// File name fragments that belong to a SQLite checkpoint database
const DATABASE_PATTERNS: [&str; 5] = [".sqlite", ".sqlite3", ".db", "-wal", "-shm"];

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Validates that an output path is safe to overwrite.
///
/// Checks:
/// - Output must carry the required extension (e.g. "json")
/// - Output cannot be the same file as any of the provided input paths
/// - Output name cannot look like a checkpoint database
pub fn validate_output_path(
    output: &Path,
    required_extension: &str,
    input_paths: &[&Path],
) -> Result<()> {
    let output_name = output.file_name().and_then(|n| n.to_str()).unwrap_or("");

    if output.extension().and_then(|e| e.to_str()) != Some(required_extension) {
        bail!(
            "Safety check failed: output file '{}' must have a .{} extension",
            output.display(),
            required_extension
        );
    }

    for input in input_paths {
        if same_file(output, input) {
            bail!(
                "Safety check failed: output '{}' cannot be the same as input '{}'",
                output.display(),
                input.display()
            );
        }
    }

    for pattern in DATABASE_PATTERNS {
        if output_name.contains(pattern) {
            bail!(
                "Safety check failed: output '{}' matches checkpoint database pattern '{}'",
                output.display(),
                pattern
            );
        }
    }

    Ok(())
}

/// Validates a report directory: it may not exist yet, but if it does it must
/// be a directory, and it cannot be one of the input files.
pub fn validate_report_dir(dir: &Path, input_paths: &[&Path]) -> Result<PathBuf> {
    if dir.exists() && !dir.is_dir() {
        bail!("Safety check failed: report dir '{}' is not a directory", dir.display());
    }
    for input in input_paths {
        if same_file(dir, input) {
            bail!(
                "Safety check failed: report dir '{}' cannot be the same as input '{}'",
                dir.display(),
                input.display()
            );
        }
    }
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_output() {
        let output = PathBuf::from("/tmp/collections-after.json");
        let source = PathBuf::from("/data/source.json");
        let db = PathBuf::from("/data/checkpoints.sqlite3");
        assert!(validate_output_path(&output, "json", &[&source, &db]).is_ok());
    }

    #[test]
    fn test_wrong_extension() {
        let output = PathBuf::from("/tmp/collections.txt");
        let result = validate_output_path(&output, "json", &[]);
        assert!(result.unwrap_err().to_string().contains("must have a .json extension"));
    }

    #[test]
    fn test_output_equals_input() {
        let path = PathBuf::from("/data/target.json");
        let result = validate_output_path(&path, "json", &[&path]);
        assert!(result.unwrap_err().to_string().contains("cannot be the same as input"));
    }

    #[test]
    fn test_output_equals_input_through_relative_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("target.json");
        std::fs::write(&input, "{}").unwrap();
        let indirect = tmp.path().join(".").join("target.json");
        assert!(validate_output_path(&indirect, "json", &[&input]).is_err());
    }

    #[test]
    fn test_database_pattern_blocked() {
        let output = PathBuf::from("/tmp/checkpoints.sqlite3.json");
        let result = validate_output_path(&output, "json", &[]);
        assert!(result.unwrap_err().to_string().contains("checkpoint database pattern"));
    }

    #[test]
    fn test_report_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("reports");
        assert_eq!(validate_report_dir(&dir, &[]).unwrap(), dir);
        assert!(dir.is_dir());

        let file = tmp.path().join("source.json");
        std::fs::write(&file, "{}").unwrap();
        assert!(validate_report_dir(&file, &[&file]).is_err());
    }
}
