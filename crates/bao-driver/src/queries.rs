//! Benchmark query files.
//!
//! Queries live as one `.sql` file per query under a benchmark directory. Schema
//! scripts in the same tree are not benchmark queries and are skipped.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryFileError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> QueryFileError + '_ {
    move |source| QueryFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Turn the text of a query file into a statement Presto accepts: comment lines are
/// dropped, literal `\s` markers become spaces and statement terminators go away.
pub fn normalize_query(text: &str) -> String {
    text.split_inclusive('\n')
        .filter(|line| !line.starts_with("--"))
        .collect::<String>()
        .replace("\\s", " ")
        .replace(';', "")
}

pub fn load_query(path: &Path) -> Result<String, QueryFileError> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    Ok(normalize_query(&text))
}

fn is_query_file(path: &Path) -> bool {
    let is_sql = path.extension().is_some_and(|ext| ext == "sql");
    let is_schema = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains("schema"));
    is_sql && !is_schema
}

/// All query files below `dir`, sorted by path.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>, QueryFileError> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(io_error(&current))? {
            let path = entry.map_err(io_error(&current))?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_query_file(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_query() {
        let text = "-- TPC-H Q6\nselect sum(l_extendedprice)\\sfrom lineitem\nwhere l_quantity < 24;\n";
        assert_eq!(
            normalize_query(text),
            "select sum(l_extendedprice) from lineitem\nwhere l_quantity < 24\n"
        );
    }

    #[test]
    fn test_inline_comment_markers_are_kept() {
        assert_eq!(normalize_query("select 1 -- one\n"), "select 1 -- one\n");
    }

    #[test]
    fn test_discover_skips_schema_files_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("posts");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("2.sql"), "select 2").unwrap();
        std::fs::write(dir.path().join("1.sql"), "select 1").unwrap();
        std::fs::write(dir.path().join("schema_job.sql"), "create table t (a int)").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a query").unwrap();
        std::fs::write(nested.join("q1.sql"), "select 3").unwrap();
        std::fs::write(nested.join("schema.sql"), "create table p (a int)").unwrap();

        let found = discover(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1.sql", "2.sql", "posts/q1.sql"]);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_query(Path::new("/nonexistent/q.sql")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/q.sql"));
    }
}
