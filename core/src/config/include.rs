// Configuration file inclusion
//
// Expands `!include: path` directives recursively, preserving the
// directive's indentation so included blocks nest correctly in the
// document. Visited paths are reported for the file watcher.

use super::ConfigError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MAX_DEPTH: usize = 5;

/// Read a configuration file, expanding includes. Returns the expanded
/// contents plus every file visited, root included.
pub fn read_with_includes(path: &Path) -> Result<(String, Vec<PathBuf>), ConfigError> {
    let mut visited = Vec::new();
    let mut chain = HashSet::new();
    let contents = expand(path, 0, &mut visited, &mut chain)?;
    Ok((contents, visited))
}

fn expand(
    path: &Path,
    depth: usize,
    visited: &mut Vec<PathBuf>,
    chain: &mut HashSet<PathBuf>,
) -> Result<String, ConfigError> {
    if depth > MAX_DEPTH {
        return Err(ConfigError::Include(format!(
            "include depth exceeds {MAX_DEPTH} at {}",
            path.display()
        )));
    }

    let canonical = path
        .canonicalize()
        .map_err(|e| ConfigError::Include(format!("cannot resolve {}: {e}", path.display())))?;
    if !chain.insert(canonical.clone()) {
        return Err(ConfigError::Include(format!(
            "include cycle through {}",
            path.display()
        )));
    }
    visited.push(canonical.clone());

    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Include(format!("cannot read {}: {e}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("!include:") {
            let indent = &line[..line.len() - trimmed.len()];
            let target = rest.trim();
            if target.is_empty() {
                return Err(ConfigError::Include(format!(
                    "empty !include directive in {}",
                    path.display()
                )));
            }

            let included_path = base_dir.join(target);
            let included = expand(&included_path, depth + 1, visited, chain)?;
            for included_line in included.lines() {
                out.push_str(indent);
                out.push_str(included_line);
                out.push('\n');
            }
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    chain.remove(&canonical);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn expands_nested_includes_with_indentation() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("root.yml"),
            "pages:\n  !include: page.yml\n",
        )
        .unwrap();
        fs::write(dir.path().join("page.yml"), "- name: Home\n").unwrap();

        let (contents, visited) = read_with_includes(&dir.path().join("root.yml")).unwrap();
        assert_eq!(contents, "pages:\n  - name: Home\n");
        assert_eq!(visited.len(), 2);
    }

    #[test]
    fn rejects_include_cycles() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.yml"), "!include: b.yml\n").unwrap();
        fs::write(dir.path().join("b.yml"), "!include: a.yml\n").unwrap();

        let err = read_with_includes(&dir.path().join("a.yml")).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_missing_include_target() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("root.yml"), "!include: missing.yml\n").unwrap();
        assert!(read_with_includes(&dir.path().join("root.yml")).is_err());
    }
}
