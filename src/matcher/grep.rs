//! Matcher backed by the system `grep`.
//!
//! Runs `grep -E` twice, first with `-c` for per-file counts and then for
//! the lines themselves. Arguments go straight to the process, never through
//! a shell, so terms cannot inject commands.

use super::{file_name, FileMatches, LogSource, MatchResult, Matcher, MatcherError};
use bytes::Bytes;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

/// grep exits with 1 when nothing matched, which is not an error.
const NO_MATCH_STATUS: i32 = 1;

#[derive(Debug)]
pub struct GrepMatcher {
    program: PathBuf,
}

impl GrepMatcher {
    pub fn new() -> Self {
        Self::with_program("grep")
    }

    /// Use a specific grep binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(
        &self,
        dir: &Path,
        terms: &[String],
        names: &[String],
        extra: &[&str],
    ) -> Result<Vec<u8>, MatcherError> {
        let mut args: Vec<OsString> = vec!["-E".into()];
        args.extend(extra.iter().map(OsString::from));
        for term in terms {
            args.push("-e".into());
            args.push(term.into());
        }
        args.push("--".into());
        args.extend(names.iter().map(OsString::from));

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(dir)
            .output()
            .map_err(MatcherError::Spawn)?;

        let failed = match output.status.code() {
            Some(0) | Some(NO_MATCH_STATUS) => !output.stderr.is_empty(),
            _ => true,
        };
        if failed {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program = %self.program.display(), stderr = %stderr, "grep failed");
            return Err(MatcherError::Command(stderr));
        }
        Ok(output.stdout)
    }
}

impl Default for GrepMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for GrepMatcher {
    fn search(&self, terms: &[String], source: &LogSource) -> Result<MatchResult, MatcherError> {
        let multi_file = source.is_multi_file();
        let paths = source
            .files()
            .map_err(|e| MatcherError::Io(source.path().to_path_buf(), e))?;
        if paths.is_empty() {
            return Ok(MatchResult::empty(multi_file));
        }

        // Run from the files' directory so grep prints base names.
        let dir = match source {
            LogSource::Directory(dir) => dir.clone(),
            LogSource::File(path) => match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };
        let names: Vec<String> = paths.iter().map(|p| file_name(p)).collect();
        let with_name = if multi_file { "-H" } else { "-h" };

        let counts = self.run(&dir, terms, &names, &["-c", "-H"])?;
        let files = parse_counts(&counts)?;
        let total = files.iter().map(|f| f.count).sum();

        let lines = self.run(&dir, terms, &names, &[with_name])?;

        Ok(MatchResult {
            files,
            total,
            lines: Bytes::from(lines),
            multi_file,
        })
    }

    fn name(&self) -> &'static str {
        "grep"
    }
}

/// Parse `grep -c -H` output: one `name:count` per line.
fn parse_counts(stdout: &[u8]) -> Result<Vec<FileMatches>, MatcherError> {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (name, count) = line
                .rsplit_once(':')
                .ok_or_else(|| MatcherError::Command(format!("unexpected count line: {line}")))?;
            let count = count
                .trim()
                .parse()
                .map_err(|_| MatcherError::Command(format!("unexpected count line: {line}")))?;
            Ok(FileMatches {
                name: name.to_string(),
                count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grep_available() -> bool {
        Command::new("grep").arg("--version").output().is_ok()
    }

    #[test]
    fn test_parse_counts() {
        let files = parse_counts(b"a.log:3\nb.log:0\n").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], FileMatches { name: "a.log".into(), count: 3 });
        assert_eq!(files[1].count, 0);

        assert!(parse_counts(b"garbage\n").is_err());
    }

    #[test]
    fn test_grep_single_file() {
        if !grep_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.log");
        std::fs::write(&path, "ERROR one\nINFO two\nERROR three\n").unwrap();

        let result = GrepMatcher::new()
            .search(&["ERROR".to_string()], &LogSource::File(path))
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(&result.lines[..], b"ERROR one\nERROR three\n");
        assert_eq!(result.files[0].name, "machine.log");
    }

    #[test]
    fn test_grep_no_match_is_not_an_error() {
        if !grep_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.log");
        std::fs::write(&path, "INFO only\n").unwrap();

        let result = GrepMatcher::new()
            .search(&["ERROR".to_string()], &LogSource::File(path))
            .unwrap();
        assert_eq!(result.total, 0);
        assert!(result.lines.is_empty());
    }

    #[test]
    fn test_grep_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.log");
        std::fs::write(&path, "x\n").unwrap();

        let err = GrepMatcher::with_program("/nonexistent/grep")
            .search(&["x".to_string()], &LogSource::File(path))
            .unwrap_err();
        assert!(matches!(err, MatcherError::Spawn(_)));
    }
}
