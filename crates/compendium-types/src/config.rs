use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Action a `DataSourceRule` takes on a path matching its pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceAction {
    Include,
    Exclude,
}

/// One entry of the ordered `data_sources` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRule {
    pub pattern: String,
    pub action: DataSourceAction,
}

/// Configuration passed to the compendium builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub working_directories: Vec<Utf8PathBuf>,
    pub data_sources: Vec<DataSourceRule>,
    pub ignored_data_objects: Vec<String>,
    pub secret_env_vars: Vec<String>,
}

/// Scheduler selection for the graph executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerMode {
    Sequential,
    Parallel { bound: u32 },
}

impl Default for SchedulerMode {
    fn default() -> Self {
        SchedulerMode::Sequential
    }
}

/// An `NAME=VALUE` pair parsed from an environment variable file. Splits
/// on the *first* `=` only, so values may themselves contain `=` —
/// matching `reprounzip`'s own `--pass-env-vars` parsing. Comments
/// (`#...`) and blank lines are ignored.
pub fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, EnvFileError> {
    let mut pairs = Vec::new();
    for (line_no, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            return Err(EnvFileError::MalformedLine {
                line: line_no + 1,
                content: raw_line.to_string(),
            });
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(EnvFileError::MalformedLine {
                line: line_no + 1,
                content: raw_line.to_string(),
            });
        }
        pairs.push((name.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvFileError {
    #[error("line {line} is not a NAME=VALUE pair: {content:?}")]
    MalformedLine { line: usize, content: String },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let parsed = parse_env_file("FOO=bar\nBAZ=qux\n").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string())
            ]
        );
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let parsed = parse_env_file("# a comment\n\nFOO=bar\n  \n").unwrap();
        assert_eq!(parsed, vec![("FOO".to_string(), "bar".to_string())]);
    }

    #[test]
    fn value_may_contain_equals_sign() {
        let parsed = parse_env_file("CONNECTION=postgres://u:p@host/db?x=1").unwrap();
        assert_eq!(
            parsed,
            vec![(
                "CONNECTION".to_string(),
                "postgres://u:p@host/db?x=1".to_string()
            )]
        );
    }

    #[test]
    fn rejects_lines_without_equals() {
        let err = parse_env_file("FOO=bar\nNOTAPAIR\n").unwrap_err();
        assert_eq!(
            err,
            EnvFileError::MalformedLine {
                line: 2,
                content: "NOTAPAIR".to_string()
            }
        );
    }
}
