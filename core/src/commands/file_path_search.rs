use async_trait::async_trait;
use neo_protocol::ContentBlock;
use tracing::debug;
use wildmatch::WildMatch;

use crate::command::Command;
use crate::commands::flag_value;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::resolve_workspace_path;

#[derive(Debug, PartialEq)]
struct FilePathSearchArgs {
    path: String,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    file_type: Option<char>,
    content_pattern: Option<String>,
}

/// Recursive path listing, delegated to `find`, with wildcard
/// include/exclude filtering on file names and an optional content regex
/// post-filter.
pub struct FilePathSearchCommand;

impl FilePathSearchCommand {
    fn parse(statement: &str) -> Result<FilePathSearchArgs> {
        let tokens = split_args("file_path_search", statement)?;
        let mut path = None;
        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();
        let mut file_type = None;
        let mut content_pattern = None;

        let mut it = tokens.iter();
        while let Some(token) = it.next() {
            match token.as_str() {
                "--file-pattern" => {
                    let pattern: String = flag_value("--file-pattern", it.next())?;
                    match pattern.strip_prefix('!') {
                        Some(excluded) => exclude_patterns.push(excluded.to_string()),
                        None => include_patterns.push(pattern),
                    }
                }
                "--type" => {
                    let value: String = flag_value("--type", it.next())?;
                    match value.as_str() {
                        "f" => file_type = Some('f'),
                        "d" => file_type = Some('d'),
                        other => {
                            return Err(NeoErr::validation(format!(
                                "Type must be 'f' for files or 'd' for directories, got '{other}'"
                            )));
                        }
                    }
                }
                "--content" => content_pattern = Some(flag_value("--content", it.next())?),
                flag if flag.starts_with("--") => {
                    return Err(NeoErr::validation(format!("Unknown flag: {flag}")));
                }
                positional if path.is_none() => path = Some(positional.to_string()),
                extra => {
                    return Err(NeoErr::validation(format!("Unexpected argument: {extra}")));
                }
            }
        }

        Ok(FilePathSearchArgs {
            path: path.ok_or_else(|| NeoErr::validation("Path argument is required"))?,
            include_patterns,
            exclude_patterns,
            file_type,
            content_pattern,
        })
    }
}

/// Inclusions first, then exclusions, both matched against the path's final
/// component.
fn matches_patterns(path: &str, includes: &[WildMatch], excludes: &[WildMatch]) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if !includes.is_empty() && !includes.iter().any(|p| p.matches(name)) {
        return false;
    }
    !excludes.iter().any(|p| p.matches(name))
}

#[async_trait]
impl Command for FilePathSearchCommand {
    fn name(&self) -> &'static str {
        "file_path_search"
    }

    fn help(&self) -> String {
        "Use the `file_path_search` command to search for files and directories.\n\
         \n\
         Usage: \u{25b6}file_path_search PATH [--file-pattern <pattern>] [--type <type>] [--content <pattern>]\u{25a0}\n\
         \n\
         - PATH (required): Path to search in, relative to the workspace.\n\
         - file-pattern: File pattern to match (e.g. '*.py'). May be repeated. \
         Prefix a pattern with '!' to exclude matching files.\n\
         - type: 'f' for files, 'd' for directories. Both are included by default.\n\
         - content: Regex pattern; only files whose contents match are listed.\n\
         \n\
         Example:\n\
         \u{25b6}file_path_search src --type f --file-pattern \"*.py\"\u{25a0}\n\
         \u{2705}src/core/command.py\nsrc/utils/files.py\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_some() {
            return Err(NeoErr::validation(
                "The file_path_search command does not accept data input",
            ));
        }
        Self::parse(statement).map(|_| ())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        _data: Option<&str>,
    ) -> ContentBlock {
        let args = match Self::parse(statement) {
            Ok(args) => args,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let search_path = match resolve_workspace_path(session.workspace(), &args.path, false) {
            Ok(search_path) => search_path,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let mut find = tokio::process::Command::new("find");
        find.arg(&search_path);
        if let Some(file_type) = args.file_type {
            find.args(["-type", &file_type.to_string()]);
        }
        find.current_dir(session.workspace());

        debug!("running find under {}", search_path.display());
        let output = match find.output().await {
            Ok(output) => output,
            Err(e) => {
                return ContentBlock::result_err(format!("Command execution failed: {e}"));
            }
        };
        if !output.status.success() {
            return ContentBlock::result_err(format!(
                "Find failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let includes: Vec<WildMatch> = args
            .include_patterns
            .iter()
            .map(|p| WildMatch::new(p))
            .collect();
        let excludes: Vec<WildMatch> = args
            .exclude_patterns
            .iter()
            .map(|p| WildMatch::new(p))
            .collect();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut results: Vec<String> = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .filter(|line| matches_patterns(line, &includes, &excludes))
            .map(str::to_string)
            .collect();

        if let Some(content_pattern) = &args.content_pattern {
            let mut filtered = Vec::new();
            for path in results {
                if std::path::Path::new(&path).is_dir() {
                    continue;
                }
                let grep = tokio::process::Command::new("grep")
                    .args(["-l", content_pattern, &path])
                    .current_dir(session.workspace())
                    .output()
                    .await;
                if let Ok(grep) = grep
                    && grep.status.code() == Some(0)
                    && !grep.stdout.is_empty()
                {
                    filtered.push(path);
                }
            }
            results = filtered;
        }

        if results.is_empty() {
            return ContentBlock::result_ok("No matching files found.");
        }
        ContentBlock::result_ok(results.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_collects_patterns_type_and_content() {
        let args = FilePathSearchCommand::parse(
            "file_path_search src --type f --file-pattern \"*.py\" --file-pattern \"!*_test.py\" --content \"class File\"",
        )
        .unwrap();
        assert_eq!(args.path, "src");
        assert_eq!(args.file_type, Some('f'));
        assert_eq!(args.include_patterns, vec!["*.py"]);
        assert_eq!(args.exclude_patterns, vec!["*_test.py"]);
        assert_eq!(args.content_pattern.as_deref(), Some("class File"));
    }

    #[test]
    fn parse_rejects_bad_type() {
        assert!(FilePathSearchCommand::parse("file_path_search src --type x").is_err());
    }

    #[test]
    fn exclusions_apply_after_inclusions() {
        let includes = vec![WildMatch::new("*.py")];
        let excludes = vec![WildMatch::new("*_test.py")];
        assert!(matches_patterns("src/app.py", &includes, &excludes));
        assert!(!matches_patterns("src/app_test.py", &includes, &excludes));
        assert!(!matches_patterns("src/app.rs", &includes, &excludes));
        // No includes means everything not excluded passes.
        assert!(matches_patterns("src/app.rs", &[], &excludes));
    }
}
