use async_trait::async_trait;
use neo_protocol::ContentBlock;

use crate::command::Command;
use crate::commands::flag_value;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::resolve_workspace_path;

const DEFAULT_LIMIT: i64 = 200;

#[derive(Debug, PartialEq)]
struct ReadFileArgs {
    path: String,
    line_numbers: bool,
    from: Option<i64>,
    until: Option<i64>,
    limit: i64,
}

/// Reads a UTF-8 file, with optional line windows, negative indices counted
/// from EOF, and truncation indicators when only part of the requested
/// window is shown.
pub struct ReadFileCommand;

impl ReadFileCommand {
    fn parse(statement: &str) -> Result<ReadFileArgs> {
        let tokens = split_args("read_file", statement)?;
        let mut args = ReadFileArgs {
            path: String::new(),
            line_numbers: true,
            from: None,
            until: None,
            limit: DEFAULT_LIMIT,
        };

        let mut it = tokens.iter();
        while let Some(token) = it.next() {
            match token.as_str() {
                "--no-line-numbers" => args.line_numbers = false,
                "--from" => args.from = Some(flag_value("--from", it.next())?),
                "--until" => args.until = Some(flag_value("--until", it.next())?),
                "--limit" => args.limit = flag_value("--limit", it.next())?,
                flag if flag.starts_with("--") => {
                    return Err(NeoErr::validation(format!("Unknown flag: {flag}")));
                }
                positional if args.path.is_empty() => args.path = positional.to_string(),
                extra => {
                    return Err(NeoErr::validation(format!("Unexpected argument: {extra}")));
                }
            }
        }

        if args.path.is_empty() {
            return Err(NeoErr::validation("Path argument is required"));
        }
        if args.limit < -1 || args.limit == 0 {
            return Err(NeoErr::validation(
                "Limit must be a positive number, or -1 for unlimited",
            ));
        }
        Ok(args)
    }
}

/// Resolve a possibly-negative 1-indexed line reference against a file of
/// `total` lines.
fn resolve_index(index: i64, total: usize) -> i64 {
    if index < 0 {
        total as i64 + index + 1
    } else {
        index
    }
}

#[async_trait]
impl Command for ReadFileCommand {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn help(&self) -> String {
        "Use the `read_file` command to read and display file contents.\n\
         \n\
         Usage: \u{25b6}read_file [--no-line-numbers] [--from N] [--until N] [--limit N] PATH\u{25a0}\n\
         \n\
         - PATH (required): Relative or absolute path to a file. Paths under ~/.neo \
         can be read even when outside the current workspace.\n\
         - no-line-numbers: Exclude the `N:` line prefixes from the output.\n\
         - from: Start reading from this 1-indexed line. Negative values count from EOF.\n\
         - until: Read until this line (inclusive). Negative values count from EOF.\n\
         - limit: Maximum number of lines to show. Default: 200. Use -1 for unlimited.\n\
         \n\
         Example:\n\
         \u{25b6}read_file path/to/file.py\u{25a0}\n\
         \u{2705}1:import os\n2:import sys\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_some() {
            return Err(NeoErr::validation(
                "The read_file command does not accept data input",
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

        let full_path = match resolve_workspace_path(session.workspace(), &args.path, true) {
            Ok(path) => path,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let content = match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => content,
            Err(_) => {
                return ContentBlock::result_err(format!("File not found: {}", args.path));
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let from = args
            .from
            .map(|f| resolve_index(f, total))
            .unwrap_or(1)
            .max(1);
        let until = args
            .until
            .map(|u| resolve_index(u, total))
            .unwrap_or(total as i64)
            .min(total as i64);

        if from > until {
            return ContentBlock::result_ok(String::new());
        }
        let (from, until) = (from as usize, until as usize);
        let window_len = until - from + 1;

        // Apply the limit within the requested window. When only an upper
        // bound was given, keep the window's tail so the requested end line
        // stays visible.
        let (shown_from, shown_until) = if args.limit >= 0 && window_len > args.limit as usize {
            let limit = args.limit as usize;
            if args.from.is_none() && args.until.is_some() {
                (until - limit + 1, until)
            } else {
                (from, from + limit - 1)
            }
        } else {
            (from, until)
        };

        let mut out = Vec::new();
        if shown_from > from {
            out.push(format!("... {} additional lines", shown_from - from));
        }
        for (offset, line) in lines[shown_from - 1..shown_until].iter().enumerate() {
            if args.line_numbers {
                out.push(format!("{}:{line}", shown_from + offset));
            } else {
                out.push((*line).to_string());
            }
        }
        if shown_until < until {
            out.push(format!("... {} additional lines", until - shown_until));
        }

        ContentBlock::result_ok(out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::SessionBuilder;

    fn session_with_file(name: &str, content: &str) -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), content).unwrap();
        let session = SessionBuilder::new()
            .session_id("read-file-test")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();
        (dir, session)
    }

    fn numbered_file(lines: usize) -> String {
        (1..=lines).map(|i| format!("line {i}\n")).collect()
    }

    #[tokio::test]
    async fn reads_whole_file_with_line_numbers() {
        let (_dir, session) = session_with_file("a.txt", "alpha\nbeta\n");
        let result = ReadFileCommand
            .execute(&session, "read_file a.txt", None)
            .await;
        assert_eq!(result, ContentBlock::result_ok("1:alpha\n2:beta"));
    }

    #[tokio::test]
    async fn no_line_numbers_flag_strips_prefixes() {
        let (_dir, session) = session_with_file("a.txt", "alpha\nbeta\n");
        let result = ReadFileCommand
            .execute(&session, "read_file --no-line-numbers a.txt", None)
            .await;
        assert_eq!(result, ContentBlock::result_ok("alpha\nbeta"));
    }

    #[tokio::test]
    async fn negative_from_counts_from_eof() {
        let (_dir, session) = session_with_file("a.txt", &numbered_file(10));
        let result = ReadFileCommand
            .execute(&session, "read_file --from -3 a.txt", None)
            .await;
        assert_eq!(result, ContentBlock::result_ok("8:line 8\n9:line 9\n10:line 10"));
    }

    #[tokio::test]
    async fn limit_truncates_with_indicator() {
        let (_dir, session) = session_with_file("a.txt", &numbered_file(10));
        let result = ReadFileCommand
            .execute(&session, "read_file --limit 2 a.txt", None)
            .await;
        assert_eq!(
            result,
            ContentBlock::result_ok("1:line 1\n2:line 2\n... 8 additional lines")
        );
    }

    #[tokio::test]
    async fn until_only_keeps_window_tail() {
        let (_dir, session) = session_with_file("a.txt", &numbered_file(10));
        let result = ReadFileCommand
            .execute(&session, "read_file --until 8 --limit 2 a.txt", None)
            .await;
        assert_eq!(
            result,
            ContentBlock::result_ok("... 6 additional lines\n7:line 7\n8:line 8")
        );
    }

    #[tokio::test]
    async fn unlimited_limit_reads_everything() {
        let (_dir, session) = session_with_file("a.txt", &numbered_file(300));
        let result = ReadFileCommand
            .execute(&session, "read_file --limit -1 a.txt", None)
            .await;
        let ContentBlock::CommandResult { value, success, .. } = result else {
            panic!("expected command result");
        };
        assert!(success);
        assert_eq!(value.lines().count(), 300);
        assert!(value.ends_with("300:line 300"));
    }

    #[tokio::test]
    async fn default_limit_caps_output_at_200_lines() {
        let (_dir, session) = session_with_file("a.txt", &numbered_file(300));
        let result = ReadFileCommand
            .execute(&session, "read_file a.txt", None)
            .await;
        let ContentBlock::CommandResult { value, .. } = result else {
            panic!("expected command result");
        };
        assert_eq!(value.lines().count(), 201);
        assert!(value.ends_with("... 100 additional lines"));
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let (_dir, session) = session_with_file("a.txt", "x\n");
        let result = ReadFileCommand
            .execute(&session, "read_file nonexistent.py", None)
            .await;
        assert_eq!(
            result,
            ContentBlock::result_err("File not found: nonexistent.py")
        );
    }

    #[tokio::test]
    async fn path_escaping_workspace_fails() {
        let (_dir, session) = session_with_file("a.txt", "x\n");
        let result = ReadFileCommand
            .execute(&session, "read_file /etc/passwd", None)
            .await;
        assert_eq!(result.result_success(), Some(false));
        assert!(result.model_text().contains("within the workspace"));
    }

    #[test]
    fn validate_rejects_data_and_bad_limits() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .session_id("read-file-validate")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();
        assert!(
            ReadFileCommand
                .validate(&session, "read_file a.txt", Some("data"))
                .is_err()
        );
        assert!(
            ReadFileCommand
                .validate(&session, "read_file --limit 0 a.txt", None)
                .is_err()
        );
        assert!(ReadFileCommand.validate(&session, "read_file", None).is_err());
        assert!(
            ReadFileCommand
                .validate(&session, "read_file a.txt", None)
                .is_ok()
        );
    }
}
