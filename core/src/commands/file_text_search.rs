use async_trait::async_trait;
use neo_protocol::ContentBlock;
use tracing::debug;

use crate::command::Command;
use crate::commands::flag_value;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::resolve_workspace_path;

#[derive(Debug, PartialEq)]
struct FileTextSearchArgs {
    pattern: String,
    path: String,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    ignore_case: bool,
    num_context_lines: usize,
}

/// Recursive text search, delegated to `grep`. Output lines are
/// `path:line:text`.
pub struct FileTextSearchCommand;

impl FileTextSearchCommand {
    fn parse(statement: &str) -> Result<FileTextSearchArgs> {
        let tokens = split_args("file_text_search", statement)?;
        let mut positionals: Vec<String> = Vec::new();
        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();
        let mut ignore_case = false;
        let mut num_context_lines = 0usize;

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
                "--ignore-case" => ignore_case = true,
                "--num-context-lines" => {
                    num_context_lines = flag_value("--num-context-lines", it.next())?;
                }
                flag if flag.starts_with("--") => {
                    return Err(NeoErr::validation(format!("Unknown flag: {flag}")));
                }
                positional => positionals.push(positional.to_string()),
            }
        }

        let mut positionals = positionals.into_iter();
        let pattern = positionals
            .next()
            .ok_or_else(|| NeoErr::validation("Pattern argument is required"))?;
        let path = positionals
            .next()
            .ok_or_else(|| NeoErr::validation("Path argument is required"))?;
        if positionals.next().is_some() {
            return Err(NeoErr::validation("Too many positional arguments"));
        }

        Ok(FileTextSearchArgs {
            pattern,
            path,
            include_patterns,
            exclude_patterns,
            ignore_case,
            num_context_lines,
        })
    }
}

#[async_trait]
impl Command for FileTextSearchCommand {
    fn name(&self) -> &'static str {
        "file_text_search"
    }

    fn help(&self) -> String {
        "Use the `file_text_search` command to search for file contents.\n\
         \n\
         Usage: \u{25b6}file_text_search PATTERN PATH [--file-pattern <pattern>] [--ignore-case] [--num-context-lines <lines>]\u{25a0}\n\
         \n\
         - PATTERN (required): Regex pattern to look for in files.\n\
         - PATH (required): Path to search in, relative to the workspace.\n\
         - file-pattern: File pattern to limit the search (e.g. '*.py'). May be repeated. \
         Prefix a pattern with '!' to exclude matching files.\n\
         - ignore-case: Perform case-insensitive matching.\n\
         - num-context-lines: Number of context lines to show around each match.\n\
         \n\
         Example:\n\
         \u{25b6}file_text_search \"import\" src --file-pattern \"*.py\"\u{25a0}\n\
         \u{2705}src/core/command.py:8:import logging\nsrc/core/command.py:9:import textwrap\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_some() {
            return Err(NeoErr::validation(
                "The file_text_search command does not accept data input",
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

        let mut grep = tokio::process::Command::new("grep");
        grep.args(["-r", "-n", "--color=never"]);
        if args.ignore_case {
            grep.arg("-i");
        }
        if args.num_context_lines > 0 {
            grep.args(["-C", &args.num_context_lines.to_string()]);
        }
        for include in &args.include_patterns {
            grep.args(["--include", include]);
        }
        for exclude in &args.exclude_patterns {
            grep.args(["--exclude", exclude]);
        }
        grep.arg(&args.pattern);
        grep.arg(&search_path);
        grep.current_dir(session.workspace());

        debug!("running grep for pattern '{}' under {}", args.pattern, search_path.display());
        let output = match grep.output().await {
            Ok(output) => output,
            Err(e) => {
                return ContentBlock::result_err(format!("Command execution failed: {e}"));
            }
        };

        match output.status.code() {
            Some(0) => {
                ContentBlock::result_ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Some(1) => ContentBlock::result_ok("No matches found."),
            _ => ContentBlock::result_err(format!(
                "Search failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}
