//! Applies a line-oriented change script to an existing file. The script is
//! a sequence of `@UPDATE` and `@DELETE` blocks; `@UPDATE` carries
//! `@@BEFORE`/`@@AFTER` sections whose lines are `<n>:<text>` anchors. The
//! anchor text of the non-empty lines must match a contiguous run of the
//! file exactly; line numbers order the blocks but do not gate matching.
//! Any parse or anchor failure falls back to a secondary-model pass that
//! re-emits the whole file through `write_file`, and nothing is committed
//! unless every block (or the fallback) succeeds.

use async_trait::async_trait;
use neo_protocol::COMMAND_END;
use neo_protocol::COMMAND_START;
use neo_protocol::CommandOutput;
use neo_protocol::ContentBlock;
use neo_protocol::STDIN_SEPARATOR;
use regex_lite::Regex;
use tracing::info;
use tracing::warn;

use crate::client::proxy::ApiContent;
use crate::client::proxy::ApiMessage;
use crate::client::proxy::ChatRequest;
use crate::command::Command;
use crate::commands::split_args;
use crate::commands::unified_diff;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::resolve_workspace_path;

#[derive(Debug, PartialEq)]
struct AnchorLine {
    number: usize,
    text: String,
}

#[derive(Debug, PartialEq)]
enum ScriptBlock {
    Update {
        before: Vec<AnchorLine>,
        after: Vec<AnchorLine>,
    },
    Delete {
        lines: Vec<AnchorLine>,
    },
}

fn parse_anchor_line(line: &str) -> Result<AnchorLine> {
    // Anchors are `<n>:<text>`; the text may itself contain colons.
    let re = Regex::new(r"^(\d+):(.*)$").map_err(|e| NeoErr::Fatal(e.to_string()))?;
    let captures = re
        .captures(line)
        .ok_or_else(|| NeoErr::validation(format!("Invalid anchor line: '{line}'")))?;
    Ok(AnchorLine {
        number: captures[1]
            .parse()
            .map_err(|_| NeoErr::validation(format!("Invalid line number in anchor: '{line}'")))?,
        text: captures[2].to_string(),
    })
}

fn parse_script(script: &str) -> Result<Vec<ScriptBlock>> {
    let mut blocks = Vec::new();
    let mut lines = script.lines().peekable();

    while let Some(line) = lines.next() {
        let header = line.trim();
        if header.is_empty() {
            continue;
        }
        match header {
            "@UPDATE" => {
                match lines.next().map(str::trim) {
                    Some("@@BEFORE") => {}
                    other => {
                        return Err(NeoErr::validation(format!(
                            "Expected @@BEFORE after @UPDATE, got: '{}'",
                            other.unwrap_or("<end of script>")
                        )));
                    }
                }
                let mut before = Vec::new();
                loop {
                    match lines.peek().map(|l| l.trim()) {
                        Some("@@AFTER") => {
                            lines.next();
                            break;
                        }
                        Some(_) => {
                            let line = lines.next().unwrap_or_default();
                            if line.trim().is_empty() {
                                continue;
                            }
                            before.push(parse_anchor_line(line)?);
                        }
                        None => {
                            return Err(NeoErr::validation(
                                "Unterminated @UPDATE block: missing @@AFTER",
                            ));
                        }
                    }
                }
                let mut after = Vec::new();
                while let Some(next) = lines.peek() {
                    let trimmed = next.trim();
                    if trimmed == "@UPDATE" || trimmed == "@DELETE" {
                        break;
                    }
                    let line = lines.next().unwrap_or_default();
                    if line.trim().is_empty() {
                        continue;
                    }
                    after.push(parse_anchor_line(line)?);
                }
                if before.is_empty() {
                    return Err(NeoErr::validation("@UPDATE block has an empty @@BEFORE section"));
                }
                blocks.push(ScriptBlock::Update { before, after });
            }
            "@DELETE" => {
                let mut delete_lines = Vec::new();
                while let Some(next) = lines.peek() {
                    let trimmed = next.trim();
                    if trimmed == "@UPDATE" || trimmed == "@DELETE" {
                        break;
                    }
                    let line = lines.next().unwrap_or_default();
                    if line.trim().is_empty() {
                        continue;
                    }
                    delete_lines.push(parse_anchor_line(line)?);
                }
                if delete_lines.is_empty() {
                    return Err(NeoErr::validation("@DELETE block lists no lines"));
                }
                blocks.push(ScriptBlock::Delete {
                    lines: delete_lines,
                });
            }
            other => {
                return Err(NeoErr::validation(format!(
                    "'{other}' is not a valid block header. Valid headers: '@UPDATE', '@DELETE'"
                )));
            }
        }
    }

    if blocks.is_empty() {
        return Err(NeoErr::validation("Change script contains no blocks"));
    }
    Ok(blocks)
}

/// Find the contiguous run of `pattern` inside `lines` starting at or after
/// `start`. Matches are attempted with decreasing strictness: exact match,
/// then ignoring trailing whitespace, then ignoring leading and trailing
/// whitespace.
fn seek_sequence(lines: &[String], pattern: &[&str], start: usize) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > lines.len() {
        return None;
    }
    let last_start = lines.len() - pattern.len();
    // Exact match first.
    for i in start..=last_start {
        if lines[i..i + pattern.len()]
            .iter()
            .zip(pattern)
            .all(|(line, pat)| line == pat)
        {
            return Some(i);
        }
    }
    // Then rstrip match.
    for i in start..=last_start {
        if lines[i..i + pattern.len()]
            .iter()
            .zip(pattern)
            .all(|(line, pat)| line.trim_end() == pat.trim_end())
        {
            return Some(i);
        }
    }
    // Finally, trim both sides to allow more lenience.
    for i in start..=last_start {
        if lines[i..i + pattern.len()]
            .iter()
            .zip(pattern)
            .all(|(line, pat)| line.trim() == pat.trim())
        {
            return Some(i);
        }
    }
    None
}

/// Apply the script blocks in document order. Fails without side effects on
/// the first block whose anchors cannot be located.
fn apply_script(content: &str, blocks: &[ScriptBlock]) -> Result<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut cursor = 0usize;

    for block in blocks {
        match block {
            ScriptBlock::Update { before, after } => {
                let pattern: Vec<&str> = before
                    .iter()
                    .map(|a| a.text.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .collect();
                let idx = seek_sequence(&lines, &pattern, cursor).ok_or_else(|| {
                    NeoErr::validation(format!(
                        "Could not locate @@BEFORE block starting with '{}'",
                        pattern.first().unwrap_or(&"")
                    ))
                })?;
                let replacement: Vec<String> =
                    after.iter().map(|a| a.text.clone()).collect();
                let replacement_len = replacement.len();
                lines.splice(idx..idx + pattern.len(), replacement);
                cursor = idx + replacement_len;
            }
            ScriptBlock::Delete {
                lines: delete_lines,
            } => {
                let pattern: Vec<&str> = delete_lines
                    .iter()
                    .map(|a| a.text.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .collect();
                let idx = seek_sequence(&lines, &pattern, cursor).ok_or_else(|| {
                    NeoErr::validation(format!(
                        "Could not locate @DELETE block starting with '{}'",
                        pattern.first().unwrap_or(&"")
                    ))
                })?;
                lines.splice(idx..idx + pattern.len(), std::iter::empty());
                cursor = idx;
            }
        }
    }

    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Ask the secondary model to re-emit the whole corrected file through a
/// `write_file` call and extract its data payload.
async fn fallback_rewrite(
    session: &Session,
    path: &str,
    current_content: &str,
    script: &str,
    failure: &NeoErr,
) -> Result<String> {
    let Some(proxy) = session.proxy() else {
        return Err(NeoErr::AuxiliaryModel(
            "no model endpoint configured for the fallback pass".to_string(),
        ));
    };

    let prompt = format!(
        "You are a specialized file updating assistant. A change script could not be \
         applied to the file '{path}' ({failure}).\n\n\
         Current content of the file:\n```\n{current_content}\n```\n\n\
         The change script that failed to apply:\n```\n{script}\n```\n\n\
         Re-emit the complete updated file with the intended changes applied, as a single \
         command call of the exact form \
         {COMMAND_START}write_file {path}{STDIN_SEPARATOR}<full file contents>{COMMAND_END} \
         with no other text."
    );

    let request = ChatRequest {
        model: proxy.small_model(),
        messages: vec![ApiMessage {
            role: "user".to_string(),
            content: vec![ApiContent::text(prompt, false)],
        }],
        stop: vec![
            neo_protocol::SUCCESS_PREFIX.to_string(),
            neo_protocol::ERROR_PREFIX.to_string(),
        ],
    };

    let response = proxy.chat(&request, session.id()).await?;
    extract_write_file_payload(&response.content).ok_or_else(|| {
        NeoErr::AuxiliaryModel("fallback response did not contain a write_file call".to_string())
    })
}

fn extract_write_file_payload(content: &str) -> Option<String> {
    let start = content.find(COMMAND_START)?;
    let body = &content[start + COMMAND_START.len_utf8()..];
    let body = match body.find(COMMAND_END) {
        Some(end) => &body[..end],
        None => body,
    };
    let (statement, data) = body.split_once(STDIN_SEPARATOR)?;
    statement
        .trim()
        .starts_with("write_file")
        .then(|| data.to_string())
}

/// Applies `@UPDATE`/`@DELETE` change scripts to an existing file, with an
/// auxiliary-model rewrite as the fallback path.
pub struct UpdateFileCommand;

impl UpdateFileCommand {
    fn parse(statement: &str) -> Result<String> {
        let tokens = split_args("update_file", statement)?;
        match tokens.as_slice() {
            [path] => Ok(path.clone()),
            [] => Err(NeoErr::validation("Path argument is required")),
            _ => Err(NeoErr::validation("update_file takes a single path argument")),
        }
    }
}

#[async_trait]
impl Command for UpdateFileCommand {
    fn name(&self) -> &'static str {
        "update_file"
    }

    fn help(&self) -> String {
        "Use the `update_file` command to apply a change script to an existing file.\n\
         \n\
         Usage: \u{25b6}update_file PATH\u{ff5c}Change script\u{25a0}\n\
         \n\
         The change script is a sequence of blocks:\n\
         - `@UPDATE` blocks carry an `@@BEFORE` section listing the lines to replace and an \
         `@@AFTER` section with the replacement, each line written as `<n>:<text>`.\n\
         - `@DELETE` blocks list lines to remove in the same form.\n\
         Blocks are applied in order; if any block fails to match, no change is committed.\n\
         \n\
         Example:\n\
         \u{25b6}update_file src/app.py\u{ff5c}@UPDATE\n@@BEFORE\n3:    return 1\n@@AFTER\n3:    return 2\u{25a0}\n\
         \u{2705}Updated src/app.py (+1 -1)\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_none_or(|d| d.trim().is_empty()) {
            return Err(NeoErr::validation("update_file requires a change script as data"));
        }
        Self::parse(statement).map(|_| ())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        let path = match Self::parse(statement) {
            Ok(path) => path,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let Some(script) = data else {
            return ContentBlock::result_err("update_file requires a change script as data");
        };

        let full_path = match resolve_workspace_path(session.workspace(), &path, false) {
            Ok(full_path) => full_path,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let current = match tokio::fs::read_to_string(&full_path).await {
            Ok(current) => current,
            Err(_) => return ContentBlock::result_err(format!("File not found: {path}")),
        };

        let applied = parse_script(script).and_then(|blocks| apply_script(&current, &blocks));
        let updated = match applied {
            Ok(updated) => updated,
            Err(e) => {
                warn!("change script failed for {path}: {e}; trying fallback model pass");
                match fallback_rewrite(session, &path, &current, script, &e).await {
                    Ok(updated) => {
                        info!("fallback model pass produced a rewrite for {path}");
                        updated
                    }
                    Err(fallback_err) => {
                        return ContentBlock::result_err(format!(
                            "Failed to update {path}: {e} ({fallback_err})"
                        ));
                    }
                }
            }
        };

        if let Err(e) = tokio::fs::write(&full_path, &updated).await {
            return ContentBlock::result_err(format!("Failed to write file: {e}"));
        }

        let (diff, added, removed) = unified_diff(&current, &updated, &path);
        ContentBlock::result_ok(format!("Updated {path} (+{added} -{removed})\n\n{diff}"))
            .with_output(CommandOutput::FileUpdate {
                name: "update_file".to_string(),
                message: "Updated".to_string(),
                diff,
            })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    const FILE: &str = "def main():\n    x = 1\n    return x\n\nprint(main())\n";

    #[test]
    fn parses_update_and_delete_blocks() {
        let script = "@UPDATE\n@@BEFORE\n2:    x = 1\n@@AFTER\n2:    x = 2\n@DELETE\n5:print(main())\n";
        let blocks = parse_script(script).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            ScriptBlock::Update {
                before: vec![AnchorLine {
                    number: 2,
                    text: "    x = 1".to_string()
                }],
                after: vec![AnchorLine {
                    number: 2,
                    text: "    x = 2".to_string()
                }],
            }
        );
    }

    #[test]
    fn rejects_malformed_scripts() {
        assert!(parse_script("").is_err());
        assert!(parse_script("@UPDATE\n1:no before header\n").is_err());
        assert!(parse_script("@UPDATE\n@@BEFORE\n1:a\n").is_err());
        assert!(parse_script("garbage\n").is_err());
        assert!(parse_script("@UPDATE\n@@BEFORE\nnot an anchor\n@@AFTER\n1:a\n").is_err());
    }

    #[test]
    fn applies_update_blocks_in_order() {
        let script = "@UPDATE\n@@BEFORE\n2:    x = 1\n@@AFTER\n2:    x = 2\n2:    y = 3\n";
        let blocks = parse_script(script).unwrap();
        let updated = apply_script(FILE, &blocks).unwrap();
        assert_eq!(
            updated,
            "def main():\n    x = 2\n    y = 3\n    return x\n\nprint(main())\n"
        );
    }

    #[test]
    fn applies_delete_blocks() {
        let script = "@DELETE\n5:print(main())\n";
        let blocks = parse_script(script).unwrap();
        let updated = apply_script(FILE, &blocks).unwrap();
        assert_eq!(updated, "def main():\n    x = 1\n    return x\n\n");
    }

    #[test]
    fn multi_line_before_must_match_contiguously() {
        let script = "@UPDATE\n@@BEFORE\n2:    x = 1\n3:    return x\n@@AFTER\n2:    return 1\n";
        let blocks = parse_script(script).unwrap();
        let updated = apply_script(FILE, &blocks).unwrap();
        assert_eq!(updated, "def main():\n    return 1\n\nprint(main())\n");
    }

    #[test]
    fn anchor_match_ignores_trailing_whitespace() {
        let file = "def main():\n    x = 1  \n    return x\n";
        let script = "@UPDATE\n@@BEFORE\n2:    x = 1\n@@AFTER\n2:    x = 2\n";
        let blocks = parse_script(script).unwrap();
        let updated = apply_script(file, &blocks).unwrap();
        assert_eq!(updated, "def main():\n    x = 2\n    return x\n");
    }

    #[test]
    fn anchor_mismatch_is_fatal_and_uncommitted() {
        let script = "@UPDATE\n@@BEFORE\n2:    x = 99\n@@AFTER\n2:    x = 2\n";
        let blocks = parse_script(script).unwrap();
        assert!(apply_script(FILE, &blocks).is_err());
    }

    #[test]
    fn extracts_write_file_payload_from_fallback_response() {
        let response = format!(
            "Here you go:\n{COMMAND_START}write_file a.py{STDIN_SEPARATOR}new contents{COMMAND_END}"
        );
        assert_eq!(
            extract_write_file_payload(&response),
            Some("new contents".to_string())
        );
        assert_eq!(extract_write_file_payload("no call here"), None);
    }

    #[tokio::test]
    async fn execute_applies_script_and_reports_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), FILE).unwrap();
        let session = crate::session::SessionBuilder::new()
            .session_id("update-file-test")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();

        let script = "@UPDATE\n@@BEFORE\n2:    x = 1\n@@AFTER\n2:    x = 2\n";
        let result = UpdateFileCommand
            .execute(&session, "update_file app.py", Some(script))
            .await;

        assert_eq!(result.result_success(), Some(true));
        assert!(result.model_text().contains("Updated app.py"));
        let content = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert!(content.contains("x = 2"));
    }

    #[tokio::test]
    async fn execute_without_proxy_fails_on_bad_script_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), FILE).unwrap();
        let session = crate::session::SessionBuilder::new()
            .session_id("update-file-nofallback")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();

        let script = "@UPDATE\n@@BEFORE\n2:    nope\n@@AFTER\n2:    x = 2\n";
        let result = UpdateFileCommand
            .execute(&session, "update_file app.py", Some(script))
            .await;

        assert_eq!(result.result_success(), Some(false));
        let content = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert_eq!(content, FILE);
    }
}
