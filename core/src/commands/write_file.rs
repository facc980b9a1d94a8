use async_trait::async_trait;
use neo_protocol::CommandOutput;
use neo_protocol::ContentBlock;

use crate::command::Command;
use crate::commands::split_args;
use crate::commands::unified_diff;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::resolve_workspace_path;

/// Writes a file from the data payload, creating parent directories and
/// overwriting any existing content. The result carries a `FileUpdate`
/// payload with a unified diff against the previous content.
pub struct WriteFileCommand;

impl WriteFileCommand {
    fn parse(statement: &str) -> Result<String> {
        let tokens = split_args("write_file", statement)?;
        match tokens.as_slice() {
            [path] => Ok(path.clone()),
            [] => Err(NeoErr::validation("Path argument is required")),
            _ => Err(NeoErr::validation("write_file takes a single path argument")),
        }
    }
}

#[async_trait]
impl Command for WriteFileCommand {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn help(&self) -> String {
        "Use the `write_file` command to create or overwrite a file with the provided content.\n\
         \n\
         Usage: \u{25b6}write_file PATH\u{ff5c}File contents\u{25a0}\n\
         \n\
         - PATH (required): Path of the file to write, relative to the workspace.\n\
         - Parent directories are created as needed; existing files are overwritten.\n\
         \n\
         Example:\n\
         \u{25b6}write_file src/hello.py\u{ff5c}print(\"hello\")\u{25a0}\n\
         \u{2705}Created src/hello.py (+1 -0)\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_none() {
            return Err(NeoErr::validation("write_file requires file content as data"));
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
        let Some(content) = data else {
            return ContentBlock::result_err("write_file requires file content as data");
        };

        let full_path = match resolve_workspace_path(session.workspace(), &path, false) {
            Ok(full_path) => full_path,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let previous = tokio::fs::read_to_string(&full_path).await.ok();
        let message = if previous.is_some() { "Updated" } else { "Created" };

        if let Some(parent) = full_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return ContentBlock::result_err(format!("Failed to create parent directories: {e}"));
        }
        if let Err(e) = tokio::fs::write(&full_path, content).await {
            return ContentBlock::result_err(format!("Failed to write file: {e}"));
        }

        let (diff, added, removed) =
            unified_diff(previous.as_deref().unwrap_or(""), content, &path);

        ContentBlock::result_ok(format!("{message} {path} (+{added} -{removed})\n\n{diff}"))
            .with_output(CommandOutput::FileUpdate {
                name: "write_file".to_string(),
                message: message.to_string(),
                diff,
            })
    }
}
