use async_trait::async_trait;
use neo_protocol::ContentBlock;
use serde_json::Value;

use crate::command::Command;
use crate::commands::flag_value;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;

/// Emits a structured output: the data payload routed to a named
/// destination. Terminates the current agent step.
pub struct OutputCommand;

impl OutputCommand {
    fn parse(statement: &str) -> Result<String> {
        let tokens = split_args("output", statement)?;
        let mut destination = "default".to_string();
        let mut it = tokens.iter();
        while let Some(token) = it.next() {
            match token.as_str() {
                "-d" | "--destination" => {
                    destination = flag_value("--destination", it.next())?;
                }
                other => {
                    return Err(NeoErr::validation(format!("Unexpected argument: {other}")));
                }
            }
        }
        Ok(destination)
    }
}

#[async_trait]
impl Command for OutputCommand {
    fn name(&self) -> &'static str {
        "output"
    }

    fn help(&self) -> String {
        "Use the `output` command to return structured data when it has been requested.\n\
         \n\
         Usage: \u{25b6}output [-d DESTINATION]\u{ff5c}Payload\u{25a0}\n\
         \n\
         - d/destination: Output destination. Defaults to `default`.\n\
         - The payload must conform to the output schema supplied with the request.\n\
         \n\
         Examples:\n\
         \u{25b6}output\u{ff5c}42\u{25a0}\n\
         \u{2705}Successfully processed output.\u{25a0}\n\
         \n\
         \u{25b6}output -d checkpoint\u{ff5c}{\"x\": 1}\u{25a0}\n\
         \u{2705}Successfully processed output.\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_none() {
            return Err(NeoErr::validation("output requires a data payload"));
        }
        Self::parse(statement).map(|_| ())
    }

    async fn execute(
        &self,
        _session: &Session,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        let destination = match Self::parse(statement) {
            Ok(destination) => destination,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let Some(data) = data else {
            return ContentBlock::result_err("output requires a data payload");
        };

        ContentBlock::structured_output(
            "Successfully processed output.",
            Value::String(data.to_string()),
            destination,
        )
    }
}
