use std::time::Duration;

use async_trait::async_trait;
use neo_protocol::ContentBlock;

use crate::command::Command;
use crate::commands::flag_value;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;

const DEFAULT_DURATION: i64 = 5;

/// Sleeps via the session clock.
pub struct WaitCommand;

impl WaitCommand {
    fn parse(statement: &str) -> Result<i64> {
        let tokens = split_args("wait", statement)?;
        let mut duration = DEFAULT_DURATION;
        let mut it = tokens.iter();
        while let Some(token) = it.next() {
            match token.as_str() {
                "--duration" => duration = flag_value("--duration", it.next())?,
                other => {
                    return Err(NeoErr::validation(format!("Unexpected argument: {other}")));
                }
            }
        }
        Ok(duration)
    }
}

#[async_trait]
impl Command for WaitCommand {
    fn name(&self) -> &'static str {
        "wait"
    }

    fn help(&self) -> String {
        "Use the `wait` command to sleep for a specified number of seconds.\n\
         \n\
         Usage: \u{25b6}wait [--duration SECONDS]\u{25a0}\n\
         \n\
         - duration: Number of seconds to sleep for. Defaults to 5 seconds.\n\
         \n\
         Example:\n\
         \u{25b6}wait --duration 10\u{25a0}\n\
         \u{2705}Waited for 10 seconds\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, _data: Option<&str>) -> Result<()> {
        let duration = Self::parse(statement)?;
        if duration < 0 {
            return Err(NeoErr::validation(
                "Error: Duration must be a non-negative number",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        if let Err(e) = self.validate(session, statement, data) {
            return ContentBlock::result_err(e.to_string());
        }
        let duration = match Self::parse(statement) {
            Ok(duration) => duration,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        session
            .clock()
            .sleep(Duration::from_secs(duration as u64))
            .await;
        ContentBlock::result_ok(format!("Waited for {duration} seconds"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::FakeClock;
    use crate::session::SessionBuilder;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_sleeps_on_the_session_clock() {
        let clock = Arc::new(FakeClock::new(0.0));
        let dir = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .session_id("wait-test")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .clock(clock.clone())
            .build();

        let task = tokio::spawn(async move {
            WaitCommand.execute(&session, "wait --duration 10", None).await
        });

        assert!(clock.await_sleepers(1, Duration::from_secs(2)).await);
        clock.advance(Duration::from_secs(10));
        let result = task.await.unwrap();
        assert_eq!(result, ContentBlock::result_ok("Waited for 10 seconds"));
    }

    #[tokio::test]
    async fn negative_duration_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .session_id("wait-validate")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();
        assert!(
            WaitCommand
                .validate(&session, "wait --duration -1", None)
                .is_err()
        );
        assert!(WaitCommand.validate(&session, "wait", None).is_ok());
    }
}
