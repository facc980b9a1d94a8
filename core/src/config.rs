use serde::Deserialize;

/// Tunables for the agent state machine and the shell manager. Every field
/// has a default so hosts can override selectively.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between checkpoints, in number of messages since the last
    /// checkpoint marker.
    pub checkpoint_interval: usize,

    pub head_truncation: HeadTruncation,

    pub shell: ShellConfig,

    /// Cap on validation-and-retry round trips per model turn.
    pub max_validation_retries: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeadTruncation {
    /// Number of messages at which the head of the conversation is pruned.
    pub trigger_threshold: usize,

    /// Number of messages to keep after pruning.
    pub retention: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// How long `shell_run` blocks waiting for the end marker before
    /// returning with a still-running annotation, in seconds.
    pub command_timeout: f64,

    /// Grace period between SIGTERM and SIGKILL, in seconds.
    pub terminate_grace: f64,

    /// Cap on lines returned from a command execution window.
    pub max_output_lines: usize,

    /// Cap on lines returned by `shell_view`.
    pub view_tail_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint_interval: 40,
            head_truncation: HeadTruncation::default(),
            shell: ShellConfig::default(),
            max_validation_retries: 3,
        }
    }
}

impl Default for HeadTruncation {
    fn default() -> Self {
        Self {
            trigger_threshold: 100,
            retention: 70,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command_timeout: 2.0,
            terminate_grace: 1.0,
            max_output_lines: 100,
            view_tail_lines: 50,
        }
    }
}
