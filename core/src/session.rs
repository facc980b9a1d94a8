//! The session: the per-user runtime value binding an id, a workspace, the
//! shell registry, the upstream proxy, the clock and the structured logger.
//! Components hold cheap clones of the session handle and read what they
//! need from it; nothing retains a session past its own lifetime.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::info;

use crate::agent::Agent;
use crate::client::Client;
use crate::client::Proxy;
use crate::client::proxy_from_env;
use crate::clock::RealClock;
use crate::clock::SharedClock;
use crate::command::CommandRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::flags;
use crate::shells::ShellManager;
use crate::structured_log::StructuredLogger;

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    name: Option<String>,
    workspace: PathBuf,
    neo_home: PathBuf,
    config: Config,
    clock: SharedClock,
    shells: ShellManager,
    logger: StructuredLogger,
    proxy: OnceLock<Arc<dyn Proxy>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn workspace(&self) -> &Path {
        &self.inner.workspace
    }

    /// The agent's private scratch directory, `<NEO_HOME>/<session_id>`.
    pub fn internal_session_dir(&self) -> PathBuf {
        self.inner.neo_home.join(&self.inner.id)
    }

    pub fn neo_home(&self) -> &Path {
        &self.inner.neo_home
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn shells(&self) -> &ShellManager {
        &self.inner.shells
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.inner.logger
    }

    /// The upstream proxy, when one has been wired in. Sessions built for
    /// offline tests may not have one.
    pub fn proxy(&self) -> Option<Arc<dyn Proxy>> {
        self.inner.proxy.get().map(Arc::clone)
    }

    pub(crate) fn set_proxy(&self, proxy: Arc<dyn Proxy>) {
        let _ = self.inner.proxy.set(proxy);
    }

    /// Terminate every shell owned by this session.
    pub async fn teardown(&self) {
        self.inner.shells.terminate_all().await;
        info!("session {} torn down", self.inner.id);
    }
}

/// Fluent builder wiring a session together: shells, registry, client and
/// agent, in dependency order.
#[derive(Default)]
pub struct SessionBuilder {
    session_id: Option<String>,
    session_name: Option<String>,
    workspace: Option<PathBuf>,
    neo_home: Option<PathBuf>,
    config: Option<Config>,
    clock: Option<SharedClock>,
    proxy: Option<Arc<dyn Proxy>>,
    ephemeral: bool,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn session_name(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn neo_home(mut self, neo_home: impl Into<PathBuf>) -> Self {
        self.neo_home = Some(neo_home.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn proxy(mut self, proxy: Arc<dyn Proxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Ephemeral sessions keep agent state in memory only.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    fn generate_session_id() -> String {
        chrono::Local::now().format("session-%m%d-%H%M%S").to_string()
    }

    /// Build the bare session value without a client or agent. Useful for
    /// tests that exercise commands directly.
    pub fn build(self) -> Session {
        let id = self.session_id.unwrap_or_else(Self::generate_session_id);
        let workspace = self
            .workspace
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let neo_home = self.neo_home.unwrap_or_else(flags::neo_home);
        let config = self.config.unwrap_or_default();
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(RealClock));

        let session_dir = neo_home.join(&id);
        let shells = ShellManager::new(session_dir.clone(), Arc::clone(&clock), config.shell.clone());
        let logger = StructuredLogger::new(session_dir, "requests");

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                name: self.session_name,
                workspace,
                neo_home,
                config,
                clock,
                shells,
                logger,
                proxy: OnceLock::new(),
            }),
        };
        if let Some(proxy) = self.proxy {
            session.set_proxy(proxy);
        }
        session
    }

    /// Build the session and wire up the full engine: command registry,
    /// client and agent.
    pub fn initialize(mut self) -> Result<(Session, Agent)> {
        let ephemeral = self.ephemeral;
        let proxy = self.proxy.take();
        let session = self.build();

        let proxy = match proxy {
            Some(proxy) => proxy,
            None => proxy_from_env(session.logger().clone())?,
        };
        session.set_proxy(Arc::clone(&proxy));

        let registry = Arc::new(CommandRegistry::with_builtin_commands());
        let client = Client::new(proxy, Arc::clone(&registry));
        let agent = Agent::new(session.clone(), client, registry, ephemeral)?;

        info!("session {} initialized", session.id());
        Ok((session, agent))
    }
}
