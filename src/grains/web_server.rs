//! Web server grain: serves a static site from inside the sandbox

use crate::config::WebServerConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::{Grain, Sandbox};
use crate::utils::exec::resolve_program;
use crate::utils::fs::copy_dir_all;
use crate::utils::net::available_ports;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Attribute name used by [`UseWebServer`]
pub const WEB_SERVER: &str = "web_server";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Protocol of a site binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP
    Http,
    /// HTTP over TLS
    Https,
}

impl Protocol {
    /// Scheme name
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Argument placeholder receiving this protocol's port
    pub fn placeholder(&self) -> &'static str {
        match self {
            Protocol::Http => "{port}",
            Protocol::Https => "{https_port}",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running server as seen by tests
#[derive(Debug, Clone)]
pub struct WebServer {
    site_name: String,
    root: PathBuf,
    bindings: Vec<(Protocol, u16)>,
    pid: Option<u32>,
}

impl WebServer {
    /// Site name, `sandbox_{id}`
    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    /// Directory the site is served from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Protocol and port of every binding, in protocol order
    pub fn bindings(&self) -> &[(Protocol, u16)] {
        &self.bindings
    }

    /// Server process id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reachable endpoints, `{protocol}://localhost:{port}`
    pub fn endpoints(&self) -> Vec<String> {
        self.bindings
            .iter()
            .map(|(protocol, port)| format!("{}://localhost:{}", protocol, port))
            .collect()
    }
}

struct RunningServer {
    server: WebServer,
    child: Child,
}

/// Copies a source directory into the sandbox and serves it with a local
/// server process for the lifetime of the sandbox.
pub struct WebServerGrain {
    source: Option<PathBuf>,
    protocols: Vec<Protocol>,
    config: WebServerConfig,
    running: Mutex<Option<RunningServer>>,
}

impl WebServerGrain {
    /// Grain with default settings, serving over http
    pub fn new() -> Self {
        Self::with_config(WebServerConfig::default())
    }

    /// Grain with explicit settings
    pub fn with_config(config: WebServerConfig) -> Self {
        Self {
            source: None,
            protocols: vec![Protocol::Http],
            config,
            running: Mutex::new(None),
        }
    }

    /// Directory to serve
    pub fn set_source(&mut self, source: impl Into<PathBuf>) -> &mut Self {
        self.source = Some(source.into());
        self
    }

    /// Configured source directory
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Enable or disable the http binding
    pub fn use_http(&mut self, enabled: bool) -> &mut Self {
        self.toggle(Protocol::Http, enabled)
    }

    /// Enable or disable the https binding
    pub fn use_https(&mut self, enabled: bool) -> &mut Self {
        self.toggle(Protocol::Https, enabled)
    }

    fn toggle(&mut self, protocol: Protocol, enabled: bool) -> &mut Self {
        self.protocols.retain(|p| *p != protocol);
        if enabled {
            self.protocols.push(protocol);
        }
        self
    }

    /// Enabled protocols, in binding order
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Settings
    pub fn config(&self) -> &WebServerConfig {
        &self.config
    }

    /// Mutable settings; only meaningful before setup
    pub fn config_mut(&mut self) -> &mut WebServerConfig {
        &mut self.config
    }

    /// The running server, `None` before setup and after disposal
    pub fn instance(&self) -> Option<WebServer> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.server.clone())
    }

    /// Endpoints of the running server
    pub fn endpoints(&self) -> Vec<String> {
        self.instance()
            .map(|server| server.endpoints())
            .unwrap_or_default()
    }

    fn allocate_bindings(&self) -> Result<Vec<(Protocol, u16)>> {
        if self.protocols.is_empty() {
            return Err(SandboxError::Config(
                "at least one protocol is required for the web server".to_string(),
            ));
        }

        // every enabled protocol must reach the server through its placeholder
        if let Some(unused) = self
            .protocols
            .iter()
            .find(|protocol| !self.config.args.iter().any(|arg| arg.contains(protocol.placeholder())))
        {
            return Err(SandboxError::Config(format!(
                "{} is enabled but no server argument contains {}",
                unused,
                unused.placeholder()
            )));
        }

        let mut free = available_ports(self.protocols.len())?.into_iter();
        self.protocols
            .iter()
            .map(|protocol| {
                let port = match (protocol, self.config.https_port) {
                    (Protocol::Https, Some(port)) => Some(port),
                    _ => free.next(),
                };
                port.map(|port| (*protocol, port))
                    .ok_or_else(|| SandboxError::Other("ran out of allocated ports".to_string()))
            })
            .collect()
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<RunningServer> {
        let source = self
            .source
            .as_deref()
            .filter(|source| source.is_dir())
            .ok_or_else(|| {
                SandboxError::Config("a source directory is required for the web server".to_string())
            })?;

        let root = sandbox.location().join(&self.config.site_dir);
        let copied = copy_dir_all(source, &root)?;
        debug!("Copied {} files into {}", copied, root.display());

        let bindings = self.allocate_bindings()?;
        let site_name = format!("sandbox_{}", sandbox.id());
        let program = resolve_program(&self.config.program)?;
        let args = render_args(&self.config.args, &root, &bindings, &site_name);

        debug!("Starting {} {:?}", program.display(), args);
        let mut child = Command::new(&program)
            .args(&args)
            .envs(&self.config.env)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Process(format!("failed to start {}: {}", program.display(), e))
            })?;

        let lines = pump_output(&mut child);
        let ports: Vec<u16> = bindings.iter().map(|(_, port)| *port).collect();
        let ready = async {
            match self.config.ready_message.as_deref() {
                Some(message) => wait_for_message(&mut child, lines, message).await,
                None => wait_for_ports(&mut child, &ports).await,
            }
        };

        let timeout = self.config.startup_timeout();
        let outcome = match tokio::time::timeout(timeout, ready).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(format!(
                "{} was not ready within {:?}",
                site_name, timeout
            ))),
        };

        if let Err(e) = outcome {
            let _ = child.kill().await;
            return Err(e);
        }

        let server = WebServer {
            site_name,
            root,
            bindings,
            pid: child.id(),
        };
        info!("Web server {} ready at {:?}", server.site_name, server.endpoints());

        Ok(RunningServer { server, child })
    }

    async fn stop(&self, mut running: RunningServer) -> Result<()> {
        let name = running.server.site_name.clone();
        if running.child.try_wait()?.is_some() {
            debug!("Web server {} already exited", name);
            return Ok(());
        }

        request_shutdown(&running.child);

        let grace = self.config.shutdown_grace();
        match tokio::time::timeout(grace, running.child.wait()).await {
            Ok(status) => {
                debug!("Web server {} exited with {}", name, status?);
                Ok(())
            }
            Err(_) => {
                warn!("Web server {} ignored shutdown for {:?}, killing", name, grace);
                running.child.kill().await.map_err(|e| {
                    SandboxError::Process(format!("failed to kill web server {}: {}", name, e))
                })
            }
        }
    }
}

impl Default for WebServerGrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grain for WebServerGrain {
    async fn setup(&self, sandbox: &Sandbox) -> Result<()> {
        if self.instance().is_some() {
            debug!("Web server already running, skipping setup");
            return Ok(());
        }

        let running = self.start(sandbox).await?;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match running {
            Some(running) => self.stop(running).await,
            None => Ok(()),
        }
    }
}

/// Substitute `{root}`, `{port}`, `{https_port}` and `{site}` in each argument
pub fn render_args(
    template: &[String],
    root: &Path,
    bindings: &[(Protocol, u16)],
    site_name: &str,
) -> Vec<String> {
    let port_of = |wanted: Protocol| {
        bindings
            .iter()
            .find(|(protocol, _)| *protocol == wanted)
            .map(|(_, port)| port.to_string())
    };
    let port = port_of(Protocol::Http).unwrap_or_default();
    let https_port = port_of(Protocol::Https).unwrap_or_default();
    let root = root.display().to_string();

    template
        .iter()
        .map(|arg| {
            arg.replace("{root}", &root)
                .replace("{https_port}", &https_port)
                .replace("{port}", &port)
                .replace("{site}", site_name)
        })
        .collect()
}

/// Forward both output streams line by line into one channel, logging each line
fn pump_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    if let Some(stdout) = child.stdout.take() {
        spawn_reader("stdout", stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader("stderr", stderr, tx);
    }

    rx
}

fn spawn_reader<R>(label: &'static str, stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("  [{}]\t{}", label, line);
            // receiver is gone once the server is ready; keep draining the pipe
            let _ = tx.send(line);
        }
    });
}

async fn wait_for_message(
    child: &mut Child,
    mut lines: mpsc::UnboundedReceiver<String>,
    message: &str,
) -> Result<()> {
    let wanted = message.to_lowercase();
    while let Some(line) = lines.recv().await {
        if line.to_lowercase().contains(&wanted) {
            return Ok(());
        }
    }

    let status = child.wait().await?;
    Err(SandboxError::Process(format!(
        "web server exited with {} before reporting '{}'",
        status, message
    )))
}

/// Wait until every port accepts a connection
async fn wait_for_ports(child: &mut Child, ports: &[u16]) -> Result<()> {
    for &port in ports {
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                debug!("Port {} is accepting connections", port);
                break;
            }
            if let Some(status) = child.try_wait()? {
                return Err(SandboxError::Process(format!(
                    "web server exited with {} before listening on port {}",
                    status, port
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn request_shutdown(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_shutdown(_child: &Child) {}

/// Attach a [`WebServerGrain`] to a sandbox under [`WEB_SERVER`]
pub trait UseWebServer: Sized {
    /// Serve `source` over http
    fn use_web_server(self, source: impl Into<PathBuf>) -> Self;

    /// Configure the grain before it is attached
    fn use_web_server_with<F>(self, configure: F) -> Self
    where
        F: FnOnce(&Sandbox, &mut WebServerGrain);
}

impl UseWebServer for Sandbox {
    fn use_web_server(self, source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        self.use_web_server_with(move |_, grain| {
            grain.set_source(source);
        })
    }

    fn use_web_server_with<F>(self, configure: F) -> Self
    where
        F: FnOnce(&Sandbox, &mut WebServerGrain),
    {
        let mut grain = WebServerGrain::new();
        configure(&self, &mut grain);
        self.with_grain(WEB_SERVER, grain)
    }
}
