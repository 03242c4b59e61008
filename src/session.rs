use crate::close_on_drop::CloseOnDrop;
use crate::controller::{
    InteractiveProcess, Shutdown, ShutdownOptions, SpawnOptions, default_prompt,
};
use crate::error::SetupError;
use crate::locate::BinaryLocator;
use crate::probe::{ProbeOptions, probe_with};
use crate::pump::LineParsingOptions;
use crate::reader::Pattern;
use regex::Regex;
use std::borrow::Cow;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// Matches the readiness announcement of the server, e.g. `Server running at tcp://127.0.0.1:80`.
pub const DEFAULT_ANNOUNCEMENT: &str =
    r"(?i)Server\s+running\s+at\s+(?P<endpoint>tcp://(?P<host>[0-9.]+):(?P<port>\d+))";

static ANNOUNCEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_ANNOUNCEMENT).expect("valid announcement regex"));

/// Port probed when the server does not announce where it listens.
pub const DEFAULT_FALLBACK_PORT: u16 = 24737;

/// How to start the server and decide that it is ready.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_binary: PathBuf,
    pub server_args: Vec<OsString>,

    /// Line announcing the endpoint. Must define the named groups `host` and `port`. An
    /// `endpoint` group is used as the announced endpoint if present.
    ///
    /// default: [DEFAULT_ANNOUNCEMENT]
    pub announcement: Regex,

    /// How long to wait for the announcement.
    ///
    /// default: 10 s
    pub announce_timeout: Duration,

    /// How long the announced endpoint may take to accept connections.
    ///
    /// default: 4 s
    pub announced_probe_timeout: Duration,

    /// default: `127.0.0.1`
    pub fallback_host: String,

    /// default: [DEFAULT_FALLBACK_PORT]
    pub fallback_port: u16,

    /// How long the fallback endpoint may take to accept connections.
    ///
    /// default: 8 s
    pub fallback_probe_timeout: Duration,

    /// How long the server may take to exit after being asked to terminate, before it is killed.
    ///
    /// default: 5 s
    pub teardown_timeout: Duration,

    pub probe: ProbeOptions,
    pub line_parsing: LineParsingOptions,
}

impl SessionConfig {
    pub fn new(server_binary: impl Into<PathBuf>) -> Self {
        Self {
            server_binary: server_binary.into(),
            server_args: Vec::new(),
            announcement: ANNOUNCEMENT.clone(),
            announce_timeout: Duration::from_secs(10),
            announced_probe_timeout: Duration::from_secs(4),
            fallback_host: String::from("127.0.0.1"),
            fallback_port: DEFAULT_FALLBACK_PORT,
            fallback_probe_timeout: Duration::from_secs(8),
            teardown_timeout: Duration::from_secs(5),
            probe: ProbeOptions::default(),
            line_parsing: LineParsingOptions::default(),
        }
    }

    /// Locates the binary called `server` using [BinaryLocator::from_env].
    pub fn from_env() -> Result<Self, SetupError> {
        BinaryLocator::from_env().locate("server").map(Self::new)
    }

    pub fn server_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn fallback(mut self, host: impl Into<String>, port: u16) -> Self {
        self.fallback_host = host.into();
        self.fallback_port = port;
        self
    }
}

/// How to start one client of the session.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub name: Cow<'static, str>,
    pub binary: PathBuf,

    /// Arguments placed before `--address <host> --port <port>`.
    pub args: Vec<OsString>,

    /// Text the client prints on startup, before its first prompt.
    ///
    /// default: `Client started`
    pub banner: Cow<'static, str>,

    /// default: 5 s
    pub banner_timeout: Duration,

    /// default: `>>\s`
    pub prompt: Pattern,

    pub shutdown: ShutdownOptions,
}

impl ClientSpec {
    pub fn new(name: impl Into<Cow<'static, str>>, binary: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            banner: Cow::Borrowed("Client started"),
            banner_timeout: Duration::from_secs(5),
            prompt: default_prompt(),
            shutdown: ShutdownOptions::default(),
        }
    }

    /// Locates the binary called `name` and names the client after it.
    pub fn locate(name: &'static str, locator: &BinaryLocator) -> Result<Self, SetupError> {
        locator.locate(name).map(|binary| Self::new(name, binary))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn banner(mut self, banner: impl Into<Cow<'static, str>>) -> Self {
        self.banner = banner.into();
        self
    }

    pub fn banner_timeout(mut self, banner_timeout: Duration) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }

    pub fn prompt(mut self, prompt: Pattern) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// A running server that accepts connections, plus what is needed to connect clients to it.
///
/// The server is terminated on [Session::teardown]. A session dropped without teardown still
/// terminates its server, given a multithreaded tokio runtime (see [CloseOnDrop]).
#[derive(Debug)]
pub struct Session {
    server: CloseOnDrop,
    host: String,
    port: u16,
    endpoint: String,
    announced: bool,
    line_parsing: LineParsingOptions,
}

struct Announcement {
    endpoint: String,
    host: String,
    port: u16,
}

impl Session {
    /// Starts the server and waits until it accepts connections.
    pub async fn start(config: SessionConfig) -> Result<Self, SetupError> {
        let mut cmd = Command::new(&config.server_binary);
        cmd.args(&config.server_args);
        let mut server = InteractiveProcess::spawn_with(
            "server",
            cmd,
            SpawnOptions::default()
                .line_parsing(config.line_parsing)
                .shutdown(ShutdownOptions {
                    exit_command: None,
                    exit_timeout: Duration::ZERO,
                    terminate_timeout: config.teardown_timeout,
                    ..Default::default()
                }),
        )?;

        let announcement = Pattern::Regex(config.announcement.clone());
        let awaited = server
            .await_pattern(&announcement, config.announce_timeout)
            .await;
        let parsed = parse_announcement(&config.announcement, awaited.output());

        let session = match parsed {
            Some(Announcement {
                endpoint,
                host,
                port,
            }) => {
                tracing::debug!(%endpoint, "Server announced its endpoint");
                if !probe_with(&host, port, config.announced_probe_timeout, config.probe).await {
                    server.kill(ShutdownOptions::default().kill_timeout).await;
                    return Err(SetupError::EndpointNotOpen {
                        endpoint,
                        timeout: config.announced_probe_timeout,
                        transcript: server.transcript().dump(),
                    });
                }
                Self {
                    server: server.close_on_drop(),
                    host,
                    port,
                    endpoint,
                    announced: true,
                    line_parsing: config.line_parsing,
                }
            }
            None => {
                let host = config.fallback_host;
                let port = config.fallback_port;
                tracing::debug!(
                    status = ?awaited.status(),
                    %host,
                    port,
                    "Server did not announce its endpoint, probing fallback"
                );
                if !probe_with(&host, port, config.fallback_probe_timeout, config.probe).await {
                    server.kill(ShutdownOptions::default().kill_timeout).await;
                    return Err(SetupError::ServerNotReady {
                        host,
                        port,
                        transcript: server.transcript().dump(),
                    });
                }
                Self {
                    server: server.close_on_drop(),
                    endpoint: format!("tcp://{host}:{port}"),
                    host,
                    port,
                    announced: false,
                    line_parsing: config.line_parsing,
                }
            }
        };

        tracing::info!(endpoint = %session.endpoint, "Server is ready");
        Ok(session)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `tcp://<host>:<port>`, as announced by the server if it did.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the endpoint was announced by the server, rather than being the fallback.
    pub fn announced(&self) -> bool {
        self.announced
    }

    pub fn server(&self) -> &InteractiveProcess {
        &self.server
    }

    /// Mutable access to the server, e.g. to await some of its log output.
    pub fn server_mut(&mut self) -> &mut InteractiveProcess {
        &mut self.server
    }

    /// Starts a client connected to this session and waits for its startup banner.
    ///
    /// The client is closed once the returned handle is dropped.
    pub async fn spawn_client(&self, spec: &ClientSpec) -> Result<CloseOnDrop, SetupError> {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .arg("--address")
            .arg(&self.host)
            .arg("--port")
            .arg(self.port.to_string());

        let mut client = InteractiveProcess::spawn_with(
            spec.name.clone(),
            cmd,
            SpawnOptions::default()
                .prompt(spec.prompt.clone())
                .line_parsing(self.line_parsing)
                .shutdown(spec.shutdown.clone()),
        )?;

        let banner = client.await_prompt(spec.banner_timeout).await;
        if !banner.contains(&spec.banner) {
            client.close().await;
            return Err(SetupError::ClientBannerMissing {
                process_name: spec.name.clone(),
                banner: spec.banner.clone(),
                timeout: spec.banner_timeout,
                transcript: client.transcript().dump(),
            });
        }

        tracing::debug!(process = %spec.name, endpoint = %self.endpoint, "Client started");
        Ok(client.close_on_drop())
    }

    /// Terminates the server, killing it if it does not exit within the teardown timeout.
    pub async fn teardown(mut self) -> Shutdown {
        let shutdown = self.server.close().await;
        tracing::info!(endpoint = %self.endpoint, ?shutdown, "Server torn down");
        shutdown
    }
}

fn parse_announcement(announcement: &Regex, output: &str) -> Option<Announcement> {
    let captures = announcement.captures(output)?;
    let host = captures.name("host")?.as_str().to_owned();
    let port = match captures.name("port")?.as_str().parse::<u16>() {
        Ok(port) => port,
        Err(err) => {
            tracing::warn!(error = %err, "Server announced an invalid port");
            return None;
        }
    };
    let endpoint = match captures.name("endpoint") {
        Some(endpoint) => endpoint.as_str().to_owned(),
        None => format!("tcp://{host}:{port}"),
    };
    Some(Announcement {
        endpoint,
        host,
        port,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::controller::ShutdownStage;
    use crate::reader::AwaitStatus;
    use assertr::prelude::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn closed_port() -> u16 {
        listener().await.1
    }

    fn sh_server(script: String) -> SessionConfig {
        let mut config = SessionConfig::new("sh").server_args(["-c".to_owned(), script]);
        config.announce_timeout = Duration::from_millis(500);
        config.announced_probe_timeout = Duration::from_millis(300);
        config.fallback_probe_timeout = Duration::from_millis(300);
        config.teardown_timeout = Duration::from_secs(2);
        config
    }

    /// Prints the banner and prompt, reports its connection arguments, then waits for `exit`.
    const CLIENT: &str = r#"
        printf 'Client started. Connecting to %s:%s\n>> ' "$2" "$4"
        while read line; do
            if [ "$line" = "exit" ]; then exit 0; fi
            printf 'echo %s\n>> ' "$line"
        done
    "#;

    fn sh_client(script: &str) -> ClientSpec {
        ClientSpec::new("client", "sh")
            .args(["-c", script, "client"])
            .banner_timeout(Duration::from_secs(2))
    }

    #[test]
    fn parses_announcement_case_insensitively() {
        let regex = SessionConfig::new("server").announcement;

        let parsed = parse_announcement(
            &regex,
            "starting up\nSERVER RUNNING AT tcp://10.0.0.7:4242\n",
        )
        .unwrap();

        assert_that(parsed.endpoint).is_equal_to("tcp://10.0.0.7:4242");
        assert_that(parsed.host).is_equal_to("10.0.0.7");
        assert_that(parsed.port).is_equal_to(4242);
    }

    #[test]
    fn rejects_out_of_range_port() {
        let regex = Regex::new(DEFAULT_ANNOUNCEMENT).unwrap();

        let parsed = parse_announcement(&regex, "Server running at tcp://127.0.0.1:99999");

        assert_that(parsed.is_none()).is_true();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn starts_on_announced_endpoint() {
        let (_listener, port) = listener().await;
        let config = sh_server(format!(
            "echo 'Server running at tcp://127.0.0.1:{port}'; exec sleep 30"
        ));

        let session = Session::start(config).await.unwrap();

        assert_that(session.announced()).is_true();
        assert_that(session.host()).is_equal_to("127.0.0.1");
        assert_that(session.port()).is_equal_to(port);
        assert_that(session.endpoint()).is_equal_to(format!("tcp://127.0.0.1:{port}").as_str());

        let shutdown = session.teardown().await;
        assert_that(shutdown.stage).is_equal_to(ShutdownStage::Terminate);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn falls_back_when_server_stays_silent() {
        let (_listener, port) = listener().await;
        let config = sh_server("exec sleep 30".to_owned()).fallback("127.0.0.1", port);

        let session = Session::start(config).await.unwrap();

        assert_that(session.announced()).is_false();
        assert_that(session.port()).is_equal_to(port);
        assert_that(session.endpoint()).is_equal_to(format!("tcp://127.0.0.1:{port}").as_str());
        session.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fails_when_announced_endpoint_never_opens() {
        let port = closed_port().await;
        let config = sh_server(format!(
            "echo 'Server running at tcp://127.0.0.1:{port}'; exec sleep 30"
        ));

        let err = Session::start(config).await.unwrap_err();

        assert_that(matches!(err, SetupError::EndpointNotOpen { .. })).is_true();
        let announced = format!("Server running at tcp://127.0.0.1:{port}");
        assert_that(err.to_string()).contains(announced.as_str());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fails_when_fallback_never_opens() {
        let port = closed_port().await;
        let config = sh_server("echo 'booting...'; exec sleep 30".to_owned())
            .fallback("127.0.0.1", port);

        let err = Session::start(config).await.unwrap_err();

        assert_that(matches!(err, SetupError::ServerNotReady { .. })).is_true();
        assert_that(err.to_string()).contains("booting...");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawns_client_with_connection_arguments() {
        let (_listener, port) = listener().await;
        let session = Session::start(sh_server(format!(
            "echo 'Server running at tcp://127.0.0.1:{port}'; exec sleep 30"
        )))
        .await
        .unwrap();

        let mut client = session.spawn_client(&sh_client(CLIENT)).await.unwrap();
        let connecting = format!("Connecting to 127.0.0.1:{port}");
        assert_that(client.transcript().dump()).contains(connecting.as_str());

        client.send_line("hello").await.unwrap();
        let response = client.await_prompt(Duration::from_secs(2)).await;
        assert_that(response.status()).is_equal_to(AwaitStatus::Matched);
        assert_that(response.output()).is_equal_to("echo hello\n>> ");

        drop(client);
        session.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fails_when_client_banner_is_missing() {
        let (_listener, port) = listener().await;
        let session = Session::start(sh_server(format!(
            "echo 'Server running at tcp://127.0.0.1:{port}'; exec sleep 30"
        )))
        .await
        .unwrap();

        let spec = sh_client("printf 'Connection refused\\n>> '; exec sleep 30");
        let err = session.spawn_client(&spec).await.unwrap_err();

        assert_that(matches!(err, SetupError::ClientBannerMissing { .. })).is_true();
        assert_that(err.to_string()).contains("Connection refused");
        session.teardown().await;
    }
}
