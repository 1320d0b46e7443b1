use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunnel multiplexer configuration.
///
/// The default configuration forwards to any destination. Use [`TunmuxConfig::restricted`]
/// to only allow the port-forward destinations matching a [`FilteringRule`].
#[derive(Debug, Clone)]
pub struct TunmuxConfig {
    /// Rule port-forward destinations must obey.
    pub filtering: FilteringRule,
    /// Maximum number of bytes read from a shell output at once, i.e. the largest data frame
    /// emitted for a shell tunnel.
    pub read_buffer_size: usize,
    /// Time allowed to establish the TCP connection of a port-forward.
    pub connect_timeout: Duration,
    pub shell: ShellConfig,
}

impl Default for TunmuxConfig {
    fn default() -> Self {
        Self {
            filtering: FilteringRule::Allow,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shell: ShellConfig::default(),
        }
    }
}

impl TunmuxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only port-forwards matching `rule` are accepted.
    pub fn restricted(rule: FilteringRule) -> Self {
        Self {
            filtering: rule,
            ..Self::default()
        }
    }

    /// Port-forwarding is disabled entirely.
    pub fn no_port_forwarding() -> Self {
        Self::restricted(FilteringRule::Deny)
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }
}

/// Interactive shell settings.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell used when the request carries no usable override.
    ///
    /// When unset, the shell is taken from the environment (`SHELL` or `COMSPEC`).
    pub default_path: Option<PathBuf>,
    pub pty_rows: u16,
    pub pty_cols: u16,
    /// Value of the `TERM` environment variable inside pseudo-terminals.
    pub term: String,
    /// Time given to a killed shell to exit before it is abandoned.
    pub exit_timeout: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_path: None,
            pty_rows: 24,
            pty_cols: 80,
            term: "xterm-256color".to_owned(),
            exit_timeout: Duration::from_secs(2),
        }
    }
}

/// Filtering rule for port-forward destinations.
///
/// ```
/// use tunmux::FilteringRule;
///
/// # fn main() -> anyhow::Result<()> {
/// let always_allow = FilteringRule::Allow;
///
/// always_allow.validate_destination_str("devolutions.net:80")?;
/// always_allow.validate_destination_str("127.0.0.1:8080")?;
///
/// // Let's build this rule:
/// //   ( port 22 AND any first-level subdomain of "internal.corp" )
/// //   OR ( host:port 127.0.0.1:8080 )
/// //   OR ( NOT { port 25 } AND host mail.corp )
/// let elaborated_rule = FilteringRule::port(22)
///     .and(FilteringRule::wildcard_host("*.internal.corp"))
///     .or(FilteringRule::host_and_port("127.0.0.1", 8080))
///     .or(FilteringRule::port(25).invert().and(FilteringRule::host("mail.corp")));
///
/// assert!(elaborated_rule.validate_destination_str("build.internal.corp:22").is_ok());
/// assert!(elaborated_rule.validate_destination_str("build.internal.corp:2222").is_err());
/// assert!(elaborated_rule.validate_destination_str("a.build.internal.corp:22").is_err());
/// assert!(elaborated_rule.validate_destination_str("internal.corp:22").is_err());
///
/// assert!(elaborated_rule.validate_destination_str("127.0.0.1:8080").is_ok());
/// assert!(elaborated_rule.validate_destination_str("127.0.0.1:80").is_err());
///
/// assert!(elaborated_rule.validate_destination_str("mail.corp:587").is_ok());
/// assert!(elaborated_rule.validate_destination_str("mail.corp:25").is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum FilteringRule {
    /// Always deny
    Deny,
    /// Always allow
    Allow,
    /// Invert the rule
    Not(Box<FilteringRule>),
    /// Must fulfill every rule.
    All(Vec<FilteringRule>),
    /// Must fulfill at least one rule.
    Any(Vec<FilteringRule>),
    /// Host must match exactly.
    Host(String),
    /// Port must match exactly.
    Port(u16),
    /// Host and port must match exactly.
    HostAndPort { host: String, port: u16 },
    /// Rule matching multiple sub-domains, as in wildcard certificates.
    /// e.g.: `*.example.com`, `*.*.devolutions.net`
    WildcardHost(String),
}

impl FilteringRule {
    pub fn deny() -> Self {
        Self::Deny
    }

    pub fn allow() -> Self {
        Self::Allow
    }

    /// Puts current rule behind a NOT operator
    #[must_use]
    pub fn invert(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn host(host: impl Into<String>) -> Self {
        Self::Host(host.into())
    }

    pub fn port(port: u16) -> Self {
        Self::Port(port)
    }

    pub fn host_and_port(host: impl Into<String>, port: u16) -> Self {
        Self::HostAndPort {
            host: host.into(),
            port,
        }
    }

    pub fn wildcard_host(host: impl Into<String>) -> Self {
        Self::WildcardHost(host.into())
    }

    /// Combine current rule using an "AND" operator
    #[must_use]
    pub fn and(self, rule: Self) -> Self {
        match self {
            Self::Allow => rule,
            Self::All(mut sub_rules) => {
                sub_rules.push(rule);
                Self::All(sub_rules)
            }
            current_rule => Self::All(vec![current_rule, rule]),
        }
    }

    /// Combine current rule using an "OR" operator
    #[must_use]
    pub fn or(self, rule: Self) -> Self {
        match self {
            Self::Deny => rule,
            Self::Any(mut sub_rules) => {
                sub_rules.push(rule);
                Self::Any(sub_rules)
            }
            current_rule => Self::Any(vec![current_rule, rule]),
        }
    }

    pub fn validate_destination(&self, host: &str, port: u16) -> anyhow::Result<()> {
        if is_valid(self, host, port) {
            Ok(())
        } else {
            anyhow::bail!("{host}:{port} is not allowed by the filtering rule");
        }
    }

    /// Validates a `<host>:<port>` destination.
    pub fn validate_destination_str(&self, destination: impl AsRef<str>) -> anyhow::Result<()> {
        let (host, port) = destination
            .as_ref()
            .rsplit_once(':')
            .context("invalid destination format")?;
        let port = port.parse().context("invalid port value")?;
        self.validate_destination(host, port)
    }
}

fn is_valid(rule: &FilteringRule, target_host: &str, target_port: u16) -> bool {
    match rule {
        FilteringRule::Deny => false,
        FilteringRule::Allow => true,
        FilteringRule::Not(rule) => !is_valid(rule, target_host, target_port),
        FilteringRule::All(rules) => rules.iter().all(|r| is_valid(r, target_host, target_port)),
        FilteringRule::Any(rules) => rules.iter().any(|r| is_valid(r, target_host, target_port)),
        FilteringRule::Host(host) => target_host.eq_ignore_ascii_case(host),
        FilteringRule::Port(port) => target_port == *port,
        FilteringRule::HostAndPort { host, port } => target_host.eq_ignore_ascii_case(host) && target_port == *port,
        FilteringRule::WildcardHost(host) => {
            let mut expected_it = host.rsplit('.');
            let mut actual_it = target_host.rsplit('.');
            loop {
                match (expected_it.next(), actual_it.next()) {
                    (Some(expected), Some(actual)) if expected.eq_ignore_ascii_case(actual) => {}
                    (Some("*"), Some(_)) => {}
                    (None, None) => return true,
                    _ => return false,
                }
            }
        }
    }
}
