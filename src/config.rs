//! Embedder-facing configuration
//!
//! Plain option structs with serde derives so an embedding application can
//! load them from whatever format it keeps its configuration in. Defaults
//! carry the protocol constants: hello timeout 60 s, SSH port 830, TLS
//! port 6513, three authentication attempts.

use std::path::PathBuf;

use serde_derive::Deserialize;

/// Log verbosity recognized in configuration files, mapped onto the
/// `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Error,
    Warning,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self {
            Verbosity::Error => log::LevelFilter::Error,
            Verbosity::Warning => log::LevelFilter::Warn,
            Verbosity::Verbose => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
        }
    }
}

/// PEM material given either inline or as a file path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PemSource {
    Path(PathBuf),
    Inline(String),
}

/// SSH user-authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthMethod {
    Publickey,
    Password,
    Interactive,
}

/// One client keypair on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPair {
    pub private_key: PathBuf,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Client-side SSH options.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSshConfig {
    pub username: String,
    #[serde(default)]
    pub keypairs: Vec<KeyPair>,
    #[serde(default)]
    pub password: Option<String>,
    /// Method preference; larger wins, negative disables the method.
    #[serde(default = "default_auth_preference")]
    pub auth_preference: Vec<(SshAuthMethod, i16)>,
}

fn default_auth_preference() -> Vec<(SshAuthMethod, i16)> {
    vec![
        (SshAuthMethod::Publickey, 3),
        (SshAuthMethod::Password, 2),
        (SshAuthMethod::Interactive, 1),
    ]
}

impl Default for ClientSshConfig {
    fn default() -> Self {
        ClientSshConfig {
            username: String::new(),
            keypairs: Vec::new(),
            password: None,
            auth_preference: default_auth_preference(),
        }
    }
}

/// Client-side TLS options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientTlsConfig {
    #[serde(default)]
    pub cert: Option<PemSource>,
    #[serde(default)]
    pub key: Option<PemSource>,
    #[serde(default)]
    pub trusted_cas: Vec<PemSource>,
    #[serde(default)]
    pub crls: Vec<PemSource>,
}

/// Everything a client connector needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Seconds to wait for the peer's hello.
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout: u32,
    #[serde(default)]
    pub schema_searchpath: Option<PathBuf>,
    /// Capability URIs advertised beyond the base pair.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ssh: ClientSshConfig,
    #[serde(default)]
    pub tls: ClientTlsConfig,
}

fn default_hello_timeout() -> u32 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            verbosity: Verbosity::default(),
            hello_timeout: default_hello_timeout(),
            schema_searchpath: None,
            capabilities: Vec::new(),
            ssh: ClientSshConfig::default(),
            tls: ClientTlsConfig::default(),
        }
    }
}

/// RFC 6243 with-defaults basic modes a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithDefaults {
    #[default]
    Explicit,
    ReportAll,
    ReportAllTagged,
    Trim,
}

impl WithDefaults {
    pub fn capability(&self) -> String {
        let mode = match self {
            WithDefaults::Explicit => "explicit",
            WithDefaults::ReportAll => "report-all",
            WithDefaults::ReportAllTagged => "report-all-tagged",
            WithDefaults::Trim => "trim",
        };
        format!("urn:ietf:params:netconf:capability:with-defaults:1.0?basic-mode={mode}")
    }
}

/// Process-wide server options.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Seconds to wait for a client's hello.
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout: u32,
    /// Seconds of rpc inactivity before a session is dropped; 0 disables.
    #[serde(default)]
    pub idle_timeout: u32,
    #[serde(default)]
    pub with_defaults: WithDefaults,
    #[serde(default)]
    pub schema_searchpath: Option<PathBuf>,
    /// Capability URIs advertised beyond base and with-defaults.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            verbosity: Verbosity::default(),
            hello_timeout: default_hello_timeout(),
            idle_timeout: 0,
            with_defaults: WithDefaults::default(),
            schema_searchpath: None,
            capabilities: Vec::new(),
        }
    }
}

/// One authorized public key for server-side SSH authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedKey {
    pub pubkey: PathBuf,
    pub username: String,
}

/// Server-side SSH endpoint options.
#[derive(Debug, Clone, Deserialize)]
pub struct SshServerConfig {
    #[serde(default)]
    pub hostkeys: Vec<PathBuf>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default = "default_ssh_methods")]
    pub auth_methods: Vec<SshAuthMethod>,
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts: u16,
    /// Seconds granted to complete authentication.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u32,
    #[serde(default)]
    pub authorized_keys: Vec<AuthorizedKey>,
}

fn default_ssh_methods() -> Vec<SshAuthMethod> {
    vec![
        SshAuthMethod::Publickey,
        SshAuthMethod::Password,
        SshAuthMethod::Interactive,
    ]
}

fn default_auth_attempts() -> u16 {
    3
}

fn default_auth_timeout() -> u32 {
    10
}

impl Default for SshServerConfig {
    fn default() -> Self {
        SshServerConfig {
            hostkeys: Vec::new(),
            banner: None,
            auth_methods: default_ssh_methods(),
            auth_attempts: default_auth_attempts(),
            auth_timeout: default_auth_timeout(),
            authorized_keys: Vec::new(),
        }
    }
}

/// How a cert-to-name entry maps a matched certificate to a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CtnMapType {
    /// Use the entry's own `name`.
    Specified,
    SanRfc822,
    SanDns,
    SanIp,
    /// First of rfc822, dns, ip present in the certificate.
    SanAny,
    CommonName,
}

/// One ordered cert-to-name rule.
#[derive(Debug, Clone, Deserialize)]
pub struct CtnEntry {
    /// Priority; entries are matched in ascending id order.
    pub id: u32,
    /// Colon-separated hex fingerprint with a leading hash-algorithm
    /// octet (02 = SHA-1, 04 = SHA-256). `None` matches any certificate.
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub map_type: CtnMapType,
    #[serde(default)]
    pub name: Option<String>,
}

/// Server-side TLS endpoint options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsServerConfig {
    #[serde(default)]
    pub cert: Option<PemSource>,
    #[serde(default)]
    pub key: Option<PemSource>,
    #[serde(default)]
    pub trusted_cas: Vec<PemSource>,
    #[serde(default)]
    pub crls: Vec<PemSource>,
    /// Ordered cert-to-name rules; a non-empty list makes client
    /// certificates mandatory.
    #[serde(default)]
    pub ctn: Vec<CtnEntry>,
}

/// Default ports of RFC 6242 (SSH) and RFC 7589 (TLS), plus the RFC 8071
/// call-home ports.
pub const DEFAULT_SSH_PORT: u16 = 830;
pub const DEFAULT_TLS_PORT: u16 = 6513;
pub const DEFAULT_CALLHOME_SSH_PORT: u16 = 4334;
pub const DEFAULT_CALLHOME_TLS_PORT: u16 = 4335;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_protocol_constants() {
        let server = ServerConfig::default();
        assert_eq!(server.hello_timeout, 60);
        assert_eq!(server.idle_timeout, 0);
        let ssh = SshServerConfig::default();
        assert_eq!(ssh.auth_attempts, 3);
        assert_eq!(ssh.auth_timeout, 10);
        assert_eq!(ssh.auth_methods.len(), 3);
    }

    #[test]
    fn with_defaults_capability_uri() {
        assert_eq!(
            WithDefaults::ReportAll.capability(),
            "urn:ietf:params:netconf:capability:with-defaults:1.0?basic-mode=report-all"
        );
    }

    #[test]
    fn verbosity_maps_to_level_filter() {
        assert_eq!(Verbosity::Verbose.level_filter(), log::LevelFilter::Info);
        assert_eq!(Verbosity::Debug.level_filter(), log::LevelFilter::Debug);
    }
}
