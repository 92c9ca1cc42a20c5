//! Server configuration: layered settings and the validated, immutable `ServerConfig`.
//!
//! Settings come from three layers, lowest precedence first: built-in defaults, an
//! optional YAML file, and command-line flags. `ServerConfig::from_settings` validates
//! the merged result once; nothing mutates it afterwards.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8844;
pub const DEFAULT_PORT_RETRIES: usize = 50;
pub const DEFAULT_BASE_URL: &str = "/";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const COOKIE_SECRET_LEN: usize = 1024;
/// Shortest cookie secret accepted from settings.
pub const MIN_COOKIE_SECRET_LEN: usize = 32;

/// `{connection_file}` in the kernel command is replaced with the per-kernel connection file.
pub const DEFAULT_KERNEL_CMD: &[&str] =
    &["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"];

/// One configuration layer. Every field is optional so layers can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Listen address; `*` or an empty string means all interfaces
    pub ip: Option<String>,
    pub port: Option<u16>,
    /// Additional ports to try if `port` is unavailable
    pub port_retries: Option<usize>,
    /// PEM certificate; enables TLS
    pub certfile: Option<PathBuf>,
    /// PEM private key; read from `certfile` when absent
    pub keyfile: Option<PathBuf>,
    pub open_browser: Option<bool>,
    /// Browser command overriding the platform default
    pub browser: Option<String>,
    /// Trust X-Scheme/X-Forwarded-Proto and X-Real-Ip/X-Forwarded-For
    pub trust_xheaders: Option<bool>,
    pub security_dir: Option<PathBuf>,
    pub notebook_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
    /// bcrypt hash of the password required to log in; see `colab hash-password`
    pub password_hash: Option<String>,
    /// Hex-encoded cookie secret; random per start when absent
    pub cookie_secret: Option<String>,
    pub base_url: Option<String>,
    pub kernel_cmd: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Load a YAML settings file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: Settings) -> Settings {
        Settings {
            ip: other.ip.or(self.ip),
            port: other.port.or(self.port),
            port_retries: other.port_retries.or(self.port_retries),
            certfile: other.certfile.or(self.certfile),
            keyfile: other.keyfile.or(self.keyfile),
            open_browser: other.open_browser.or(self.open_browser),
            browser: other.browser.or(self.browser),
            trust_xheaders: other.trust_xheaders.or(self.trust_xheaders),
            security_dir: other.security_dir.or(self.security_dir),
            notebook_dir: other.notebook_dir.or(self.notebook_dir),
            resources_dir: other.resources_dir.or(self.resources_dir),
            template_path: other.template_path.or(self.template_path),
            password_hash: other.password_hash.or(self.password_hash),
            cookie_secret: other.cookie_secret.or(self.cookie_secret),
            base_url: other.base_url.or(self.base_url),
            kernel_cmd: other.kernel_cmd.or(self.kernel_cmd),
            log_level: other.log_level.or(self.log_level),
            log_file: other.log_file.or(self.log_file),
        }
    }
}

/// TLS material for the listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub certfile: PathBuf,
    pub keyfile: Option<PathBuf>,
}

impl TlsConfig {
    /// The file holding the private key: the key file if given, else the certificate.
    pub fn key_path(&self) -> &Path {
        self.keyfile.as_deref().unwrap_or(&self.certfile)
    }
}

/// Validated server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// `None` listens on all interfaces.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub port_retries: usize,
    pub tls: Option<TlsConfig>,
    pub open_browser: bool,
    pub browser: Option<String>,
    pub trust_xheaders: bool,
    pub security_dir: PathBuf,
    pub notebook_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub template_path: Option<PathBuf>,
    /// bcrypt hash; `None` disables login.
    pub password_hash: Option<String>,
    pub cookie_secret: Vec<u8>,
    pub base_url: String,
    pub kernel_cmd: Vec<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let tls = match (settings.certfile, settings.keyfile) {
            (Some(certfile), keyfile) => Some(TlsConfig { certfile, keyfile }),
            (None, Some(keyfile)) => return Err(ConfigError::KeyWithoutCertificate(keyfile)),
            (None, None) => None,
        };

        let ip = parse_ip(settings.ip.as_deref().unwrap_or(DEFAULT_IP))?;

        let cookie_secret = match settings.cookie_secret {
            Some(encoded) => {
                let secret = hex::decode(encoded.trim())?;
                if secret.len() < MIN_COOKIE_SECRET_LEN {
                    return Err(ConfigError::CookieSecretTooShort {
                        len: secret.len(),
                        min: MIN_COOKIE_SECRET_LEN,
                    });
                }
                secret
            }
            None => random_cookie_secret(),
        };

        let password_hash = match settings.password_hash.filter(|h| !h.trim().is_empty()) {
            Some(hash) => {
                let hash = hash.trim().to_string();
                // A malformed hash fails here rather than at every login.
                bcrypt::verify("", &hash).map_err(ConfigError::PasswordHash)?;
                Some(hash)
            }
            None => None,
        };

        Ok(Self {
            ip,
            port: settings.port.unwrap_or(DEFAULT_PORT),
            port_retries: settings.port_retries.unwrap_or(DEFAULT_PORT_RETRIES),
            tls,
            open_browser: settings.open_browser.unwrap_or(true),
            browser: settings.browser.filter(|b| !b.is_empty()),
            trust_xheaders: settings.trust_xheaders.unwrap_or(false),
            security_dir: settings.security_dir.unwrap_or_else(default_security_dir),
            notebook_dir: settings.notebook_dir.unwrap_or_else(|| PathBuf::from(".")),
            resources_dir: settings
                .resources_dir
                .unwrap_or_else(|| PathBuf::from("resources")),
            template_path: settings.template_path,
            password_hash,
            cookie_secret,
            base_url: settings
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            kernel_cmd: settings
                .kernel_cmd
                .filter(|cmd| !cmd.is_empty())
                .unwrap_or_else(|| DEFAULT_KERNEL_CMD.iter().map(|s| s.to_string()).collect()),
            log_level: settings
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: settings.log_file,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Path of this process's discovery record.
    pub fn info_file(&self) -> PathBuf {
        self.security_dir
            .join(format!("nbserver-{}.json", std::process::id()))
    }
}

// Debug omits the cookie secret.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("port_retries", &self.port_retries)
            .field("tls", &self.tls)
            .field("open_browser", &self.open_browser)
            .field("browser", &self.browser)
            .field("trust_xheaders", &self.trust_xheaders)
            .field("security_dir", &self.security_dir)
            .field("notebook_dir", &self.notebook_dir)
            .field("resources_dir", &self.resources_dir)
            .field("template_path", &self.template_path)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<set>"))
            .field("base_url", &self.base_url)
            .field("kernel_cmd", &self.kernel_cmd)
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Defaults never fail validation.
        match Self::from_settings(Settings::default()) {
            Ok(config) => config,
            Err(e) => unreachable!("default settings are valid: {e}"),
        }
    }
}

fn parse_ip(raw: &str) -> Result<Option<IpAddr>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return Ok(None);
    }
    if raw.eq_ignore_ascii_case("localhost") {
        return Ok(Some(IpAddr::from([127, 0, 0, 1])));
    }
    raw.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidAddress(raw.to_string()))
}

fn random_cookie_secret() -> Vec<u8> {
    let mut secret = vec![0u8; COOKIE_SECRET_LEN];
    rand::rng().fill_bytes(&mut secret);
    secret
}

pub fn default_security_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("colab")
        .join("profile_default")
        .join("security")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_settings(Settings::default()).unwrap();
        assert_eq!(config.ip, Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(config.port, 8844);
        assert_eq!(config.port_retries, 50);
        assert!(config.tls.is_none());
        assert!(config.open_browser);
        assert_eq!(config.cookie_secret.len(), COOKIE_SECRET_LEN);
        assert_eq!(config.kernel_cmd[0], "python");
    }

    #[test]
    fn test_key_without_certificate_is_rejected() {
        let settings = Settings {
            keyfile: Some(PathBuf::from("server.key")),
            ..Default::default()
        };
        let err = ServerConfig::from_settings(settings).unwrap_err();
        assert!(matches!(err, ConfigError::KeyWithoutCertificate(_)));
    }

    #[test]
    fn test_certificate_alone_reads_key_from_certificate() {
        let settings = Settings {
            certfile: Some(PathBuf::from("server.pem")),
            ..Default::default()
        };
        let config = ServerConfig::from_settings(settings).unwrap();
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.key_path(), Path::new("server.pem"));
        assert!(config.is_secure());
    }

    #[test]
    fn test_star_means_all_interfaces() {
        for raw in ["*", "", "  "] {
            let settings = Settings {
                ip: Some(raw.to_string()),
                ..Default::default()
            };
            assert_eq!(ServerConfig::from_settings(settings).unwrap().ip, None);
        }
    }

    #[test]
    fn test_invalid_ip_rejected() {
        let settings = Settings {
            ip: Some("not-an-ip".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::from_settings(settings),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_merge_prefers_overlay() {
        let file = Settings {
            port: Some(9000),
            browser: Some("firefox".to_string()),
            ..Default::default()
        };
        let cli = Settings {
            port: Some(9100),
            ..Default::default()
        };
        let merged = file.merge(cli);
        assert_eq!(merged.port, Some(9100));
        assert_eq!(merged.browser.as_deref(), Some("firefox"));
    }

    #[test]
    fn test_settings_from_yaml_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("colab.yaml");
        let secret = "00ff".repeat(16);
        std::fs::write(
            &path,
            format!("port: 9999\nport_retries: 3\nopen_browser: false\ncookie_secret: \"{secret}\"\n"),
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        let config = ServerConfig::from_settings(settings).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.port_retries, 3);
        assert!(!config.open_browser);
        assert_eq!(config.cookie_secret, [0x00, 0xff].repeat(16));
    }

    #[test]
    fn test_short_cookie_secret_rejected() {
        for secret in ["", "00ff"] {
            let settings = Settings {
                cookie_secret: Some(secret.to_string()),
                ..Default::default()
            };
            assert!(matches!(
                ServerConfig::from_settings(settings),
                Err(ConfigError::CookieSecretTooShort { min: 32, .. })
            ));
        }
    }

    #[test]
    fn test_password_hash_must_be_bcrypt() {
        let hash = bcrypt::hash("secret", 4).unwrap();
        let settings = Settings {
            password_hash: Some(hash.clone()),
            ..Default::default()
        };
        let config = ServerConfig::from_settings(settings).unwrap();
        assert_eq!(config.password_hash, Some(hash));

        let settings = Settings {
            password_hash: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::from_settings(settings),
            Err(ConfigError::PasswordHash(_))
        ));

        let settings = Settings {
            password_hash: Some(String::new()),
            ..Default::default()
        };
        assert!(ServerConfig::from_settings(settings).unwrap().password_hash.is_none());
    }

    #[test]
    fn test_unknown_yaml_key_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("colab.yaml");
        std::fs::write(&path, "prot: 1\n").unwrap();
        assert!(matches!(
            Settings::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_info_file_keyed_by_pid() {
        let config = ServerConfig::default();
        let name = config.info_file().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, format!("nbserver-{}.json", std::process::id()));
    }
}
