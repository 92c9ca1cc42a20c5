//! colab CLI: start a local notebook server or list the running ones.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use colab_core::config::{default_security_dir, DEFAULT_LOG_LEVEL};
use colab_core::ports::TcpBinder;
use colab_core::{discovery, signals, Lifecycle, ServerConfig, Settings};
use colab_server::{AppState, FileNotebookManager, KernelManager, WebServer, WebSettings};

#[derive(Parser)]
#[command(
    name = "colab",
    about = "Local notebook server with kernel lifecycle management",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the notebook server
    Serve(ServeArgs),
    /// List notebook servers running on this machine
    List {
        /// Directory holding the discovery records
        #[arg(long, env = "COLAB_SECURITY_DIR")]
        security_dir: Option<PathBuf>,
    },
    /// Print a bcrypt hash for use as `password_hash` / `--password-hash`
    HashPassword {
        /// Password to hash; read from the first line of stdin when omitted
        password: Option<String>,
        /// bcrypt cost factor
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// YAML settings file; flags override it
    #[arg(long, env = "COLAB_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on ('*' for all interfaces) [default: 127.0.0.1]
    #[arg(long, env = "COLAB_IP")]
    ip: Option<String>,
    /// First port to try [default: 8844]
    #[arg(long, short, env = "COLAB_PORT")]
    port: Option<u16>,
    /// Additional ports to try when the first is taken [default: 50]
    #[arg(long, env = "COLAB_PORT_RETRIES")]
    port_retries: Option<usize>,
    /// PEM certificate; enables HTTPS
    #[arg(long, env = "COLAB_CERTFILE")]
    certfile: Option<PathBuf>,
    /// PEM private key (defaults to the certificate file)
    #[arg(long, env = "COLAB_KEYFILE")]
    keyfile: Option<PathBuf>,
    /// Do not open a browser after startup
    #[arg(long)]
    no_browser: bool,
    /// Browser command to use instead of the system default
    #[arg(long, env = "COLAB_BROWSER")]
    browser: Option<String>,
    /// Trust X-Real-Ip/X-Forwarded-For and X-Scheme/X-Forwarded-Proto headers
    #[arg(long)]
    trust_xheaders: bool,
    /// Directory to serve notebooks from [default: .]
    #[arg(long, env = "COLAB_NOTEBOOK_DIR")]
    notebook_dir: Option<PathBuf>,
    /// Directory for discovery records and kernel connection files
    #[arg(long, env = "COLAB_SECURITY_DIR")]
    security_dir: Option<PathBuf>,
    /// Static resources directory [default: resources]
    #[arg(long = "resources", env = "COLAB_RESOURCES")]
    resources_dir: Option<PathBuf>,
    /// Directory with page templates
    #[arg(long, env = "COLAB_TEMPLATE_PATH")]
    template_path: Option<PathBuf>,
    /// bcrypt hash of the password for web access (see `colab hash-password`)
    #[arg(long, env = "COLAB_PASSWORD_HASH", hide_env_values = true)]
    password_hash: Option<String>,
    /// URL prefix for every route [default: /]
    #[arg(long, env = "COLAB_BASE_URL")]
    base_url: Option<String>,
    /// Kernel command; {connection_file} is replaced per kernel
    #[arg(long, env = "COLAB_KERNEL_CMD")]
    kernel_cmd: Option<String>,
    /// Log level when RUST_LOG is unset [default: info]
    #[arg(long, env = "COLAB_LOG_LEVEL")]
    log_level: Option<String>,
    /// Also write logs to this file
    #[arg(long, env = "COLAB_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl ServeArgs {
    /// The command-line layer. Unset flags stay `None` so lower layers show through.
    fn to_settings(&self) -> Settings {
        Settings {
            ip: self.ip.clone(),
            port: self.port,
            port_retries: self.port_retries,
            certfile: self.certfile.clone(),
            keyfile: self.keyfile.clone(),
            open_browser: self.no_browser.then_some(false),
            browser: self.browser.clone(),
            trust_xheaders: self.trust_xheaders.then_some(true),
            security_dir: self.security_dir.clone(),
            notebook_dir: self.notebook_dir.clone(),
            resources_dir: self.resources_dir.clone(),
            template_path: self.template_path.clone(),
            password_hash: self.password_hash.clone(),
            cookie_secret: None,
            base_url: self.base_url.clone(),
            kernel_cmd: self
                .kernel_cmd
                .as_deref()
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect()),
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
        }
    }

    fn load_config(&self) -> Result<ServerConfig> {
        let file = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        let settings = file.merge(self.to_settings());
        Ok(ServerConfig::from_settings(settings)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.load_config()?;
            let _guard = init_tracing(&config.log_level, config.log_file.as_deref())?;
            cmd_serve(config).await?;
        }
        Commands::List { security_dir } => {
            let _guard = init_tracing(DEFAULT_LOG_LEVEL, None)?;
            cmd_list(&security_dir.unwrap_or_else(default_security_dir))?;
        }
        Commands::HashPassword { password, cost } => {
            let password = match password {
                Some(password) => password,
                None => read_password_line(std::io::stdin().lock())?,
            };
            println!("{}", hash_password(&password, cost)?);
        }
    }

    Ok(())
}

/// Console logging, plus a plain-text file copy when `log_file` is set. The returned guard
/// flushes the file writer on drop.
fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
        .compact();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file {} has no file name", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}

// ─── Command implementations ──────────────────────────────────────────────────

async fn cmd_serve(config: ServerConfig) -> Result<()> {
    let config = Arc::new(config);
    info!("Using security directory {}", config.security_dir.display());

    let kernels = KernelManager::new(config.kernel_cmd.clone(), config.security_dir.clone());
    let notebooks = Arc::new(FileNotebookManager::new(config.notebook_dir.clone()));
    let state = AppState::new(
        kernels.clone(),
        Arc::clone(&notebooks),
        WebSettings::from_config(&config),
    );
    let server = WebServer::new(state, &config)?;

    let lifecycle = Lifecycle::new(Arc::clone(&config), Arc::new(kernels), notebooks);
    signals::forward_os_signals(lifecycle.control_sender());
    lifecycle.run(&mut TcpBinder, |_| server).await?;
    Ok(())
}

fn cmd_list(security_dir: &Path) -> Result<()> {
    let records = discovery::list(security_dir)?;
    if records.is_empty() {
        println!("No running notebook servers found in '{}'", security_dir.display());
        return Ok(());
    }

    println!("Currently running servers:");
    for record in records {
        println!("  {}", record.url);
    }
    Ok(())
}

fn read_password_line(input: impl BufRead) -> Result<String> {
    let line = input
        .lines()
        .next()
        .context("no password on stdin")?
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches('\r').to_string();
    anyhow::ensure!(!password.is_empty(), "password must not be empty");
    Ok(password)
}

fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost).context("Failed to hash password")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["colab", "serve"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Commands::Serve(args) => args,
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_unset_flags_leave_settings_empty() {
        let settings = parse(&[]).to_settings();
        assert_eq!(settings.open_browser, None);
        assert_eq!(settings.trust_xheaders, None);
        assert_eq!(settings.kernel_cmd, None);
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("colab.yaml");
        std::fs::write(&path, "port: 9100\nport_retries: 3\nip: '*'\n").unwrap();

        let args = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9200",
            "--no-browser",
            "--kernel-cmd",
            "python3 -m ipykernel_launcher -f {connection_file}",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.port_retries, 3);
        assert_eq!(config.ip, None);
        assert!(!config.open_browser);
        assert_eq!(config.kernel_cmd[0], "python3");
        assert_eq!(config.kernel_cmd.len(), 5);
    }

    #[test]
    fn test_key_without_cert_is_rejected() {
        let args = parse(&["--keyfile", "server.key"]);
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_hashed_password_is_accepted_by_config() {
        let password = read_password_line("secret\n".as_bytes()).unwrap();
        let hash = hash_password(&password, 4).unwrap();
        assert!(bcrypt::verify("secret", &hash).unwrap());

        let args = parse(&["--password-hash", hash.as_str()]);
        let config = args.load_config().unwrap();
        assert_eq!(config.password_hash.as_deref(), Some(hash.as_str()));

        assert!(parse(&["--password-hash", "secret"]).load_config().is_err());
        assert!(read_password_line("\n".as_bytes()).is_err());
        assert!(read_password_line("".as_bytes()).is_err());
    }

    #[test]
    fn test_list_without_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        cmd_list(tmp.path()).unwrap();
    }
}
