//! Layered configuration
//!
//! Values come from `devvisor.toml` in the project root (or `--config`),
//! then `DEVVISOR__*` environment variables, then command-line flags.
//! The `[env]` table and `DEVVISOR__ENV__*` variables keep their key case;
//! every other key is case-insensitive.
//!
//! ```toml
//! command = ["node", "server.js"]
//!
//! [env]
//! PORT = "4000"
//!
//! [watch]
//! patterns = ["src/**/*.ts"]
//! ignore = ["**/node_modules/**", "**/dist/**"]
//!
//! [link]
//! kill_timeout_ms = 5000
//!
//! [exit]
//! timeout_ms = 2000
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File};
use devvisor_exit::{ExitOptions, DEFAULT_EXIT_TIMEOUT};
use devvisor_process::{LinkOptions, DEFAULT_KILL_TIMEOUT, DEFAULT_RESPAWN_DELAY};
use devvisor_watch::WatchOptions;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    args::Cli,
    error::{ConfigError, Result},
};

/// Config file looked up in the project root
pub const CONFIG_FILE: &str = "devvisor.toml";

/// Prefix for environment overrides, e.g. `DEVVISOR__LINK__KILL_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "DEVVISOR";

const ENV_SEPARATOR: &str = "__";

/// Table holding the child's environment
const ENV_TABLE: &str = "env";

/// Ignored unless the config says otherwise
pub const DEFAULT_IGNORE: &[&str] = &["**/node_modules/**", "**/.git/**"];

/// Complete supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Project root; the child's working directory
    pub root: PathBuf,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extra environment for the child, read outside the folding layers
    #[serde(skip)]
    pub env: HashMap<String, String>,
    pub watch: WatchSection,
    pub link: LinkSection,
    pub exit: ExitSection,
    pub log: LogSection,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            command: Vec::new(),
            env: HashMap::new(),
            watch: WatchSection::default(),
            link: LinkSection::default(),
            exit: ExitSection::default(),
            log: LogSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Watch roots relative to `root`; empty watches `root` itself
    pub paths: Vec<PathBuf>,
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            patterns: Vec::new(),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    pub kill_timeout_ms: u64,
    pub respawn_delay_ms: u64,
    pub forward_terminal: bool,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT.as_millis() as u64,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY.as_millis() as u64,
            forward_terminal: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSection {
    pub timeout_ms: u64,
}

impl Default for ExitSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_EXIT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Reads the file and environment layers
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
    env_source: Option<::config::Map<String, String>>,
}

impl ConfigLoader {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            env_prefix: ENV_PREFIX.to_string(),
            env_source: None,
        }
    }

    /// Read overrides from this map instead of the process environment
    pub fn with_env_source(mut self, vars: ::config::Map<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&self) -> Result<DevConfig> {
        debug!(path = %self.config_path.display(), "Loading configuration");

        let builder = Config::builder()
            .add_source(File::from(self.config_path.clone()).required(false))
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .separator(ENV_SEPARATOR)
                    .source(self.env_source.clone()),
            );

        let config = builder.build()?;
        let mut dev_config: DevConfig = config.try_deserialize()?;
        dev_config.env = self.load_child_env()?;
        Ok(dev_config)
    }

    /// `[env]` from the file, then `DEVVISOR__ENV__*`, with keys as written
    fn load_child_env(&self) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();

        if self.config_path.is_file() {
            let raw = std::fs::read_to_string(&self.config_path)?;
            let table: toml::Table = raw
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
            if let Some(entries) = table.get(ENV_TABLE) {
                let entries = entries.as_table().ok_or_else(|| {
                    ConfigError::Validation("`env` must be a table".to_string())
                })?;
                for (key, value) in entries {
                    env.insert(key.clone(), env_value(key, value)?);
                }
            }
        }

        let prefix = format!(
            "{}{sep}{}{sep}",
            self.env_prefix,
            ENV_TABLE.to_uppercase(),
            sep = ENV_SEPARATOR
        );
        let overrides: Vec<(String, String)> = match &self.env_source {
            Some(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => std::env::vars().collect(),
        };
        for (key, value) in overrides {
            if let Some(name) = key.strip_prefix(&prefix).filter(|n| !n.is_empty()) {
                env.insert(name.to_string(), value);
            }
        }

        Ok(env)
    }
}

fn env_value(key: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
            Ok(value.to_string())
        }
        _ => Err(ConfigError::Validation(format!(
            "env.{key} must be a string, number, or boolean"
        ))),
    }
}

/// Resolve the final configuration for a command line
pub fn load(cli: &Cli) -> Result<DevConfig> {
    let base = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let path = cli.config.clone().unwrap_or_else(|| base.join(CONFIG_FILE));
    let config = ConfigLoader::new(path).load()?;
    resolve(config, &base, cli)
}

/// Apply command-line overrides, anchor relative paths, and validate
pub fn resolve(mut config: DevConfig, base: &Path, cli: &Cli) -> Result<DevConfig> {
    config.root = match &cli.root {
        Some(root) => root.clone(),
        None if config.root.is_relative() => base.join(&config.root),
        None => config.root,
    };
    config.root = config.root.canonicalize().map_err(|e| {
        ConfigError::Validation(format!("project root {}: {}", config.root.display(), e))
    })?;

    if !cli.command.is_empty() {
        config.command = cli.command.clone();
    }
    config.watch.patterns.extend(cli.watch.iter().cloned());
    config.watch.ignore.extend(cli.ignore.iter().cloned());
    config.env.extend(cli.env.iter().cloned());
    if let Some(timeout) = cli.exit_timeout_ms {
        config.exit.timeout_ms = timeout;
    }

    validate(&config)?;
    Ok(config)
}

/// Validate configuration
pub fn validate(config: &DevConfig) -> Result<()> {
    match config.command.first() {
        Some(program) if !program.trim().is_empty() => {}
        _ => {
            return Err(ConfigError::Validation(
                "no command given; pass one after `--` or set `command`".to_string(),
            ))
        }
    }

    if config.exit.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "exit.timeout_ms must be greater than 0".to_string(),
        ));
    }

    if config.link.kill_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "link.kill_timeout_ms must be greater than 0".to_string(),
        ));
    }

    if !config.root.is_dir() {
        return Err(ConfigError::Validation(format!(
            "project root {} is not a directory",
            config.root.display()
        )));
    }

    Ok(())
}

impl DevConfig {
    pub fn link_options(&self) -> LinkOptions {
        let (program, args) = match self.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let mut options = LinkOptions::new(program)
            .args(args)
            .working_dir(&self.root)
            .forward_terminal(self.link.forward_terminal)
            .kill_timeout(Duration::from_millis(self.link.kill_timeout_ms))
            .respawn_delay(Duration::from_millis(self.link.respawn_delay_ms));
        for (key, value) in &self.env {
            options = options.env(key, value);
        }
        options
    }

    pub fn watch_options(&self) -> WatchOptions {
        let roots = if self.watch.paths.is_empty() {
            vec![self.root.clone()]
        } else {
            self.watch.paths.iter().map(|p| self.root.join(p)).collect()
        };
        WatchOptions {
            roots,
            patterns: self.watch.patterns.clone(),
            ignore: self.watch.ignore.clone(),
        }
    }

    pub fn exit_options(&self) -> ExitOptions {
        ExitOptions::default().timeout(Duration::from_millis(self.exit.timeout_ms))
    }
}
