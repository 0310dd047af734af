//! Runner configuration.
//!
//! Configuration is JSON. It is read from the `SNIPPET_RUNNER_CONFIG`
//! environment variable (inline JSON) or from a file passed with `--config`.
//! Anything left out falls back to the built-in toolchain defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::language::Language;

/// Default Piston endpoint (public emkc.org instance).
pub const DEFAULT_REMOTE_ENDPOINT: &str = "https://emkc.org/api/v2/piston";

/// Top-level configuration, passed into the coordinator at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Per-execution timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Strategy used when a language has no explicit override.
    #[serde(default)]
    pub prefer: Strategy,

    /// Cap on answers pulled from an embedded engine per run.
    #[serde(default = "default_max_answers")]
    pub max_answers: usize,

    /// Directory for scratch source files. Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Remote execution API settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Per-language settings, merged over [`default_languages`].
    #[serde(default)]
    pub languages: HashMap<Language, LanguageConfig>,
}

/// How a snippet gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Spawn a local toolchain process against a scratch file.
    #[default]
    Local,
    /// Delegate to the remote execution API.
    Remote,
    /// Hand the source to a registered in-process engine.
    Embedded,
}

impl Strategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Embedded => "embedded",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote execution API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Whether the remote API may be used at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the Piston API (without `/execute`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_endpoint(),
        }
    }
}

/// Settings for a single language.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguageConfig {
    /// Local toolchain invocation. `None` means no local toolchain.
    #[serde(default)]
    pub local: Option<LocalCommand>,

    /// Strategy override for this language.
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Identifier sent to the remote API instead of the default one.
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// A local toolchain invocation: `<command> <args...> <scratch file>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalCommand {
    /// Executable path or name looked up on `PATH`.
    pub command: String,

    /// Space-delimited arguments placed before the scratch file path.
    #[serde(default)]
    pub args: String,

    /// Scratch file extension, without the dot.
    pub extension: String,
}

impl LocalCommand {
    pub fn new(command: &str, args: &str, extension: &str) -> Self {
        Self {
            command: command.into(),
            args: args.into(),
            extension: extension.into(),
        }
    }

    /// Arguments as passed to the process, empty segments dropped.
    pub fn arg_list(&self) -> Vec<&str> {
        self.args.split_whitespace().collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            prefer: Strategy::default(),
            max_answers: default_max_answers(),
            scratch_dir: None,
            remote: RemoteConfig::default(),
            languages: default_languages(),
        }
    }
}

impl Config {
    /// Load configuration from `SNIPPET_RUNNER_CONFIG`, or defaults if unset.
    ///
    /// `SNIPPET_RUNNER_REMOTE` overrides the remote endpoint either way.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SNIPPET_RUNNER_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse SNIPPET_RUNNER_CONFIG")?,
            Err(_) => Self::default(),
        };

        if let Ok(endpoint) = std::env::var("SNIPPET_RUNNER_REMOTE") {
            info!(endpoint = %endpoint, "Remote endpoint overridden from environment");
            config.remote.endpoint = endpoint;
        }

        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse a JSON document and fill in default language settings.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        let overrides = std::mem::take(&mut config.languages);
        config.languages = default_languages();
        config.merge_languages(overrides);
        Ok(config)
    }

    /// Merge language settings into the config. Given entries replace
    /// existing ones wholesale.
    pub fn merge_languages(&mut self, extra: HashMap<Language, LanguageConfig>) {
        for (lang, settings) in extra {
            self.languages.insert(lang, settings);
        }
    }

    /// Per-execution timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Local toolchain for a language, if one is configured.
    pub fn local_command(&self, lang: Language) -> Option<&LocalCommand> {
        self.languages.get(&lang).and_then(|l| l.local.as_ref())
    }

    /// Identifier the remote API should receive for a language.
    pub fn remote_id(&self, lang: Language) -> &str {
        self.languages
            .get(&lang)
            .and_then(|l| l.remote_id.as_deref())
            .unwrap_or_else(|| lang.default_remote_id())
    }

    /// Strategy override configured for a language, if any.
    pub fn strategy_override(&self, lang: Language) -> Option<Strategy> {
        self.languages.get(&lang).and_then(|l| l.strategy)
    }

    /// Directory scratch files are written to.
    pub fn resolved_scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Built-in toolchain table.
///
/// C++ and Prolog have no local toolchain here; they run remotely or through
/// an embedded engine.
pub fn default_languages() -> HashMap<Language, LanguageConfig> {
    let local = |command: &str, args: &str, extension: &str| LanguageConfig {
        local: Some(LocalCommand::new(command, args, extension)),
        ..LanguageConfig::default()
    };

    HashMap::from([
        (Language::Js, local("node", "", "js")),
        (Language::Python, local("python", "", "py")),
        (Language::Shell, local("bash", "", "sh")),
        (Language::Groovy, local("groovy", "", "groovy")),
        (Language::Go, local("go", "run", "go")),
        (Language::Java, local("java", "-ea", "java")),
        (Language::PowerShell, local("powershell", "-file", "ps1")),
        (Language::Rust, local("cargo", "run", "rs")),
        (Language::R, local("Rscript", "", "R")),
        (Language::Kotlin, local("kotlinc", "-script", "kts")),
        (Language::Cpp, LanguageConfig::default()),
        (Language::Prolog, LanguageConfig::default()),
    ])
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_max_answers() -> usize {
    15
}

const fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    DEFAULT_REMOTE_ENDPOINT.into()
}
