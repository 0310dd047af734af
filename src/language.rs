//! Supported snippet languages.
//!
//! Code blocks arrive tagged with free-form strings (`python`, `language-js`,
//! `bash`, ...). They are resolved once into a closed [`Language`] set, and
//! everything downstream dispatches on the enum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A language the runner knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "javascript")]
    Js,
    Python,
    Cpp,
    Prolog,
    #[serde(alias = "bash")]
    Shell,
    Groovy,
    R,
    Go,
    Rust,
    Java,
    PowerShell,
    Kotlin,
}

impl Language {
    /// Every supported language, in display order.
    pub const ALL: [Self; 12] = [
        Self::Js,
        Self::Python,
        Self::Cpp,
        Self::Prolog,
        Self::Shell,
        Self::Groovy,
        Self::R,
        Self::Go,
        Self::Rust,
        Self::Java,
        Self::PowerShell,
        Self::Kotlin,
    ];

    /// Resolve a code block tag such as `python`, `JavaScript` or
    /// `language-bash`. Returns `None` for anything outside the supported set.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        let tag = tag.strip_prefix("language-").unwrap_or(&tag);

        let lang = match tag {
            "js" | "javascript" => Self::Js,
            "python" => Self::Python,
            "cpp" => Self::Cpp,
            "prolog" => Self::Prolog,
            "shell" | "bash" => Self::Shell,
            "groovy" => Self::Groovy,
            "r" => Self::R,
            "go" => Self::Go,
            "rust" => Self::Rust,
            "java" => Self::Java,
            "powershell" => Self::PowerShell,
            "kotlin" => Self::Kotlin,
            _ => return None,
        };
        Some(lang)
    }

    /// Canonical lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Python => "python",
            Self::Cpp => "cpp",
            Self::Prolog => "prolog",
            Self::Shell => "shell",
            Self::Groovy => "groovy",
            Self::R => "r",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::PowerShell => "powershell",
            Self::Kotlin => "kotlin",
        }
    }

    /// Identifier the Piston API knows this language by.
    pub const fn default_remote_id(self) -> &'static str {
        match self {
            Self::Js => "javascript",
            Self::Python => "python",
            Self::Cpp => "c++",
            Self::Prolog => "prolog",
            Self::Shell => "bash",
            Self::Groovy => "groovy",
            Self::R => "r",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::PowerShell => "powershell",
            Self::Kotlin => "kotlin",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a tag names no supported language.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language '{0}'")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_resolve_with_aliases_and_prefix() {
        assert_eq!(Language::from_tag("js"), Some(Language::Js));
        assert_eq!(Language::from_tag("JavaScript"), Some(Language::Js));
        assert_eq!(Language::from_tag("language-bash"), Some(Language::Shell));
        assert_eq!(Language::from_tag(" shell "), Some(Language::Shell));
        assert_eq!(Language::from_tag("language-r"), Some(Language::R));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(Language::from_tag("cobol"), None);
        assert_eq!(Language::from_tag(""), None);
        // Substring matches must not leak through: "rust" is not "r".
        assert_eq!(Language::from_tag("rustacean"), None);

        let err = "brainfuck".parse::<Language>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported language 'brainfuck'");
    }

    #[test]
    fn every_language_round_trips_through_its_name() {
        for lang in Language::ALL {
            assert_eq!(Language::from_tag(lang.as_str()), Some(lang));
        }
    }

    #[test]
    fn serde_accepts_aliases() {
        let lang: Language = serde_json::from_str("\"bash\"").unwrap();
        assert_eq!(lang, Language::Shell);
        let lang: Language = serde_json::from_str("\"powershell\"").unwrap();
        assert_eq!(lang, Language::PowerShell);
    }
}
