//! Host platform classification
//! Maps free-form OS/architecture strings onto the tag of a packaged artifact directory.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

/// Platform-specific errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Invalid platform pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// The two opaque strings identifying the running host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub os_name: String,
    pub arch: String,
}

impl HostInfo {
    pub fn new(os_name: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os_name: os_name.into(),
            arch: arch.into(),
        }
    }

    /// Reads the host strings, honoring `NATIVECODE_OS_NAME` / `NATIVECODE_OS_ARCH` overrides.
    pub fn current() -> Self {
        Self {
            os_name: env_override("NATIVECODE_OS_NAME")
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: env_override("NATIVECODE_OS_ARCH")
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        }
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.os_name, self.arch)
    }
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Serialized form of a [`PlatformRule`], as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleSpec {
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// One row of the platform table. Patterns are compiled once, case-insensitively.
#[derive(Debug, Clone)]
pub struct PlatformRule {
    os_pattern: Regex,
    arch_pattern: Regex,
    tag: Option<String>,
}

impl PlatformRule {
    pub fn new(os_pattern: &str, arch_pattern: &str, tag: Option<&str>) -> Result<Self> {
        Ok(Self {
            os_pattern: compile_pattern(os_pattern)?,
            arch_pattern: compile_pattern(arch_pattern)?,
            tag: tag.map(str::to_string),
        })
    }

    pub fn from_spec(spec: &RuleSpec) -> Result<Self> {
        Self::new(&spec.os, &spec.arch, spec.tag.as_deref())
    }

    /// Both patterns must cover the whole host string.
    pub fn matches(&self, host: &HostInfo) -> bool {
        self.os_pattern.is_match(&host.os_name) && self.arch_pattern.is_match(&host.arch)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(true)
        .build()
        .map_err(|source| PlatformError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Built-in rules: (os pattern, arch pattern, directory tag). Order is significant.
const BUILTIN_RULES: &[(&str, &str, &str)] = &[
    ("linux", "amd64|x86_64", "amd64-linux"),
    ("linux", ".*86.*", "x86-linux"),
    ("mac\\s*os.*", "ppc|power|powerpc.*|x86.*", "x86-mac"),
    ("win.*", "x86.*", "x86-windows"),
];

/// Ordered, immutable list of platform rules.
#[derive(Debug, Clone)]
pub struct PlatformTable {
    rules: Vec<PlatformRule>,
}

impl PlatformTable {
    pub fn new(rules: Vec<PlatformRule>) -> Self {
        Self { rules }
    }

    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        specs
            .iter()
            .map(PlatformRule::from_spec)
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    /// The process-wide default table.
    ///
    /// Panics on first use if a built-in pattern fails to compile.
    pub fn builtin() -> &'static PlatformTable {
        static BUILTIN: OnceLock<PlatformTable> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            let rules = BUILTIN_RULES
                .iter()
                .map(|(os, arch, tag)| {
                    PlatformRule::new(os, arch, Some(*tag))
                        .unwrap_or_else(|e| panic!("built-in platform rule for {tag}: {e}"))
                })
                .collect();
            PlatformTable::new(rules)
        })
    }

    pub fn rules(&self) -> &[PlatformRule] {
        &self.rules
    }

    /// First rule in declaration order matching `host`; no best-match search.
    pub fn detect(&self, host: &HostInfo) -> ResolvedPlatform {
        match self.rules.iter().find(|rule| rule.matches(host)) {
            Some(rule) => {
                debug!("host {} matched platform {:?}", host, rule.tag());
                ResolvedPlatform {
                    host: host.clone(),
                    tag: rule.tag.clone(),
                }
            }
            None => {
                debug!("no platform rule matches host {}", host);
                ResolvedPlatform::unsupported(host.clone())
            }
        }
    }
}

/// Outcome of platform detection. A missing tag means the host is unsupported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlatform {
    pub host: HostInfo,
    tag: Option<String>,
}

impl ResolvedPlatform {
    pub fn supported(host: HostInfo, tag: impl Into<String>) -> Self {
        Self {
            host,
            tag: Some(tag.into()),
        }
    }

    pub fn unsupported(host: HostInfo) -> Self {
        Self { host, tag: None }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_supported(&self) -> bool {
        self.tag.is_some()
    }
}

impl fmt::Display for ResolvedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{tag} ({})", self.host),
            None => write!(f, "unsupported ({})", self.host),
        }
    }
}

/// Classify the running host against the built-in table.
pub fn detect() -> ResolvedPlatform {
    PlatformTable::builtin().detect(&HostInfo::current())
}

/// [`detect`], computed once per process.
pub fn current() -> &'static ResolvedPlatform {
    static CURRENT: OnceLock<ResolvedPlatform> = OnceLock::new();
    CURRENT.get_or_init(detect)
}

/// Shared-library file name for `name` on this host, e.g. `libfoo.so` or `foo.dll`.
pub fn map_library_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}
