//! What is under test: the scenario context validators read from.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::config::HarnessConfig;
use crate::error::EngineError;

// ── Version ──────────────────────────────────────────────────────────

/// A semantic version as reported by a tracer, agent or weblog.
///
/// Build metadata is kept for display but ignored by comparisons.
#[derive(Debug, Clone, Serialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub build: Option<String>,
}

impl Version {
    /// Parse a version string the way `component` reports it.
    ///
    /// Each component decorates its version differently (`* ddtrace (1.2.3)`
    /// for ruby, `1.2.3~abcdef` for java, `Agent 7.50.0 - Commit: ...`); the
    /// decoration is removed before parsing. `v1.2` reads as `1.2.0`.
    pub fn parse(raw: &str, component: &str) -> Result<Version, EngineError> {
        let cleaned = clean_version(raw.trim(), component);
        let mut text = cleaned.as_str();
        if let Some(stripped) = text.strip_prefix('v') {
            text = stripped;
        }
        let completed;
        if is_major_minor(text) {
            completed = format!("{}.0", text);
            text = &completed;
        }
        parse_semver(text).ok_or_else(|| {
            EngineError::Version(format!("'{}' is not a valid {} version", raw, component))
        })
    }
}

fn clean_version(version: &str, component: &str) -> String {
    match component {
        "ruby" => strip_bullet(version, "ddtrace")
            .or_else(|| strip_bullet(version, "datadog"))
            .unwrap_or(version)
            .to_string(),
        "libddwaf" => strip_bullet(version, "libddwaf")
            .unwrap_or(version)
            .to_string(),
        "agent" => {
            let mut v = version;
            for marker in [" - Commit", " - Meta"] {
                if let Some(i) = v.find(marker) {
                    v = &v[..i];
                }
            }
            if let Some(i) = v.find("Agent ") {
                v = &v[i + "Agent ".len()..];
            }
            let uncoloured = strip_ansi(v);
            uncoloured
                .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '-')
                .to_string()
        }
        "java" => version
            .split('~')
            .next()
            .unwrap_or(version)
            .replace("-SNAPSHOT", ""),
        "dotnet" => {
            let v = version.strip_prefix("datadog-dotnet-apm-").unwrap_or(version);
            v.strip_suffix(".tar.gz").unwrap_or(v).to_string()
        }
        "php" => version.replace("-nightly", ""),
        _ => version.to_string(),
    }
}

/// `* name (1.2.3)` -> `1.2.3`
fn strip_bullet<'a>(version: &'a str, name: &str) -> Option<&'a str> {
    let rest = version.strip_prefix('*')?.trim_start();
    let rest = rest.strip_prefix(name)?.trim_start();
    rest.strip_prefix('(')?.strip_suffix(')')
}

fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            // Parameter and intermediate bytes run up to a final byte in `@..=~`.
            for d in chars.by_ref() {
                if ('@'..='~').contains(&d) {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn is_major_minor(text: &str) -> bool {
    let mut parts = text.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => is_number(a) && is_number(b),
        _ => false,
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_identifier_chars(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn take_number(text: &str) -> Option<(u64, &str)> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    let n = text[..end].parse().ok()?;
    Some((n, &text[end..]))
}

fn parse_semver(text: &str) -> Option<Version> {
    let (major, rest) = take_number(text)?;
    let (minor, rest) = take_number(rest.strip_prefix('.')?)?;
    let (patch, rest) = take_number(rest.strip_prefix('.')?)?;

    let (pre_part, build) = match rest.find(['+', ' ']) {
        Some(i) => {
            let build = &rest[i + 1..];
            if !is_identifier_chars(build) {
                return None;
            }
            (&rest[..i], Some(build.to_string()))
        }
        None => (rest, None),
    };

    let pre_part = pre_part
        .strip_prefix('-')
        .or_else(|| pre_part.strip_prefix('.'))
        .unwrap_or(pre_part);
    let pre = if pre_part.is_empty() {
        None
    } else if is_identifier_chars(pre_part) {
        Some(pre_part.to_string())
    } else {
        return None;
    };

    Some(Version {
        major,
        minor,
        patch,
        pre,
        build,
    })
}

fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(m), Ok(n)) => m.cmp(&n),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // A release sorts above its pre-releases.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre(a, b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

// ── LibraryVersion ───────────────────────────────────────────────────

/// The tracing library under test and, when known, its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryVersion {
    pub library: Option<String>,
    pub version: Option<Version>,
}

impl LibraryVersion {
    pub fn new(library: &str, version: Option<&str>) -> Result<Self, EngineError> {
        if library.contains('@') {
            return Err(EngineError::Version(format!(
                "library name '{}' must not contain '@'",
                library
            )));
        }
        let version = version.map(|v| Version::parse(v, library)).transpose()?;
        Ok(LibraryVersion {
            library: Some(library.to_string()),
            version,
        })
    }

    pub fn unknown() -> Self {
        LibraryVersion {
            library: None,
            version: None,
        }
    }

    pub fn is(&self, library: &str) -> bool {
        self.library.as_deref() == Some(library)
    }

    /// `"java"` matches any java version; `"java@1.2.0"` only that version.
    pub fn matches(&self, spec: &str) -> Result<bool, EngineError> {
        match spec.split_once('@') {
            None => Ok(self.is(spec)),
            Some((library, version)) => Ok(self.compare(library, version)? == Some(Ordering::Equal)),
        }
    }

    /// True when this is `library` at `version` or above.
    pub fn at_least(&self, spec: &str) -> Result<bool, EngineError> {
        let (library, version) = split_spec(spec)?;
        Ok(matches!(
            self.compare(library, version)?,
            Some(Ordering::Equal | Ordering::Greater)
        ))
    }

    /// True when this is `library` strictly below `version`.
    pub fn older_than(&self, spec: &str) -> Result<bool, EngineError> {
        let (library, version) = split_spec(spec)?;
        Ok(self.compare(library, version)? == Some(Ordering::Less))
    }

    /// `None` when the library differs: versions of different libraries
    /// never compare.
    fn compare(&self, library: &str, version: &str) -> Result<Option<Ordering>, EngineError> {
        if !self.is(library) {
            return Ok(None);
        }
        let Some(own) = &self.version else {
            return Err(EngineError::Version(format!(
                "cannot compare against '{}@{}': the weblog did not report a {} version",
                library, version, library
            )));
        };
        let other = Version::parse(version, library)?;
        Ok(Some(own.cmp(&other)))
    }
}

fn split_spec(spec: &str) -> Result<(&str, &str), EngineError> {
    spec.split_once('@').ok_or_else(|| {
        EngineError::Version(format!(
            "'{}' has no version; expected <library>@<version>",
            spec
        ))
    })
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.library, &self.version) {
            (None, _) => write!(f, "None"),
            (Some(library), None) => write!(f, "{}", library),
            (Some(library), Some(version)) => write!(f, "{}@{}", library, version),
        }
    }
}

// ── ScenarioContext ──────────────────────────────────────────────────

/// Read-only description of the scenario under test, built once per
/// session and shared by the engine and every validator.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioContext {
    pub name: String,
    pub library: LibraryVersion,
    pub weblog_variant: Option<String>,
    pub agent_version: Option<Version>,
    pub features: BTreeSet<String>,
    pub buddies: u8,
}

impl ScenarioContext {
    pub fn from_config(config: &HarnessConfig) -> Result<Self, EngineError> {
        let scenario = &config.scenario;
        let library = match &scenario.library {
            Some(library) => LibraryVersion::new(library, scenario.library_version.as_deref())?,
            None => LibraryVersion::unknown(),
        };
        let agent_version = scenario
            .agent_version
            .as_deref()
            .map(|v| Version::parse(v, "agent"))
            .transpose()?;
        Ok(ScenarioContext {
            name: scenario.name.clone(),
            library,
            weblog_variant: scenario.weblog_variant.clone(),
            agent_version,
            features: scenario.features.iter().cloned().collect(),
            buddies: scenario.buddies,
        })
    }

    /// A context for `library`, with everything else defaulted.
    pub fn for_library(library: &str, version: Option<&str>) -> Result<Self, EngineError> {
        let mut context = ScenarioContext::from_config(&HarnessConfig::default())?;
        context.library = LibraryVersion::new(library, version)?;
        Ok(context)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str, component: &str) -> Version {
        Version::parse(raw, component).unwrap()
    }

    #[test]
    fn plain_and_short_versions() {
        assert_eq!(v("1.2.3", "python").to_string(), "1.2.3");
        assert_eq!(v("v1.2", "golang").to_string(), "1.2.0");
        assert_eq!(v("2.9.0rc1", "python").pre.as_deref(), Some("rc1"));
        assert_eq!(v("1.0.0-beta.2+abc", "nodejs").build.as_deref(), Some("abc"));
        assert!(Version::parse("latest", "python").is_err());
    }

    #[test]
    fn component_decorations_are_removed() {
        assert_eq!(v("* ddtrace (1.13.0)", "ruby"), v("1.13.0", "ruby"));
        assert_eq!(v("* datadog (2.0.0)", "ruby").to_string(), "2.0.0");
        assert_eq!(v("1.20.0~a7c2e3", "java").to_string(), "1.20.0");
        assert_eq!(v("1.21.0-SNAPSHOT", "java").to_string(), "1.21.0");
        assert_eq!(
            v("Agent 7.50.0 - Commit: 1234abc - Serialization version: 5.0", "agent").to_string(),
            "7.50.0"
        );
        assert_eq!(v("Agent 7.51.0-devel - Meta: git", "agent").to_string(), "7.51.0");
        assert_eq!(v("0.95.0-nightly", "php").to_string(), "0.95.0");
        assert_eq!(v("datadog-dotnet-apm-2.41.0.tar.gz", "dotnet").to_string(), "2.41.0");
    }

    #[test]
    fn coloured_agent_versions_are_stripped_whole() {
        assert_eq!(v("Agent \u{1b}[1;32m7.50.0\u{1b}[0m", "agent").to_string(), "7.50.0");
        assert_eq!(strip_ansi("\u{1b}[38;5;208mx\u{1b}[K"), "x");
    }

    #[test]
    fn release_sorts_above_pre_release() {
        assert!(v("1.2.0", "x") > v("1.2.0-rc.2", "x"));
        assert!(v("1.2.0-rc.10", "x") > v("1.2.0-rc.2", "x"));
        assert!(v("1.2.0-alpha", "x") < v("1.2.0-beta", "x"));
        assert!(v("1.10.0", "x") > v("1.9.9", "x"));
        assert_eq!(v("1.2.3+a", "x"), v("1.2.3+b", "x"));
    }

    #[test]
    fn library_version_comparisons() {
        let lib = LibraryVersion::new("java", Some("1.20.0")).unwrap();
        assert!(lib.is("java"));
        assert!(lib.matches("java").unwrap());
        assert!(lib.matches("java@1.20.0").unwrap());
        assert!(!lib.matches("python@1.20.0").unwrap());
        assert!(lib.at_least("java@1.19.5").unwrap());
        assert!(!lib.at_least("java@1.21.0").unwrap());
        assert!(lib.older_than("java@1.21.0").unwrap());
        assert!(!lib.at_least("python@0.1.0").unwrap());
        assert!(lib.at_least("java").is_err());
        assert_eq!(lib.to_string(), "java@1.20.0");
    }

    #[test]
    fn comparing_without_a_version_is_an_error() {
        let lib = LibraryVersion::new("golang", None).unwrap();
        assert!(lib.matches("golang").unwrap());
        assert!(lib.matches("golang@1.0.0").is_err());
        // Another library never gets as far as the version.
        assert!(!lib.at_least("java@1.0.0").unwrap());
    }

    #[test]
    fn at_sign_in_library_name_is_rejected() {
        assert!(LibraryVersion::new("java@1", None).is_err());
    }

    #[test]
    fn context_carries_features_and_buddies() {
        let mut config = HarnessConfig::default();
        config.scenario.library = Some("php".to_string());
        config.scenario.buddies = 2;
        config.scenario.features = vec!["telemetry".to_string()];
        let context = ScenarioContext::from_config(&config).unwrap();
        assert!(context.has_feature("telemetry"));
        assert!(!context.has_feature("appsec"));
        assert_eq!(context.buddies, 2);
    }
}
