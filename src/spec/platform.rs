//! Target platform (`os/arch[/variant]`) as used by container builders

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default build platform when a spec does not name one
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// A container target platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: String,
    variant: Option<String>,
}

impl Platform {
    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Architecture names as they appear in wheel platform tags
    pub fn wheel_arch_aliases(&self) -> &'static [&'static str] {
        match self.arch.as_str() {
            "amd64" => &["x86_64", "amd64"],
            "arm64" => &["aarch64", "arm64"],
            "386" => &["i686", "i386", "win32"],
            "arm" => &["armv7l", "armv6l"],
            "ppc64le" => &["ppc64le"],
            "s390x" => &["s390x"],
            "riscv64" => &["riscv64"],
            _ => &[],
        }
    }

    /// PEP 508 marker selecting this platform, for resolver environments
    pub fn environment_marker(&self) -> Option<String> {
        let sys_platform = match self.os.as_str() {
            "linux" => "linux",
            "darwin" => "darwin",
            "windows" => "win32",
            _ => return None,
        };
        let machine = match (self.os.as_str(), self.arch.as_str()) {
            ("windows", "amd64") => "AMD64",
            ("windows", "arm64") => "ARM64",
            ("darwin", "arm64") => "arm64",
            (_, "amd64") => "x86_64",
            (_, "arm64") => "aarch64",
            (_, "386") => "i686",
            (_, "arm") => "armv7l",
            (_, other) => other,
        };
        Some(format!(
            "sys_platform == '{}' and platform_machine == '{}'",
            sys_platform, machine
        ))
    }

    fn normalize_arch(arch: &str) -> String {
        match arch {
            "x86_64" | "x86-64" => "amd64".to_string(),
            "aarch64" => "arm64".to_string(),
            "i386" | "i686" => "386".to_string(),
            other => other.to_string(),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            variant: None,
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let lowered = input.trim().to_ascii_lowercase();
        let parts: Vec<&str> = lowered.split('/').collect();
        let valid_part = |p: &str| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !(2..=3).contains(&parts.len()) || !parts.iter().all(|p| valid_part(p)) {
            return Err(format!(
                "invalid platform '{}': expected os/arch or os/arch/variant",
                input.trim()
            ));
        }
        Ok(Self {
            os: parts[0].to_string(),
            arch: Self::normalize_arch(parts[1]),
            variant: parts.get(2).map(|v| v.to_string()),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Platform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_constant() {
        assert_eq!(Platform::default().to_string(), DEFAULT_PLATFORM);
    }

    #[test]
    fn parse_normalizes_arch_aliases() {
        let p: Platform = "Linux/x86_64".parse().unwrap();
        assert_eq!(p.to_string(), "linux/amd64");
        let p: Platform = "linux/aarch64".parse().unwrap();
        assert_eq!(p.arch(), "arm64");
    }

    #[test]
    fn parse_keeps_variant() {
        let p: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(p.to_string(), "linux/arm64/v8");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//amd64".parse::<Platform>().is_err());
        assert!("linux/amd 64".parse::<Platform>().is_err());
    }

    #[test]
    fn environment_markers() {
        let p: Platform = "linux/arm64".parse().unwrap();
        assert_eq!(
            p.environment_marker().as_deref(),
            Some("sys_platform == 'linux' and platform_machine == 'aarch64'")
        );
        let p: Platform = "darwin/arm64".parse().unwrap();
        assert_eq!(
            p.environment_marker().as_deref(),
            Some("sys_platform == 'darwin' and platform_machine == 'arm64'")
        );
        let p: Platform = "plan9/amd64".parse().unwrap();
        assert_eq!(p.environment_marker(), None);
    }
}
