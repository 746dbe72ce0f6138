//! Operating-system / CPU identity used to pick a bundled server binary.
//!
//! Tags follow the bundle layout (`linux`, `darwin`, `win32` / `x64`,
//! `arm64`), not Rust's `std::env::consts` spelling.

use std::env::consts;
use std::fmt;

/// Operating system tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OsTag {
    Linux,
    Darwin,
    Win32,
    Other(String),
}

impl OsTag {
    /// Map a `std::env::consts::OS` value to a bundle tag.
    #[must_use]
    pub fn from_rust(os: &str) -> Self {
        match os {
            "linux" => Self::Linux,
            "macos" => Self::Darwin,
            "windows" => Self::Win32,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Win32 => "win32",
            Self::Other(raw) => raw,
        }
    }

    #[must_use]
    pub fn is_windows(&self) -> bool {
        *self == Self::Win32
    }
}

/// CPU architecture tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArchTag {
    X64,
    Arm64,
    Other(String),
}

impl ArchTag {
    /// Map a `std::env::consts::ARCH` value to a bundle tag.
    #[must_use]
    pub fn from_rust(arch: &str) -> Self {
        match arch {
            "x86_64" => Self::X64,
            "aarch64" => Self::Arm64,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
            Self::Other(raw) => raw,
        }
    }
}

/// The (os, arch) pair of the running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformIdentity {
    os: OsTag,
    arch: ArchTag,
}

impl PlatformIdentity {
    #[must_use]
    pub fn new(os: OsTag, arch: ArchTag) -> Self {
        Self { os, arch }
    }

    /// Identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self::new(
            OsTag::from_rust(consts::OS),
            ArchTag::from_rust(consts::ARCH),
        )
    }

    #[must_use]
    pub fn os(&self) -> &OsTag {
        &self.os
    }

    #[must_use]
    pub fn arch(&self) -> &ArchTag {
        &self.arch
    }

    /// Whether a bundled binary can exist for this platform.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        !matches!(self.os, OsTag::Other(_)) && !matches!(self.arch, ArchTag::Other(_))
    }

    /// Bundle directory name (`linux-x64`, `win32-arm64`, ...), or `None`
    /// for unsupported combinations.
    #[must_use]
    pub fn target_dir(&self) -> Option<String> {
        self.is_supported().then(|| self.to_string())
    }

    /// Server executable file name on this platform.
    #[must_use]
    pub fn executable_name(&self, stem: &str) -> String {
        if self.os.is_windows() {
            format!("{stem}.exe")
        } else {
            stem.to_string()
        }
    }
}

impl fmt::Display for PlatformIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())
    }
}
