//! Execution platform identity.
//!
//! The platform participates in process cache keys: a result produced on one
//! OS/architecture pair is never reused on another.

pub mod paths;

use std::fmt;

use serde::{Deserialize, Serialize};

/// CPU architecture a process ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
  X86_64,
  Aarch64,
}

/// Operating system a process ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
  Linux,
  MacOs,
  Windows,
}

/// Platform identifier combining OS and architecture (e.g. "linux_x86_64").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
  pub os: Os,
  pub arch: Arch,
}

impl Platform {
  pub fn new(os: Os, arch: Arch) -> Self {
    Self { os, arch }
  }

  /// Detect the platform this binary was compiled for.
  ///
  /// Returns `None` on an OS or architecture the sandbox does not support.
  pub fn current() -> Option<Self> {
    let os = match std::env::consts::OS {
      "linux" => Os::Linux,
      "macos" => Os::MacOs,
      "windows" => Os::Windows,
      _ => return None,
    };
    let arch = match std::env::consts::ARCH {
      "x86_64" => Arch::X86_64,
      "aarch64" => Arch::Aarch64,
      _ => return None,
    };
    Some(Self { os, arch })
  }

  pub fn as_str(&self) -> &'static str {
    match (self.os, self.arch) {
      (Os::Linux, Arch::X86_64) => "linux_x86_64",
      (Os::Linux, Arch::Aarch64) => "linux_arm64",
      (Os::MacOs, Arch::X86_64) => "macos_x86_64",
      (Os::MacOs, Arch::Aarch64) => "macos_arm64",
      (Os::Windows, Arch::X86_64) => "windows_x86_64",
      (Os::Windows, Arch::Aarch64) => "windows_arm64",
    }
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
