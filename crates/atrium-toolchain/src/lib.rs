use std::fmt;
use std::str::FromStr;

/// Node package manager driving a workspace project.
///
/// Every command line the runner hands to a toolchain comes from here; no
/// other crate knows how the managers differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid package manager: {0}")]
pub struct ParsePackageManagerError(String);

impl FromStr for PackageManager {
    type Err = ParsePackageManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pnpm" => Ok(Self::Pnpm),
            other => Err(ParsePackageManagerError(other.to_string())),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PackageManager {
    /// Parse a configured value, falling back to pnpm when it is not a
    /// recognized manager. Used where a bad config value must not be fatal.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or(Self::Pnpm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }

    pub fn install_cmd(self) -> &'static str {
        match self {
            Self::Npm => "npm install",
            Self::Yarn => "yarn install",
            Self::Pnpm => "pnpm install",
        }
    }

    pub fn dev_cmd(self) -> &'static str {
        match self {
            Self::Npm => "npm run dev",
            Self::Yarn => "yarn dev",
            Self::Pnpm => "pnpm dev",
        }
    }

    pub fn lint_cmd(self) -> &'static str {
        match self {
            Self::Npm => "npm run lint",
            Self::Yarn => "yarn lint",
            Self::Pnpm => "pnpm lint",
        }
    }

    pub fn build_cmd(self) -> &'static str {
        match self {
            Self::Npm => "npm run build",
            Self::Yarn => "yarn build",
            Self::Pnpm => "pnpm build",
        }
    }

    /// A full build is too slow for the edit loop, so compile checks run the
    /// incremental type check instead.
    pub fn type_check_cmd(self) -> &'static str {
        match self {
            Self::Npm => "npm exec -- tsc --noEmit --incremental -p tsconfig.app.json",
            Self::Yarn => "yarn tsc --noEmit --incremental -p tsconfig.app.json",
            Self::Pnpm => "pnpm exec tsc --noEmit --incremental -p tsconfig.app.json",
        }
    }
}
