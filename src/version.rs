//! Server version gate run before any mutation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::cluster::{ControlPlane, ServerVersion};
use crate::error::EdgeError;

/// A `major.minor` Kubernetes version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubeVersion {
    pub major: u32,
    pub minor: u32,
}

impl KubeVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Read the reported version, preferring the numeric fields and falling
    /// back to `gitVersion`. Providers append suffixes like `"14+"` or
    /// `v1.18.6-eks-1`; only the leading digits count.
    pub fn from_server(version: &ServerVersion) -> Result<Self, EdgeError> {
        match (leading_number(&version.major), leading_number(&version.minor)) {
            (Some(major), Some(minor)) => Ok(Self::new(major, minor)),
            _ => version
                .git_version
                .parse()
                .map_err(|_| EdgeError::InvalidVersion(version.git_version.clone())),
        }
    }
}

impl FromStr for KubeVersion {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let major = parts.next().and_then(leading_number);
        let minor = parts.next().and_then(leading_number);
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(Self::new(major, minor)),
            _ => Err(EdgeError::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub struct VersionValidator {
    client: Arc<dyn ControlPlane>,
    minimum: KubeVersion,
}

impl VersionValidator {
    pub fn new(client: Arc<dyn ControlPlane>, minimum: KubeVersion) -> Self {
        Self { client, minimum }
    }

    /// The server's reported git version, without checking it.
    pub async fn server_version(&self) -> Result<String, EdgeError> {
        Ok(self.client.server_version().await?.git_version)
    }

    pub async fn validate(&self) -> Result<KubeVersion, EdgeError> {
        let reported = self.client.server_version().await?;
        let version = KubeVersion::from_server(&reported)?;
        if version < self.minimum {
            return Err(EdgeError::UnsupportedVersion {
                found: reported.git_version,
                minimum: self.minimum.to_string(),
            });
        }
        info!(version = %version, minimum = %self.minimum, "server version supported");
        Ok(version)
    }
}
