//! Configuration loaded from `edgectl.toml`.
//!
//! Every field has a default, so the file is optional. The environment
//! variable `EDGECTL_SERVANT_IMAGE` takes precedence over the file; CLI flags
//! take precedence over both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::jobs::DispatchSettings;
use crate::manifests::ComponentSettings;
use crate::version::KubeVersion;

const DEFAULT_PATH: &str = "edgectl.toml";
const SERVANT_IMAGE_ENV: &str = "EDGECTL_SERVANT_IMAGE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgectlConfig {
    /// Namespace holding the lock, the managed workloads and servant jobs.
    pub namespace: String,
    pub lock_name: String,
    pub edge_label_key: String,
    pub autonomy_annotation_key: String,
    pub servant_image: String,
    pub controller_manager_image: String,
    pub tunnel_server_image: String,
    pub tunnel_agent_image: String,
    pub job_timeout_secs: u64,
    pub job_poll_interval_secs: u64,
    /// Seconds a finished servant job is kept before the platform removes it.
    pub job_ttl_secs: i32,
    /// Oldest supported server version, as `major.minor`.
    pub min_server_version: String,
}

impl Default for EdgectlConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            lock_name: "edgectl-lock".to_string(),
            edge_label_key: "alibabacloud.com/is-edge-worker".to_string(),
            autonomy_annotation_key: "node.beta.alibabacloud.com/autonomy".to_string(),
            servant_image: "openyurt/yurtctl-servant:latest".to_string(),
            controller_manager_image: "openyurt/yurt-controller-manager:latest".to_string(),
            tunnel_server_image: "openyurt/yurt-tunnel-server:latest".to_string(),
            tunnel_agent_image: "openyurt/yurt-tunnel-agent:latest".to_string(),
            job_timeout_secs: 300,
            job_poll_interval_secs: 5,
            job_ttl_secs: 600,
            min_server_version: "1.14".to_string(),
        }
    }
}

impl EdgectlConfig {
    /// Load from `path` if given (it must exist), otherwise from
    /// `edgectl.toml` in the working directory when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_PATH).exists() => Self::from_file(Path::new(DEFAULT_PATH))?,
            None => Self::default(),
        };

        if let Ok(image) = std::env::var(SERVANT_IMAGE_ENV)
            && !image.is_empty()
        {
            config.servant_image = image;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.servant_image.trim().is_empty() {
            bail!("servant image must not be empty");
        }
        if self.job_poll_interval_secs == 0 {
            bail!("job_poll_interval_secs must be at least 1");
        }
        self.min_version()?;
        Ok(())
    }

    pub fn min_version(&self) -> Result<KubeVersion> {
        self.min_server_version
            .parse()
            .with_context(|| format!("invalid min_server_version {:?}", self.min_server_version))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            namespace: self.namespace.clone(),
            image: self.servant_image.clone(),
            timeout: Duration::from_secs(self.job_timeout_secs),
            poll_interval: Duration::from_secs(self.job_poll_interval_secs),
        }
    }

    pub fn component_settings(&self) -> ComponentSettings {
        ComponentSettings {
            namespace: self.namespace.clone(),
            edge_label_key: self.edge_label_key.clone(),
            controller_manager_image: self.controller_manager_image.clone(),
            tunnel_server_image: self.tunnel_server_image.clone(),
            tunnel_agent_image: self.tunnel_agent_image.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EdgectlConfig::default();
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.edge_label_key, "alibabacloud.com/is-edge-worker");
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.min_version().unwrap(), KubeVersion::new(1, 14));
        config.validate().unwrap();
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            servant_image = "registry.local/servant:v2"
            job_timeout_secs = 60
        "#;
        let config: EdgectlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servant_image, "registry.local/servant:v2");
        assert_eq!(config.job_timeout_secs, 60);
        assert_eq!(config.lock_name, "edgectl-lock");
        assert_eq!(config.dispatch_settings().timeout, Duration::from_secs(60));
    }

    #[test]
    fn load_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "namespace = \"edge-system\"").unwrap();
        let config = EdgectlConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.namespace, "edge-system");
        assert_eq!(config.component_settings().namespace, "edge-system");
    }

    #[test]
    fn load_fails_on_missing_explicit_path() {
        assert!(EdgectlConfig::load(Some(Path::new("/definitely/not/edgectl.toml"))).is_err());
    }

    #[test]
    fn validate_rejects_bad_version_floor() {
        let config = EdgectlConfig {
            min_server_version: "latest".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
