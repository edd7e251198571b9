use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Base URL of the Cloud SQL admin API.
    #[serde(default = "default_admin_api_base")]
    pub admin_api_base: Url,
    /// Security Token Service exchange endpoint (workload identity federation).
    #[serde(default = "default_sts_token_url")]
    pub sts_token_url: Url,
    /// Base URL of the IAM credentials API (service account impersonation).
    #[serde(default = "default_iam_credentials_base")]
    pub iam_credentials_base: Url,
    /// Port the instances accept mTLS connections on (default: 3307).
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// A token this close to expiry is refreshed proactively (default: 300).
    #[serde(default = "default_token_expiry_skew")]
    pub token_expiry_skew_secs: u64,
    /// A certificate this close to notAfter is replaced (default: 900).
    #[serde(default = "default_cert_refresh_window")]
    pub cert_refresh_window_secs: u64,
    /// Sleep between background certificate pre-warms (default: 3000).
    #[serde(default = "default_cert_rotation_interval")]
    pub cert_rotation_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            admin_api_base: default_admin_api_base(),
            sts_token_url: default_sts_token_url(),
            iam_credentials_base: default_iam_credentials_base(),
            remote_port: default_remote_port(),
            token_expiry_skew_secs: default_token_expiry_skew(),
            cert_refresh_window_secs: default_cert_refresh_window(),
            cert_rotation_interval_secs: default_cert_rotation_interval(),
        }
    }
}

impl BrokerConfig {
    pub fn token_expiry_skew(&self) -> Duration {
        Duration::from_secs(self.token_expiry_skew_secs)
    }

    pub fn cert_refresh_window(&self) -> Duration {
        Duration::from_secs(self.cert_refresh_window_secs)
    }

    pub fn cert_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.cert_rotation_interval_secs)
    }
}

fn default_admin_api_base() -> Url {
    Url::parse("https://sqladmin.googleapis.com").expect("static url")
}

fn default_sts_token_url() -> Url {
    Url::parse("https://sts.googleapis.com/v1/token").expect("static url")
}

fn default_iam_credentials_base() -> Url {
    Url::parse("https://iamcredentials.googleapis.com").expect("static url")
}

fn default_remote_port() -> u16 {
    3307
}

fn default_token_expiry_skew() -> u64 {
    300
}

fn default_cert_refresh_window() -> u64 {
    900
}

fn default_cert_rotation_interval() -> u64 {
    3000
}

/// Canonical `project:region:name` triple identifying one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub project: String,
    pub region: String,
    pub name: String,
}

impl InstanceKey {
    /// Instance path component the admin API expects: `region~name`.
    pub fn admin_path(&self) -> String {
        format!("{}~{}", self.region, self.name)
    }

    /// Common name the instance's server certificate carries: `project:name`.
    pub fn server_cn(&self) -> String {
        format!("{}:{}", self.project, self.name)
    }
}

impl FromStr for InstanceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [project, region, name]
                if !project.is_empty() && !region.is_empty() && !name.is_empty() =>
            {
                Ok(InstanceKey {
                    project: project.to_string(),
                    region: region.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::InvalidInstanceName(s.to_string())),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}
