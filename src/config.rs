use anyhow::{anyhow, Context};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub dkim: DkimConfig,
    #[serde(default)]
    pub dnswl: DnswlConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default = "default_user_types")]
    pub user_types: Vec<UserTypeConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Prefix the forum is mounted under, e.g. `/forum`. Empty at the root.
    #[serde(default)]
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Path secret guarding the send-request admission endpoints.
    #[serde(default)]
    pub register_token: String,
    /// Base64 of the PEM or DER encoded RSA private key for envelopes.
    #[serde(default)]
    pub register_sk: String,
    /// Address applicants send their encrypted request to.
    #[serde(default)]
    pub register_email: String,
    /// Shared secret for the DKIM status and invite admin endpoints.
    #[serde(default)]
    pub admin_token: String,
    /// Semicolon separated list of fully trusted signing/HELO domains.
    #[serde(default)]
    pub register_helo_domains: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    pub raw_email_save_dir: String,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            raw_email_save_dir: "/var/lib/pr-gatekeeper/dkim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnswlConfig {
    pub enabled: bool,
    pub zone: String,
    pub timeout_seconds: u64,
}

impl Default for DnswlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zone: "dnswl.org".to_string(),
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    pub enabled: bool,
    #[serde(default)]
    pub site_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_verify_url")]
    pub verify_url: String,
    #[serde(default = "default_captcha_timeout")]
    pub timeout_seconds: u64,
}

fn default_verify_url() -> String {
    "https://hcaptcha.com/siteverify".to_string()
}

fn default_captcha_timeout() -> u64 {
    10
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            site_key: String::new(),
            secret_key: String::new(),
            verify_url: default_verify_url(),
            timeout_seconds: default_captcha_timeout(),
        }
    }
}

/// One organisation. `code` doubles as the score in the sorted claim index,
/// so it must be a positive integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTypeConfig {
    pub code: i64,
    pub name: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_user_types() -> Vec<UserTypeConfig> {
    vec![
        UserTypeConfig {
            code: 1,
            name: "PKU".to_string(),
            domains: [
                "pku.edu.cn",
                "stu.pku.edu.cn",
                "bjmu.edu.cn",
                "hsc.pku.edu.cn",
                "sz.pku.edu.cn",
                "pku.org.cn",
                "alumni.pku.edu.cn",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        },
        UserTypeConfig {
            code: 2,
            name: "THU".to_string(),
            domains: [
                "mails.tsinghua.edu.cn",
                "mail.tsinghua.edu.cn",
                "tsinghua.edu.cn",
                "mailoa.tsinghua.edu.cn",
                "sem.tsinghua.edu.cn",
                "sz.tsinghua.edu.cn",
                "tsinghua.org.cn",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        },
    ]
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            registration: RegistrationConfig::default(),
            dkim: DkimConfig::default(),
            dnswl: DnswlConfig::default(),
            captcha: CaptchaConfig::default(),
            user_types: default_user_types(),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl GatekeeperConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: GatekeeperConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> &'static str {
        "/etc/pr-gatekeeper.yaml"
    }

    /// Trusted signing domains, empty entries dropped.
    pub fn helo_domains(&self) -> Vec<String> {
        self.registration
            .register_helo_domains
            .split(';')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut codes = HashSet::new();
        let mut domains = HashSet::new();
        for user_type in &self.user_types {
            if user_type.code <= 0 {
                return Err(anyhow!(
                    "User type {} has non-positive code {}",
                    user_type.name,
                    user_type.code
                ));
            }
            if !codes.insert(user_type.code) {
                return Err(anyhow!("Duplicate user type code {}", user_type.code));
            }
            for domain in &user_type.domains {
                if !domains.insert(domain.to_lowercase()) {
                    return Err(anyhow!("Domain {domain} is listed under more than one type"));
                }
            }
        }
        if !self.registration.register_sk.is_empty() {
            let compact: String = self
                .registration
                .register_sk
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            general_purpose::STANDARD
                .decode(compact)
                .context("register_sk is not valid base64")?;
        }
        Ok(())
    }
}
