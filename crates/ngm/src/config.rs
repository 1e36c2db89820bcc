//! YAML configuration for the control plane.
//!
//! Loading is strict: unknown keys are rejected so typos surface at startup
//! instead of silently falling back to defaults.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr as _,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub phpfpm: PhpFpmConfig,
    #[serde(default)]
    pub hosting: HostingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub allow_ips: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tokens: Vec::new(),
            allow_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NginxConfig {
    #[serde(default)]
    pub root: String,
    #[serde(default = "default_main_conf")]
    pub main_conf: String,
    #[serde(default = "default_sites_dir")]
    pub sites_dir: String,
    #[serde(default = "default_nginx_bin")]
    pub bin: String,
    #[serde(default)]
    pub apply: NginxApplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NginxApplyConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_true")]
    pub test_before_reload: bool,
    #[serde(default)]
    pub reload_mode: ReloadMode,
}

impl Default for NginxApplyConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            backup_dir: default_backup_dir(),
            test_before_reload: true,
            reload_mode: ReloadMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    #[default]
    Signal,
    Systemd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertsConfig {
    #[serde(default = "default_certs_mode")]
    pub mode: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub webroot: String,
    #[serde(default)]
    pub letsencrypt_live: String,
    #[serde(default = "default_certbot_bin")]
    pub certbot_bin: String,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            mode: default_certs_mode(),
            email: String::new(),
            webroot: String::new(),
            letsencrypt_live: String::new(),
            certbot_bin: default_certbot_bin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhpFpmConfig {
    #[serde(default = "default_php_version")]
    pub default_version: String,
    #[serde(default)]
    pub versions: BTreeMap<String, PhpFpmVersion>,
}

impl Default for PhpFpmConfig {
    fn default() -> Self {
        Self {
            default_version: default_php_version(),
            versions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhpFpmVersion {
    pub pools_dir: String,
    pub service: String,
    pub sock_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostingConfig {
    #[serde(default = "default_home_root")]
    pub home_root: String,
    #[serde(default = "default_sites_root_name")]
    pub sites_root_name: String,
    #[serde(default = "default_web_group")]
    pub web_group: String,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            home_root: default_home_root(),
            sites_root_name: default_sites_root_name(),
            web_group: default_web_group(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            audit_log: default_audit_log(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9601".to_string()
}
fn default_main_conf() -> String {
    "conf/nginx.conf".to_string()
}
fn default_sites_dir() -> String {
    "conf/sites".to_string()
}
fn default_nginx_bin() -> String {
    "sbin/nginx".to_string()
}
fn default_staging_dir() -> String {
    "conf/.staging".to_string()
}
fn default_backup_dir() -> String {
    "conf/.backup".to_string()
}
fn default_certs_mode() -> String {
    "certbot".to_string()
}
fn default_certbot_bin() -> String {
    "certbot".to_string()
}
fn default_php_version() -> String {
    "8.4".to_string()
}
fn default_home_root() -> String {
    "/home".to_string()
}
fn default_sites_root_name() -> String {
    "sites".to_string()
}
fn default_web_group() -> String {
    "www-data".to_string()
}
fn default_audit_log() -> String {
    "/var/log/ngm/audit.log".to_string()
}
fn default_sqlite_path() -> String {
    "/var/lib/ngm/ngm.db".to_string()
}
fn default_true() -> bool {
    true
}

/// Absolute locations everything else works with. Relative nginx paths
/// resolve against `nginx.root`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub nginx_root: PathBuf,
    pub nginx_bin: PathBuf,
    pub nginx_main_conf: PathBuf,
    pub nginx_sites_dir: PathBuf,
    pub nginx_stage_dir: PathBuf,
    pub nginx_backup_dir: PathBuf,

    /// Can be a bare name resolved via PATH.
    pub certbot_bin: String,
    pub acme_webroot: PathBuf,
    pub letsencrypt_live: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse yaml {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errs: Vec<String> = Vec::new();

        if self.nginx.root.trim().is_empty() {
            errs.push("nginx.root is required (e.g. /opt/nginx)".to_string());
        }

        if self.api.tokens.is_empty() {
            errs.push("api.tokens must contain at least one token".to_string());
        }
        for (i, t) in self.api.tokens.iter().enumerate() {
            if t.trim().is_empty() {
                errs.push(format!("api.tokens[{i}] is empty"));
            }
        }

        for (i, cidr) in self.api.allow_ips.iter().enumerate() {
            if cidr.trim().is_empty() {
                errs.push(format!("api.allow_ips[{i}] is empty"));
                continue;
            }
            if let Err(e) = validate_cidr(cidr) {
                errs.push(format!("api.allow_ips[{i}]={cidr:?} invalid CIDR: {e}"));
            }
        }

        if self.certs.mode != "certbot" {
            errs.push(format!(
                "certs.mode={:?} unsupported (only 'certbot' is supported)",
                self.certs.mode
            ));
        }
        if self.certs.webroot.trim().is_empty() {
            errs.push("certs.webroot is required (e.g. /opt/nginx/html)".to_string());
        }
        if self.certs.letsencrypt_live.trim().is_empty() {
            errs.push("certs.letsencrypt_live is required (e.g. /etc/letsencrypt/live)".to_string());
        }

        if !self.phpfpm.versions.is_empty()
            && !self.phpfpm.versions.contains_key(&self.phpfpm.default_version)
        {
            errs.push(format!(
                "phpfpm.default_version={:?} not found in phpfpm.versions map",
                self.phpfpm.default_version
            ));
        }
        for (ver, v) in &self.phpfpm.versions {
            if v.pools_dir.trim().is_empty() {
                errs.push(format!("phpfpm.versions[{ver:?}].pools_dir is required"));
            }
            if v.service.trim().is_empty() {
                errs.push(format!("phpfpm.versions[{ver:?}].service is required"));
            }
            if v.sock_dir.trim().is_empty() {
                errs.push(format!("phpfpm.versions[{ver:?}].sock_dir is required"));
            }
        }

        if !errs.is_empty() {
            anyhow::bail!("config validation failed:\n- {}", errs.join("\n- "));
        }
        Ok(())
    }

    pub fn resolve_paths(&self) -> Paths {
        let root = PathBuf::from(&self.nginx.root);
        Paths {
            nginx_root: root.clone(),
            nginx_bin: abs_or_join(&root, &self.nginx.bin),
            nginx_main_conf: abs_or_join(&root, &self.nginx.main_conf),
            nginx_sites_dir: abs_or_join(&root, &self.nginx.sites_dir),
            nginx_stage_dir: abs_or_join(&root, &self.nginx.apply.staging_dir),
            nginx_backup_dir: abs_or_join(&root, &self.nginx.apply.backup_dir),
            certbot_bin: self.certs.certbot_bin.clone(),
            acme_webroot: PathBuf::from(&self.certs.webroot),
            letsencrypt_live: PathBuf::from(&self.certs.letsencrypt_live),
        }
    }
}

fn abs_or_join(root: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Validates "addr/prefix" CIDR notation (bare addresses are rejected: the
/// allowlist is explicit about ranges).
fn validate_cidr(s: &str) -> Result<(), String> {
    let (ip, prefix) = s
        .split_once('/')
        .ok_or_else(|| "missing '/prefix'".to_string())?;
    let addr = IpAddr::from_str(ip.trim()).map_err(|e| e.to_string())?;
    let prefix: u8 = prefix.trim().parse().map_err(|_| "bad prefix".to_string())?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(format!("prefix {prefix} exceeds /{max}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
api:
  tokens: ["t0ken"]
nginx:
  root: /opt/nginx
certs:
  webroot: /opt/nginx/html
  letsencrypt_live: /etc/letsencrypt/live
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_yaml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.api.listen, "127.0.0.1:9601");
        assert_eq!(cfg.nginx.bin, "sbin/nginx");
        assert!(cfg.nginx.apply.test_before_reload);
        assert_eq!(cfg.nginx.apply.reload_mode, ReloadMode::Signal);
        assert_eq!(cfg.certs.certbot_bin, "certbot");
        assert_eq!(cfg.hosting.web_group, "www-data");
        assert_eq!(cfg.storage.sqlite_path, "/var/lib/ngm/ngm.db");
    }

    #[test]
    fn resolves_relative_paths_against_root() {
        let cfg: Config = serde_yaml::from_str(MINIMAL).unwrap();
        let paths = cfg.resolve_paths();
        assert_eq!(paths.nginx_bin, PathBuf::from("/opt/nginx/sbin/nginx"));
        assert_eq!(paths.nginx_sites_dir, PathBuf::from("/opt/nginx/conf/sites"));
        assert_eq!(
            paths.nginx_stage_dir,
            PathBuf::from("/opt/nginx/conf/.staging")
        );
        assert_eq!(
            paths.nginx_backup_dir,
            PathBuf::from("/opt/nginx/conf/.backup")
        );
    }

    #[test]
    fn absolute_paths_win_over_root() {
        let mut cfg: Config = serde_yaml::from_str(MINIMAL).unwrap();
        cfg.nginx.sites_dir = "/srv/nginx/sites".to_string();
        let paths = cfg.resolve_paths();
        assert_eq!(paths.nginx_sites_dir, PathBuf::from("/srv/nginx/sites"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let res: Result<Config, _> = serde_yaml::from_str("nginxx:\n  root: /opt\n");
        assert!(res.is_err());
    }

    #[test]
    fn validation_collects_all_errors() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("nginx.root is required"));
        assert!(err.contains("api.tokens"));
        assert!(err.contains("certs.webroot"));
        assert!(err.contains("certs.letsencrypt_live"));
    }

    #[test]
    fn rejects_bad_cidr_and_unknown_default_php() {
        let yaml = r#"
api:
  tokens: ["x"]
  allow_ips: ["10.0.0.0/8", "not-a-cidr"]
nginx:
  root: /opt/nginx
certs:
  webroot: /w
  letsencrypt_live: /l
phpfpm:
  default_version: "8.3"
  versions:
    "8.2":
      pools_dir: /etc/php/8.2/fpm/pool.d
      service: php8.2-fpm
      sock_dir: /run/php
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("invalid CIDR"));
        assert!(err.contains("default_version"));
    }

    #[test]
    fn php_version_entries_require_all_fields() {
        let yaml = r#"
api:
  tokens: ["x"]
nginx:
  root: /opt/nginx
certs:
  webroot: /w
  letsencrypt_live: /l
phpfpm:
  default_version: "8.3"
  versions:
    "8.3":
      pools_dir: ""
      service: php8.3-fpm
      sock_dir: /run/php
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("pools_dir is required"));
    }
}
