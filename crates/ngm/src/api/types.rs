use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::{certs::CertInfo, db::Site, db::SiteMode};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteResponse {
    pub id: i64,
    pub domain: String,
    pub mode: SiteMode,
    pub webroot: String,
    pub php_version: String,
    pub enable_http3: bool,
    pub enabled: bool,
    pub state: String,
    pub last_apply_status: String,
    pub last_apply_error: String,
    pub last_render_hash: String,
    pub last_applied_at: Option<String>,
    pub updated_at: Option<String>,

    // reserved per-site TLS overrides, surfaced for the panel
    pub tls_mode: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
}

impl From<Site> for SiteResponse {
    fn from(site: Site) -> Self {
        let state = site.state().to_string();
        Self {
            id: site.id,
            domain: site.domain,
            mode: site.mode,
            webroot: site.webroot,
            php_version: site.php_version,
            enable_http3: site.enable_http3,
            enabled: site.enabled,
            state,
            last_apply_status: site.last_apply_status,
            last_apply_error: site.last_apply_error,
            last_render_hash: site.last_render_hash,
            last_applied_at: site
                .last_applied_at
                .and_then(|t| t.format(&Rfc3339).ok()),
            updated_at: site.updated_at.and_then(|t| t.format(&Rfc3339).ok()),
            tls_mode: site.tls_mode,
            tls_cert_path: site.tls_cert_path,
            tls_key_path: site.tls_key_path,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSitesResponse {
    pub sites: Vec<SiteResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSiteRequest {
    pub user: String,
    pub domain: String,
    #[serde(default)]
    pub mode: SiteMode,
    #[serde(default)]
    pub php_version: String,
    #[serde(default)]
    pub webroot: String,
    #[serde(default = "default_true")]
    pub http3: bool,
    #[serde(default)]
    pub provision: bool,
    #[serde(default)]
    pub skip_cert: bool,
    #[serde(default)]
    pub apply_now: bool,
    #[serde(default)]
    pub proxy_targets: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSiteResponse {
    pub site: SiteResponse,
    pub warnings: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyBody {
    pub domain: Option<String>,
    pub all: bool,
    pub dry_run: bool,
    pub limit: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertResponse {
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    pub exists: bool,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub days_left: i64,
}

impl From<CertInfo> for CertResponse {
    fn from(info: CertInfo) -> Self {
        Self {
            domain: info.domain,
            cert_path: info.cert_path.to_string_lossy().to_string(),
            key_path: info.key_path.to_string_lossy().to_string(),
            exists: info.exists,
            not_before: info.not_before.and_then(|t| t.format(&Rfc3339).ok()),
            not_after: info.not_after.and_then(|t| t.format(&Rfc3339).ok()),
            days_left: info.days_left,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCertsResponse {
    pub certs: Vec<CertResponse>,
}
