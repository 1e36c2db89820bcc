//! Transport-agnostic application core wiring the store, the nginx driver,
//! the PHP-FPM pool manager, and the certificate manager. The CLI and the
//! HTTP API both call into this layer.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use tokio::sync::Mutex;

use crate::{
    certs::{self, CertbotManager, CertInfo},
    config::{Config, Paths},
    db::{Db, Site, SiteMode, SiteUpsert},
    fpm,
    nginx::Manager,
    provision,
    render::{
        CacheCfg, FastCgiCfg, ModeCfg, ProxyCfg, SiteTemplateData, UpstreamTarget, domain_key,
    },
    runner::CommandRunner,
};

pub struct App {
    pub cfg: Config,
    pub paths: Paths,
    pub db: Db,
    pub ng: Manager,
    pub(crate) runner: Arc<dyn CommandRunner>,

    // Serializes every apply; anything touching live config or the nginx
    // process must hold it.
    pub(crate) apply_mu: Mutex<()>,
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[derive(Clone, Debug, Default)]
pub struct SiteAddRequest {
    pub user: String,
    pub domain: String,
    pub mode: SiteMode,
    pub php_version: String,
    pub webroot: String,
    pub http3: bool,
    pub provision: bool,
    pub skip_cert: bool,
    pub apply_now: bool,

    /// For proxy mode: "addr" or "addr weight", one entry per target.
    pub proxy_targets: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SiteAddResult {
    pub site: Site,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct SiteEditRequest {
    pub domain: String,

    // empty = keep existing; booleans are tri-state through Option
    pub user: String,
    pub mode: Option<SiteMode>,
    pub php_version: String,
    pub webroot: String,
    pub http3: Option<bool>,
    pub enabled: Option<bool>,

    pub apply_now: bool,
}

impl App {
    pub fn new(cfg: Config, db: Db, runner: Arc<dyn CommandRunner>) -> anyhow::Result<Arc<Self>> {
        let paths = cfg.resolve_paths();
        let ng = Manager::new(
            paths.nginx_root.clone(),
            paths.nginx_bin.clone(),
            paths.nginx_main_conf.clone(),
            paths.nginx_sites_dir.clone(),
            paths.nginx_stage_dir.clone(),
            paths.nginx_backup_dir.clone(),
            cfg.nginx.apply.reload_mode,
            runner.clone(),
        );
        ng.ensure_layout().context("nginx layout")?;

        Ok(Arc::new(Self {
            cfg,
            paths,
            db,
            ng,
            runner,
            apply_mu: Mutex::new(()),
        }))
    }

    pub fn cert_manager(&self) -> CertbotManager {
        CertbotManager::new(
            self.paths.certbot_bin.clone(),
            self.paths.acme_webroot.clone(),
            self.paths.letsencrypt_live.clone(),
            self.cfg.certs.email.clone(),
            self.runner.clone(),
        )
    }

    pub async fn site_add(&self, req: SiteAddRequest) -> anyhow::Result<SiteAddResult> {
        let user = req.user.trim().to_string();
        let domain = normalize_domain(&req.domain);
        if user.is_empty() || domain.is_empty() {
            anyhow::bail!("user and domain are required");
        }

        let php_version = if req.php_version.trim().is_empty() {
            self.cfg.phpfpm.default_version.clone()
        } else {
            req.php_version.trim().to_string()
        };

        let home = Path::new(&self.cfg.hosting.home_root).join(&user);
        let db_user = self
            .db
            .ensure_user(&user, &home.to_string_lossy())
            .await?;

        let webroot = if req.webroot.trim().is_empty() {
            home.join(&self.cfg.hosting.sites_root_name)
                .join(&domain)
                .join("public")
        } else {
            PathBuf::from(req.webroot.trim())
        };

        if req.provision {
            provision::ensure_system_user(self.runner.as_ref(), &user, &home).await?;
            provision::ensure_site_dirs(&user, &home, &webroot, &self.cfg.hosting.web_group)?;
        }

        let site = self
            .db
            .upsert_site(SiteUpsert {
                user_id: db_user.id,
                domain: domain.clone(),
                mode: req.mode,
                webroot: webroot.to_string_lossy().to_string(),
                php_version,
                enable_http3: req.http3,
                enabled: true,
            })
            .await?;

        let mut warnings = Vec::new();

        if req.mode == SiteMode::Proxy {
            for line in &req.proxy_targets {
                let Some((target, weight)) = parse_proxy_target_line(line) else {
                    continue;
                };
                if let Err(e) = self
                    .db
                    .upsert_proxy_target(site.id, &target, weight, false, true)
                    .await
                {
                    warnings.push(format!("proxy target add failed: {e:#}"));
                }
            }
        }

        let mut apply_now = req.apply_now;
        if req.mode == SiteMode::Proxy && apply_now {
            let targets = self.db.list_enabled_proxy_targets(site.id).await?;
            if targets.is_empty() {
                warnings.push(
                    "proxy site created: add at least 1 proxy target, then apply".to_string(),
                );
                apply_now = false;
            }
        }

        // Publish the vhost immediately so the HTTP-01 challenge can be
        // served before issuance.
        if apply_now
            && let Err(e) = self
                .apply(crate::apply::ApplyRequest {
                    domain: Some(domain.clone()),
                    ..Default::default()
                })
                .await
        {
            warnings.push(format!("apply-now failed: {e:#}"));
        }

        if !req.skip_cert
            && let Err(e) = self.cert_issue(&domain, true).await
        {
            warnings.push(format!("certificate issuance failed: {e:#}"));
        }

        let site = self
            .db
            .get_site_by_domain(&domain)
            .await?
            .with_context(|| format!("site not found: {domain}"))?;
        Ok(SiteAddResult { site, warnings })
    }

    pub async fn site_edit(&self, req: SiteEditRequest) -> anyhow::Result<Site> {
        let domain = normalize_domain(&req.domain);
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }

        let cur = self
            .db
            .get_site_by_domain(&domain)
            .await?
            .with_context(|| format!("site not found: {domain}"))?;

        let user_id = if req.user.trim().is_empty() {
            cur.user_id
        } else {
            let user = req.user.trim();
            let home = Path::new(&self.cfg.hosting.home_root).join(user);
            self.db
                .ensure_user(user, &home.to_string_lossy())
                .await?
                .id
        };

        let updated = self
            .db
            .upsert_site(SiteUpsert {
                user_id,
                domain: domain.clone(),
                mode: req.mode.unwrap_or(cur.mode),
                webroot: if req.webroot.trim().is_empty() {
                    cur.webroot
                } else {
                    req.webroot.trim().to_string()
                },
                php_version: if req.php_version.trim().is_empty() {
                    cur.php_version
                } else {
                    req.php_version.trim().to_string()
                },
                enable_http3: req.http3.unwrap_or(cur.enable_http3),
                enabled: req.enabled.unwrap_or(cur.enabled),
            })
            .await?;

        if req.apply_now {
            let _ = self
                .apply(crate::apply::ApplyRequest {
                    domain: Some(domain),
                    ..Default::default()
                })
                .await;
        }

        Ok(updated)
    }

    pub async fn site_list(&self) -> anyhow::Result<Vec<Site>> {
        self.db.list_sites().await
    }

    pub async fn site_get(&self, domain: &str) -> anyhow::Result<Site> {
        let domain = normalize_domain(domain);
        self.db
            .get_site_by_domain(&domain)
            .await?
            .with_context(|| format!("site not found: {domain}"))
    }

    pub async fn site_disable(&self, domain: &str) -> anyhow::Result<()> {
        self.db
            .disable_site_by_domain(&normalize_domain(domain))
            .await
    }

    pub async fn site_enable(&self, domain: &str) -> anyhow::Result<()> {
        self.db
            .enable_site_by_domain(&normalize_domain(domain))
            .await
    }

    /// Hard delete: only allowed once the site is already disabled, so the
    /// live vhost has had a reconcile pass to disappear first.
    pub async fn site_delete(&self, domain: &str) -> anyhow::Result<()> {
        let domain = normalize_domain(domain);
        let site = self
            .db
            .get_site_by_domain(&domain)
            .await?
            .with_context(|| format!("site not found: {domain}"))?;
        if site.enabled {
            anyhow::bail!("site {domain} is still enabled; disable it first, apply, then delete");
        }
        self.db.delete_site_by_domain(&domain).await
    }

    pub async fn proxy_target_add(
        &self,
        domain: &str,
        target: &str,
        weight: i64,
        is_backup: bool,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let site = self.site_get(domain).await?;
        self.db
            .upsert_proxy_target(site.id, target, weight, is_backup, enabled)
            .await
    }

    pub async fn proxy_target_disable(&self, domain: &str, target: &str) -> anyhow::Result<()> {
        let site = self.site_get(domain).await?;
        self.db.disable_proxy_target(site.id, target).await
    }

    pub async fn proxy_target_list(
        &self,
        domain: &str,
    ) -> anyhow::Result<Vec<crate::db::ProxyTarget>> {
        let site = self.site_get(domain).await?;
        self.db.list_proxy_targets(site.id).await
    }

    pub async fn cert_issue(&self, domain: &str, apply_after: bool) -> anyhow::Result<()> {
        let domain = normalize_domain(domain);
        self.cert_manager().issue_cert(&domain).await?;
        if apply_after {
            self.apply(crate::apply::ApplyRequest {
                domain: Some(domain),
                ..Default::default()
            })
            .await?;
        }
        Ok(())
    }

    pub async fn cert_renew(
        &self,
        domain: &str,
        all: bool,
        apply_after: bool,
    ) -> anyhow::Result<()> {
        let m = self.cert_manager();
        let domain = normalize_domain(domain);
        if all || domain.is_empty() {
            m.renew_all().await?;
        } else {
            m.renew_cert(&domain).await?;
        }
        if apply_after {
            self.apply(crate::apply::ApplyRequest {
                all: true,
                ..Default::default()
            })
            .await?;
        }
        Ok(())
    }

    pub fn cert_list(&self) -> anyhow::Result<Vec<CertInfo>> {
        self.cert_manager().list_certs()
    }

    pub fn cert_info(&self, domain: &str) -> anyhow::Result<CertInfo> {
        self.cert_manager().get_cert_info(&normalize_domain(domain))
    }

    pub fn cert_check(&self, days: i64) -> anyhow::Result<Vec<CertInfo>> {
        self.cert_manager().check_expiring(days)
    }

    /// Builds the render input for one site, with mode-specific side effects:
    /// php ensures the PHP-FPM pool, proxy loads its upstream targets, and
    /// missing ACME material falls back to a self-signed bootstrap pair.
    pub(crate) async fn build_template_data(
        &self,
        site: &Site,
        domain: &str,
    ) -> anyhow::Result<SiteTemplateData> {
        let webroot = PathBuf::from(&site.webroot);
        let site_root = webroot
            .parent()
            .with_context(|| format!("invalid webroot {:?}", site.webroot))?;
        let logs_dir = site_root.join("logs");

        let mode = match site.mode {
            SiteMode::Php => {
                let ver = self
                    .cfg
                    .phpfpm
                    .versions
                    .get(&site.php_version)
                    .with_context(|| {
                        format!(
                            "unknown php version {:?} (not in config phpfpm.versions)",
                            site.php_version
                        )
                    })?;

                let run_user = infer_user_from_webroot(
                    &self.cfg.hosting.home_root,
                    &site.webroot,
                )
                .with_context(|| {
                    format!(
                        "cannot infer site user from webroot {:?} (expected under {:?})",
                        site.webroot, self.cfg.hosting.home_root
                    )
                })?;
                let web_group = self.cfg.hosting.web_group.clone();

                let pool = fpm::PoolData {
                    pool_name: format!("ngm_{}", domain_key(domain)),
                    run_user: run_user.clone(),
                    run_group: run_user.clone(),
                    socket: PathBuf::new(),
                    listen_owner: run_user,
                    listen_group: web_group,
                    max_children: 10,
                    idle_timeout: "10s".to_string(),
                    max_requests: 500,
                    request_terminate_timeout: "60s".to_string(),
                    slowlog_timeout: "5s".to_string(),
                    slowlog_path: logs_dir.join("php-fpm.slow.log"),
                    error_log: logs_dir.join("php-fpm.error.log"),
                    php_admin_values: Default::default(),
                    php_values: Default::default(),
                };

                let (socket, _) = fpm::ensure_pool(
                    self.runner.as_ref(),
                    Path::new(&ver.pools_dir),
                    &ver.service,
                    Path::new(&ver.sock_dir),
                    domain,
                    &site.php_version,
                    pool,
                )
                .await
                .context("ensure fpm pool")?;

                ModeCfg::Php(FastCgiCfg {
                    pass: format!("unix:{}", socket.display()),
                    cache: CacheCfg {
                        enabled: true,
                        zone: "php_cache".to_string(),
                        ttl_200: "1s".to_string(),
                    },
                })
            }
            SiteMode::Proxy => {
                let targets = self.db.list_enabled_proxy_targets(site.id).await?;
                if targets.is_empty() {
                    anyhow::bail!("proxy mode requires at least 1 proxy target for {domain}");
                }
                ModeCfg::Proxy(ProxyCfg {
                    lb: "least_conn".to_string(),
                    targets: targets
                        .into_iter()
                        .map(|t| UpstreamTarget {
                            addr: t.target,
                            weight: t.weight,
                            is_backup: t.is_backup,
                        })
                        .collect(),
                    websockets: false,
                    pass_host: true,
                    time_connect: "3s".to_string(),
                    time_read: "60s".to_string(),
                    time_send: "60s".to_string(),
                    microcache: CacheCfg {
                        enabled: true,
                        zone: "proxy_micro".to_string(),
                        ttl_200: "1s".to_string(),
                    },
                    static_cache: CacheCfg {
                        enabled: true,
                        zone: "proxy_static".to_string(),
                        ttl_200: "30d".to_string(),
                    },
                })
            }
            SiteMode::Static => ModeCfg::Static,
        };

        // Prefer issued material, possibly behind a repaired lineage alias;
        // fall back to a self-signed pair so nginx always starts.
        let _ = self.cert_manager().ensure_live_alias(domain);
        let le_dir = self.paths.letsencrypt_live.join(domain);
        let le_cert = le_dir.join("fullchain.pem");
        let le_key = le_dir.join("privkey.pem");

        let (tls_cert, tls_key) = if le_cert.is_file() && le_key.is_file() {
            (le_cert, le_key)
        } else {
            let selfsigned = self.ng.root.join("conf").join("selfsigned").join(domain);
            let cert = selfsigned.join("fullchain.pem");
            let key = selfsigned.join("privkey.pem");
            certs::ensure_self_signed(self.runner.as_ref(), domain, &cert, &key).await?;
            (cert, key)
        };

        Ok(SiteTemplateData {
            domain: domain.to_string(),
            webroot,
            acme_webroot: self.paths.acme_webroot.clone(),
            enable_http3: site.enable_http3,
            tls_cert,
            tls_key,
            front_controller: true,
            access_log: logs_dir.join("access.log"),
            error_log: logs_dir.join("error.log"),
            mode,
        })
    }
}

fn infer_user_from_webroot(home_root: &str, webroot: &str) -> Option<String> {
    let home_root = home_root.trim_end_matches('/');
    if home_root.is_empty() {
        return None;
    }
    let rest = webroot.strip_prefix(&format!("{home_root}/"))?;
    let first = rest.split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// "addr" or "addr weight"; returns None for blank lines.
fn parse_proxy_target_line(line: &str) -> Option<(String, i64)> {
    let mut parts = line.split_whitespace();
    let addr = parts.next()?.to_string();
    let weight = parts
        .next()
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(100);
    Some((addr, weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_user_from_webroot_under_home_root() {
        assert_eq!(
            infer_user_from_webroot("/home", "/home/alice/sites/a.example/public"),
            Some("alice".to_string())
        );
        assert_eq!(
            infer_user_from_webroot("/home/", "/home/bob/www"),
            Some("bob".to_string())
        );
        assert_eq!(infer_user_from_webroot("/home", "/srv/www/a"), None);
        assert_eq!(infer_user_from_webroot("", "/home/alice"), None);
        assert_eq!(infer_user_from_webroot("/home", "/home/"), None);
    }

    #[test]
    fn parses_proxy_target_lines() {
        assert_eq!(
            parse_proxy_target_line("10.0.0.1:8080"),
            Some(("10.0.0.1:8080".to_string(), 100))
        );
        assert_eq!(
            parse_proxy_target_line("10.0.0.1:8080 50"),
            Some(("10.0.0.1:8080".to_string(), 50))
        );
        assert_eq!(
            parse_proxy_target_line("unix:/run/app.sock bogus"),
            Some(("unix:/run/app.sock".to_string(), 100))
        );
        assert_eq!(parse_proxy_target_line("   "), None);
    }
}
