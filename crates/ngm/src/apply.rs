//! The apply pipeline: converges live nginx state onto the desired state in
//! the store. Staged writes complete before validation, validation before the
//! single batch reload, and every changed domain rolls back from its backup
//! (plus one recovery reload) when validation or reload fails.

use std::collections::HashMap;

use anyhow::Context as _;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tracing::{info, warn};

use crate::{
    app::{App, normalize_domain},
    atomic::write_file_atomic,
    nginx::Manager,
};

#[derive(Clone, Debug, Default)]
pub struct ApplyRequest {
    /// Single-site mode when set and non-empty.
    pub domain: Option<String>,
    /// Batch mode: also apply enabled sites that are not pending.
    pub all: bool,
    pub dry_run: bool,
    /// Max sites actioned in batch mode; 0 = unlimited.
    pub limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyAction {
    Apply,
    Delete,
    Skip,
}

impl ApplyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Apply => "apply",
            ApplyAction::Delete => "delete",
            ApplyAction::Skip => "skip",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStatus {
    Ok,
    Fail,
    Skipped,
    DryRun,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Ok => "ok",
            ApplyStatus::Fail => "fail",
            ApplyStatus::Skipped => "skipped",
            ApplyStatus::DryRun => "dry-run",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDomainResult {
    pub domain: String,
    pub action: ApplyAction,
    pub changed: bool,
    pub render_hash: String,
    pub status: ApplyStatus,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub domains: Vec<ApplyDomainResult>,
    pub changed: Vec<String>,
    pub reloaded: bool,
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn row(
    domain: &str,
    action: ApplyAction,
    status: ApplyStatus,
    changed: bool,
    render_hash: &str,
    error: &str,
) -> ApplyDomainResult {
    ApplyDomainResult {
        domain: domain.to_string(),
        action,
        changed,
        render_hash: render_hash.to_string(),
        status,
        error: error.to_string(),
    }
}

impl App {
    /// Reconciles desired state onto disk and the nginx process. Serialized
    /// by the process-wide apply mutex; concurrent callers queue.
    pub async fn apply(&self, req: ApplyRequest) -> anyhow::Result<ApplyResult> {
        let _guard = self.apply_mu.lock().await;

        if let Some(domain) = req.domain.as_deref() {
            let domain = normalize_domain(domain);
            if !domain.is_empty() {
                info!(domain, dry_run = req.dry_run, "apply (single site)");
                return self.apply_one(&domain, req.dry_run).await;
            }
        }
        info!(all = req.all, dry_run = req.dry_run, limit = req.limit, "apply (batch)");
        self.apply_batch(&req).await
    }

    async fn apply_one(&self, domain: &str, dry: bool) -> anyhow::Result<ApplyResult> {
        let mut res = ApplyResult::default();
        let site = self
            .db
            .get_site_by_domain(domain)
            .await
            .context("get site")?
            .with_context(|| format!("site not found: {domain}"))?;

        if dry {
            let action = if site.enabled {
                ApplyAction::Apply
            } else {
                ApplyAction::Delete
            };
            self.record(domain, action.as_str(), "dry-run", "", "").await;
            res.domains
                .push(row(domain, action, ApplyStatus::DryRun, false, "", ""));
            return Ok(res);
        }

        if !site.enabled {
            let removed = match self.stage_delete_live_conf(domain) {
                Ok(removed) => removed,
                Err(e) => {
                    let msg = format!("delete live conf failed: {e:#}");
                    self.record(domain, "delete", "fail", &msg, "").await;
                    return Err(e);
                }
            };
            if !removed {
                self.record(domain, "delete", "ok", "", "").await;
                res.domains
                    .push(row(domain, ApplyAction::Delete, ApplyStatus::Ok, false, "", ""));
                return Ok(res);
            }

            let changed = vec![domain.to_string()];
            if let Err(msg) = self.test_and_reload(&changed).await {
                self.record(domain, "delete", "fail", &msg, "").await;
                anyhow::bail!(msg);
            }
            self.record(domain, "delete", "ok", "", "").await;
            res.domains
                .push(row(domain, ApplyAction::Delete, ApplyStatus::Ok, true, "", ""));
            res.changed = changed;
            res.reloaded = true;
            return Ok(res);
        }

        let td = match self.build_template_data(&site, domain).await {
            Ok(td) => td,
            Err(e) => {
                self.record(domain, "apply", "fail", &format!("{e:#}"), "").await;
                return Err(e);
            }
        };
        let content = match self.ng.render_site_to_staging(&td) {
            Ok(content) => content,
            Err(e) => {
                self.record(domain, "apply", "fail", &format!("{e:#}"), "").await;
                return Err(e);
            }
        };
        let render_hash = sha256_hex(&content);

        let changed_now = match self.ng.publish(domain) {
            Ok(changed) => changed,
            Err(e) => {
                self.record(domain, "apply", "fail", &format!("{e:#}"), &render_hash)
                    .await;
                return Err(e);
            }
        };

        if !changed_now {
            self.record(domain, "apply", "ok", "", &render_hash).await;
            res.domains.push(row(
                domain,
                ApplyAction::Apply,
                ApplyStatus::Ok,
                false,
                &render_hash,
                "",
            ));
            return Ok(res);
        }

        let changed = vec![domain.to_string()];
        if let Err(msg) = self.test_and_reload(&changed).await {
            self.record(domain, "apply", "fail", &msg, &render_hash).await;
            anyhow::bail!(msg);
        }

        self.record(domain, "apply", "ok", "", &render_hash).await;
        res.domains.push(row(
            domain,
            ApplyAction::Apply,
            ApplyStatus::Ok,
            true,
            &render_hash,
            "",
        ));
        res.changed = changed;
        res.reloaded = true;
        Ok(res)
    }

    async fn apply_batch(&self, req: &ApplyRequest) -> anyhow::Result<ApplyResult> {
        let mut res = ApplyResult::default();
        let sites = self.db.list_sites().await.context("list sites")?;

        let mut actioned = 0usize;
        let mut changed: Vec<String> = Vec::new();
        let mut changed_hashes: HashMap<String, String> = HashMap::new();
        let mut changed_actions: HashMap<String, &'static str> = HashMap::new();

        for site in sites {
            if req.limit > 0 && actioned >= req.limit {
                break;
            }

            let d = normalize_domain(&site.domain);
            if d.is_empty() {
                continue;
            }

            if !site.enabled {
                if req.dry_run {
                    self.record(&d, "delete", "dry-run", "", "").await;
                    res.domains
                        .push(row(&d, ApplyAction::Delete, ApplyStatus::DryRun, false, "", ""));
                    actioned += 1;
                    continue;
                }

                match self.stage_delete_live_conf(&d) {
                    Err(e) => {
                        let msg = format!("delete live conf failed: {e:#}");
                        self.record(&d, "delete", "fail", &msg, "").await;
                        res.domains.push(row(
                            &d,
                            ApplyAction::Delete,
                            ApplyStatus::Fail,
                            false,
                            "",
                            &msg,
                        ));
                    }
                    Ok(removed) => {
                        if removed {
                            // final status settles after the batch test+reload
                            changed.push(d.clone());
                            changed_hashes.insert(d.clone(), String::new());
                            changed_actions.insert(d.clone(), "delete");
                            res.domains
                                .push(row(&d, ApplyAction::Delete, ApplyStatus::Ok, true, "", ""));
                        } else {
                            self.record(&d, "delete", "ok", "", "").await;
                            res.domains
                                .push(row(&d, ApplyAction::Delete, ApplyStatus::Ok, false, "", ""));
                        }
                    }
                }
                actioned += 1;
                continue;
            }

            if !req.all && !site.needs_apply() {
                self.record(&d, "skip", "skipped", "", "").await;
                res.domains
                    .push(row(&d, ApplyAction::Skip, ApplyStatus::Skipped, false, "", ""));
                continue;
            }

            if req.dry_run {
                self.record(&d, "apply", "dry-run", "", "").await;
                res.domains
                    .push(row(&d, ApplyAction::Apply, ApplyStatus::DryRun, false, "", ""));
                actioned += 1;
                continue;
            }

            let td = match self.build_template_data(&site, &d).await {
                Ok(td) => td,
                Err(e) => {
                    let msg = format!("{e:#}");
                    self.record(&d, "apply", "fail", &msg, "").await;
                    res.domains
                        .push(row(&d, ApplyAction::Apply, ApplyStatus::Fail, false, "", &msg));
                    actioned += 1;
                    continue;
                }
            };

            let content = match self.ng.render_site_to_staging(&td) {
                Ok(content) => content,
                Err(e) => {
                    let msg = format!("{e:#}");
                    self.record(&d, "apply", "fail", &msg, "").await;
                    res.domains
                        .push(row(&d, ApplyAction::Apply, ApplyStatus::Fail, false, "", &msg));
                    actioned += 1;
                    continue;
                }
            };
            let render_hash = sha256_hex(&content);

            match self.ng.publish(&d) {
                Err(e) => {
                    let msg = format!("{e:#}");
                    self.record(&d, "apply", "fail", &msg, &render_hash).await;
                    res.domains.push(row(
                        &d,
                        ApplyAction::Apply,
                        ApplyStatus::Fail,
                        false,
                        &render_hash,
                        &msg,
                    ));
                }
                Ok(true) => {
                    changed.push(d.clone());
                    changed_hashes.insert(d.clone(), render_hash.clone());
                    changed_actions.insert(d.clone(), "apply");
                    res.domains.push(row(
                        &d,
                        ApplyAction::Apply,
                        ApplyStatus::Ok,
                        true,
                        &render_hash,
                        "",
                    ));
                }
                Ok(false) => {
                    self.record(&d, "apply", "ok", "", &render_hash).await;
                    res.domains.push(row(
                        &d,
                        ApplyAction::Apply,
                        ApplyStatus::Ok,
                        false,
                        &render_hash,
                        "",
                    ));
                }
            }
            actioned += 1;
        }

        res.domains.sort_by(|a, b| a.domain.cmp(&b.domain));

        if req.dry_run || changed.is_empty() {
            return Ok(res);
        }

        // one validation + one reload for the whole batch
        if let Err(msg) = self.test_and_reload(&changed).await {
            for d in &changed {
                let hash = changed_hashes.get(d).map(String::as_str).unwrap_or("");
                let action = changed_actions.get(d).copied().unwrap_or("apply");
                self.record(d, action, "fail", &msg, hash).await;
                if let Some(r) = res.domains.iter_mut().find(|r| &r.domain == d) {
                    r.status = ApplyStatus::Fail;
                    r.error = msg.clone();
                }
            }
            anyhow::bail!(msg);
        }

        for d in &changed {
            let hash = changed_hashes.get(d).map(String::as_str).unwrap_or("");
            let action = changed_actions.get(d).copied().unwrap_or("apply");
            self.record(d, action, "ok", "", hash).await;
        }

        res.changed = changed;
        res.reloaded = true;
        Ok(res)
    }

    /// Validates (when configured) then reloads. On failure every changed
    /// domain is restored from its backup and a best-effort recovery reload
    /// brings nginx back to the known-good state; the original failure is
    /// returned as the error message.
    async fn test_and_reload(&self, changed: &[String]) -> Result<(), String> {
        if self.cfg.nginx.apply.test_before_reload
            && let Err(e) = self.ng.test_config().await
        {
            warn!(domains = ?changed, "nginx -t failed, rolling back");
            rollback_from_backup(&self.ng, changed);
            let _ = self.ng.reload().await;
            return Err(format!("nginx -t failed (rolled back): {e:#}"));
        }

        if let Err(e) = self.ng.reload().await {
            warn!(domains = ?changed, "nginx reload failed, rolling back");
            rollback_from_backup(&self.ng, changed);
            let _ = self.ng.reload().await;
            return Err(format!("nginx reload failed (rolled back): {e:#}"));
        }
        Ok(())
    }

    fn stage_delete_live_conf(&self, domain: &str) -> anyhow::Result<bool> {
        if !self.ng.live_conf_path(domain).exists() {
            return Ok(false);
        }
        self.ng.remove_live_site(domain)?;
        Ok(true)
    }

    async fn record(&self, domain: &str, action: &str, status: &str, message: &str, hash: &str) {
        if let Err(e) = self
            .db
            .record_apply(domain, action, status, message, hash)
            .await
        {
            warn!(domain, error = %format!("{e:#}"), "failed to record apply result");
        }
        self.append_audit_line(domain, action, status, message);
    }

    /// Best-effort flat-file audit trail alongside the store rows; a broken
    /// log path must never fail an apply.
    fn append_audit_line(&self, domain: &str, action: &str, status: &str, message: &str) {
        use std::io::Write as _;

        let path = std::path::Path::new(&self.cfg.security.audit_log);
        if path.as_os_str().is_empty() {
            return;
        }
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }

        let ts = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let line = format!("{ts} apply domain={domain} action={action} status={status} message={message:?}\n");
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }
}

/// Restores every domain's live file from its backup (or removes the live
/// file when no backup exists). Best-effort: an unreadable backup must not
/// stop the remaining domains from being restored.
fn rollback_from_backup(ng: &Manager, domains: &[String]) {
    for d in domains {
        let dst = ng.live_conf_path(d);
        let bak = ng.backup_path(d);

        match std::fs::read(&bak) {
            Ok(data) if !data.is_empty() => {
                if let Err(e) = write_file_atomic(&dst, &data, 0o644) {
                    warn!(domain = %d, error = %format!("{e:#}"), "rollback restore failed");
                }
            }
            _ => {
                let _ = std::fs::remove_file(&dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::{SiteAddRequest, SiteEditRequest},
        config::{Config, PhpFpmVersion},
        db::{Db, Site, SiteMode},
        runner::{CommandError, CommandOutput, CommandRunner, CommandSpec},
    };
    use std::{
        fs,
        path::Path,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail_test: AtomicBool,
    }

    impl FakeRunner {
        fn reload_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, args)| args.as_slice() == ["-s", "reload"])
                .count()
        }

        fn test_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, args)| args.first().map(String::as_str) == Some("-t"))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            spec: CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push((spec.program.clone(), spec.args.clone()));

            if spec.program == "openssl" {
                // stand-in for the X.509 tool: drop key material where asked
                for flag in ["-keyout", "-out"] {
                    if let Some(pos) = spec.args.iter().position(|a| a == flag) {
                        let path = Path::new(&spec.args[pos + 1]);
                        fs::create_dir_all(path.parent().unwrap()).unwrap();
                        fs::write(path, format!("fake pem via {flag}\n")).unwrap();
                    }
                }
            }

            if spec.args.first().map(String::as_str) == Some("-t")
                && self.fail_test.load(Ordering::SeqCst)
            {
                return Err(CommandError::Failed {
                    command: spec.program.clone(),
                    status: 1,
                    stdout: String::new(),
                    stderr: "nginx: [emerg] unexpected end of file".to_string(),
                });
            }

            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct TestEnv {
        _tmp: tempfile::TempDir,
        app: Arc<crate::app::App>,
        runner: Arc<FakeRunner>,
    }

    async fn test_env() -> TestEnv {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = |s: &str| tmp.path().join(s).to_string_lossy().to_string();

        let mut cfg = Config::default();
        cfg.api.tokens = vec!["token".to_string()];
        cfg.nginx.root = p("nginx");
        cfg.certs.webroot = p("acme");
        cfg.certs.letsencrypt_live = p("letsencrypt/live");
        cfg.phpfpm.default_version = "8.3".to_string();
        cfg.phpfpm.versions.insert(
            "8.3".to_string(),
            PhpFpmVersion {
                pools_dir: p("pool.d"),
                service: "php8.3-fpm".to_string(),
                sock_dir: p("run/php"),
            },
        );
        cfg.hosting.home_root = p("home");
        cfg.security.audit_log = p("audit.log");
        cfg.validate().unwrap();

        let db = Db::open(Path::new(":memory:")).await.unwrap();
        let runner = Arc::new(FakeRunner::default());
        let app = crate::app::App::new(cfg, db, runner.clone()).unwrap();
        TestEnv {
            _tmp: tmp,
            app,
            runner,
        }
    }

    async fn add_site(env: &TestEnv, domain: &str, mode: SiteMode) -> Site {
        env.app
            .site_add(SiteAddRequest {
                user: "alice".to_string(),
                domain: domain.to_string(),
                mode,
                php_version: "8.3".to_string(),
                http3: true,
                provision: false,
                skip_cert: true,
                apply_now: false,
                ..Default::default()
            })
            .await
            .unwrap()
            .site
    }

    #[tokio::test]
    async fn apply_publishes_php_site_and_reloads() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;

        let res = env.app.apply(ApplyRequest::default()).await.unwrap();

        assert_eq!(res.domains.len(), 1);
        let r = &res.domains[0];
        assert_eq!(r.domain, "site1.example");
        assert_eq!(r.action, ApplyAction::Apply);
        assert_eq!(r.status, ApplyStatus::Ok);
        assert!(r.changed);
        assert!(res.reloaded);

        let live = env.app.ng.live_conf_path("site1.example");
        let bytes = fs::read(&live).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("ngm-site1_example-8.3.sock"));

        // state reflects disk
        let site = env.app.site_get("site1.example").await.unwrap();
        assert_eq!(site.last_apply_status, "ok");
        assert_eq!(site.last_render_hash, sha256_hex(&bytes));
        assert!(site.last_applied_at >= site.updated_at);

        // the pool landed too, and validation ran before the reload
        let pools_dir = std::path::PathBuf::from(&env.app.cfg.phpfpm.versions["8.3"].pools_dir);
        assert!(pools_dir.join("ngm-site1_example.conf").is_file());
        assert_eq!(env.runner.test_count(), 1);
        assert_eq!(env.runner.reload_count(), 1);
    }

    #[tokio::test]
    async fn second_apply_is_a_noop_without_reload() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.apply(ApplyRequest::default()).await.unwrap();
        let reloads = env.runner.reload_count();

        // --all re-renders even non-pending sites; bytes match, so no reload
        let res = env
            .app
            .apply(ApplyRequest {
                all: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!res.reloaded);
        assert!(res.changed.is_empty());
        for r in &res.domains {
            assert_eq!(r.status, ApplyStatus::Ok);
            assert!(!r.changed);
        }
        assert_eq!(env.runner.reload_count(), reloads);

        let site = env.app.site_get("site1.example").await.unwrap();
        assert_eq!(site.last_apply_status, "ok");
    }

    #[tokio::test]
    async fn non_pending_site_is_skipped_by_default() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.apply(ApplyRequest::default()).await.unwrap();

        let res = env.app.apply(ApplyRequest::default()).await.unwrap();
        assert_eq!(res.domains.len(), 1);
        assert_eq!(res.domains[0].action, ApplyAction::Skip);
        assert_eq!(res.domains[0].status, ApplyStatus::Skipped);
    }

    #[tokio::test]
    async fn failing_test_rolls_back_to_previous_bytes() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.apply(ApplyRequest::default()).await.unwrap();

        let live = env.app.ng.live_conf_path("site1.example");
        let before = fs::read(&live).unwrap();
        let reloads_before = env.runner.reload_count();

        // legitimate edit, then the config test starts failing
        // (millisecond timestamp resolution: let the clock advance first)
        tokio::time::sleep(Duration::from_millis(5)).await;
        env.app
            .site_edit(SiteEditRequest {
                domain: "site1.example".to_string(),
                http3: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        env.runner.fail_test.store(true, Ordering::SeqCst);

        let err = env.app.apply(ApplyRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("nginx -t failed (rolled back)"));
        assert!(err.to_string().contains("[emerg]"));

        // live bytes equal the pre-apply bytes again
        assert_eq!(fs::read(&live).unwrap(), before);

        let site = env.app.site_get("site1.example").await.unwrap();
        assert_eq!(site.last_apply_status, "fail");
        assert!(site.last_apply_error.contains("[emerg]"));
        assert!(site.needs_apply());

        // exactly one recovery reload restored the known-good state
        assert_eq!(env.runner.reload_count(), reloads_before + 1);
    }

    #[tokio::test]
    async fn disable_then_apply_removes_live_vhost() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.apply(ApplyRequest::default()).await.unwrap();

        let live = env.app.ng.live_conf_path("site1.example");
        let last_live = fs::read(&live).unwrap();

        env.app.site_disable("site1.example").await.unwrap();
        let res = env.app.apply(ApplyRequest::default()).await.unwrap();

        assert!(!live.exists());
        assert_eq!(
            fs::read(env.app.ng.backup_path("site1.example")).unwrap(),
            last_live
        );
        assert!(res.reloaded);
        assert_eq!(res.domains[0].action, ApplyAction::Delete);
        assert_eq!(res.domains[0].status, ApplyStatus::Ok);
        assert!(res.domains[0].changed);

        let site = env.app.site_get("site1.example").await.unwrap();
        assert!(!site.enabled);
        assert!(site.deleted_at.is_some());
        assert_eq!(site.last_apply_status, "ok");

        // a config test after the delete still passes (fake nginx says ok)
        env.app.ng.test_config().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_site_with_no_live_file_does_not_reload() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.site_disable("site1.example").await.unwrap();

        let res = env.app.apply(ApplyRequest::default()).await.unwrap();

        assert!(!res.reloaded);
        assert_eq!(res.domains[0].action, ApplyAction::Delete);
        assert_eq!(res.domains[0].status, ApplyStatus::Ok);
        assert!(!res.domains[0].changed);
        assert_eq!(env.runner.reload_count(), 0);
    }

    #[tokio::test]
    async fn proxy_without_targets_fails_without_touching_nginx() {
        let env = test_env().await;
        add_site(&env, "api.example", SiteMode::Proxy).await;

        let res = env.app.apply(ApplyRequest::default()).await.unwrap();

        assert_eq!(res.domains.len(), 1);
        let r = &res.domains[0];
        assert_eq!(r.status, ApplyStatus::Fail);
        assert!(r.error.contains("proxy mode requires at least 1 proxy target"));
        assert!(!env.app.ng.live_conf_path("api.example").exists());
        assert_eq!(env.runner.reload_count(), 0);
        assert_eq!(env.runner.test_count(), 0);

        let site = env.app.site_get("api.example").await.unwrap();
        assert_eq!(site.last_apply_status, "fail");
        assert!(site.last_apply_error.contains("proxy mode requires"));
    }

    #[tokio::test]
    async fn proxy_with_targets_renders_upstream() {
        let env = test_env().await;
        add_site(&env, "api.example", SiteMode::Proxy).await;
        env.app
            .proxy_target_add("api.example", "10.0.0.1:8080", 100, false, true)
            .await
            .unwrap();
        env.app
            .proxy_target_add("api.example", "10.0.0.2:8080", 50, true, true)
            .await
            .unwrap();

        let res = env.app.apply(ApplyRequest::default()).await.unwrap();
        assert!(res.reloaded);

        let text =
            fs::read_to_string(env.app.ng.live_conf_path("api.example")).unwrap();
        assert!(text.contains("upstream api_example_upstream {"));
        assert!(text.contains("server 10.0.0.1:8080 weight=100;"));
        assert!(text.contains("server 10.0.0.2:8080 weight=50 backup;"));
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_the_filesystem() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;

        let res = env
            .app
            .apply(ApplyRequest {
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(res.domains[0].status, ApplyStatus::DryRun);
        assert!(!res.reloaded);
        assert!(!env.app.ng.live_conf_path("site1.example").exists());
        assert!(!env.app.ng.staged_conf_path("site1.example").exists());
        assert_eq!(env.runner.reload_count(), 0);

        // the attempt is still audited, but the site row is untouched
        let site = env.app.site_get("site1.example").await.unwrap();
        assert_eq!(site.last_apply_status, "");
        let runs = env.app.db.list_recent_apply_runs(10).await.unwrap();
        assert_eq!(runs[0].status, "dry-run");

        // and the flat-file audit trail got a line too
        let audit = fs::read_to_string(&env.app.cfg.security.audit_log).unwrap();
        assert!(audit.contains("domain=site1.example"));
        assert!(audit.contains("status=dry-run"));
    }

    #[tokio::test]
    async fn limit_caps_actioned_sites() {
        let env = test_env().await;
        add_site(&env, "a.example", SiteMode::Php).await;
        add_site(&env, "b.example", SiteMode::Php).await;

        let res = env
            .app
            .apply(ApplyRequest {
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(res.domains.len(), 1);
        assert_eq!(res.domains[0].domain, "a.example");
        assert_eq!(res.changed, vec!["a.example".to_string()]);

        // the second site is still pending for the next run
        let site = env.app.site_get("b.example").await.unwrap();
        assert!(site.needs_apply());
    }

    #[tokio::test]
    async fn single_site_apply_after_no_change_skips_reload() {
        let env = test_env().await;
        add_site(&env, "site1.example", SiteMode::Php).await;
        env.app.apply(ApplyRequest::default()).await.unwrap();
        let reloads = env.runner.reload_count();

        let res = env
            .app
            .apply(ApplyRequest {
                domain: Some("site1.example".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(res.domains[0].status, ApplyStatus::Ok);
        assert!(!res.domains[0].changed);
        assert!(!res.reloaded);
        assert_eq!(env.runner.reload_count(), reloads);
    }

    #[tokio::test]
    async fn single_site_not_found_is_an_error() {
        let env = test_env().await;
        let err = env
            .app
            .apply(ApplyRequest {
                domain: Some("ghost.example".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("site not found"));
    }

    #[tokio::test]
    async fn batch_failure_marks_every_changed_domain() {
        let env = test_env().await;
        add_site(&env, "a.example", SiteMode::Php).await;
        add_site(&env, "b.example", SiteMode::Php).await;
        env.runner.fail_test.store(true, Ordering::SeqCst);

        let err = env.app.apply(ApplyRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("rolled back"));

        for d in ["a.example", "b.example"] {
            let site = env.app.site_get(d).await.unwrap();
            assert_eq!(site.last_apply_status, "fail", "{d}");
            // rollback on a never-published site removes the live file
            assert!(!env.app.ng.live_conf_path(d).exists(), "{d}");
        }
    }
}
