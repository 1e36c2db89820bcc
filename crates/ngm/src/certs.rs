//! Certbot wrapper: issuance, renewal, inspection, and lineage-alias repair.
//!
//! Certbot sometimes creates a suffixed lineage directory
//! (`<live>/<domain>-0001`) instead of `<live>/<domain>`. Everything else in
//! the system depends on the unsuffixed path, so the manager keeps
//! `<live>/<domain>` resolvable as either a real directory or a symlink to
//! the best candidate lineage.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context as _;
use time::{OffsetDateTime, macros::format_description};

use crate::runner::{CommandError, CommandRunner, CommandSpec};

const ISSUE_TIMEOUT: Duration = Duration::from_secs(120);
const RENEW_TIMEOUT: Duration = Duration::from_secs(300);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Re-issue is refused while the current certificate still has more days
/// left than this.
const REISSUE_THRESHOLD_DAYS: i64 = 30;

#[derive(Clone, Debug)]
pub struct CertInfo {
    pub domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub exists: bool,
    pub not_before: Option<OffsetDateTime>,
    pub not_after: Option<OffsetDateTime>,
    pub days_left: i64,
}

#[derive(Clone)]
pub struct CertbotManager {
    certbot_bin: String,
    webroot: PathBuf,
    letsencrypt_live: PathBuf,
    email: String,
    runner: Arc<dyn CommandRunner>,
}

impl CertbotManager {
    pub fn new(
        certbot_bin: impl Into<String>,
        webroot: impl Into<PathBuf>,
        letsencrypt_live: impl Into<PathBuf>,
        email: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            certbot_bin: certbot_bin.into(),
            webroot: webroot.into(),
            letsencrypt_live: letsencrypt_live.into(),
            email: email.into(),
            runner,
        }
    }

    fn live_dir(&self, domain: &str) -> PathBuf {
        self.letsencrypt_live.join(domain)
    }

    /// Ensures `<live>/<domain>` resolves to a usable lineage. Returns the
    /// directory expected to contain `fullchain.pem`; when no candidate
    /// exists this is still the base path, without error.
    pub fn ensure_live_alias(&self, domain: &str) -> anyhow::Result<PathBuf> {
        if domain.trim().is_empty() {
            anyhow::bail!("domain is required");
        }

        let base = self.live_dir(domain);
        if base.join("fullchain.pem").is_file() && base.join("privkey.pem").is_file() {
            return Ok(base);
        }

        struct Candidate {
            dir: PathBuf,
            not_after: Option<OffsetDateTime>,
            mtime: Option<SystemTime>,
        }

        let prefix = format!("{domain}-");
        let mut good: Vec<Candidate> = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.letsencrypt_live) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&prefix) {
                    continue;
                }
                let dir = entry.path();
                let full = dir.join("fullchain.pem");
                if !full.is_file() || !dir.join("privkey.pem").is_file() {
                    continue;
                }

                // Expiry is the quality signal; mtime is only a tiebreaker.
                let not_after = parse_leaf_validity(&full).ok().map(|(_, na)| na);
                let mtime = fs::metadata(&dir).and_then(|m| m.modified()).ok();
                good.push(Candidate {
                    dir,
                    not_after,
                    mtime,
                });
            }
        }

        if good.is_empty() {
            return Ok(base);
        }

        good.sort_by(|a, b| {
            let by_expiry = match (a.not_after, b.not_after) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            by_expiry.then_with(|| b.mtime.cmp(&a.mtime))
        });
        let target = good[0].dir.clone();

        if let Ok(meta) = fs::symlink_metadata(&base) {
            if meta.file_type().is_symlink() {
                // Recreate so the alias always points at the best candidate.
                fs::remove_file(&base)
                    .with_context(|| format!("remove stale alias {}", base.display()))?;
            } else {
                // Never delete whatever is there; move it out of the way.
                let fmt = format_description!("[year][month][day]-[hour][minute][second]");
                let ts = OffsetDateTime::now_utc().format(&fmt)?;
                let backup = PathBuf::from(format!("{}.bak-{ts}", base.display()));
                fs::rename(&base, &backup).with_context(|| {
                    format!(
                        "cannot rename existing live path {} to {}",
                        base.display(),
                        backup.display()
                    )
                })?;
            }
        }

        std::os::unix::fs::symlink(&target, &base).with_context(|| {
            format!("create symlink {} -> {}", base.display(), target.display())
        })?;
        Ok(base)
    }

    /// Certificate info for a domain, repairing the lineage alias
    /// opportunistically first.
    pub fn get_cert_info(&self, domain: &str) -> anyhow::Result<CertInfo> {
        let _ = self.ensure_live_alias(domain);

        let cert_path = self.live_dir(domain).join("fullchain.pem");
        let key_path = self.live_dir(domain).join("privkey.pem");
        Self::cert_info_from_paths(domain, cert_path, key_path)
    }

    fn cert_info_from_paths(
        domain: &str,
        cert_path: PathBuf,
        key_path: PathBuf,
    ) -> anyhow::Result<CertInfo> {
        let mut info = CertInfo {
            domain: domain.to_string(),
            cert_path,
            key_path,
            exists: false,
            not_before: None,
            not_after: None,
            days_left: 0,
        };

        if !info.cert_path.is_file() || !info.key_path.is_file() {
            return Ok(info);
        }
        info.exists = true;

        let (not_before, not_after) = parse_leaf_validity(&info.cert_path)?;
        info.not_before = Some(not_before);
        info.not_after = Some(not_after);
        info.days_left = (not_after - OffsetDateTime::now_utc()).whole_days();
        Ok(info)
    }

    /// Issues a certificate via the HTTP-01 webroot challenge. Refuses while
    /// a valid certificate with more than 30 days left exists.
    pub async fn issue_cert(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.trim();
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }

        fs::create_dir_all(&self.webroot)
            .with_context(|| format!("create webroot {}", self.webroot.display()))?;

        if let Ok(info) = self.get_cert_info(domain)
            && info.exists
            && info.days_left > REISSUE_THRESHOLD_DAYS
        {
            anyhow::bail!(
                "certificate already exists and is valid for {} more days",
                info.days_left
            );
        }

        let webroot = self.webroot.to_string_lossy().to_string();
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            webroot,
            "-d".to_string(),
            domain.to_string(),
            "--cert-name".to_string(),
            domain.to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--keep-until-expiring".to_string(),
        ];
        if self.email.is_empty() {
            args.push("--register-unsafely-without-email".to_string());
        } else {
            args.push("--email".to_string());
            args.push(self.email.clone());
        }

        self.runner
            .run(
                CommandSpec {
                    program: self.certbot_bin.clone(),
                    args,
                    env: Vec::new(),
                },
                ISSUE_TIMEOUT,
            )
            .await
            .context("certbot certonly failed")?;

        self.ensure_live_alias(domain)
            .context("cert issued but failed to ensure live alias")?;

        let cert_path = self.live_dir(domain).join("fullchain.pem");
        if !cert_path.is_file() {
            anyhow::bail!("cert file not found after issuance: {}", cert_path.display());
        }
        Ok(())
    }

    pub async fn renew_cert(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.trim();
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }
        let webroot = self.webroot.to_string_lossy().to_string();
        self.runner
            .run(
                CommandSpec::new(
                    self.certbot_bin.clone(),
                    [
                        "renew",
                        "--cert-name",
                        domain,
                        "--webroot",
                        "-w",
                        webroot.as_str(),
                        "--non-interactive",
                    ],
                ),
                RENEW_TIMEOUT,
            )
            .await
            .context("certbot renew failed")?;
        Ok(())
    }

    pub async fn renew_all(&self) -> anyhow::Result<()> {
        let webroot = self.webroot.to_string_lossy().to_string();
        self.runner
            .run(
                CommandSpec::new(
                    self.certbot_bin.clone(),
                    ["renew", "--webroot", "-w", webroot.as_str(), "--non-interactive"],
                ),
                RENEW_TIMEOUT,
            )
            .await
            .context("certbot renew all failed")?;
        Ok(())
    }

    /// All certificates under the live directory. Unreadable entries are
    /// skipped so one broken lineage does not hide the rest.
    pub fn list_certs(&self) -> anyhow::Result<Vec<CertInfo>> {
        let entries = match fs::read_dir(&self.letsencrypt_live) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("read live dir {}", self.letsencrypt_live.display())
                });
            }
        };

        let mut certs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "README" || name.contains(".bak-") {
                continue;
            }
            // follow symlinks: repaired aliases count
            let is_dir = fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Ok(info) = self.get_cert_info(&name) else {
                continue;
            };
            if info.exists {
                certs.push(info);
            }
        }
        certs.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(certs)
    }

    pub fn check_expiring(&self, days: i64) -> anyhow::Result<Vec<CertInfo>> {
        let mut certs = self.list_certs()?;
        certs.retain(|c| c.days_left <= days);
        Ok(certs)
    }

    /// Removes the lineage for a domain. A missing certificate is fine.
    pub async fn delete_cert(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.trim();
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }
        let res = self
            .runner
            .run(
                CommandSpec::new(
                    self.certbot_bin.clone(),
                    ["delete", "--cert-name", domain, "--non-interactive"],
                ),
                ADMIN_TIMEOUT,
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(CommandError::Failed { stdout, stderr, .. })
                if stdout.contains("No certificate found")
                    || stderr.contains("No certificate found") =>
            {
                Ok(())
            }
            Err(e) => Err(e).context("certbot delete failed"),
        }
    }

    pub async fn revoke_cert(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.trim();
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }
        let cert_path = self.live_dir(domain).join("fullchain.pem");
        let cert_path = cert_path.to_string_lossy().to_string();
        self.runner
            .run(
                CommandSpec::new(
                    self.certbot_bin.clone(),
                    ["revoke", "--cert-path", cert_path.as_str(), "--non-interactive"],
                ),
                ADMIN_TIMEOUT,
            )
            .await
            .context("certbot revoke failed")?;
        Ok(())
    }
}

/// Bootstrap certificate so nginx can start before the first ACME challenge
/// completes: 7-day self-signed, CN = domain. No-op when both files exist.
pub async fn ensure_self_signed(
    runner: &dyn CommandRunner,
    domain: &str,
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<()> {
    if cert_path.is_file() && key_path.is_file() {
        return Ok(());
    }

    use std::os::unix::fs::PermissionsExt as _;
    for p in [cert_path, key_path] {
        if let Some(dir) = p.parent() {
            fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
    }

    let key = key_path.to_string_lossy().to_string();
    let cert = cert_path.to_string_lossy().to_string();
    let subject = format!("/CN={domain}");
    runner
        .run(
            CommandSpec::new(
                "openssl",
                [
                    "req",
                    "-x509",
                    "-nodes",
                    "-newkey",
                    "rsa:2048",
                    "-days",
                    "7",
                    "-subj",
                    subject.as_str(),
                    "-keyout",
                    key.as_str(),
                    "-out",
                    cert.as_str(),
                ],
            ),
            ADMIN_TIMEOUT,
        )
        .await
        .context("generate self-signed cert failed")?;

    // nginx masters run as root, so a 0600 key is readable where it matters.
    let _ = fs::set_permissions(cert_path, fs::Permissions::from_mode(0o644));
    let _ = fs::set_permissions(key_path, fs::Permissions::from_mode(0o600));
    Ok(())
}

fn parse_leaf_validity(cert_path: &Path) -> anyhow::Result<(OffsetDateTime, OffsetDateTime)> {
    let data =
        fs::read(cert_path).with_context(|| format!("read cert file {}", cert_path.display()))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|e| anyhow::anyhow!("failed to decode PEM block: {e}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("parse certificate: {e}"))?;
    Ok((
        cert.validity().not_before.to_datetime(),
        cert.validity().not_after.to_datetime(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use std::sync::Mutex;

    fn write_cert_pair(dir: &Path, domain: &str, days_valid: i64) {
        fs::create_dir_all(dir).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(days_valid);
        let cert = params.self_signed(&key).unwrap();
        fs::write(dir.join("fullchain.pem"), cert.pem()).unwrap();
        fs::write(dir.join("privkey.pem"), key.serialize_pem()).unwrap();
    }

    /// Plays the external issuer: `certonly` creates a suffixed lineage the
    /// way certbot does when the unsuffixed name is taken.
    struct FakeIssuer {
        live: PathBuf,
        calls: Mutex<Vec<Vec<String>>>,
        missing_cert_on_delete: bool,
    }

    impl FakeIssuer {
        fn new(live: &Path) -> Self {
            Self {
                live: live.to_path_buf(),
                calls: Mutex::new(Vec::new()),
                missing_cert_on_delete: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeIssuer {
        async fn run(
            &self,
            spec: CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.args.clone());
            match spec.args.first().map(String::as_str) {
                Some("certonly") => {
                    let domain = spec.args[spec.args.iter().position(|a| a == "-d").unwrap() + 1]
                        .clone();
                    write_cert_pair(&self.live.join(format!("{domain}-0001")), &domain, 90);
                    Ok(CommandOutput {
                        status: 0,
                        stdout: String::new(),
                        stderr: String::new(),
                    })
                }
                Some("delete") if self.missing_cert_on_delete => Err(CommandError::Failed {
                    command: "certbot delete".to_string(),
                    status: 1,
                    stdout: "No certificate found with name gone.example".to_string(),
                    stderr: String::new(),
                }),
                _ => Ok(CommandOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }
    }

    fn manager(live: &Path, runner: Arc<dyn CommandRunner>) -> CertbotManager {
        CertbotManager::new(
            "certbot",
            live.parent().unwrap().join("webroot"),
            live,
            "admin@example.com",
            runner,
        )
    }

    #[test]
    fn alias_repair_picks_latest_not_after() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        write_cert_pair(&live.join("api.example-0001"), "api.example", 30);
        write_cert_pair(&live.join("api.example-0002"), "api.example", 60);

        let m = manager(&live, Arc::new(FakeIssuer::new(&live)));
        let resolved = m.ensure_live_alias("api.example").unwrap();

        assert_eq!(resolved, live.join("api.example"));
        let link = fs::read_link(&resolved).unwrap();
        assert_eq!(link, live.join("api.example-0002"));

        let info = m.get_cert_info("api.example").unwrap();
        assert!(info.exists);
        assert!(info.days_left >= 58 && info.days_left <= 60, "{}", info.days_left);
    }

    #[test]
    fn alias_repair_moves_existing_real_dir_aside() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        // a real (broken) base dir without key material
        fs::create_dir_all(live.join("api.example")).unwrap();
        fs::write(live.join("api.example/README"), b"stale").unwrap();
        write_cert_pair(&live.join("api.example-0001"), "api.example", 45);

        let m = manager(&live, Arc::new(FakeIssuer::new(&live)));
        m.ensure_live_alias("api.example").unwrap();

        let base = live.join("api.example");
        assert!(fs::symlink_metadata(&base).unwrap().file_type().is_symlink());
        let moved = fs::read_dir(&live)
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("api.example.bak-"));
        assert!(moved, "expected a .bak- rename of the old dir");
    }

    #[test]
    fn alias_repair_without_candidates_is_a_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        fs::create_dir_all(&live).unwrap();

        let m = manager(&live, Arc::new(FakeIssuer::new(&live)));
        let resolved = m.ensure_live_alias("api.example").unwrap();
        assert_eq!(resolved, live.join("api.example"));
        assert!(!resolved.exists());
    }

    #[test]
    fn cert_info_reports_missing_and_valid_pairs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        let m = manager(&live, Arc::new(FakeIssuer::new(&live)));

        let info = m.get_cert_info("absent.example").unwrap();
        assert!(!info.exists);
        assert_eq!(info.days_left, 0);

        write_cert_pair(&live.join("site1.example"), "site1.example", 80);
        let info = m.get_cert_info("site1.example").unwrap();
        assert!(info.exists);
        assert!(info.not_before.is_some());
        assert!(info.days_left >= 78 && info.days_left <= 80);
    }

    #[tokio::test]
    async fn issue_refuses_when_cert_still_valid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        write_cert_pair(&live.join("site1.example"), "site1.example", 60);

        let issuer = Arc::new(FakeIssuer::new(&live));
        let m = manager(&live, issuer.clone());

        let err = m.issue_cert("site1.example").await.unwrap_err();
        assert!(err.to_string().contains("valid for"), "{err}");
        assert!(issuer.calls.lock().unwrap().is_empty(), "certbot must not run");
    }

    #[tokio::test]
    async fn issue_repairs_suffixed_lineage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        fs::create_dir_all(&live).unwrap();

        let issuer = Arc::new(FakeIssuer::new(&live));
        let m = manager(&live, issuer.clone());

        m.issue_cert("api.example").await.unwrap();

        // the unsuffixed path opens even though the issuer created -0001
        let info = m.get_cert_info("api.example").unwrap();
        assert!(info.exists);
        assert!(fs::read(live.join("api.example/fullchain.pem")).is_ok());

        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "certonly");
        assert!(calls[0].iter().any(|a| a == "--keep-until-expiring"));
        assert!(calls[0].iter().any(|a| a == "--email"));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_lineage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        let issuer = Arc::new(FakeIssuer {
            live: live.clone(),
            calls: Mutex::new(Vec::new()),
            missing_cert_on_delete: true,
        });
        let m = manager(&live, issuer);

        m.delete_cert("gone.example").await.unwrap();
    }

    #[test]
    fn list_and_check_expiring() {
        let tmp = tempfile::TempDir::new().unwrap();
        let live = tmp.path().join("live");
        write_cert_pair(&live.join("a.example"), "a.example", 10);
        write_cert_pair(&live.join("b.example"), "b.example", 80);
        fs::create_dir_all(live.join("README")).ok();

        let m = manager(&live, Arc::new(FakeIssuer::new(&live)));
        let certs = m.list_certs().unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].domain, "a.example");

        let expiring = m.check_expiring(30).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].domain, "a.example");
    }

    #[tokio::test]
    async fn self_signed_bootstrap_skips_existing_material() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cert = tmp.path().join("selfsigned/d.example/fullchain.pem");
        let key = tmp.path().join("selfsigned/d.example/privkey.pem");
        fs::create_dir_all(cert.parent().unwrap()).unwrap();
        fs::write(&cert, b"cert").unwrap();
        fs::write(&key, b"key").unwrap();

        let issuer = FakeIssuer::new(tmp.path());
        ensure_self_signed(&issuer, "d.example", &cert, &key).await.unwrap();
        assert!(issuer.calls.lock().unwrap().is_empty(), "openssl must not run");
    }
}
