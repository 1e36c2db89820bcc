//! Driver for the compiled nginx build: staging/backup layout, config test,
//! reload, and atomic promotion of staged vhosts into the live directory.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;

use crate::{
    atomic::write_file_atomic,
    config::ReloadMode,
    render::{self, SiteTemplateData},
    runner::{CommandRunner, CommandSpec},
};

const NGINX_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Manager {
    pub root: PathBuf,
    pub bin: PathBuf,
    pub main_conf: PathBuf,
    pub sites_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub backup_dir: PathBuf,
    reload_mode: ReloadMode,
    runner: Arc<dyn CommandRunner>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        bin: PathBuf,
        main_conf: PathBuf,
        sites_dir: PathBuf,
        stage_dir: PathBuf,
        backup_dir: PathBuf,
        reload_mode: ReloadMode,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            root,
            bin,
            main_conf,
            sites_dir,
            stage_dir,
            backup_dir,
            reload_mode,
            runner,
        }
    }

    /// Creates the sites/staging/backup directories. Does not write configs.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for d in [
            &self.sites_dir,
            &self.stage_dir,
            &self.backup_dir,
            &self.stage_dir.join("sites"),
        ] {
            fs::create_dir_all(d).with_context(|| format!("mkdir {}", d.display()))?;
        }
        Ok(())
    }

    pub fn live_conf_path(&self, domain: &str) -> PathBuf {
        self.sites_dir.join(format!("{domain}.conf"))
    }

    pub fn staged_conf_path(&self, domain: &str) -> PathBuf {
        self.stage_dir.join("sites").join(format!("{domain}.conf"))
    }

    pub fn backup_path(&self, domain: &str) -> PathBuf {
        self.backup_dir.join(format!("{domain}.conf.bak"))
    }

    /// Renders a site into staging and returns the exact bytes written, for
    /// hashing by the caller.
    pub fn render_site_to_staging(&self, site: &SiteTemplateData) -> anyhow::Result<Vec<u8>> {
        let content = render::render_site(site)?;
        let out_path = self.staged_conf_path(&site.domain);
        write_file_atomic(&out_path, &content, 0o644)
            .with_context(|| format!("stage {}", out_path.display()))?;
        Ok(content)
    }

    /// Promotes the staged config for `domain` into the live directory.
    /// Returns `false` without touching anything when the live bytes already
    /// match. Otherwise the previous live file (if any) lands in the backup
    /// directory strictly before the new live file is written.
    pub fn publish(&self, domain: &str) -> anyhow::Result<bool> {
        if domain.is_empty() {
            anyhow::bail!("domain is required");
        }

        let src = self.staged_conf_path(domain);
        let dst = self.live_conf_path(domain);
        let bak = self.backup_path(domain);

        let data =
            fs::read(&src).with_context(|| format!("read staging {}", src.display()))?;

        let live = match fs::read(&dst) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("read live {}", dst.display())),
        };

        if live.as_deref() == Some(data.as_slice()) {
            return Ok(false);
        }

        if let Some(old) = live {
            write_file_atomic(&bak, &old, 0o644)
                .with_context(|| format!("write backup {}", bak.display()))?;
        }

        write_file_atomic(&dst, &data, 0o644)
            .with_context(|| format!("publish {}", dst.display()))?;
        Ok(true)
    }

    /// Removes the live vhost, keeping its bytes in the backup directory.
    /// Absent file is a no-op. Does not reload; batch apply tests and
    /// reloads once at the end.
    pub fn remove_live_site(&self, domain: &str) -> anyhow::Result<()> {
        let dst = self.live_conf_path(domain);
        let bak = self.backup_path(domain);

        let old = match fs::read(&dst) {
            Ok(old) => old,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("read live {}", dst.display())),
        };

        write_file_atomic(&bak, &old, 0o644)
            .with_context(|| format!("write backup {}", bak.display()))?;
        fs::remove_file(&dst).with_context(|| format!("remove live {}", dst.display()))?;
        Ok(())
    }

    /// `nginx -t` against the explicit main config; stderr travels with the
    /// error because it is the only diagnostic the operator gets.
    pub async fn test_config(&self) -> anyhow::Result<()> {
        let bin = self.bin.to_string_lossy().to_string();
        let main_conf = self.main_conf.to_string_lossy().to_string();
        self.runner
            .run(
                CommandSpec::new(bin, ["-t", "-c", main_conf.as_str()]),
                NGINX_TIMEOUT,
            )
            .await
            .context("nginx -t failed")?;
        Ok(())
    }

    pub async fn reload(&self) -> anyhow::Result<()> {
        let spec = match self.reload_mode {
            ReloadMode::Signal => {
                let bin = self.bin.to_string_lossy().to_string();
                CommandSpec::new(bin, ["-s", "reload"])
            }
            ReloadMode::Systemd => CommandSpec::new("systemctl", ["reload", "nginx"]),
        };
        self.runner
            .run(spec, NGINX_TIMEOUT)
            .await
            .context("nginx reload failed")?;
        Ok(())
    }
}
