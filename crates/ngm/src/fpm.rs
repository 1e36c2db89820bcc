//! Per-site PHP-FPM pool files.
//!
//! Pool files are rendered deterministically and the service is only
//! reloaded when the bytes actually change, so repeated applies do not
//! churn PHP-FPM.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;

use crate::{
    atomic::write_file_atomic,
    render::domain_key,
    runner::{CommandRunner, CommandSpec},
};

#[derive(Clone, Debug)]
pub struct PoolData {
    pub pool_name: String,
    pub run_user: String,
    pub run_group: String,
    pub socket: PathBuf,
    pub listen_owner: String,
    pub listen_group: String,

    pub max_children: u32,
    pub idle_timeout: String,
    pub max_requests: u32,
    pub request_terminate_timeout: String,

    pub slowlog_timeout: String,
    pub slowlog_path: PathBuf,
    pub error_log: PathBuf,

    pub php_admin_values: BTreeMap<String, String>,
    pub php_values: BTreeMap<String, String>,
}

/// Deterministic per-site socket: `<sock_dir>/ngm-<key>-<version>.sock`.
pub fn socket_path(sock_dir: &Path, domain: &str, php_version: &str) -> PathBuf {
    sock_dir.join(format!("ngm-{}-{}.sock", domain_key(domain), php_version))
}

/// Pool file location: `<pools_dir>/ngm-<key>.conf`.
pub fn pool_file_path(pools_dir: &Path, domain: &str) -> PathBuf {
    pools_dir.join(format!("ngm-{}.conf", domain_key(domain)))
}

pub fn render_pool(td: &PoolData) -> anyhow::Result<Vec<u8>> {
    let mut w = String::with_capacity(1024);
    let out = &mut w;

    writeln!(out, "; Managed by ngm. Do not edit: regenerated on apply.")?;
    writeln!(out, "[{}]", td.pool_name)?;
    writeln!(out, "user = {}", td.run_user)?;
    writeln!(out, "group = {}", td.run_group)?;
    writeln!(out)?;
    writeln!(out, "listen = {}", td.socket.display())?;
    writeln!(out, "listen.owner = {}", td.listen_owner)?;
    writeln!(out, "listen.group = {}", td.listen_group)?;
    writeln!(out, "listen.mode = 0660")?;
    writeln!(out)?;
    writeln!(out, "pm = ondemand")?;
    writeln!(out, "pm.max_children = {}", td.max_children)?;
    writeln!(out, "pm.process_idle_timeout = {}", td.idle_timeout)?;
    writeln!(out, "pm.max_requests = {}", td.max_requests)?;
    writeln!(out)?;
    writeln!(out, "request_terminate_timeout = {}", td.request_terminate_timeout)?;
    writeln!(out, "request_slowlog_timeout = {}", td.slowlog_timeout)?;
    writeln!(out, "slowlog = {}", td.slowlog_path.display())?;
    writeln!(out)?;
    writeln!(out, "catch_workers_output = yes")?;
    writeln!(out, "php_admin_value[error_log] = {}", td.error_log.display())?;
    writeln!(out, "php_admin_flag[log_errors] = on")?;

    // BTreeMap iteration keeps custom values in a stable order.
    for (k, v) in &td.php_admin_values {
        writeln!(out, "php_admin_value[{k}] = {v}")?;
    }
    for (k, v) in &td.php_values {
        writeln!(out, "php_value[{k}] = {v}")?;
    }

    Ok(w.into_bytes())
}

/// Renders the pool file and reloads the PHP-FPM service only on content
/// change. Returns the socket path and whether anything was written. A reload
/// failure after a successful write is an error; the fresh pool file stays in
/// place so the next apply retries cheaply.
pub async fn ensure_pool(
    runner: &dyn CommandRunner,
    pools_dir: &Path,
    service: &str,
    sock_dir: &Path,
    domain: &str,
    php_version: &str,
    mut td: PoolData,
) -> anyhow::Result<(PathBuf, bool)> {
    if domain.trim().is_empty() {
        anyhow::bail!("domain is required");
    }
    if pools_dir.as_os_str().is_empty()
        || service.trim().is_empty()
        || sock_dir.as_os_str().is_empty()
        || php_version.trim().is_empty()
    {
        anyhow::bail!("pools_dir/service/sock_dir/php_version are required");
    }

    // The socket is always the deterministic per-domain path.
    td.socket = socket_path(sock_dir, domain, php_version);

    // PHP-FPM creates the log files itself but not their directories.
    for log in [&td.error_log, &td.slowlog_path] {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
    }

    let rendered = render_pool(&td)?;
    let out_path = pool_file_path(pools_dir, domain);

    if let Ok(existing) = fs::read(&out_path)
        && existing == rendered
    {
        return Ok((td.socket, false));
    }

    write_file_atomic(&out_path, &rendered, 0o644)
        .with_context(|| format!("write pool {}", out_path.display()))?;

    runner
        .run(
            CommandSpec::new("systemctl", ["reload", service]),
            Duration::from_secs(15),
        )
        .await
        .with_context(|| format!("reload {service} after pool write"))?;

    Ok((td.socket, true))
}
