use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{OptionalExtension as _, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio_rusqlite::Connection;

/// Timestamps are stored as RFC 3339 TEXT in UTC with millisecond precision,
/// stamped by SQLite itself so every writer shares one clock.
const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteMode {
    #[default]
    Php,
    Proxy,
    Static,
}

impl SiteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteMode::Php => "php",
            SiteMode::Proxy => "proxy",
            SiteMode::Static => "static",
        }
    }

    /// Empty input falls back to the default mode.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim() {
            "" | "php" => Ok(SiteMode::Php),
            "proxy" => Ok(SiteMode::Proxy),
            "static" => Ok(SiteMode::Static),
            other => anyhow::bail!("invalid mode {other:?} (expected php|proxy|static)"),
        }
    }
}

impl fmt::Display for SiteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub home_dir: String,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug)]
pub struct Site {
    pub id: i64,
    pub user_id: i64,
    pub domain: String,
    pub mode: SiteMode,
    pub webroot: String,
    pub php_version: String,
    pub enable_http3: bool,
    pub enabled: bool,
    pub deleted_at: Option<OffsetDateTime>,

    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,

    pub last_render_hash: String,
    pub last_applied_at: Option<OffsetDateTime>,
    pub last_apply_status: String,
    pub last_apply_error: String,

    // Reserved for per-site TLS overrides.
    pub tls_mode: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
}

impl Site {
    /// A site is pending when it was never applied, the last apply failed, or
    /// it was edited after the last successful apply.
    pub fn needs_apply(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(applied_at) = self.last_applied_at else {
            return true;
        };
        if self.last_apply_status != "ok" {
            return true;
        }
        match self.updated_at {
            Some(updated_at) => updated_at > applied_at,
            None => false,
        }
    }

    /// Display state: DISABLED > ERROR > PENDING > OK.
    pub fn state(&self) -> &'static str {
        if !self.enabled {
            return "DISABLED";
        }
        if self.last_apply_status == "fail" {
            return "ERROR";
        }
        if self.needs_apply() {
            return "PENDING";
        }
        if self.last_apply_status == "ok" {
            return "OK";
        }
        "PENDING"
    }
}

/// Desired-state input for `upsert_site`, keyed by domain.
#[derive(Clone, Debug)]
pub struct SiteUpsert {
    pub user_id: i64,
    pub domain: String,
    pub mode: SiteMode,
    pub webroot: String,
    pub php_version: String,
    pub enable_http3: bool,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct ProxyTarget {
    pub id: i64,
    pub site_id: i64,
    pub target: String,
    pub weight: i64,
    pub is_backup: bool,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct PanelUser {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub enabled: bool,
    pub last_login_at: Option<OffsetDateTime>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug)]
pub struct ApplyRun {
    pub id: i64,
    pub site_id: Option<i64>,
    pub action: String,
    pub status: String,
    pub message: String,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct Db {
    conn: Connection,
}

const SITE_COLUMNS: &str = "id, user_id, domain, mode, webroot, php_version, \
     enable_http3, enabled, deleted_at, created_at, updated_at, \
     last_render_hash, last_apply_status, last_apply_error, last_applied_at, \
     tls_mode, tls_cert_path, tls_key_path";

impl Db {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let path = ensure_parent_dir(path)?;
        let conn = Connection::open(path).await?;

        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

    async fn call<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, tokio_rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(f)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    async fn init(&self) -> anyhow::Result<()> {
        self.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .context("init schema")
    }

    pub async fn ensure_user(&self, username: &str, home_dir: &str) -> anyhow::Result<User> {
        if username.trim().is_empty() {
            anyhow::bail!("username is required");
        }
        if home_dir.trim().is_empty() {
            anyhow::bail!("home dir is required");
        }

        let username = username.to_string();
        let home_dir = home_dir.to_string();
        let user = self
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users(username, home_dir) VALUES (?1, ?2)
                     ON CONFLICT(username) DO UPDATE SET home_dir = excluded.home_dir",
                    params![username, home_dir],
                )?;
                let user = conn.query_row(
                    "SELECT id, username, home_dir, created_at FROM users WHERE username = ?1",
                    params![username],
                    map_user_row,
                )?;
                Ok(user)
            })
            .await
            .context("ensure user")?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        let username = username.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, home_dir, created_at FROM users WHERE username = ?1",
                    params![username],
                    map_user_row,
                )
                .optional()?)
        })
        .await
        .context("get user")
    }

    pub async fn get_user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, home_dir, created_at FROM users WHERE id = ?1",
                    params![id],
                    map_user_row,
                )
                .optional()?)
        })
        .await
        .context("get user by id")
    }

    pub async fn upsert_site(&self, site: SiteUpsert) -> anyhow::Result<Site> {
        if site.domain.trim().is_empty() {
            anyhow::bail!("domain is required");
        }
        if site.user_id == 0 {
            anyhow::bail!("user_id is required");
        }
        if site.webroot.trim().is_empty() {
            anyhow::bail!("webroot is required");
        }

        let domain = site.domain.clone();
        self.call(move |conn| {
            // Soft-delete bookkeeping rides on the enabled transition:
            // disabling stamps deleted_at once, re-enabling clears it.
            conn.execute(
                &format!(
                    "INSERT INTO sites(user_id, domain, mode, webroot, php_version, enable_http3, enabled)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(domain) DO UPDATE SET
                         user_id = excluded.user_id,
                         mode = excluded.mode,
                         webroot = excluded.webroot,
                         php_version = excluded.php_version,
                         enable_http3 = excluded.enable_http3,
                         enabled = excluded.enabled,
                         deleted_at = CASE
                             WHEN excluded.enabled = 1 THEN NULL
                             WHEN sites.enabled = 1 THEN COALESCE(sites.deleted_at, {SQL_NOW})
                             ELSE sites.deleted_at
                         END,
                         updated_at = {SQL_NOW}"
                ),
                params![
                    site.user_id,
                    site.domain,
                    site.mode.as_str(),
                    site.webroot,
                    site.php_version,
                    site.enable_http3 as i64,
                    site.enabled as i64,
                ],
            )?;
            let row = conn.query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE domain = ?1"),
                params![site.domain],
                map_site_row,
            )?;
            Ok(row)
        })
        .await
        .with_context(|| format!("upsert site {domain}"))
    }

    pub async fn get_site_by_domain(&self, domain: &str) -> anyhow::Result<Option<Site>> {
        let domain = domain.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SITE_COLUMNS} FROM sites WHERE domain = ?1"),
                    params![domain],
                    map_site_row,
                )
                .optional()?)
        })
        .await
        .context("get site")
    }

    pub async fn list_sites(&self) -> anyhow::Result<Vec<Site>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY domain ASC"))?;
            let rows = stmt.query_map([], map_site_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
        .context("list sites")
    }

    pub async fn list_pending_sites(&self) -> anyhow::Result<Vec<Site>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SITE_COLUMNS} FROM sites
                 WHERE enabled = 1
                   AND (last_applied_at IS NULL
                        OR last_apply_status != 'ok'
                        OR updated_at > last_applied_at)
                 ORDER BY domain ASC"
            ))?;
            let rows = stmt.query_map([], map_site_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
        .context("list pending sites")
    }

    pub async fn disable_site_by_domain(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.to_string();
        let d = domain.clone();
        let changed = self
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE sites
                         SET enabled = 0,
                             deleted_at = COALESCE(deleted_at, {SQL_NOW}),
                             updated_at = {SQL_NOW}
                         WHERE domain = ?1"
                    ),
                    params![domain],
                )?)
            })
            .await
            .context("disable site")?;
        if changed == 0 {
            anyhow::bail!("site not found: {d}");
        }
        Ok(())
    }

    pub async fn enable_site_by_domain(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.to_string();
        let d = domain.clone();
        let changed = self
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE sites
                         SET enabled = 1,
                             deleted_at = NULL,
                             updated_at = {SQL_NOW}
                         WHERE domain = ?1"
                    ),
                    params![domain],
                )?)
            })
            .await
            .context("enable site")?;
        if changed == 0 {
            anyhow::bail!("site not found: {d}");
        }
        Ok(())
    }

    /// Hard delete. Removes the row and its children in one transaction; the
    /// caller is responsible for only doing this on an already-disabled site.
    pub async fn delete_site_by_domain(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.to_string();
        let d = domain.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let site_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM sites WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(site_id) = site_id else {
                return Err(tokio_rusqlite::Error::Rusqlite(
                    rusqlite::Error::QueryReturnedNoRows,
                ));
            };

            tx.execute(
                "DELETE FROM proxy_targets WHERE site_id = ?1",
                params![site_id],
            )?;
            tx.execute("DELETE FROM apply_runs WHERE site_id = ?1", params![site_id])?;
            tx.execute("DELETE FROM sites WHERE id = ?1", params![site_id])?;

            tx.commit()?;
            Ok(())
        })
        .await
        .with_context(|| format!("delete site {d}"))
    }

    /// The pipeline's single write path, called once per reconciliation
    /// attempt per site after the final ok/rollback decision. Statuses `ok`
    /// and `fail` stamp the site row; every attempt gets an audit row.
    pub async fn record_apply(
        &self,
        domain: &str,
        action: &str,
        status: &str,
        message: &str,
        render_hash: &str,
    ) -> anyhow::Result<()> {
        if domain.trim().is_empty() {
            anyhow::bail!("domain is required");
        }
        let domain = domain.to_string();
        let action = action.to_string();
        let status = status.to_string();
        let message = message.to_string();
        let render_hash = render_hash.to_string();

        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if status == "ok" || status == "fail" {
                tx.execute(
                    &format!(
                        "UPDATE sites
                         SET last_apply_status = ?1,
                             last_apply_error = ?2,
                             last_render_hash = ?3,
                             last_applied_at = {SQL_NOW}
                         WHERE domain = ?4"
                    ),
                    params![status, message, render_hash, domain],
                )?;
            }

            let site_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM sites WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT INTO apply_runs(site_id, action, status, message) VALUES (?1, ?2, ?3, ?4)",
                params![site_id, action, status, message],
            )?;

            tx.commit()?;
            Ok(())
        })
        .await
        .context("record apply result")
    }

    pub async fn list_recent_apply_runs(&self, limit: i64) -> anyhow::Result<Vec<ApplyRun>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, site_id, action, status, message, created_at
                 FROM apply_runs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(ApplyRun {
                    id: row.get(0)?,
                    site_id: row.get(1)?,
                    action: row.get(2)?,
                    status: row.get(3)?,
                    message: row.get(4)?,
                    created_at: parse_ts_opt(row.get::<_, Option<String>>(5)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
        .context("list apply runs")
    }

    pub async fn upsert_proxy_target(
        &self,
        site_id: i64,
        target: &str,
        weight: i64,
        is_backup: bool,
        enabled: bool,
    ) -> anyhow::Result<()> {
        if site_id == 0 {
            anyhow::bail!("site_id is required");
        }
        let target = target.trim().to_string();
        if target.is_empty() {
            anyhow::bail!("target is required");
        }
        let weight = if weight <= 0 { 100 } else { weight };

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO proxy_targets(site_id, target, weight, is_backup, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(site_id, target) DO UPDATE SET
                     weight = excluded.weight,
                     is_backup = excluded.is_backup,
                     enabled = excluded.enabled",
                params![site_id, target, weight, is_backup as i64, enabled as i64],
            )?;
            Ok(())
        })
        .await
        .context("upsert proxy target")
    }

    pub async fn disable_proxy_target(&self, site_id: i64, target: &str) -> anyhow::Result<()> {
        if site_id == 0 {
            anyhow::bail!("site_id is required");
        }
        let target = target.trim().to_string();
        if target.is_empty() {
            anyhow::bail!("target is required");
        }
        self.call(move |conn| {
            conn.execute(
                "UPDATE proxy_targets SET enabled = 0 WHERE site_id = ?1 AND target = ?2",
                params![site_id, target],
            )?;
            Ok(())
        })
        .await
        .context("disable proxy target")
    }

    /// Enabled upstream targets in render order (primaries before backups).
    pub async fn list_enabled_proxy_targets(&self, site_id: i64) -> anyhow::Result<Vec<ProxyTarget>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, site_id, target, weight, is_backup, enabled
                 FROM proxy_targets
                 WHERE site_id = ?1 AND enabled = 1
                 ORDER BY is_backup ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![site_id], map_proxy_target_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
        .context("list enabled proxy targets")
    }

    pub async fn list_proxy_targets(&self, site_id: i64) -> anyhow::Result<Vec<ProxyTarget>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, site_id, target, weight, is_backup, enabled
                 FROM proxy_targets
                 WHERE site_id = ?1
                 ORDER BY is_backup ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![site_id], map_proxy_target_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
        .context("list proxy targets")
    }

    pub async fn create_panel_user(
        &self,
        username: &str,
        password_hash: &str,
        role: &str,
        enabled: bool,
    ) -> anyhow::Result<PanelUser> {
        if username.trim().is_empty() {
            anyhow::bail!("username is required");
        }
        if password_hash.trim().is_empty() {
            anyhow::bail!("password hash is required");
        }
        let role = if role.trim().is_empty() { "admin" } else { role.trim() };

        let username = username.to_string();
        let password_hash = password_hash.to_string();
        let role = role.to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO panel_users(username, password_hash, role, enabled)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(username) DO UPDATE SET
                         password_hash = excluded.password_hash,
                         role = excluded.role,
                         enabled = excluded.enabled,
                         updated_at = {SQL_NOW}"
                ),
                params![username, password_hash, role, enabled as i64],
            )?;
            let user = conn.query_row(
                "SELECT id, username, password_hash, role, enabled,
                        last_login_at, created_at, updated_at
                 FROM panel_users WHERE username = ?1",
                params![username],
                map_panel_user_row,
            )?;
            Ok(user)
        })
        .await
        .context("create panel user")
    }

    pub async fn get_panel_user_by_username(
        &self,
        username: &str,
    ) -> anyhow::Result<Option<PanelUser>> {
        let username = username.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, password_hash, role, enabled,
                            last_login_at, created_at, updated_at
                     FROM panel_users WHERE username = ?1",
                    params![username],
                    map_panel_user_row,
                )
                .optional()?)
        })
        .await
        .context("get panel user")
    }

    pub async fn update_panel_user_last_login(&self, id: i64) -> anyhow::Result<()> {
        if id == 0 {
            anyhow::bail!("id is required");
        }
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE panel_users
                     SET last_login_at = {SQL_NOW}, updated_at = {SQL_NOW}
                     WHERE id = ?1"
                ),
                params![id],
            )?;
            Ok(())
        })
        .await
        .context("update panel user last login")
    }
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        home_dir: row.get(2)?,
        created_at: parse_ts_opt(row.get::<_, Option<String>>(3)?),
    })
}

fn map_site_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Site> {
    let mode: String = row.get(3)?;
    Ok(Site {
        id: row.get(0)?,
        user_id: row.get(1)?,
        domain: row.get(2)?,
        mode: SiteMode::parse(&mode).unwrap_or(SiteMode::Php),
        webroot: row.get(4)?,
        php_version: row.get(5)?,
        enable_http3: row.get::<_, i64>(6)? != 0,
        enabled: row.get::<_, i64>(7)? != 0,
        deleted_at: parse_ts_opt(row.get::<_, Option<String>>(8)?),
        created_at: parse_ts_opt(row.get::<_, Option<String>>(9)?),
        updated_at: parse_ts_opt(row.get::<_, Option<String>>(10)?),
        last_render_hash: row.get(11)?,
        last_apply_status: row.get(12)?,
        last_apply_error: row.get(13)?,
        last_applied_at: parse_ts_opt(row.get::<_, Option<String>>(14)?),
        tls_mode: row.get(15)?,
        tls_cert_path: row.get(16)?,
        tls_key_path: row.get(17)?,
    })
}

fn map_proxy_target_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProxyTarget> {
    Ok(ProxyTarget {
        id: row.get(0)?,
        site_id: row.get(1)?,
        target: row.get(2)?,
        weight: row.get(3)?,
        is_backup: row.get::<_, i64>(4)? != 0,
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

fn map_panel_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PanelUser> {
    Ok(PanelUser {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        last_login_at: parse_ts_opt(row.get::<_, Option<String>>(5)?),
        created_at: parse_ts_opt(row.get::<_, Option<String>>(6)?),
        updated_at: parse_ts_opt(row.get::<_, Option<String>>(7)?),
    })
}

fn parse_ts_opt(s: Option<String>) -> Option<OffsetDateTime> {
    let s = s?;
    if s.is_empty() {
        return None;
    }
    OffsetDateTime::parse(&s, &Rfc3339).ok()
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let path = path.to_path_buf();
    if path != Path::new(":memory:")
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    Ok(path)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  home_dir TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS sites (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  domain TEXT NOT NULL UNIQUE,
  mode TEXT NOT NULL DEFAULT 'php',
  webroot TEXT NOT NULL,
  php_version TEXT NOT NULL DEFAULT '',
  enable_http3 INTEGER NOT NULL DEFAULT 1,
  enabled INTEGER NOT NULL DEFAULT 1,
  deleted_at TEXT,

  last_render_hash TEXT NOT NULL DEFAULT '',
  last_applied_at TEXT,
  last_apply_status TEXT NOT NULL DEFAULT '',
  last_apply_error TEXT NOT NULL DEFAULT '',

  tls_mode TEXT NOT NULL DEFAULT '',
  tls_cert_path TEXT NOT NULL DEFAULT '',
  tls_key_path TEXT NOT NULL DEFAULT '',

  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_sites_user_id ON sites(user_id);

CREATE TABLE IF NOT EXISTS proxy_targets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
  target TEXT NOT NULL,
  weight INTEGER NOT NULL DEFAULT 100,
  is_backup INTEGER NOT NULL DEFAULT 0,
  enabled INTEGER NOT NULL DEFAULT 1,
  UNIQUE(site_id, target)
);
CREATE INDEX IF NOT EXISTS idx_proxy_targets_site_id ON proxy_targets(site_id);

CREATE TABLE IF NOT EXISTS panel_users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  role TEXT NOT NULL DEFAULT 'admin',
  enabled INTEGER NOT NULL DEFAULT 1,
  last_login_at TEXT,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS apply_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  site_id INTEGER REFERENCES sites(id) ON DELETE SET NULL,
  action TEXT NOT NULL,
  status TEXT NOT NULL,
  message TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_apply_runs_site_id ON apply_runs(site_id);
"#;
