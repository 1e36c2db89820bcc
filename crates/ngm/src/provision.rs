//! Local user and per-site directory provisioning.
//!
//! Ownership changes require effective root; without it directory creation
//! still proceeds and chown calls are skipped so a dev setup keeps working.

use std::{
    fs,
    os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use nix::unistd::{Gid, Group, Uid, User, chown, geteuid};

use crate::runner::{CommandRunner, CommandSpec};

#[derive(Clone, Debug)]
pub struct SiteDirs {
    pub site_root: PathBuf,
    pub public: PathBuf,
    pub logs: PathBuf,
    pub tmp: PathBuf,
    pub php: PathBuf,
}

/// Ensures the local OS user exists, creating it via `useradd` when missing.
/// Creating a user needs effective root; a missing user without root is a
/// hard error so the operator knows to re-run privileged.
pub async fn ensure_system_user(
    runner: &dyn CommandRunner,
    username: &str,
    home: &Path,
) -> anyhow::Result<()> {
    let username = username.trim();
    if username.is_empty() {
        anyhow::bail!("username is empty");
    }
    if home.as_os_str().is_empty() {
        anyhow::bail!("home dir is empty");
    }

    if user_exists(username)? {
        return Ok(());
    }
    if !geteuid().is_root() {
        anyhow::bail!("linux user {username:?} does not exist; run as root to create it");
    }

    let home = home.to_string_lossy().to_string();
    runner
        .run(
            CommandSpec::new(
                "useradd",
                ["-m", "-d", home.as_str(), "-s", "/bin/bash", username],
            ),
            Duration::from_secs(10),
        )
        .await
        .context("useradd failed")?;
    Ok(())
}

/// Creates the site layout around the webroot:
///
///   <site_root>/public   (the webroot)
///   <site_root>/logs     with access.log / error.log pre-touched
///   <site_root>/tmp
///   <site_root>/php
///
/// When running as root the tree is chowned to `user:web_group` and the home
/// directory is made traverse-only (`0710`, group `web_group`) so nginx
/// workers can open files beneath it without listing the home itself.
pub fn ensure_site_dirs(
    user: &str,
    home: &Path,
    webroot: &Path,
    web_group: &str,
) -> anyhow::Result<SiteDirs> {
    if webroot.as_os_str().is_empty() || webroot == Path::new("/") {
        anyhow::bail!("invalid webroot {:?}", webroot);
    }
    let site_root = webroot
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .with_context(|| format!("invalid webroot {:?}", webroot))?
        .to_path_buf();

    let dirs = SiteDirs {
        site_root: site_root.clone(),
        public: webroot.to_path_buf(),
        logs: site_root.join("logs"),
        tmp: site_root.join("tmp"),
        php: site_root.join("php"),
    };

    for d in [&dirs.site_root, &dirs.public, &dirs.logs, &dirs.tmp, &dirs.php] {
        fs::create_dir_all(d).with_context(|| format!("mkdir {}", d.display()))?;
        fs::set_permissions(d, fs::Permissions::from_mode(0o750))
            .with_context(|| format!("chmod {}", d.display()))?;
    }

    // Pre-create log files so nginx can open them on the first reload.
    touch(&dirs.logs.join("access.log"), 0o640)?;
    touch(&dirs.logs.join("error.log"), 0o640)?;

    if geteuid().is_root() {
        apply_ownership(user, home, &dirs, web_group);
    }

    Ok(dirs)
}

/// Best-effort: a missing user/group (or an EPERM from an odd mount) must not
/// fail provisioning.
fn apply_ownership(user: &str, home: &Path, dirs: &SiteDirs, web_group: &str) {
    let uid = lookup_uid(user);
    let gid = lookup_gid(web_group);

    if uid.is_none() && gid.is_none() {
        return;
    }

    chown_recursive(&dirs.site_root, uid, gid);

    // Home stays owned by the user; only the group and traverse bit change.
    if !home.as_os_str().is_empty() {
        let _ = chown(home, None, gid);
        let _ = fs::set_permissions(home, fs::Permissions::from_mode(0o710));
    }
}

fn lookup_uid(user: &str) -> Option<Uid> {
    User::from_name(user).ok().flatten().map(|u| u.uid)
}

fn lookup_gid(group: &str) -> Option<Gid> {
    let group = group.trim();
    if group.is_empty() {
        return None;
    }
    Group::from_name(group).ok().flatten().map(|g| g.gid)
}

fn user_exists(username: &str) -> anyhow::Result<bool> {
    Ok(User::from_name(username)
        .context("local user lookup")?
        .is_some())
}

fn chown_recursive(root: &Path, uid: Option<Uid>, gid: Option<Gid>) {
    let _ = chown(root, uid, gid);
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            chown_recursive(&path, uid, gid);
        } else {
            let _ = chown(&path, uid, gid);
        }
    }
}

fn touch(path: &Path, mode: u32) -> anyhow::Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("touch {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;

    #[test]
    fn creates_site_layout_and_log_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        let webroot = home.join("sites/site1.example/public");

        let dirs = ensure_site_dirs("alice", &home, &webroot, "www-data").unwrap();

        for d in [&dirs.site_root, &dirs.public, &dirs.logs, &dirs.tmp, &dirs.php] {
            assert!(d.is_dir(), "missing {}", d.display());
            assert_eq!(fs::metadata(d).unwrap().mode() & 0o777, 0o750);
        }
        for f in ["access.log", "error.log"] {
            let path = dirs.logs.join(f);
            assert!(path.is_file(), "missing {}", path.display());
        }
        assert_eq!(dirs.public, webroot);
    }

    #[test]
    fn is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        let webroot = home.join("sites/site1.example/public");

        ensure_site_dirs("alice", &home, &webroot, "www-data").unwrap();
        fs::write(webroot.join("index.html"), b"hi").unwrap();
        ensure_site_dirs("alice", &home, &webroot, "www-data").unwrap();

        // existing content survives a re-run
        assert_eq!(fs::read(webroot.join("index.html")).unwrap(), b"hi");
    }

    #[test]
    fn rejects_unusable_webroot() {
        assert!(ensure_site_dirs("alice", Path::new("/home/alice"), Path::new("/"), "www-data").is_err());
        assert!(ensure_site_dirs("alice", Path::new("/home/alice"), Path::new(""), "www-data").is_err());
    }
}
