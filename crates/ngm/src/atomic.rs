use std::{
    fs,
    io::Write as _,
    os::unix::fs::PermissionsExt as _,
    path::Path,
};

use anyhow::Context as _;
use tempfile::NamedTempFile;

/// Writes `data` to `path` atomically: a uniquely-named temp file is created
/// in the destination directory, filled, chmodded, fsynced, then renamed over
/// `path`. Readers never observe a partial file. The same-directory constraint
/// keeps the final rename atomic on the target filesystem.
pub fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;

    // NamedTempFile removes the temp on drop, so any failure before
    // `persist` leaves nothing behind.
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp in {}", dir.display()))?;
    tmp.write_all(data).context("write temp")?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .context("chmod temp")?;
    tmp.as_file().sync_all().context("sync temp")?;
    tmp.persist(path)
        .with_context(|| format!("rename temp over {}", path.display()))?;
    Ok(())
}
