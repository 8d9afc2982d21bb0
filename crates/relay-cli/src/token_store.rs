//! Minimal on-disk token cache for `relay login` / `relay proxy`.
//!
//! Not part of any spec'd component — a thin convenience so `proxy`
//! doesn't require `--token` on every invocation. Stored at
//! `$HOME/.config/relaytun/token`, mode 0600 where supported.

use std::path::PathBuf;

fn token_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".config/relaytun/token"))
}

pub fn load() -> anyhow::Result<String> {
    let path = token_path()?;
    let token = std::fs::read_to_string(&path)
        .map_err(|_| anyhow::anyhow!("not logged in (run `relay login` first)"))?;
    Ok(token.trim().to_string())
}

pub fn save(token: &str) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let path = token_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(token.as_bytes())?;
    Ok(())
}
