//! Startup configuration.
//!
//! Everything here is read once when the process starts and then passed around
//! as an immutable value; nothing below consults the environment again.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use portator_contracts::{
    DEFAULT_CC, DEFAULT_OVERLAYS, ENV_BUNDLE_DIR, ENV_CC, ENV_NOLINEAR, ENV_OVERLAYS,
};

use crate::paths::default_bundle_dir_from;

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Project-local search root; programs here override bundled ones.
    pub local_root: PathBuf,
    /// Read-only bundle holding `apps/`, `shared/` and `wwwroot/`.
    pub bundle_dir: Option<PathBuf>,
    /// Root-overlay spec handed to the emulator.
    pub overlays: String,
    /// Host directory the guest VFS is rooted at.
    pub vfs_prefix: PathBuf,
    pub linear_memory: bool,
    /// Guest compiler used by `build`.
    pub compiler: OsString,
}

fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

impl LaunchConfig {
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir().context("current_dir")?;
        let exe = std::env::current_exe().ok();
        Self::from_lookup(|k| std::env::var_os(k), &cwd, exe.as_deref())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<OsString>,
        cwd: &Path,
        exe: Option<&Path>,
    ) -> Result<Self> {
        let bundle_dir = default_bundle_dir_from(lookup(ENV_BUNDLE_DIR).map(PathBuf::from), exe);

        let overlays = match lookup(ENV_OVERLAYS) {
            Some(raw) => raw
                .into_string()
                .map_err(|raw| anyhow::anyhow!("{ENV_OVERLAYS} is not valid UTF-8: {raw:?}"))?,
            None => DEFAULT_OVERLAYS.to_string(),
        };
        if overlays.trim().is_empty() {
            anyhow::bail!("bad overlays spec: {ENV_OVERLAYS} is empty");
        }

        let nolinear = match lookup(ENV_NOLINEAR) {
            Some(raw) => parse_bool_env(ENV_NOLINEAR, &raw.to_string_lossy())?,
            None => false,
        };

        let compiler = lookup(ENV_CC)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| OsString::from(DEFAULT_CC));

        Ok(LaunchConfig {
            local_root: cwd.to_path_buf(),
            bundle_dir,
            overlays,
            vfs_prefix: cwd.to_path_buf(),
            linear_memory: !nolinear,
            compiler,
        })
    }

    pub fn apps_root(&self) -> Option<PathBuf> {
        self.bundle_dir.as_ref().map(|d| d.join("apps"))
    }

    pub fn shared_root(&self) -> Option<PathBuf> {
        self.bundle_dir.as_ref().map(|d| d.join("shared"))
    }

    pub fn templates_root(&self) -> Option<PathBuf> {
        self.apps_root().map(|d| d.join("new").join("templates"))
    }

    pub fn wwwroot(&self) -> Option<PathBuf> {
        self.bundle_dir.as_ref().map(|d| d.join("wwwroot"))
    }

    /// Registry search roots, highest priority first.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.local_root.clone()];
        roots.extend(self.apps_root());
        roots
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> Result<LaunchConfig> {
        let env: BTreeMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        LaunchConfig::from_lookup(|k| env.get(k).cloned(), Path::new("/work"), None)
    }

    #[test]
    fn defaults() {
        let cfg = config_with(&[(ENV_BUNDLE_DIR, "/b")]).unwrap();
        assert_eq!(cfg.local_root, PathBuf::from("/work"));
        assert_eq!(cfg.vfs_prefix, PathBuf::from("/work"));
        assert_eq!(cfg.overlays, DEFAULT_OVERLAYS);
        assert!(cfg.linear_memory);
        assert_eq!(cfg.compiler, OsString::from(DEFAULT_CC));
        assert_eq!(
            cfg.search_roots(),
            vec![PathBuf::from("/work"), PathBuf::from("/b/apps")]
        );
        assert_eq!(
            cfg.templates_root(),
            Some(PathBuf::from("/b/apps/new/templates"))
        );
        assert_eq!(cfg.wwwroot(), Some(PathBuf::from("/b/wwwroot")));
    }

    #[test]
    fn overrides_from_env() {
        let cfg = config_with(&[
            (ENV_NOLINEAR, "1"),
            (ENV_CC, "clang"),
            (ENV_OVERLAYS, ":/opt/root"),
        ])
        .unwrap();
        assert!(!cfg.linear_memory);
        assert_eq!(cfg.compiler, OsString::from("clang"));
        assert_eq!(cfg.overlays, ":/opt/root");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_with(&[(ENV_NOLINEAR, "maybe")]).is_err());
        let err = config_with(&[(ENV_OVERLAYS, "  ")]).unwrap_err();
        assert!(format!("{err:#}").contains("bad overlays spec"));
    }
}
