use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const BUNDLE_SIBLING_REL: &str = "bundle";
const BUNDLE_SHARE_REL: &str = "share/portator";
const BUNDLE_REPO_REL: &str = "assets";

/// Marker every bundle carries; used to tell a bundle apart from an unrelated directory.
const BUNDLE_APPS_DIR: &str = "apps";

/// Candidate walk: explicit override, next to the executable, a `share/`
/// install layout, then the repository checkout.
pub fn default_bundle_dir_from(env_override: Option<PathBuf>, exe: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = env_override {
        return Some(dir);
    }

    let mut checked: Vec<PathBuf> = Vec::new();

    if let Some(exe_dir) = exe.and_then(Path::parent) {
        let cand = exe_dir.join(BUNDLE_SIBLING_REL);
        checked.push(cand.clone());
        if is_bundle(&cand) {
            return Some(cand);
        }
        if let Some(prefix) = exe_dir.parent() {
            let cand = prefix.join(BUNDLE_SHARE_REL);
            checked.push(cand.clone());
            if is_bundle(&cand) {
                return Some(cand);
            }
        }
    }

    let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    if let Some(workspace_root) = crate_dir.parent().and_then(|p| p.parent()) {
        let cand = workspace_root.join(BUNDLE_REPO_REL);
        checked.push(cand.clone());
        if is_bundle(&cand) {
            return Some(cand);
        }
    }

    tracing::debug!(
        checked = ?checked,
        "no bundle directory found; only local programs are available"
    );
    None
}

fn is_bundle(dir: &Path) -> bool {
    dir.join(BUNDLE_APPS_DIR).is_dir()
}

pub fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Ok(meta) = std::fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }
    #[cfg(not(unix))]
    {
        return true;
    }
    false
}

/// Resolve a command the way a shell would: paths with a separator are used
/// as-is, bare names are searched on `PATH`.
pub fn resolve_command(prog: &OsStr) -> Option<PathBuf> {
    let prog_path = PathBuf::from(prog);
    if prog_path.components().count() > 1 {
        return is_executable(&prog_path).then_some(prog_path);
    }

    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .map(|dir| dir.join(&prog_path))
        .find(|cand| is_executable(cand))
}
