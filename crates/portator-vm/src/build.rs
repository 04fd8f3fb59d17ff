//! Guest builds: compile `<name>/<name>.c` with the guest toolchain.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use portator_contracts::EXIT_SIGNAL_BASE;
use portator_runner_common::{is_program_name, LaunchConfig};

use crate::supervisor::LaunchError;

const COMPILER_FLAGS: &[&str] = &[
    "-static",
    "-fno-pie",
    "-no-pie",
    "-I./include",
    "-I./include/cjson",
    "-DNO_OPEN_MEMSTREAM",
];

const SHARED_INCLUDE_DIR: &str = "include";
const SHARED_SRC_DIR: &str = "src";

#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Shared files written before compiling, relative to the project root.
    pub extracted: Vec<PathBuf>,
    pub output: PathBuf,
    pub status: i32,
}

pub fn build(config: &LaunchConfig, name: &str) -> Result<BuildReport, LaunchError> {
    let root = &config.local_root;
    let src_rel = Path::new(name).join(format!("{name}.c"));
    if !is_program_name(name) || !root.join(&src_rel).is_file() {
        return Err(LaunchError::SourceNotFound { path: src_rel });
    }

    let bin_dir = root.join(name).join("bin");
    std::fs::create_dir_all(&bin_dir)
        .with_context(|| format!("create dir: {}", bin_dir.display()))
        .map_err(LaunchError::Setup)?;

    let mut extracted = Vec::new();
    if !root.join(SHARED_INCLUDE_DIR).exists() || !root.join(SHARED_SRC_DIR).exists() {
        extracted = extract_shared_files(config).map_err(LaunchError::Setup)?;
    }

    let out_rel = Path::new(name).join("bin").join(name);
    let support = support_sources(root).map_err(LaunchError::Setup)?;

    let mut cmd = Command::new(&config.compiler);
    cmd.current_dir(root)
        .args(COMPILER_FLAGS)
        .arg("-o")
        .arg(&out_rel)
        .arg(&src_rel)
        .args(&support);
    tracing::info!(cmd = ?cmd, "running guest compiler");

    let status = match cmd.status() {
        Ok(status) => status,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(LaunchError::CommandNotFound {
                name: config.compiler.clone(),
            });
        }
        Err(err) => return Err(LaunchError::Fork(err)),
    };

    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    let status = match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| EXIT_SIGNAL_BASE + s).unwrap_or(1),
    };

    Ok(BuildReport {
        extracted,
        output: root.join(out_rel),
        status,
    })
}

/// `./src/*.c`, sorted.
fn support_sources(root: &Path) -> Result<Vec<PathBuf>> {
    let dir = root.join(SHARED_SRC_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("read dir: {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry: {}", dir.display()))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "c") && path.is_file() {
            out.push(Path::new(".").join(SHARED_SRC_DIR).join(entry.file_name()));
        }
    }
    out.sort();
    Ok(out)
}

/// Copy the bundle's shared headers and sources into the project root,
/// overwriting existing copies. Returns the written paths relative to the root.
pub fn extract_shared_files(config: &LaunchConfig) -> Result<Vec<PathBuf>> {
    let shared = config
        .shared_root()
        .context("no bundle directory; cannot extract shared files")?;
    if !shared.is_dir() {
        anyhow::bail!("shared files missing from bundle: {}", shared.display());
    }
    let mut written = Vec::new();
    copy_dir_recursive(&shared, &config.local_root, Path::new(""), &mut written)?;
    Ok(written)
}

fn copy_dir_recursive(src: &Path, dst: &Path, rel: &Path, written: &mut Vec<PathBuf>) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create dir: {}", dst.display()))?;

    let mut entries: Vec<_> = std::fs::read_dir(src)
        .with_context(|| format!("read dir: {}", src.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("read dir entries: {}", src.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src_path = entry.path();
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("read file type: {}", src_path.display()))?;
        let dst_path = dst.join(&file_name);
        let rel_path = rel.join(&file_name);

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path, &rel_path, written)?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path).with_context(|| {
                format!("copy file: {} -> {}", src_path.display(), dst_path.display())
            })?;
            written.push(rel_path);
        }
    }
    Ok(())
}
