//! Program discovery across ordered search roots.
//!
//! A program `X` lives at `<root>/X/bin/X`. The first root is the project-local
//! tree; every later root is bundled and only contributes names the earlier
//! roots did not provide. Discovery is a fresh filesystem scan on every call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const HIDDEN_MARKER: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Bundled,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Bundled => "bundled",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub name: String,
    pub executable_path: PathBuf,
    pub origin: Origin,
}

/// Well-known executable location of program `name` under `root`.
pub fn program_executable(root: &Path, name: &str) -> PathBuf {
    root.join(name).join("bin").join(name)
}

pub fn discover(roots: &[PathBuf]) -> Vec<ProgramDescriptor> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out: Vec<ProgramDescriptor> = Vec::new();

    for (idx, root) in roots.iter().enumerate() {
        let origin = if idx == 0 {
            Origin::Local
        } else {
            Origin::Bundled
        };

        let names = match candidate_names(root) {
            Ok(names) => names,
            Err(err) => {
                tracing::debug!(root = %root.display(), "skipping search root: {err:#}");
                continue;
            }
        };

        for name in names {
            if seen.contains(&name) {
                continue;
            }
            let executable_path = program_executable(root, &name);
            if std::fs::metadata(&executable_path).is_err() {
                continue;
            }
            seen.insert(name.clone());
            out.push(ProgramDescriptor {
                name,
                executable_path,
                origin,
            });
        }
    }

    out
}

/// Whether `name` can name a program: one non-hidden path component, so
/// `<root>/<name>` never leaves `root`.
pub fn is_program_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(HIDDEN_MARKER)
        && !name.contains(['/', '\\', '\0'])
}

/// Immediate subdirectory names of `root`, hidden entries excluded, in name order.
fn candidate_names(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        std::fs::read_dir(root).with_context(|| format!("read dir: {}", root.display()))?
    {
        let Ok(entry) = entry else { continue };
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with(HIDDEN_MARKER) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Serialize)]
struct ListingDoc<'a> {
    apps: Vec<ListingEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ListingEntry<'a> {
    name: &'a str,
}

/// Guest-visible listing document `{"apps":[{"name":..},..]}`.
///
/// Only names cross into the guest; paths and origins stay host-side.
pub fn serialize_listing(programs: &[ProgramDescriptor]) -> Result<Vec<u8>> {
    let doc = ListingDoc {
        apps: programs
            .iter()
            .map(|p| ListingEntry { name: &p.name })
            .collect(),
    };
    serde_json::to_vec(&doc).context("serialize program listing")
}

#[derive(Debug, Deserialize)]
struct ListingDocOwned {
    apps: Vec<ListingEntryOwned>,
}

#[derive(Debug, Deserialize)]
struct ListingEntryOwned {
    name: String,
}

/// Program names of a listing document. A trailing NUL terminator is accepted.
pub fn parse_listing_names(bytes: &[u8]) -> Result<Vec<String>> {
    let bytes = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    let doc: ListingDocOwned = serde_json::from_slice(bytes).context("parse program listing")?;
    Ok(doc.apps.into_iter().map(|e| e.name).collect())
}
