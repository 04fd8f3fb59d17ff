use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use portator_contracts::TEMPLATE_NAME_PLACEHOLDER;

use crate::template::{self, TemplateContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TemplateKind {
    Console,
    Gui,
    Web,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::Console => "console",
            TemplateKind::Gui => "gui",
            TemplateKind::Web => "web",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ScaffoldReport {
    /// Written files, in template order.
    pub written: Vec<PathBuf>,
    /// Template files that failed to render, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

pub fn template_dir(templates_root: &Path, kind: TemplateKind) -> Option<PathBuf> {
    let dir = templates_root.join(kind.as_str());
    dir.is_dir().then_some(dir)
}

/// Instantiate the `kind` template into `output_root` (the new project
/// directory), naming files and filling contents with `name`.
pub fn render(
    templates_root: &Path,
    kind: TemplateKind,
    name: &str,
    output_root: &Path,
) -> Result<ScaffoldReport> {
    let src = template_dir(templates_root, kind)
        .with_context(|| format!("template not found: {kind}"))?;

    let bin = output_root.join("bin");
    std::fs::create_dir_all(&bin).with_context(|| format!("create dir: {}", bin.display()))?;

    let ctx = TemplateContext::new().with("name", name);
    let mut report = ScaffoldReport::default();
    render_dir(&src, output_root, name, &ctx, &mut report)?;
    Ok(report)
}

fn render_dir(
    src: &Path,
    dst: &Path,
    name: &str,
    ctx: &TemplateContext,
    report: &mut ScaffoldReport,
) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create dir: {}", dst.display()))?;

    let mut entries: Vec<_> = std::fs::read_dir(src)
        .with_context(|| format!("read dir: {}", src.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("read dir entries: {}", src.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src_path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') {
            continue;
        }
        let dst_path = dst.join(file_name.replace(TEMPLATE_NAME_PLACEHOLDER, name));
        let file_type = entry
            .file_type()
            .with_context(|| format!("read file type: {}", src_path.display()))?;

        if file_type.is_dir() {
            render_dir(&src_path, &dst_path, name, ctx, report)?;
            continue;
        }

        let rendered = std::fs::read_to_string(&src_path)
            .map_err(|err| err.to_string())
            .and_then(|text| template::render(&text, ctx).map_err(|err| err.to_string()));
        match rendered {
            Ok(text) => {
                std::fs::write(&dst_path, text)
                    .with_context(|| format!("write: {}", dst_path.display()))?;
                report.written.push(dst_path);
            }
            Err(reason) => {
                tracing::warn!(template = %src_path.display(), "skipping template: {reason}");
                report.skipped.push((src_path, reason));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let console = root.path().join("console");
        std::fs::create_dir_all(console.join("zip")).unwrap();
        std::fs::write(
            console.join("__NAME__.c"),
            "/* {{name}} */\nint main(void) { return 0; }\n",
        )
        .unwrap();
        std::fs::write(console.join("zip/__NAME__.txt"), "hello {{name}}\n").unwrap();
        std::fs::write(console.join("broken.c"), "{{#loop}}\n").unwrap();
        std::fs::write(console.join(".gitignore"), "bin/\n").unwrap();
        std::fs::create_dir_all(console.join(".cache")).unwrap();
        std::fs::write(console.join(".cache/__NAME__.o"), "").unwrap();
        root
    }

    #[test]
    fn renders_names_and_contents() {
        let tpl = templates();
        let out = tempfile::tempdir().unwrap();
        let project = out.path().join("widget");

        let report = render(tpl.path(), TemplateKind::Console, "widget", &project).unwrap();
        assert_eq!(
            report.written,
            vec![project.join("widget.c"), project.join("zip/widget.txt")]
        );
        assert!(project.join("bin").is_dir());
        assert!(!project.join(".gitignore").exists());
        assert!(!project.join(".cache").exists());

        let c = std::fs::read_to_string(project.join("widget.c")).unwrap();
        assert!(c.contains("/* widget */"));
        assert!(!c.contains(TEMPLATE_NAME_PLACEHOLDER));
        assert!(!c.contains("{{"));
    }

    #[test]
    fn broken_templates_are_skipped() {
        let tpl = templates();
        let out = tempfile::tempdir().unwrap();
        let project = out.path().join("w");

        let report = render(tpl.path(), TemplateKind::Console, "w", &project).unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].0.ends_with("broken.c"));
        assert!(!project.join("broken.c").exists());
        assert_eq!(report.written.len(), 2);
    }

    #[test]
    fn existing_project_dir_is_fine_and_missing_kind_errors() {
        let tpl = templates();
        let out = tempfile::tempdir().unwrap();
        let project = out.path().join("again");
        std::fs::create_dir_all(project.join("bin")).unwrap();
        render(tpl.path(), TemplateKind::Console, "again", &project).unwrap();

        let err = render(tpl.path(), TemplateKind::Gui, "again", &project).unwrap_err();
        assert!(format!("{err:#}").contains("template not found: gui"));
    }
}
