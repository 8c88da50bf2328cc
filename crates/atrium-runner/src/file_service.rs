use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Vendor and cache directories that never belong in a project tree view.
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".git",
    ".next",
    "dist",
    "build",
    ".venv",
    "venv",
    ".env",
    ".codepanda",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

fn skip_directory(name: &str) -> bool {
    let name = name.to_lowercase();
    SKIPPED_DIRS.iter().any(|dir| name == *dir)
}

/// Depth-first tree of the project directory with the skip set pruned.
/// Unreadable entries are skipped rather than aborting the walk; skipped
/// directories yield `None`.
pub fn build_file_tree(root: &Path) -> anyhow::Result<Option<FileNode>> {
    let metadata = std::fs::metadata(root)?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());

    if !metadata.is_dir() {
        return Ok(Some(FileNode { name, kind: "file", children: None }));
    }

    if skip_directory(&name) {
        return Ok(None);
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        match build_file_tree(&entry.path()) {
            Ok(Some(child)) => children.push(child),
            Ok(None) => {}
            Err(_) => continue,
        }
    }

    Ok(Some(FileNode {
        name,
        kind: "folder",
        children: if children.is_empty() { None } else { Some(children) },
    }))
}

/// Lexically resolve `file_path` under the project directory, mirroring a
/// clean-then-join: `..` pops, absolute prefixes are stripped. Returns None
/// when the resolved path escapes the project directory.
pub fn resolve_within_project(project_path: &Path, file_path: &str) -> Option<PathBuf> {
    // Platform-normalize separators before resolution.
    let normalized = file_path.replace('\\', "/");

    let mut resolved = project_path.to_path_buf();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(segment) => resolved.push(segment),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    resolved.starts_with(project_path).then_some(resolved)
}

/// Best-effort MIME detection: magic bytes first, then the extension, then a
/// text/binary guess.
pub fn detect_mime_type(path: &Path, content: &[u8]) -> String {
    if let Some(kind) = infer::get(content) {
        return kind.mime_type().to_string();
    }
    if let Some(mime) = mime_guess::from_path(path).first_raw() {
        return mime.to_string();
    }
    if std::str::from_utf8(content).is_ok() {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(children: &Option<Vec<FileNode>>) -> Vec<&str> {
        children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    #[test]
    fn walk_prunes_skip_set_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::create_dir(dir.path().join("DIST")).unwrap();
        std::fs::write(dir.path().join("src/main.ts"), "export {}").unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let tree = build_file_tree(dir.path()).unwrap().unwrap();
        assert_eq!(tree.kind, "folder");

        let top = names(&tree.children);
        assert!(top.contains(&"src"));
        assert!(top.contains(&"index.html"));
        assert!(!top.contains(&"node_modules"));
        assert!(!top.contains(&"DIST"));

        let src = tree
            .children
            .as_ref()
            .unwrap()
            .iter()
            .find(|c| c.name == "src")
            .unwrap();
        assert_eq!(names(&src.children), vec!["main.ts"]);
    }

    #[test]
    fn files_have_no_children_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let tree = build_file_tree(&dir.path().join("a.txt")).unwrap().unwrap();
        assert_eq!(tree.kind, "file");
        assert!(tree.children.is_none());

        let json = serde_json::to_string(&tree).unwrap();
        assert!(!json.contains("children"));
    }

    #[test]
    fn empty_directories_serialize_without_children() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_file_tree(dir.path()).unwrap().unwrap();
        assert_eq!(tree.kind, "folder");
        assert!(tree.children.is_none());
    }

    #[test]
    fn traversal_outside_the_project_is_rejected() {
        let project = Path::new("/workspace/p1");
        assert!(resolve_within_project(project, "../../etc/passwd").is_none());
        assert!(resolve_within_project(project, "src/../../p2/secret").is_none());
    }

    #[test]
    fn interior_parent_segments_resolve() {
        let project = Path::new("/workspace/p1");
        assert_eq!(
            resolve_within_project(project, "src/../src/app.ts").unwrap(),
            PathBuf::from("/workspace/p1/src/app.ts")
        );
    }

    #[test]
    fn absolute_paths_are_treated_as_project_relative() {
        let project = Path::new("/workspace/p1");
        assert_eq!(
            resolve_within_project(project, "/etc/passwd").unwrap(),
            PathBuf::from("/workspace/p1/etc/passwd")
        );
    }

    #[test]
    fn backslash_separators_are_normalized() {
        let project = Path::new("/workspace/p1");
        assert_eq!(
            resolve_within_project(project, "src\\app.ts").unwrap(),
            PathBuf::from("/workspace/p1/src/app.ts")
        );
    }

    #[test]
    fn mime_detection_prefers_magic_bytes() {
        let png = [0x89u8, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        assert_eq!(detect_mime_type(Path::new("image.wrong"), &png), "image/png");

        let mime = detect_mime_type(Path::new("app.css"), b"body { color: red }");
        assert_eq!(mime, "text/css");

        assert_eq!(
            detect_mime_type(Path::new("notes"), b"plain words"),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            detect_mime_type(Path::new("blob"), &[0xff, 0xfe, 0x00, 0x01]),
            "application/octet-stream"
        );
    }
}
