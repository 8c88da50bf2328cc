use std::path::Path;

use serde::Serialize;
use tokio::process::Command;

pub const DEFAULT_COMMIT_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommitFile {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub date: String,
    pub files: Vec<CommitFile>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitPage {
    pub commits: Vec<Commit>,
    pub has_next_page: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub fn is_git_repository(project_path: &Path) -> bool {
    project_path.join(".git").exists()
}

/// Run a git subprocess in the project directory; non-zero exit becomes an
/// error carrying the combined output.
pub async fn exec_git(working_dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to run git: {e}"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        anyhow::bail!("git command failed: {}: {combined}", output.status);
    }
    Ok(combined)
}

/// Parse `git --no-pager log --pretty=format:"%ai %H %d %s [%an]"` output.
///
/// Each line: three date fields, the hash, then the decorated subject. A
/// parenthesized ref list is stripped, and the trailing ` [author]` tag is
/// trimmed by last-index. That trim is a heuristic: a subject that itself
/// ends in `[...]` loses that tail too (preserved behavior, flagged for
/// review downstream).
pub fn parse_git_log(output: &str) -> Vec<Commit> {
    let mut commits = Vec::new();

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.splitn(5, ' ').collect();
        if parts.len() < 5 {
            tracing::warn!(line, "skipping malformed git log line");
            continue;
        }

        let date = format!("{} {} {}", parts[0], parts[1], parts[2]);
        let hash = parts[3].to_string();
        let remaining = parts[4];
        let mut message = remaining;

        if let Some(close) = remaining.find(')')
            && let Some(open) = remaining.find('(')
            && open < close
        {
            message = remaining[close + 1..].trim();
        }

        let message = match message.rfind(" [") {
            Some(idx) => message[..idx].trim(),
            None => message.trim(),
        };

        commits.push(Commit {
            hash,
            message: message.to_string(),
            date,
            files: Vec::new(),
        });
    }

    commits
}

/// Cursor-based page over an already-parsed commit list. The cursor is a
/// commit hash; the page starts after it.
pub fn paginate_commits(all: Vec<Commit>, cursor: Option<&str>, limit: usize) -> CommitPage {
    let start = match cursor {
        Some(cursor) => all
            .iter()
            .position(|c| c.hash == cursor)
            .map(|i| i + 1)
            .unwrap_or(0),
        None => 0,
    };

    let end = (start + limit).min(all.len());
    let has_next_page = end < all.len();
    let commits: Vec<Commit> = if start < all.len() {
        all[start..end].to_vec()
    } else {
        Vec::new()
    };

    let next_cursor = if has_next_page {
        commits.last().map(|c| c.hash.clone())
    } else {
        None
    };

    CommitPage { commits, has_next_page, next_cursor }
}

/// `A` / `M` / `D` from `git show --name-status`; anything else (renames,
/// copies, mode changes) is reported as modified.
pub fn parse_name_status(output: &str) -> Vec<CommitFile> {
    let mut files = Vec::new();
    for line in output.trim().lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(status), Some(path)) = (fields.next(), fields.next()) else {
            continue;
        };

        let kind = match status {
            "A" => "added",
            "M" => "modified",
            "D" => "deleted",
            _ => "modified",
        };

        files.push(CommitFile { path: path.to_string(), kind: kind.to_string() });
    }
    files
}

pub async fn list_commits(
    project_path: &Path,
    cursor: Option<&str>,
    limit: usize,
) -> anyhow::Result<CommitPage> {
    let log = exec_git(
        project_path,
        &["--no-pager", "log", "--pretty=format:%ai %H %d %s [%an]"],
    )
    .await?;

    let mut page = paginate_commits(parse_git_log(&log), cursor, limit);

    for commit in &mut page.commits {
        let name_status = exec_git(
            project_path,
            &["show", "--name-status", "--pretty=format:", &commit.hash],
        )
        .await?;
        commit.files = parse_name_status(&name_status);
    }

    Ok(page)
}

/// Old and new contents of one file at a commit. Either side failing to
/// resolve (added or deleted file) comes back as the empty string.
pub async fn file_diff(project_path: &Path, commit_hash: &str, file_path: &str) -> FileDiff {
    let old_text = exec_git(project_path, &["show", &format!("{commit_hash}^:{file_path}")])
        .await
        .unwrap_or_default();
    let new_text = exec_git(project_path, &["show", &format!("{commit_hash}:{file_path}")])
        .await
        .unwrap_or_default();

    FileDiff { path: file_path.to_string(), old_text, new_text }
}

pub async fn commit_diff(project_path: &Path, commit_hash: &str) -> anyhow::Result<Vec<FileDiff>> {
    let files_output = exec_git(
        project_path,
        &["show", "--name-only", "--pretty=format:", commit_hash],
    )
    .await?;

    let mut changes = Vec::new();
    for file in files_output.trim().lines() {
        if file.is_empty() {
            continue;
        }
        changes.push(file_diff(project_path, commit_hash, file).await);
    }
    Ok(changes)
}

/// `git reset --hard <hash>`. Discards uncommitted working-tree changes by
/// design; callers own the confirmation UX.
pub async fn reset_to_commit(project_path: &Path, commit_hash: &str) -> anyhow::Result<()> {
    exec_git(project_path, &["reset", "--hard", commit_hash]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str) -> Commit {
        Commit {
            hash: hash.to_string(),
            message: format!("commit {hash}"),
            date: "2025-06-01 10:00:00 +0000".to_string(),
            files: Vec::new(),
        }
    }

    #[test]
    fn parses_plain_log_lines() {
        let out = "2025-06-01 10:00:00 +0000 abc123  Fix the proxy [Jane Doe]\n";
        let commits = parse_git_log(out);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash, "abc123");
        assert_eq!(commits[0].date, "2025-06-01 10:00:00 +0000");
        assert_eq!(commits[0].message, "Fix the proxy");
    }

    #[test]
    fn strips_ref_decorations() {
        let out = "2025-06-01 10:00:00 +0000 abc123  (HEAD -> main, origin/main) Ship it [Jane]\n";
        let commits = parse_git_log(out);
        assert_eq!(commits[0].message, "Ship it");
    }

    #[test]
    fn author_tail_trim_also_eats_bracketed_subjects() {
        // Known heuristic: a subject ending in [...] loses that tail.
        let out = "2025-06-01 10:00:00 +0000 abc123  Bump deps [security] [Jane]\n";
        let commits = parse_git_log(out);
        assert_eq!(commits[0].message, "Bump deps");
    }

    #[test]
    fn skips_malformed_lines() {
        let commits = parse_git_log("garbage\n\n2025-06-01 10:00:00 +0000 abc1  msg [a]\n");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash, "abc1");
    }

    #[test]
    fn pagination_pages_are_contiguous_and_disjoint() {
        let all: Vec<Commit> = (0..25).map(|i| commit(&format!("c{i}"))).collect();

        let first = paginate_commits(all.clone(), None, 10);
        assert_eq!(first.commits.len(), 10);
        assert!(first.has_next_page);
        assert_eq!(first.next_cursor.as_deref(), Some("c9"));

        let second = paginate_commits(all.clone(), Some("c9"), 10);
        assert_eq!(second.commits[0].hash, "c10");
        assert_eq!(second.commits.len(), 10);
        assert!(second.has_next_page);

        let third = paginate_commits(all.clone(), Some("c19"), 10);
        assert_eq!(third.commits.len(), 5);
        assert!(!third.has_next_page);
        assert!(third.next_cursor.is_none());

        let mut joined: Vec<String> = Vec::new();
        for page in [&first, &second, &third] {
            joined.extend(page.commits.iter().map(|c| c.hash.clone()));
        }
        let expected: Vec<String> = (0..25).map(|i| format!("c{i}")).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn unknown_cursor_starts_from_the_top() {
        let all: Vec<Commit> = (0..3).map(|i| commit(&format!("c{i}"))).collect();
        let page = paginate_commits(all, Some("nope"), 10);
        assert_eq!(page.commits.len(), 3);
        assert!(!page.has_next_page);
    }

    #[test]
    fn name_status_maps_change_kinds() {
        let files = parse_name_status("A\tsrc/new.ts\nM\tsrc/app.ts\nD\told.ts\nR100\ta\tb\n");
        assert_eq!(
            files,
            vec![
                CommitFile { path: "src/new.ts".into(), kind: "added".into() },
                CommitFile { path: "src/app.ts".into(), kind: "modified".into() },
                CommitFile { path: "old.ts".into(), kind: "deleted".into() },
                CommitFile { path: "a".into(), kind: "modified".into() },
            ]
        );
    }
}
