use mnemo_state::Stage1Output;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;
use tracing::warn;

use crate::layout::SKILL_DOCUMENT_FILENAME;
use crate::layout::ensure_layout;
use crate::layout::memory_registry_file;
use crate::layout::memory_summary_file;
use crate::layout::raw_memories_file;
use crate::layout::rollout_summaries_dir;
use crate::layout::skills_dir;
use crate::paths::disambiguated_rollout_summary_file_name;
use crate::paths::rollout_summary_file_name;
use crate::paths::sanitize_skill_relative_path;
use crate::paths::slugify_skill_name;
use crate::schema::ConsolidationOutput;
use crate::schema::SkillBundle;

/// Syncs rollout summary files from DB-backed stage-1 output rows.
///
/// `rollout_summaries/` ends up holding exactly one file per output; anything
/// else in the directory is removed. Returns the kept file names, sorted.
pub(crate) async fn sync_rollout_summaries(
    root: &Path,
    memories: &[Stage1Output],
) -> std::io::Result<Vec<String>> {
    ensure_layout(root).await?;

    let mut keep = BTreeSet::new();
    for memory in memories {
        let thread_id = memory.thread_id.as_str();
        let rollout_slug = memory.rollout_slug.as_deref();
        let mut file_name = rollout_summary_file_name(thread_id, rollout_slug);
        if keep.contains(&file_name) {
            file_name = disambiguated_rollout_summary_file_name(thread_id, rollout_slug);
        }
        write_rollout_summary_for_thread(root, &file_name, memory).await?;
        keep.insert(file_name);
    }
    prune_rollout_summaries(root, &keep).await?;

    Ok(keep.into_iter().collect())
}

/// Rebuilds `raw_memories.md` from DB-backed stage-1 outputs and returns the
/// written body.
pub(crate) async fn rebuild_raw_memories_file(
    root: &Path,
    memories: &[Stage1Output],
) -> std::io::Result<String> {
    ensure_layout(root).await?;
    let body = render_raw_memories(memories)?;
    tokio::fs::write(raw_memories_file(root), &body).await?;
    Ok(body)
}

fn render_raw_memories(memories: &[Stage1Output]) -> std::io::Result<String> {
    let mut body = String::from("# Raw Memories\n\n");

    if memories.is_empty() {
        body.push_str("No raw memories yet.\n");
        return Ok(body);
    }

    body.push_str("Merged stage-1 raw memories (latest first):\n\n");
    for memory in memories {
        writeln!(body, "## Thread `{}`", memory.thread_id).map_err(format_error)?;
        writeln!(
            body,
            "updated_at: {}",
            memory.source_updated_at.to_rfc3339()
        )
        .map_err(format_error)?;
        writeln!(body, "cwd: {}", memory.cwd.display()).map_err(format_error)?;
        writeln!(body).map_err(format_error)?;
        body.push_str(memory.raw_memory.trim());
        body.push_str("\n\n");
    }
    Ok(body)
}

async fn write_rollout_summary_for_thread(
    root: &Path,
    file_name: &str,
    memory: &Stage1Output,
) -> std::io::Result<()> {
    let path = rollout_summaries_dir(root).join(file_name);

    let mut body = String::new();
    writeln!(body, "thread_id: {}", memory.thread_id).map_err(format_error)?;
    writeln!(
        body,
        "updated_at: {}",
        memory.source_updated_at.to_rfc3339()
    )
    .map_err(format_error)?;
    writeln!(body, "cwd: {}", memory.cwd.display()).map_err(format_error)?;
    writeln!(body).map_err(format_error)?;
    body.push_str(memory.rollout_summary.trim());
    body.push('\n');

    tokio::fs::write(path, body).await
}

async fn prune_rollout_summaries(root: &Path, keep: &BTreeSet<String>) -> std::io::Result<()> {
    let dir_path = rollout_summaries_dir(root);
    let mut dir = match tokio::fs::read_dir(&dir_path).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    while let Some(entry) = dir.next_entry().await? {
        let file_name = entry.file_name();
        if keep.contains(file_name.to_string_lossy().as_ref()) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(err) = result
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "failed pruning outdated rollout summary {}: {err}",
                path.display()
            );
        }
    }

    Ok(())
}

/// Reads the current `MEMORY.md`, if any.
pub(crate) async fn read_memory_registry(root: &Path) -> Option<String> {
    tokio::fs::read_to_string(memory_registry_file(root))
        .await
        .ok()
}

/// Writes the phase-2 artifacts: `MEMORY.md`, `memory_summary.md` and the
/// skills tree.
pub(crate) async fn apply_consolidation(
    root: &Path,
    output: &ConsolidationOutput,
) -> std::io::Result<()> {
    ensure_layout(root).await?;
    tokio::fs::write(memory_registry_file(root), with_trailing_newline(&output.memory_md)).await?;
    tokio::fs::write(
        memory_summary_file(root),
        with_trailing_newline(&output.memory_summary),
    )
    .await?;
    sync_skills(root, &output.skills).await
}

/// Removes every phase-2 artifact. Used when no stage-1 output is left.
pub(crate) async fn prune_consolidated_artifacts(root: &Path) -> std::io::Result<()> {
    for path in [memory_registry_file(root), memory_summary_file(root)] {
        if let Err(err) = tokio::fs::remove_file(path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(err);
        }
    }

    if let Err(err) = tokio::fs::remove_dir_all(skills_dir(root)).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        return Err(err);
    }

    Ok(())
}

/// Reconciles `skills/` to exactly the files described by `skills`.
///
/// Stale entries go first so a wanted file can replace a directory of the
/// same name; emptied directories are pruned bottom-up before writing.
pub(crate) async fn sync_skills(root: &Path, skills: &[SkillBundle]) -> std::io::Result<()> {
    let skills_root = skills_dir(root);
    let desired = desired_skill_files(skills);

    let (files, dirs) = walk_tree(&skills_root).await?;
    for path in files {
        let keep = path
            .strip_prefix(&skills_root)
            .map(|relative| desired.contains_key(relative))
            .unwrap_or(false);
        if keep {
            continue;
        }
        if let Err(err) = tokio::fs::remove_file(&path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(err);
        }
    }
    prune_empty_dirs(dirs).await?;

    for (relative, contents) in &desired {
        let path = skills_root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
    }
    Ok(())
}

/// Maps every skill file to its path relative to `skills/`.
///
/// Unusable names and unsafe paths are dropped with a warning. A later skill
/// never overwrites an earlier one with the same slug, and a file whose path
/// is already taken, or would nest under or over an earlier file, is dropped.
fn desired_skill_files(skills: &[SkillBundle]) -> BTreeMap<PathBuf, String> {
    let mut desired = BTreeMap::new();
    let mut seen_names = BTreeSet::new();

    for skill in skills {
        let Some(slug) = slugify_skill_name(&skill.name) else {
            warn!("dropping memory skill with unusable name {:?}", skill.name);
            continue;
        };
        if !seen_names.insert(slug.clone()) {
            warn!("dropping duplicate memory skill {slug}");
            continue;
        }
        let skill_dir = PathBuf::from(&slug);

        let document = skill
            .content
            .as_deref()
            .map(with_trailing_newline)
            .unwrap_or_else(|| format!("# {}\n", skill.name.trim()));
        desired.insert(skill_dir.join(SKILL_DOCUMENT_FILENAME), document);

        for (bundle_dir, files) in [
            ("scripts", &skill.scripts),
            ("templates", &skill.templates),
            ("examples", &skill.examples),
        ] {
            for file in files {
                let Some(relative) = sanitize_skill_relative_path(&file.path) else {
                    warn!(
                        "dropping memory skill file with unsafe path {:?} in skill {slug}",
                        file.path
                    );
                    continue;
                };
                // `scripts/setup.sh` inside `scripts` must not nest twice.
                let relative = match relative.strip_prefix(bundle_dir) {
                    Ok(stripped) => stripped.to_path_buf(),
                    Err(_) => relative,
                };
                if relative.as_os_str().is_empty() {
                    warn!(
                        "dropping memory skill file {:?} in skill {slug}: path names the bundle directory",
                        file.path
                    );
                    continue;
                }
                let path = skill_dir.join(bundle_dir).join(relative);
                if conflicts_with_desired(&desired, &path) {
                    warn!(
                        "dropping memory skill file {:?} in skill {slug}: path clashes with another file",
                        file.path
                    );
                    continue;
                }
                desired.insert(path, file.content.clone());
            }
        }
    }

    desired
}

/// True when `path` is already wanted, sits below a wanted file, or would
/// need to be a directory holding a wanted file.
fn conflicts_with_desired(desired: &BTreeMap<PathBuf, String>, path: &Path) -> bool {
    desired.contains_key(path)
        || path
            .ancestors()
            .skip(1)
            .any(|ancestor| desired.contains_key(ancestor))
        || desired.keys().any(|existing| existing.starts_with(path))
}

/// Lists every non-directory entry and every directory below `root`.
async fn walk_tree(root: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path.clone());
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    Ok((files, dirs))
}

async fn prune_empty_dirs(mut dirs: Vec<PathBuf>) -> std::io::Result<()> {
    // Deepest first so parents see their children already removed.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        if entries.next_entry().await?.is_none() {
            tokio::fs::remove_dir(&dir).await?;
        }
    }
    Ok(())
}

fn with_trailing_newline(contents: &str) -> String {
    let mut contents = contents.trim_end().to_string();
    contents.push('\n');
    contents
}

fn format_error(err: std::fmt::Error) -> std::io::Error {
    std::io::Error::other(format!("format memory artifact: {err}"))
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
