use sha2::Digest;
use sha2::Sha256;
use std::path::Path;
use std::path::PathBuf;

pub(crate) const MEMORIES_SUBDIR: &str = "memories";
pub(crate) const MEMORY_SUBDIR: &str = "memory";
pub(crate) const ROLLOUT_SUMMARIES_SUBDIR: &str = "rollout_summaries";
pub(crate) const RAW_MEMORIES_FILENAME: &str = "raw_memories.md";
pub(crate) const MEMORY_REGISTRY_FILENAME: &str = "MEMORY.md";
pub(crate) const MEMORY_SUMMARY_FILENAME: &str = "memory_summary.md";
pub(crate) const SKILLS_SUBDIR: &str = "skills";
pub(crate) const SKILL_DOCUMENT_FILENAME: &str = "SKILL.md";

const CWD_MEMORY_BUCKET_HEX_LEN: usize = 16;

/// Returns the per-project directory holding the job store and the memory
/// root for `cwd`.
///
/// The cwd is normalized and hashed into a deterministic bucket under
/// `<home>/memories/<hash>`.
pub fn memory_home_for_cwd(home: &Path, cwd: &Path) -> PathBuf {
    home.join(MEMORIES_SUBDIR).join(memory_bucket_for_cwd(cwd))
}

/// Returns the on-disk memory root inside a per-project memory home.
pub fn memory_root(memory_home: &Path) -> PathBuf {
    memory_home.join(MEMORY_SUBDIR)
}

pub(crate) fn rollout_summaries_dir(root: &Path) -> PathBuf {
    root.join(ROLLOUT_SUMMARIES_SUBDIR)
}

pub(crate) fn raw_memories_file(root: &Path) -> PathBuf {
    root.join(RAW_MEMORIES_FILENAME)
}

pub(crate) fn memory_registry_file(root: &Path) -> PathBuf {
    root.join(MEMORY_REGISTRY_FILENAME)
}

pub(crate) fn memory_summary_file(root: &Path) -> PathBuf {
    root.join(MEMORY_SUMMARY_FILENAME)
}

pub(crate) fn skills_dir(root: &Path) -> PathBuf {
    root.join(SKILLS_SUBDIR)
}

/// Ensures the phase-1 memory directory layout exists for the given root.
pub(crate) async fn ensure_layout(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(rollout_summaries_dir(root)).await
}

fn memory_bucket_for_cwd(cwd: &Path) -> String {
    let normalized = normalize_cwd_for_memory(cwd);
    let normalized = normalized.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let full_hash = format!("{:x}", hasher.finalize());
    full_hash[..CWD_MEMORY_BUCKET_HEX_LEN].to_string()
}

fn normalize_cwd_for_memory(cwd: &Path) -> PathBuf {
    std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
}
