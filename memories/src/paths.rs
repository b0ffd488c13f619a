use mnemo_utils_string::sanitize_file_stem;
use sha2::Digest;
use sha2::Sha256;
use std::path::PathBuf;

pub(crate) const MAX_SKILL_NAME_LEN: usize = 64;
const MAX_ROLLOUT_SLUG_LEN: usize = 60;
const MAX_THREAD_STEM_LEN: usize = 128;
const THREAD_HASH_HEX_LEN: usize = 8;

/// Turns a model-provided relative path into a safe path under a skill
/// directory.
///
/// Backslashes count as separators. `.` and empty segments are dropped.
/// Returns `None` for absolute paths, `..`, NUL or `:` anywhere, and segments
/// with characters outside `[A-Za-z0-9._-]`.
pub fn sanitize_skill_relative_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.contains('\0')
        || normalized.contains(':')
        || normalized.contains("..")
        || normalized.starts_with('/')
    {
        return None;
    }

    let mut path = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            segment if segment.chars().all(is_safe_path_char) => path.push(segment),
            _ => return None,
        }
    }

    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

fn is_safe_path_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')
}

/// Lowercases `name` and collapses every run of non-alphanumerics into one
/// `-`. Returns `None` when nothing usable is left.
pub fn slugify_skill_name(name: &str) -> Option<String> {
    slugify(name, MAX_SKILL_NAME_LEN)
}

fn slugify(value: &str, max_len: usize) -> Option<String> {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    // ASCII only, so truncating at a byte index is safe.
    slug.truncate(max_len);
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

/// File name for a thread's rollout summary: `<thread>[-<slug>].md`.
///
/// Distinct threads can map to the same name (`a` + `b-c` and `a-b` + `c`);
/// callers fall back to [`disambiguated_rollout_summary_file_name`].
pub(crate) fn rollout_summary_file_name(thread_id: &str, rollout_slug: Option<&str>) -> String {
    let stem = sanitize_file_stem(thread_id, MAX_THREAD_STEM_LEN);
    with_rollout_slug(stem, rollout_slug)
}

/// Like [`rollout_summary_file_name`], with a hash of the raw thread id
/// appended to the stem: `<thread>-<hash>[-<slug>].md`.
pub(crate) fn disambiguated_rollout_summary_file_name(
    thread_id: &str,
    rollout_slug: Option<&str>,
) -> String {
    let stem = sanitize_file_stem(thread_id, MAX_THREAD_STEM_LEN);
    let digest = format!("{:x}", Sha256::digest(thread_id.as_bytes()));
    with_rollout_slug(
        format!("{stem}-{}", &digest[..THREAD_HASH_HEX_LEN]),
        rollout_slug,
    )
}

fn with_rollout_slug(stem: String, rollout_slug: Option<&str>) -> String {
    match rollout_slug.and_then(|slug| slugify(slug, MAX_ROLLOUT_SLUG_LEN)) {
        Some(slug) => format!("{stem}-{slug}.md"),
        None => format!("{stem}.md"),
    }
}
