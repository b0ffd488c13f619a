// Truncate a &str to a byte budget at a char boundary (prefix)
#[inline]
pub fn take_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut end = maxb;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// Take a suffix of a &str within a byte budget at a char boundary
#[inline]
pub fn take_last_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut start = s.len() - maxb;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Keeps the first third and the last two thirds of `maxb` bytes of `s`,
/// joined by `marker`. The marker counts against the budget.
///
/// Returns `None` when `s` already fits.
pub fn truncate_head_tail(s: &str, maxb: usize, marker: &str) -> Option<String> {
    if s.len() <= maxb {
        return None;
    }
    let budget = maxb.saturating_sub(marker.len());
    let head_budget = budget / 3;
    let tail_budget = budget.saturating_sub(head_budget);
    let head = take_bytes_at_char_boundary(s, head_budget);
    let tail = take_last_bytes_at_char_boundary(s, tail_budget);
    Some(format!("{head}{marker}{tail}"))
}

/// Reduce an arbitrary identifier to a file-name-safe stem: only ASCII
/// alphanumeric, '.', '_' and '-' survive, everything else becomes '_'.
pub fn sanitize_file_stem(value: &str, max_len: usize) -> String {
    let sanitized: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches(|ch| ch == '_' || ch == '.');
    if trimmed.is_empty() || trimmed.chars().all(|ch| !ch.is_ascii_alphanumeric()) {
        return "unspecified".to_string();
    }
    // Only ASCII remains, so any byte index is a char boundary.
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        trimmed[..max_len].to_string()
    }
}
