use regex::Regex;
use std::sync::LazyLock;

/// Placeholder substituted for anything that looks like a credential.
pub const REDACTED: &str = "[REDACTED]";

static OPENAI_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bsk-[A-Za-z0-9_\-]{20,}"));
static AWS_ACCESS_KEY_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"));
static GITHUB_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"\b(?:gh[pousr]_[A-Za-z0-9]{20,}|github_pat_[A-Za-z0-9_]{20,})")
});
static SLACK_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bxox[abprs]-[A-Za-z0-9\-]{10,}"));
static GOOGLE_API_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bAIza[0-9A-Za-z_\-]{35}"));
static JWT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"\beyJ[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}")
});
static BEARER_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?i)\bBearer\s+[A-Za-z0-9._\-]{16,}\b"));
static SECRET_ASSIGNMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r#"(?i)\b((?:api|access|secret|private|client)[_-]?key|token|secret|password|passwd)\b(\s*[:=]\s*)(["']?)[^\s"']{8,}"#,
    )
});

/// Remove secrets and keys from a String. This is done on best effort basis following some
/// well-known REGEX.
pub fn redact_secrets(input: String) -> String {
    let redacted = OPENAI_KEY_REGEX.replace_all(&input, REDACTED);
    let redacted = AWS_ACCESS_KEY_ID_REGEX.replace_all(&redacted, REDACTED);
    let redacted = GITHUB_TOKEN_REGEX.replace_all(&redacted, REDACTED);
    let redacted = SLACK_TOKEN_REGEX.replace_all(&redacted, REDACTED);
    let redacted = GOOGLE_API_KEY_REGEX.replace_all(&redacted, REDACTED);
    let redacted = JWT_REGEX.replace_all(&redacted, REDACTED);
    let redacted = BEARER_TOKEN_REGEX.replace_all(&redacted, format!("Bearer {REDACTED}"));
    let redacted = SECRET_ASSIGNMENT_REGEX.replace_all(&redacted, format!("$1$2$3{REDACTED}"));

    redacted.to_string()
}

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Panic is ok thanks to `load_regex` test.
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}
