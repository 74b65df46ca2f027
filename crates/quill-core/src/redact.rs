//! Best-effort scrubbing of secrets from captured process output.
//!
//! This is a display convenience, not a security control: anything that does
//! not look like one of the rule patterns passes through untouched.

use regex::Regex;
use tracing::warn;

pub trait Redactor: Send + Sync {
    fn redact(&self, text: &str) -> String;
}

/// Redactor that leaves text unchanged.
pub struct NoRedaction;

impl Redactor for NoRedaction {
    fn redact(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Environment variables whose values are masked wherever they appear.
pub const SENSITIVE_ENV_VARS: &[&str] = &[
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITHUB_WEBHOOK_SECRET",
    "OPENAI_API_KEY",
    "LLM_API_KEY",
    "ANTHROPIC_API_KEY",
    "DATABASE_URL",
    "NPM_TOKEN",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
];

/// Values shorter than this are never masked literally (too many false hits).
const MIN_LITERAL_LEN: usize = 6;

pub struct RedactionRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: &'static str,
}

/// (name, pattern, replacement). Applied in order.
const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    (
        "connection_string",
        r#"(?i)\b(postgres(?:ql)?|mysql|mariadb|mongodb(?:\+srv)?|rediss?|amqps?|mssql|sqlserver)://[^\s'"]+"#,
        "$1://[REDACTED]",
    ),
    (
        "github_token",
        r"\bgh[pousr]_[A-Za-z0-9]{20,}\b",
        "[REDACTED]",
    ),
    (
        "openai_key",
        r"\bsk-[A-Za-z0-9_-]{20,}\b",
        "[REDACTED]",
    ),
    (
        "aws_access_key",
        r"\bAKIA[0-9A-Z]{16}\b",
        "[REDACTED]",
    ),
    (
        "bearer",
        r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]{8,}",
        "$1 [REDACTED]",
    ),
    (
        "key_value",
        r#"(?i)\b([A-Z0-9_.-]*(?:token|secret|passw(?:or)?d|pwd|api[_-]?key|key|credentials?)[A-Z0-9_.-]*)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&"']+)"#,
        "$1$2[REDACTED]",
    ),
    (
        "home_dir",
        r"(/home|/Users)/[^/\s:]+",
        "$1/[user]",
    ),
    (
        "windows_home_dir",
        r"(?i)\b([A-Z]:\\Users\\)[^\\\s]+",
        "${1}[user]",
    ),
    (
        "private_ipv4",
        r"\b(?:10\.\d{1,3}|192\.168|172\.(?:1[6-9]|2\d|3[01]))\.\d{1,3}\.\d{1,3}\b",
        "[private-ip]",
    ),
];

/// Rule-list redactor: literal secret values first, then regex rules in order.
pub struct PatternRedactor {
    rules: Vec<RedactionRule>,
    literals: Vec<(String, String)>,
}

impl PatternRedactor {
    /// Compile `(name, pattern, replacement)` rules; invalid patterns are logged and skipped.
    pub fn from_rules(rules: &[(&'static str, &str, &'static str)]) -> Self {
        let rules = rules
            .iter()
            .filter_map(|&(name, pattern, replacement)| match Regex::new(pattern) {
                Ok(pattern) => Some(RedactionRule {
                    name,
                    pattern,
                    replacement,
                }),
                Err(e) => {
                    warn!(rule = name, "skipping invalid redaction pattern: {e}");
                    None
                }
            })
            .collect();
        Self {
            rules,
            literals: Vec::new(),
        }
    }

    /// Mask the literal values of the given variables wherever they appear.
    pub fn with_secret_values<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let value = value.as_ref().trim();
            if value.len() >= MIN_LITERAL_LEN {
                self.literals
                    .push((value.to_string(), format!("[{}]", name.as_ref())));
            }
        }
        // Longest first so a value containing another is masked whole.
        self.literals.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Default rules plus the current values of [`SENSITIVE_ENV_VARS`].
    pub fn from_env() -> Self {
        let vars = SENSITIVE_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (*name, v)));
        Self::default().with_secret_values(vars)
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }
}

impl Default for PatternRedactor {
    fn default() -> Self {
        Self::from_rules(DEFAULT_RULES)
    }
}

impl Redactor for PatternRedactor {
    fn redact(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let mut out = text.to_string();
        for (value, mask) in &self.literals {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), mask);
            }
        }
        for rule in &self.rules {
            if rule.pattern.is_match(&out) {
                out = rule.pattern.replace_all(&out, rule.replacement).into_owned();
            }
        }
        out
    }
}
