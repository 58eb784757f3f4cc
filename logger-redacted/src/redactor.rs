use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PiiKind {
    Secret,
    Email,
    CreditCard,
    Ssn,
    Phone,
    IpAddress,
}

impl PiiKind {
    fn label(self) -> &'static str {
        match self {
            Self::Secret => "SECRET",
            Self::Email => "EMAIL",
            Self::CreditCard => "CC",
            Self::Ssn => "SSN",
            Self::Phone => "PHONE",
            Self::IpAddress => "IP",
        }
    }

    fn mask(self, matched: &str) -> String {
        match self {
            Self::Secret => "[REDACTED]".to_string(),
            Self::Email => match matched.split_once('@') {
                Some((local, domain)) => format!(
                    "{}***@{}***",
                    local.chars().next().unwrap_or('*'),
                    domain.chars().next().unwrap_or('*')
                ),
                None => "***@***".to_string(),
            },
            Self::CreditCard => "****-****-****-****".to_string(),
            Self::Ssn => "***-**-****".to_string(),
            Self::Phone => "(***) ***-****".to_string(),
            Self::IpAddress => {
                let octets: Vec<&str> = matched.split('.').collect();
                match (octets.first(), octets.last()) {
                    (Some(first), Some(last)) if octets.len() == 4 => {
                        format!("{first}.***.***.{last}")
                    }
                    _ => "***.***.***.***".to_string(),
                }
            }
        }
    }
}

// Order matters: secrets and cards are matched before the looser phone and
// IP patterns can eat parts of them.
const PATTERNS: &[(PiiKind, &str)] = &[
    (PiiKind::Secret, r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*"),
    (
        PiiKind::Secret,
        r#"(?i)\b(?:api[_-]?key|token|secret|password|passwd)\s*[=:]\s*["']?[^\s"',;]+"#,
    ),
    (PiiKind::Email, r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    (PiiKind::CreditCard, r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"),
    (PiiKind::Ssn, r"\b\d{3}-\d{2}-\d{4}\b"),
    (
        PiiKind::Phone,
        r"(?:\+1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s][0-9]{4}\b",
    ),
    (PiiKind::IpAddress, r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b"),
];

lazy_static! {
    static ref COMPILED: Vec<(PiiKind, Regex)> = PATTERNS
        .iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|regex| (*kind, regex)))
        .collect();
}

/// PII redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_secrets: bool,
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_credit_cards: bool,
    pub redact_ip_addresses: bool,
    /// Replace matches with a short stable hash instead of a mask, so the
    /// same value can be correlated across log lines
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_secrets: true,
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_credit_cards: true,
            redact_ip_addresses: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl RedactionConfig {
    fn enabled(&self, kind: PiiKind) -> bool {
        match kind {
            PiiKind::Secret => self.redact_secrets,
            PiiKind::Email => self.redact_emails,
            PiiKind::CreditCard => self.redact_credit_cards,
            PiiKind::Ssn => self.redact_ssn,
            PiiKind::Phone => self.redact_phones,
            PiiKind::IpAddress => self.redact_ip_addresses,
        }
    }

    pub fn with_custom_pattern(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.custom_patterns.push((pattern, replacement.into()));
        self
    }
}

/// PII redactor for extension console output
#[derive(Debug, Clone, Default)]
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        for (kind, regex) in COMPILED.iter() {
            if !self.config.enabled(*kind) {
                continue;
            }
            result = regex
                .replace_all(&result, |caps: &Captures| {
                    let matched = caps.get(0).map_or("", |m| m.as_str());
                    // Secrets are never hashed; a hash of a short token is guessable.
                    if self.config.hash_for_correlation && *kind != PiiKind::Secret {
                        format!("{}[{}]", kind.label(), hash_value(matched))
                    } else {
                        kind.mask(matched)
                    }
                })
                .into_owned();
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).into_owned();
        }

        result
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    general_purpose::STANDARD_NO_PAD.encode(digest.get(..8).unwrap_or_default())
}
