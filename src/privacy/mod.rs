//! PII detection and masking
//!
//! Applies an ordered chain of pattern rules to text before it is sent to the
//! summarization backend. Each rule runs over the already-cleaned output of
//! the previous rules, so a masked span can never be re-matched by a later,
//! looser pattern.

use crate::models::Message;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid email pattern")
});

// Turkish mobile/landline forms: leading +90 or 0, then 3-3-2-2 groups.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+90[\s\-.]?|0)\(?\d{3}\)?[\s\-.]?\d{3}[\s\-.]?\d{2}[\s\-.]?\d{2}\b")
        .expect("valid phone pattern")
});

// Turkish national identity number: 11 digits, first digit nonzero.
static NATIONAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[1-9]\d{10}\b").expect("valid national id pattern"));

static IBAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z]{2}\d{2}(?:[\s]?\d{4}){5}(?:[\s]?\d{1,2})?\b").expect("valid iban pattern")
});

static CARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}[\s\-]?\d{4}[\s\-]?\d{4}[\s\-]?\d{1,4}\b").expect("valid card pattern")
});

const MAX_EXAMPLES_PER_KIND: usize = 3;

/// A single masking rule
#[derive(Debug, Clone)]
pub struct PiiRule {
    pub kind: String,
    pub pattern: Regex,
    pub replacement: String,
    pub enabled: bool,
}

impl PiiRule {
    pub fn new(kind: impl Into<String>, pattern: Regex, replacement: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            pattern,
            replacement: replacement.into(),
            enabled: true,
        }
    }
}

/// Which built-in rules are active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiScrubberConfig {
    pub mask_emails: bool,
    pub mask_phones: bool,
    pub mask_national_ids: bool,
    pub mask_ibans: bool,
    pub mask_credit_cards: bool,
}

impl Default for PiiScrubberConfig {
    fn default() -> Self {
        Self {
            mask_emails: true,
            mask_phones: true,
            mask_national_ids: true,
            mask_ibans: true,
            mask_credit_cards: true,
        }
    }
}

/// Matches found for one PII type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiMatchReport {
    pub kind: String,
    pub count: usize,
    /// Up to 3 de-duplicated example matches.
    pub examples: Vec<String>,
}

/// Result of scrubbing one piece of text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubResult {
    pub cleaned_text: String,
    pub detected: Vec<PiiMatchReport>,
    pub has_any_pii: bool,
}

impl ScrubResult {
    fn clean(text: String) -> Self {
        Self {
            cleaned_text: text,
            detected: Vec::new(),
            has_any_pii: false,
        }
    }

    /// Total number of masked matches across all types.
    pub fn total_removed(&self) -> usize {
        self.detected.iter().map(|d| d.count).sum()
    }
}

/// Aggregate report over a list of messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageScrubReport {
    pub total_removed: usize,
    pub by_kind: HashMap<String, usize>,
}

/// Ordered PII masking rule chain
pub struct PiiScrubber {
    rules: Vec<PiiRule>,
}

impl PiiScrubber {
    /// Build the standard rule chain. Rule order matters: masks applied by an
    /// earlier rule cannot be re-matched by a later one.
    pub fn new(config: PiiScrubberConfig) -> Self {
        let mut rules = Vec::new();

        let mut rule = PiiRule::new("email", EMAIL_RE.clone(), "[EMAIL]");
        rule.enabled = config.mask_emails;
        rules.push(rule);

        let mut rule = PiiRule::new("phone", PHONE_RE.clone(), "[PHONE]");
        rule.enabled = config.mask_phones;
        rules.push(rule);

        let mut rule = PiiRule::new("national_id", NATIONAL_ID_RE.clone(), "[ID_NUMBER]");
        rule.enabled = config.mask_national_ids;
        rules.push(rule);

        let mut rule = PiiRule::new("iban", IBAN_RE.clone(), "[IBAN]");
        rule.enabled = config.mask_ibans;
        rules.push(rule);

        let mut rule = PiiRule::new("credit_card", CARD_RE.clone(), "[CARD]");
        rule.enabled = config.mask_credit_cards;
        rules.push(rule);

        Self { rules }
    }

    pub fn with_defaults() -> Self {
        Self::new(PiiScrubberConfig::default())
    }

    /// A scrubber with every rule disabled; scrubbing becomes the identity.
    pub fn disabled() -> Self {
        Self::new(PiiScrubberConfig {
            mask_emails: false,
            mask_phones: false,
            mask_national_ids: false,
            mask_ibans: false,
            mask_credit_cards: false,
        })
    }

    /// Append a caller-supplied rule to the end of the chain.
    pub fn with_custom_rule(mut self, rule: PiiRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Mask all PII in `text`. Never fails; empty input returns the zero
    /// result shape.
    pub fn scrub(&self, text: &str) -> ScrubResult {
        if text.is_empty() {
            return ScrubResult::clean(String::new());
        }

        let mut cleaned = text.to_string();
        let mut detected = Vec::new();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            let mut count = 0usize;
            let mut examples: Vec<String> = Vec::new();

            for m in rule.pattern.find_iter(&cleaned) {
                count += 1;
                let matched = m.as_str().to_string();
                if examples.len() < MAX_EXAMPLES_PER_KIND && !examples.contains(&matched) {
                    examples.push(matched);
                }
            }

            if count > 0 {
                cleaned = rule
                    .pattern
                    .replace_all(&cleaned, rule.replacement.as_str())
                    .into_owned();
                detected.push(PiiMatchReport {
                    kind: rule.kind.clone(),
                    count,
                    examples,
                });
            }
        }

        let has_any_pii = !detected.is_empty();
        ScrubResult {
            cleaned_text: cleaned,
            detected,
            has_any_pii,
        }
    }

    /// Scrub each message and aggregate match counts by type.
    pub fn scrub_messages(&self, messages: &[Message]) -> (Vec<Message>, MessageScrubReport) {
        let mut report = MessageScrubReport::default();
        let mut cleaned = Vec::with_capacity(messages.len());

        for message in messages {
            let result = self.scrub(&message.content);
            for found in &result.detected {
                report.total_removed += found.count;
                *report.by_kind.entry(found.kind.clone()).or_insert(0) += found.count;
            }
            cleaned.push(Message {
                role: message.role,
                content: result.cleaned_text,
                token_count: 0,
            });
        }

        (cleaned, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    #[test]
    fn test_no_pii_returns_unmodified_text() {
        let scrubber = PiiScrubber::with_defaults();
        let result = scrubber.scrub("Toplantı yarın saat üçte.");
        assert_eq!(result.cleaned_text, "Toplantı yarın saat üçte.");
        assert!(!result.has_any_pii);
        assert!(result.detected.is_empty());
    }

    #[test]
    fn test_empty_input_is_zero_result() {
        let scrubber = PiiScrubber::with_defaults();
        let result = scrubber.scrub("");
        assert_eq!(result.cleaned_text, "");
        assert!(!result.has_any_pii);
    }

    #[test]
    fn test_email_masked() {
        let scrubber = PiiScrubber::with_defaults();
        let result = scrubber.scrub("Mail adresim ayse.demir@example.com oldu.");
        assert!(!result.cleaned_text.contains("ayse.demir@example.com"));
        assert!(result.cleaned_text.contains("[EMAIL]"));
        assert_eq!(result.detected[0].kind, "email");
        assert_eq!(result.detected[0].count, 1);
    }

    #[test]
    fn test_mixed_pii_counts_per_type() {
        let scrubber = PiiScrubber::with_defaults();
        let text = "Ben Ali, mail ali@firma.com, telefon 0532 123 45 67, TC 12345678901.";
        let result = scrubber.scrub(text);

        assert!(!result.cleaned_text.contains("ali@firma.com"));
        assert!(!result.cleaned_text.contains("0532 123 45 67"));
        assert!(!result.cleaned_text.contains("12345678901"));
        assert!(result.has_any_pii);

        let kinds: HashMap<&str, usize> = result
            .detected
            .iter()
            .map(|d| (d.kind.as_str(), d.count))
            .collect();
        assert_eq!(kinds["email"], 1);
        assert_eq!(kinds["phone"], 1);
        assert_eq!(kinds["national_id"], 1);
    }

    #[test]
    fn test_iban_and_card_masked() {
        let scrubber = PiiScrubber::with_defaults();
        let text = "IBAN TR33 0006 1005 1978 6457 8413 26 karta 4111 1111 1111 1111 yatır.";
        let result = scrubber.scrub(text);

        assert!(result.cleaned_text.contains("[IBAN]"));
        assert!(result.cleaned_text.contains("[CARD]"));
        assert!(!result.cleaned_text.contains("6457"));
        assert!(!result.cleaned_text.contains("4111"));
    }

    #[test]
    fn test_examples_are_deduplicated_and_capped() {
        let scrubber = PiiScrubber::with_defaults();
        let text = "a@x.com b@x.com a@x.com c@x.com d@x.com";
        let result = scrubber.scrub(text);

        let email = &result.detected[0];
        assert_eq!(email.count, 5);
        assert_eq!(email.examples.len(), 3);
        assert_eq!(email.examples[0], "a@x.com");
        assert_eq!(email.examples[1], "b@x.com");
    }

    #[test]
    fn test_disabled_rules_leave_text_alone() {
        let scrubber = PiiScrubber::disabled();
        let text = "ali@firma.com 0532 123 45 67";
        let result = scrubber.scrub(text);
        assert_eq!(result.cleaned_text, text);
        assert!(!result.has_any_pii);
    }

    #[test]
    fn test_custom_rule_runs_after_builtins() {
        let scrubber = PiiScrubber::with_defaults().with_custom_rule(PiiRule::new(
            "ticket",
            Regex::new(r"TCK-\d+").unwrap(),
            "[TICKET]",
        ));
        let result = scrubber.scrub("Kayıt TCK-4471 açıldı, mail ali@x.com");
        assert!(result.cleaned_text.contains("[TICKET]"));
        assert!(result.cleaned_text.contains("[EMAIL]"));
    }

    #[test]
    fn test_scrub_messages_aggregates_by_kind() {
        let scrubber = PiiScrubber::with_defaults();
        let messages = vec![
            Message::new(MessageRole::User, "mail a@x.com ve b@x.com"),
            Message::new(MessageRole::Assistant, "telefonunuz 0532 123 45 67 kaydedildi"),
        ];

        let (cleaned, report) = scrubber.scrub_messages(&messages);

        assert_eq!(cleaned.len(), 2);
        assert_eq!(report.total_removed, 3);
        assert_eq!(report.by_kind["email"], 2);
        assert_eq!(report.by_kind["phone"], 1);
    }
}
