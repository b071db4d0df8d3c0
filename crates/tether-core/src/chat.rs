//! Chat line classification.
//!
//! Every raw line the transport reports goes through [`ChatClassifier`],
//! which decides whether it is a payment, a confirmation that the transfer
//! to the target server completed, and/or a line worth relaying.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;

static FORMAT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"§[0-9a-fk-or]").expect("format code regex is valid"));

static BAR_GLYPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"▏\s*").expect("bar glyph regex is valid"));

static SENT_YOU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+) has sent you \$?([\d,kmbt.]+)").expect("payment regex is valid")
});

static RECEIVED_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)You received \$?([\d,kmbt.]+) from ([\w.]+)").expect("payment regex is valid")
});

static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\d.]+)([kmbt])?$").expect("amount regex is valid"));

/// Remove `§x` formatting codes and bar glyphs.
#[must_use]
pub fn strip_formatting(raw: &str) -> String {
    let s = FORMAT_CODE_RE.replace_all(raw, "");
    BAR_GLYPH_RE.replace_all(&s, "").into_owned()
}

/// Strip formatting and a leading `<prefix> »` tag, then trim.
#[must_use]
pub fn normalize(raw: &str, server_prefix: &str) -> String {
    let stripped = strip_formatting(raw);
    let trimmed = stripped.trim_start();
    if !server_prefix.is_empty() {
        if let Some(head) = trimmed.get(..server_prefix.len()) {
            if head.eq_ignore_ascii_case(server_prefix) {
                let rest = trimmed[server_prefix.len()..].trim_start();
                if let Some(rest) = rest.strip_prefix('»') {
                    return rest.trim().to_string();
                }
            }
        }
    }
    trimmed.trim().to_string()
}

/// Parse an amount like `1,500`, `$2.5k` or `3m`.
///
/// Unparseable input yields `0.0`.
#[must_use]
pub fn parse_money_amount(text: &str) -> f64 {
    let s: String = text
        .chars()
        .filter(|c| *c != ',' && *c != '$' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    if let Some(caps) = AMOUNT_RE.captures(&s) {
        let Ok(number) = caps[1].parse::<f64>() else {
            return 0.0;
        };
        let multiplier = match caps.get(2).map(|m| m.as_str()) {
            Some("k") => 1e3,
            Some("m") => 1e6,
            Some("b") => 1e9,
            Some("t") => 1e12,
            _ => 1.0,
        };
        return number * multiplier;
    }

    leading_number(&s).unwrap_or(0.0)
}

fn leading_number(s: &str) -> Option<f64> {
    let mut seen_dot = false;
    let end = s
        .char_indices()
        .find(|(_, c)| {
            if *c == '.' && !seen_dot {
                seen_dot = true;
                false
            } else {
                !c.is_ascii_digit()
            }
        })
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().ok()
}

/// Render an amount with a `k/m/b/t` suffix, e.g. `1.5m`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn format_number_short(n: f64) -> String {
    if !n.is_finite() {
        return "N/A".into();
    }
    let scaled = |div: f64, suffix: &str| {
        let s = format!("{:.2}", n / div);
        let s = s.strip_suffix(".00").unwrap_or(&s).to_string();
        format!("{s}{suffix}")
    };
    if n >= 1e12 {
        scaled(1e12, "t")
    } else if n >= 1e9 {
        scaled(1e9, "b")
    } else if n >= 1e6 {
        scaled(1e6, "m")
    } else if n >= 1e3 {
        scaled(1e3, "k")
    } else {
        format!("{}", n.floor() as i64)
    }
}

/// An incoming in-game payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Player who sent the money.
    pub sender: String,
    /// Amount, suffixes expanded.
    pub amount: f64,
}

/// Find a payment announcement in a line.
#[must_use]
pub fn detect_payment(line: &str) -> Option<Payment> {
    let (sender, amount) = if let Some(caps) = SENT_YOU_RE.captures(line) {
        (caps[1].to_string(), caps[2].to_string())
    } else {
        let caps = RECEIVED_FROM_RE.captures(line)?;
        (caps[2].to_string(), caps[1].to_string())
    };
    let amount = parse_money_amount(&amount);
    (amount > 0.0).then_some(Payment { sender, amount })
}

/// What one line means.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    /// A payment was announced.
    pub payment: Option<Payment>,
    /// The transfer to the target server was confirmed.
    pub server_confirmed: bool,
    /// Cleaned text to relay.
    pub relay: Option<String>,
}

/// Classifies raw chat lines.
#[derive(Debug, Clone)]
pub struct ChatClassifier {
    config: ChatConfig,
    phrases_lower: Vec<String>,
}

impl ChatClassifier {
    /// Build a classifier from config.
    #[must_use]
    pub fn new(config: ChatConfig) -> Self {
        let phrases_lower = config
            .confirmation_phrases
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        Self {
            config,
            phrases_lower,
        }
    }

    /// Whether a line confirms arrival on the target server.
    #[must_use]
    pub fn is_server_confirmation(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.phrases_lower.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Cleaned relay text, if the line should be relayed at all.
    #[must_use]
    pub fn relay_text(&self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return None;
        }
        if self
            .config
            .ignored_substrings
            .iter()
            .any(|s| line.contains(s.as_str()))
        {
            return None;
        }
        if self
            .config
            .suppressed_prefixes
            .iter()
            .any(|p| line.starts_with(p.as_str()))
        {
            return None;
        }
        let cleaned = normalize(line, &self.config.server_prefix);
        if cleaned.chars().all(|c| c == '»' || c == '.' || c.is_whitespace()) {
            return None;
        }
        Some(cleaned)
    }

    /// Classify one raw line.
    ///
    /// Relaying only happens once tasks are initialized; confirmation only
    /// counts before that.
    #[must_use]
    pub fn classify(&self, raw: &str, tasks_initialized: bool) -> Classified {
        let line = strip_formatting(raw);
        let payment = detect_payment(&line);

        if tasks_initialized {
            Classified {
                payment,
                server_confirmed: false,
                relay: self.relay_text(&line),
            }
        } else {
            Classified {
                payment,
                server_confirmed: self.is_server_confirmation(&line),
                relay: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> ChatClassifier {
        ChatClassifier::new(ChatConfig::default())
    }

    #[test]
    fn strips_codes_and_prefix() {
        assert_eq!(
            normalize("§aTrySmp §7» §fhello there", "TrySmp"),
            "hello there"
        );
        assert_eq!(normalize("  trysmp » hi ", "TrySmp"), "hi");
        assert_eq!(normalize("▏ plain", "TrySmp"), "plain");
    }

    #[test]
    fn money_suffixes() {
        assert!((parse_money_amount("1,500") - 1_500.0).abs() < f64::EPSILON);
        assert!((parse_money_amount("$2.5k") - 2_500.0).abs() < f64::EPSILON);
        assert!((parse_money_amount("3M") - 3_000_000.0).abs() < f64::EPSILON);
        assert!((parse_money_amount("1b") - 1e9).abs() < f64::EPSILON);
        assert!((parse_money_amount("abc")).abs() < f64::EPSILON);
        assert!((parse_money_amount("12x") - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_numbers() {
        assert_eq!(format_number_short(999.9), "999");
        assert_eq!(format_number_short(1_000.0), "1k");
        assert_eq!(format_number_short(1_500_000.0), "1.50m");
        assert_eq!(format_number_short(2e12), "2t");
        assert_eq!(format_number_short(f64::NAN), "N/A");
    }

    #[test]
    fn payment_sent_you_form() {
        let p = detect_payment("Steve has sent you $1,250").unwrap();
        assert_eq!(p.sender, "Steve");
        assert!((p.amount - 1_250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn payment_received_form() {
        let p = detect_payment("You received 2k from alex.b").unwrap();
        assert_eq!(p.sender, "alex.b");
        assert!((p.amount - 2_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_payment_is_ignored() {
        assert!(detect_payment("Steve has sent you $0").is_none());
    }

    #[test]
    fn confirmation_only_before_tasks() {
        let c = classifier();
        let line = "§aSending you to economy-euc...";
        assert!(c.classify(line, false).server_confirmed);
        assert!(!c.classify(line, true).server_confirmed);
    }

    #[test]
    fn confirmation_is_case_insensitive() {
        assert!(classifier().is_server_confirmation("WELCOME TO ECONOMY-EUC!"));
    }

    #[test]
    fn relay_only_after_tasks() {
        let c = classifier();
        assert_eq!(c.classify("TrySmp » gg", false).relay, None);
        assert_eq!(c.classify("TrySmp » gg", true).relay.as_deref(), Some("gg"));
    }

    #[test]
    fn relay_filters() {
        let c = classifier();
        assert_eq!(c.relay_text("Your balance is $5"), None);
        assert_eq!(c.relay_text("TryAFK zone entered"), None);
        assert_eq!(c.relay_text("TrySmp » ..."), None);
        assert_eq!(c.relay_text("   "), None);
    }
}
