//! Table-driven drift scoring.
//!
//! The risk score for a diff is a weighted sum of pattern hits over its
//! changed lines plus a relative-change-size signal, clamped to [0, 1].
//! The pattern table ships with defaults and can be replaced wholesale from
//! configuration, so tuning never needs a code change.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Severity buckets over the risk score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DriftSeverity {
    /// Bucket a risk score: [0,0.2) low, [0.2,0.5) medium, [0.5,0.8) high,
    /// [0.8,1] critical.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            DriftSeverity::Critical
        } else if score >= 0.5 {
            DriftSeverity::High
        } else if score >= 0.2 {
            DriftSeverity::Medium
        } else {
            DriftSeverity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Low => "low",
            DriftSeverity::Medium => "medium",
            DriftSeverity::High => "high",
            DriftSeverity::Critical => "critical",
        }
    }
}

/// One configurable pattern: regex, weight, and a label for alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftPattern {
    pub pattern: String,
    pub weight: f64,
    pub label: String,
}

#[derive(Debug, Error)]
pub enum DriftPatternError {
    #[error("invalid drift pattern '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// Outcome of scoring one diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftScore {
    pub risk: f64,
    pub severity: DriftSeverity,
    /// Labels of the patterns that fired.
    pub matched: Vec<String>,
}

struct CompiledPattern {
    regex: Regex,
    weight: f64,
    label: String,
}

/// Scores diffs against the pattern table.
pub struct DriftAnalyzer {
    patterns: Vec<CompiledPattern>,
}

/// Weight of the relative-change-size signal.
const SIZE_WEIGHT: f64 = 0.25;

impl DriftAnalyzer {
    /// The built-in table. Weights chosen so a single access-control change
    /// in a small config already lands in the high bucket.
    pub fn default_table() -> Vec<DriftPattern> {
        vec![
            DriftPattern {
                pattern: r"password|secret|token|private[_-]?key|credential".into(),
                weight: 0.5,
                label: "credential-material".into(),
            },
            DriftPattern {
                pattern: r"\b(allow|deny|permit|grant|revoke)\b".into(),
                weight: 0.4,
                label: "access-control".into(),
            },
            DriftPattern {
                pattern: r"\b(port|route|gateway|firewall|listen|iface)\b".into(),
                weight: 0.35,
                label: "network-surface".into(),
            },
            DriftPattern {
                pattern: r"\b(enable|disable|start|stop|restart|systemctl)\b".into(),
                weight: 0.3,
                label: "service-state".into(),
            },
        ]
    }

    /// Compile a pattern table. Patterns match case-insensitively.
    pub fn from_patterns(patterns: Vec<DriftPattern>) -> Result<Self, DriftPatternError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let regex = RegexBuilder::new(&p.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| DriftPatternError::BadRegex {
                    pattern: p.pattern.clone(),
                    source,
                })?;
            compiled.push(CompiledPattern {
                regex,
                weight: p.weight,
                label: p.label,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// Score a unified diff. `before_lines` feeds the relative-size signal.
    pub fn score(&self, diff_text: &str, before_lines: usize) -> DriftScore {
        let changed: Vec<&str> = diff_text
            .lines()
            .filter(|line| {
                (line.starts_with('+') && !line.starts_with("+++"))
                    || (line.starts_with('-') && !line.starts_with("---"))
            })
            .collect();

        let mut risk = 0.0;
        let mut matched = Vec::new();
        for pattern in &self.patterns {
            if changed.iter().any(|line| pattern.regex.is_match(line)) {
                risk += pattern.weight;
                matched.push(pattern.label.clone());
            }
        }

        // Relative size: a rewrite of a small file is riskier than one
        // changed line in a large one.
        let ratio = changed.len() as f64 / before_lines.max(1) as f64;
        risk += SIZE_WEIGHT * ratio.min(1.0);

        let risk = risk.clamp(0.0, 1.0);
        DriftScore {
            risk,
            severity: DriftSeverity::from_score(risk),
            matched,
        }
    }
}

impl Default for DriftAnalyzer {
    fn default() -> Self {
        // The built-in table is statically valid.
        Self::from_patterns(Self::default_table()).unwrap_or(Self { patterns: Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::unified_diff;

    #[test]
    fn test_severity_buckets() {
        assert_eq!(DriftSeverity::from_score(0.0), DriftSeverity::Low);
        assert_eq!(DriftSeverity::from_score(0.19), DriftSeverity::Low);
        assert_eq!(DriftSeverity::from_score(0.2), DriftSeverity::Medium);
        assert_eq!(DriftSeverity::from_score(0.5), DriftSeverity::High);
        assert_eq!(DriftSeverity::from_score(0.8), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::from_score(1.0), DriftSeverity::Critical);
    }

    #[test]
    fn test_allow_rule_scores_high() {
        let analyzer = DriftAnalyzer::default();
        let stats = unified_diff("port 22\n", "port 22\nallow all\n");
        let score = analyzer.score(&stats.text, 1);
        assert!(score.risk >= 0.5, "risk was {}", score.risk);
        assert!(score.severity >= DriftSeverity::High);
        assert!(score.matched.contains(&"access-control".to_string()));
    }

    #[test]
    fn test_benign_change_scores_low() {
        let analyzer = DriftAnalyzer::default();
        let before: String = (0..50).map(|i| format!("comment line {i}\n")).collect();
        let after = format!("{before}one more comment\n");
        let stats = unified_diff(&before, &after);
        let score = analyzer.score(&stats.text, 50);
        assert!(score.risk < 0.2, "risk was {}", score.risk);
        assert_eq!(score.severity, DriftSeverity::Low);
        assert!(score.matched.is_empty());
    }

    #[test]
    fn test_credentials_plus_network_stacks_to_critical() {
        let analyzer = DriftAnalyzer::default();
        let stats = unified_diff(
            "listen 8080\n",
            "listen 9090\npassword = hunter2\n",
        );
        let score = analyzer.score(&stats.text, 1);
        assert_eq!(score.severity, DriftSeverity::Critical);
    }

    #[test]
    fn test_custom_table_replaces_defaults() {
        let analyzer = DriftAnalyzer::from_patterns(vec![DriftPattern {
            pattern: r"forbidden".into(),
            weight: 0.9,
            label: "house-rule".into(),
        }])
        .unwrap();

        let stats = unified_diff("ok\n", "ok\nforbidden setting\n");
        let score = analyzer.score(&stats.text, 1);
        assert!(score.matched.contains(&"house-rule".to_string()));

        // Default patterns are gone.
        let stats = unified_diff("x\n", "x\nallow all\n");
        let score = analyzer.score(&stats.text, 1);
        assert!(score.matched.is_empty());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let err = DriftAnalyzer::from_patterns(vec![DriftPattern {
            pattern: "(".into(),
            weight: 0.5,
            label: "broken".into(),
        }]);
        assert!(err.is_err());
    }
}
