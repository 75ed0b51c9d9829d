//! Final risk labeling.
//!
//! Labels come from an ordered rule list; the first rule whose predicate holds
//! decides. The last rule always matches, so every student gets a label.

use tracing::trace;

use crate::config::RiskConfig;
use crate::models::{AnomalyFlag, RiskLabel};

#[derive(Debug, Clone, Copy)]
pub struct RiskInput<'a> {
    pub cluster: &'a str,
    pub anomaly: AnomalyFlag,
    pub exceptional: &'a str,
}

pub struct RiskRule {
    pub name: &'static str,
    pub applies: fn(&RiskInput<'_>, &RiskConfig, &str) -> bool,
    pub label: fn(&RiskInput<'_>) -> RiskLabel,
}

fn escalate_if_outlier(input: &RiskInput<'_>, base: RiskLabel, escalated: RiskLabel) -> RiskLabel {
    if input.anomaly.is_outlier() {
        escalated
    } else {
        base
    }
}

/// Priority order. Self-declared exceptional ability only overrides a
/// baseline cluster, never an at-risk one.
pub const RULES: &[RiskRule] = &[
    RiskRule {
        name: "declared-exceptional",
        applies: |input, config, yes| {
            input.exceptional == yes && config.baseline.contains(input.cluster)
        },
        label: |_| RiskLabel::Exceptional,
    },
    RiskRule {
        name: "high-risk-cluster",
        applies: |input, config, _| config.high.contains(input.cluster),
        label: |_| RiskLabel::HighRisk,
    },
    RiskRule {
        name: "moderate-risk-cluster",
        applies: |input, config, _| config.moderate.contains(input.cluster),
        label: |input| escalate_if_outlier(input, RiskLabel::ModerateRisk, RiskLabel::HighRisk),
    },
    RiskRule {
        name: "baseline-cluster",
        applies: |input, config, _| config.baseline.contains(input.cluster),
        label: |input| escalate_if_outlier(input, RiskLabel::Normal, RiskLabel::ModerateRisk),
    },
    RiskRule {
        name: "unassigned-cluster",
        applies: |_, _, _| true,
        label: |_| RiskLabel::Normal,
    },
];

/// The rule that decides `input`.
pub fn matching_rule(input: &RiskInput<'_>, config: &RiskConfig, exceptional_yes: &str) -> &'static RiskRule {
    RULES
        .iter()
        .find(|rule| (rule.applies)(input, config, exceptional_yes))
        .unwrap_or(&RULES[RULES.len() - 1])
}

pub fn classify(input: &RiskInput<'_>, config: &RiskConfig, exceptional_yes: &str) -> RiskLabel {
    let rule = matching_rule(input, config, exceptional_yes);
    trace!(rule = rule.name, cluster = input.cluster, "risk rule matched");
    (rule.label)(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference() -> RiskConfig {
        RiskConfig::new(["1", "2", "3"], ["5", "6"], ["4", "0"])
    }

    fn label(cluster: &str, anomaly: AnomalyFlag, exceptional: &str) -> RiskLabel {
        let input = RiskInput {
            cluster,
            anomaly,
            exceptional,
        };
        classify(&input, &reference(), "B")
    }

    #[test]
    fn declared_exceptional_in_baseline_wins_even_when_outlier() {
        assert_eq!(label("4", AnomalyFlag::Outlier, "B"), RiskLabel::Exceptional);
        assert_eq!(label("0", AnomalyFlag::Normal, "B"), RiskLabel::Exceptional);
    }

    #[test]
    fn high_risk_cluster_ignores_declaration_and_anomaly() {
        assert_eq!(label("1", AnomalyFlag::Normal, "B"), RiskLabel::HighRisk);
        assert_eq!(label("3", AnomalyFlag::Outlier, "A"), RiskLabel::HighRisk);
    }

    #[test]
    fn moderate_cluster_escalates_outliers() {
        assert_eq!(label("5", AnomalyFlag::Outlier, "A"), RiskLabel::HighRisk);
        assert_eq!(label("5", AnomalyFlag::Normal, "A"), RiskLabel::ModerateRisk);
        assert_eq!(label("6", AnomalyFlag::Normal, "B"), RiskLabel::ModerateRisk);
    }

    #[test]
    fn baseline_cluster_escalates_outliers_to_moderate() {
        assert_eq!(label("4", AnomalyFlag::Outlier, "A"), RiskLabel::ModerateRisk);
        assert_eq!(label("0", AnomalyFlag::Normal, "A"), RiskLabel::Normal);
    }

    #[test]
    fn unassigned_cluster_fails_closed_to_normal() {
        assert_eq!(label("9", AnomalyFlag::Normal, "B"), RiskLabel::Normal);
        assert_eq!(label("9", AnomalyFlag::Outlier, "A"), RiskLabel::Normal);
    }

    #[test]
    fn overlapping_roles_resolve_by_priority() {
        let config = RiskConfig::new(["2"], ["2"], ["2"]);
        let input = RiskInput {
            cluster: "2",
            anomaly: AnomalyFlag::Normal,
            exceptional: "A",
        };
        assert_eq!(matching_rule(&input, &config, "B").name, "high-risk-cluster");
        let declared = RiskInput {
            exceptional: "B",
            ..input
        };
        assert_eq!(classify(&declared, &config, "B"), RiskLabel::Exceptional);
    }

    proptest! {
        #[test]
        fn every_input_gets_one_stable_label(
            cluster in 0u8..10,
            outlier in any::<bool>(),
            declared in prop::sample::select(vec!["A", "B", ""]),
        ) {
            let cluster = cluster.to_string();
            let anomaly = if outlier { AnomalyFlag::Outlier } else { AnomalyFlag::Normal };
            let input = RiskInput { cluster: &cluster, anomaly, exceptional: declared };
            let first = classify(&input, &reference(), "B");
            let second = classify(&input, &reference(), "B");
            prop_assert_eq!(first, second);
            prop_assert!(RiskLabel::ALL.contains(&first));
        }
    }
}
