//! Label resolver
//!
//! Turns a decoded raw result plus the item text into the final label,
//! confidence, and ambiguity flag. Four stages run in a fixed order — base
//! mapping, target–sentiment scoring, deterministic overrides, post-hoc
//! correction — and later stages exist specifically to correct known failure
//! modes of earlier ones, so the order must not change. The whole pipeline is
//! a pure function of its inputs.

use lazy_static::lazy_static;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    decoder::LabelResult,
    model::{DecodeStatus, Label, Stance},
};

/// Vote granted to the class the model itself decoded cleanly.
const BASE_VOTE: f32 = 2.0;
/// Scoring-stage override requires this lead over the runner-up class.
const DOMINANCE_MARGIN: f32 = 4.0;
/// Below this dominant score a default-class resolution counts as ambiguous.
const MIN_SIGNAL: f32 = 2.0;
/// Target and polarity phrase within this many chars count as one signal.
const PROXIMITY_CHARS: usize = 20;

const W_GOV_ATTACK: f32 = 5.0;
const W_IDEOLOGY_ATTACK: f32 = 7.0;
const W_OPPONENTS_MOCKED_NEAR: f32 = 5.0;
const W_OPPONENTS_MOCKED_FAR: f32 = 2.0;
const W_GOV_PRAISE: f32 = 3.0;
const W_DISSENT_PRAISE: f32 = 3.0;

pub struct PatternFamily {
    pub name: &'static str,
    patterns: Vec<Regex>,
}

impl PatternFamily {
    fn new(name: &'static str, patterns: &[&str]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid built-in pattern"))
            .collect();
        Self { name, patterns }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    fn match_starts(&self, text: &str) -> Vec<usize> {
        self.patterns
            .iter()
            .flat_map(|re| re.find_iter(text).map(|m| m.start()))
            .collect()
    }
}

// Pattern families. Longer, more specific alternations come first within each
// family; the short risky forms are what the post-hoc stage exists to police.
static GOV_ATTACK: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "gov_attack",
        &[
            r"\b(commies?|communist (?:regime|dictatorship)|red (?:regime|overlords))\b",
            r"\b(corrupt|thieving|rotten)\s+(?:party|regime|officials?)\b",
            r"\b(one-?party (?:rule|state)|police state|dictatorship)\b",
            r"\b(land (?:grab|theft)s?|bleeding the people dry)\b",
            r"\bthe party\b.{0,16}\b(robs|steals|lies|lied|ruined|crushed)\b",
        ],
    )
});

static IDEOLOGY_ATTACK: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "ideology_attack",
        &[
            r"\b(communist ideology|communism|marxism|socialism|socialist ideology)\b.{0,30}\b(scam|fraud|sham|con|lie|lies|failure|failed|bankrupt|delusion)\b",
        ],
    )
});

static OPPONENT_TARGET: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "opponent_target",
        &[
            r"\b(reactionar(?:y|ies)|three-?stripers?|yellow-?flag(?:gers)?|puppet (?:troops?|regime)|exile crowd|traitors?)\b",
        ],
    )
});

static INSULT: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "insult",
        &[
            r"\b(scum|dogs?|rats?|clowns?|idiots?|trash|garbage|filthy|stupid|rabid|losers?|barking)\b",
        ],
    )
});

static GOV_PRAISE: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "gov_praise",
        &[
            r"\b(glorious party|uncle ho|long live the party|national liberation|independence and freedom|proud of (?:our|the) (?:party|country)|patriot(?:s|ic)?)\b",
        ],
    )
});

static DISSENT_PRAISE: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "dissent_praise",
        &[
            r"\b(multi-?party democracy|free elections now|restore the republic|yellow flag forever|down with censorship)\b",
        ],
    )
});

static SLUR_NEGATED: Lazy<PatternFamily> = Lazy::new(|| {
    PatternFamily::new(
        "slur_negated",
        &[
            r"\b(reactionar(?:y|ies)|traitors?|three-?stripers?|yellow-?flag(?:gers)?)\b.{0,12}\b(not|never|ain'?t)\b.{0,12}\b(right|correct|good|decent)\b",
        ],
    )
});

/// One deterministic override. Highest priority match wins; a rule fires only
/// if its guard holds, and firing forces the label regardless of the earlier
/// stages.
pub struct OverrideRule {
    pub name: &'static str,
    pub priority: i32,
    pub pattern: fn(&str) -> bool,
    pub guard: fn(&str) -> bool,
    pub target: Stance,
    pub weight: f32,
}

fn always(_: &str) -> bool {
    true
}

lazy_static! {
    pub static ref OVERRIDE_RULES: Vec<OverrideRule> = {
        let mut rules = vec![
            OverrideRule {
                name: "ideology_attacked",
                priority: 100,
                pattern: |t: &str| IDEOLOGY_ATTACK.is_match(t),
                guard: always,
                target: Stance::Anti,
                weight: 6.0,
            },
            OverrideRule {
                name: "government_attacked",
                priority: 90,
                pattern: |t: &str| GOV_ATTACK.is_match(t),
                guard: always,
                target: Stance::Anti,
                weight: 5.0,
            },
            OverrideRule {
                name: "opponents_mocked",
                priority: 80,
                pattern: |t: &str| OPPONENT_TARGET.is_match(t) && INSULT.is_match(t),
                // Text that also attacks the government outranks this rule.
                guard: |t: &str| !GOV_ATTACK.is_match(t),
                target: Stance::Pro,
                weight: 5.0,
            },
            OverrideRule {
                name: "slur_negated",
                priority: 70,
                pattern: |t: &str| SLUR_NEGATED.is_match(t),
                guard: always,
                target: Stance::Pro,
                weight: 4.0,
            },
        ];
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        rules
    };
}

/// Reverts an override when a polysemous keyword fired without its
/// disambiguating companion nearby.
pub struct PostHocRule {
    pub name: &'static str,
    pub trigger: Stance,
    pub near_miss: Regex,
    pub companion: Regex,
    pub revert_to: Stance,
}

lazy_static! {
    pub static ref POST_HOC_RULES: Vec<PostHocRule> = vec![PostHocRule {
        // "the party" is as often a birthday as a politburo.
        name: "bare_party_mention",
        trigger: Stance::Anti,
        near_miss: Regex::new(r"(?i)\bparty\b").unwrap(),
        companion: Regex::new(
            r"(?i)\b(communist|communis[mt]|regime|ruling|politburo|corrupt|one-?party|socialis[mt])\b"
        )
        .unwrap(),
        revert_to: Stance::Unrelated,
    }];
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Scores {
    anti: f32,
    pro: f32,
    unrelated: f32,
}

impl Scores {
    fn add(&mut self, stance: Stance, weight: f32) {
        match stance {
            Stance::Anti => self.anti += weight,
            Stance::Pro => self.pro += weight,
            Stance::Unrelated => self.unrelated += weight,
        }
    }

    fn get(&self, stance: Stance) -> f32 {
        match stance {
            Stance::Anti => self.anti,
            Stance::Pro => self.pro,
            Stance::Unrelated => self.unrelated,
        }
    }

    fn total(&self) -> f32 {
        self.anti + self.pro + self.unrelated
    }

    /// Dominant class and runner-up score; ties resolve in the fixed order of
    /// `Stance::ALL` so resolution stays deterministic.
    fn dominant(&self) -> (Stance, f32, f32) {
        let mut best = Stance::ALL[0];
        for &stance in &Stance::ALL[1..] {
            if self.get(stance) > self.get(best) {
                best = stance;
            }
        }
        let runner_up = Stance::ALL
            .iter()
            .filter(|&&s| s != best)
            .map(|&s| self.get(s))
            .fold(0.0_f32, f32::max);
        (best, self.get(best), runner_up)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub label: Label,
    pub confidence: f32,
    pub ambiguous: bool,
}

#[derive(Default)]
pub struct LabelResolver;

impl LabelResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, text: &str, result: &LabelResult) -> Resolution {
        let lower = text.to_lowercase();

        // Stage a: base mapping. Missing or unrecognized decode falls back to
        // the default class without earning a vote.
        let decoded = result.raw;
        let mut label = decoded.unwrap_or(Stance::Unrelated);

        // Stage b: target–sentiment scoring.
        let mut scores = Scores::default();
        if let Some(stance) = decoded {
            scores.add(stance, BASE_VOTE);
        }
        self.score_families(&lower, &mut scores);

        let (dominant, dominant_score, runner_up) = scores.dominant();
        if dominant != label && dominant_score >= runner_up + DOMINANCE_MARGIN {
            label = dominant;
        }

        // Stage c: deterministic overrides, highest priority first, one fire.
        let mut fired: Option<&OverrideRule> = None;
        for rule in OVERRIDE_RULES.iter() {
            if (rule.pattern)(&lower) && (rule.guard)(&lower) {
                label = rule.target;
                scores.add(rule.target, rule.weight);
                fired = Some(rule);
                break;
            }
        }

        // Stage d: post-hoc correction of polysemous false positives.
        for rule in POST_HOC_RULES.iter() {
            if label == rule.trigger
                && rule.near_miss.is_match(&lower)
                && !rule.companion.is_match(&lower)
            {
                tracing::debug!(rule = rule.name, "post-hoc revert");
                label = rule.revert_to;
                break;
            }
        }

        if let Some(rule) = fired {
            tracing::trace!(rule = rule.name, label = %label, "override fired");
        }

        // An unrescued decode failure stays terminal: placeholder label,
        // zero confidence, ambiguous.
        if decoded.is_none()
            && result.strategy == DecodeStatus::Placeholder
            && label == Stance::Unrelated
            && scores.total() == 0.0
        {
            return Resolution {
                label: Label::DecodeFailed,
                confidence: 0.0,
                ambiguous: true,
            };
        }

        let total = scores.total();
        let confidence = if total > 0.0 {
            (scores.get(label) / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let ambiguous = label == Stance::default_class() && scores.get(label) < MIN_SIGNAL;

        Resolution {
            label: label.into(),
            confidence,
            ambiguous,
        }
    }

    fn score_families(&self, lower: &str, scores: &mut Scores) {
        if GOV_ATTACK.is_match(lower) {
            scores.add(Stance::Anti, W_GOV_ATTACK);
        }
        if IDEOLOGY_ATTACK.is_match(lower) {
            scores.add(Stance::Anti, W_IDEOLOGY_ATTACK);
        }
        if DISSENT_PRAISE.is_match(lower) {
            scores.add(Stance::Anti, W_DISSENT_PRAISE);
        }
        if GOV_PRAISE.is_match(lower) {
            scores.add(Stance::Pro, W_GOV_PRAISE);
        }

        // Opposing families co-occurring: the closer the target phrase sits
        // to the polarity phrase, the stronger the signal.
        let targets = OPPONENT_TARGET.match_starts(lower);
        let insults = INSULT.match_starts(lower);
        if !targets.is_empty() && !insults.is_empty() {
            let closest = targets
                .iter()
                .flat_map(|&t| insults.iter().map(move |&i| t.abs_diff(i)))
                .min()
                .unwrap_or(usize::MAX);
            let weight = if closest <= PROXIMITY_CHARS {
                W_OPPONENTS_MOCKED_NEAR
            } else {
                W_OPPONENTS_MOCKED_FAR
            };
            scores.add(Stance::Pro, weight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(stance: Stance) -> LabelResult {
        LabelResult {
            raw: Some(stance),
            strategy: DecodeStatus::Strict,
        }
    }

    fn placeholder() -> LabelResult {
        LabelResult {
            raw: None,
            strategy: DecodeStatus::Placeholder,
        }
    }

    #[test]
    fn test_ideology_attack_scenario() {
        let resolver = LabelResolver::new();
        let resolution = resolver.resolve("communist ideology is a scam", &decoded(Stance::Anti));

        assert_eq!(resolution.label, Label::Anti);
        assert!(resolution.confidence > 0.8);
        assert!(!resolution.ambiguous);
    }

    #[test]
    fn test_clean_unrelated_is_not_ambiguous() {
        let resolver = LabelResolver::new();
        let resolution = resolver.resolve("nice weather today", &decoded(Stance::Unrelated));

        assert_eq!(resolution.label, Label::Unrelated);
        assert!(!resolution.ambiguous);
    }

    #[test]
    fn test_higher_priority_override_wins_regardless_of_base() {
        let resolver = LabelResolver::new();
        // Ideology attack (priority 100) and mocked opponents (priority 80)
        // in the same text, with the base label on the opposing side.
        let text = "communist ideology is a failure and those reactionary clowns knew it";
        let resolution = resolver.resolve(text, &decoded(Stance::Pro));

        assert_eq!(resolution.label, Label::Anti);
    }

    #[test]
    fn test_resolver_is_pure() {
        let resolver = LabelResolver::new();
        let text = "the corrupt party steals land while patriots cheer";
        let first = resolver.resolve(text, &decoded(Stance::Unrelated));
        let second = resolver.resolve(text, &decoded(Stance::Unrelated));

        assert_eq!(first, second);
    }

    #[test]
    fn test_proximity_strengthens_opposing_family_signal() {
        let resolver = LabelResolver::new();
        let close = resolver.resolve(
            "those reactionary clowns again",
            &decoded(Stance::Unrelated),
        );
        let far = resolver.resolve(
            "reactionaries came to town and after the whole show ended everyone agreed the clowns were elsewhere",
            &decoded(Stance::Unrelated),
        );

        assert_eq!(close.label, Label::Pro);
        assert_eq!(far.label, Label::Pro);
        assert!(close.confidence > far.confidence);
    }

    #[test]
    fn test_scoring_overrides_weak_base_label() {
        let resolver = LabelResolver::new();
        // Model said unrelated, but the text attacks the government hard.
        let resolution = resolver.resolve(
            "the corrupt party steals land",
            &decoded(Stance::Unrelated),
        );

        assert_eq!(resolution.label, Label::Anti);
        assert!(!resolution.ambiguous);
    }

    #[test]
    fn test_post_hoc_reverts_bare_party_mention() {
        let resolver = LabelResolver::new();
        let reverted = resolver.resolve(
            "the party ruined the evening for everyone",
            &decoded(Stance::Unrelated),
        );
        assert_eq!(reverted.label, Label::Unrelated);

        let kept = resolver.resolve(
            "the corrupt party ruined the whole country",
            &decoded(Stance::Unrelated),
        );
        assert_eq!(kept.label, Label::Anti);
    }

    #[test]
    fn test_unrescued_placeholder_is_decode_failed() {
        let resolver = LabelResolver::new();
        let resolution = resolver.resolve("just some mundane chatter", &placeholder());

        assert_eq!(resolution.label, Label::DecodeFailed);
        assert_eq!(resolution.confidence, 0.0);
        assert!(resolution.ambiguous);
    }

    #[test]
    fn test_placeholder_rescued_by_override() {
        let resolver = LabelResolver::new();
        let resolution = resolver.resolve("the thieving regime strikes again", &placeholder());

        assert_eq!(resolution.label, Label::Anti);
        assert!(resolution.confidence > 0.5);
        assert!(!resolution.ambiguous);
    }

    #[test]
    fn test_slur_negation_reads_as_pro() {
        let resolver = LabelResolver::new();
        let resolution = resolver.resolve(
            "the reactionaries were never right about any of it",
            &decoded(Stance::Unrelated),
        );

        assert_eq!(resolution.label, Label::Pro);
    }
}
