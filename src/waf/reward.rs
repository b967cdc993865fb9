use serde::{Deserialize, Serialize};

use crate::config::RewardConfig;
use crate::error::Result as WafResult;
use super::{Action, Feature, FeatureVector};

// Attack-probability heuristic weights
const KEYWORD_WEIGHT: f64 = 0.3;
const QUOTE_WEIGHT: f64 = 0.2;
const COMMENT_WEIGHT: f64 = 0.3;
const OR_AND_WEIGHT: f64 = 0.2;
const ENTROPY_WEIGHT: f64 = 0.1;
const ENCODING_WEIGHT: f64 = 0.2;

const QUOTE_THRESHOLD: f64 = 2.0;
const ENTROPY_THRESHOLD: f64 = 5.0;
const ENCODING_DEPTH_THRESHOLD: f64 = 1.0;

/// Observed (or simulated) result of handling a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Outcome {
    pub is_attack: bool,
    pub http_status: u16,
    pub latency_ms: f64,
    /// A downstream failure (e.g. a database error) was observed
    pub downstream_error: bool,
    pub user_complaint: bool,
    /// Heuristic estimate, set when `is_attack` was inferred rather than known
    pub attack_probability: Option<f64>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self {
            is_attack: false,
            http_status: 200,
            latency_ms: 0.0,
            downstream_error: false,
            user_complaint: false,
            attack_probability: None,
        }
    }
}

impl Outcome {
    pub fn attack() -> Self {
        Self {
            is_attack: true,
            ..Default::default()
        }
    }

    pub fn legitimate() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, http_status: u16) -> Self {
        self.http_status = http_status;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_downstream_error(mut self) -> Self {
        self.downstream_error = true;
        self
    }

    pub fn with_user_complaint(mut self) -> Self {
        self.user_complaint = true;
        self
    }
}

/// Converts outcomes into scalar training rewards
#[derive(Debug, Clone)]
pub struct RewardCalculator {
    weights: RewardConfig,
}

impl RewardCalculator {
    pub fn new(weights: RewardConfig) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RewardConfig {
        &self.weights
    }

    /// Replace the weights at runtime. Invalid weights are rejected and the
    /// current ones stay in effect.
    pub fn set_weights(&mut self, weights: RewardConfig) -> WafResult<()> {
        weights.validate()?;
        self.weights = weights;
        Ok(())
    }

    /// Sum of independent terms: action correctness, latency, downstream
    /// error, complaint, efficiency bonus and HTTP status.
    pub fn score(&self, action: Action, outcome: &Outcome) -> f64 {
        let w = &self.weights;
        let mut reward = self.base_reward(action, outcome.is_attack);

        if outcome.latency_ms > w.latency_threshold_ms {
            let excess = outcome.latency_ms - w.latency_threshold_ms;
            let penalty = w.max_latency_penalty * (excess / w.latency_threshold_ms);
            reward += penalty.max(w.max_latency_penalty).min(0.0);
        }

        if outcome.downstream_error {
            reward += w.downstream_error_penalty;
        }
        if outcome.user_complaint {
            reward += w.user_complaint_penalty;
        }

        if !outcome.is_attack && matches!(action, Action::LogOnly | Action::Sanitize) {
            reward += w.efficiency_bonus;
        }

        match outcome.http_status {
            500.. => reward += w.server_error_penalty,
            403 => {}
            400..=499 => reward += w.client_error_penalty,
            _ => {}
        }

        reward
    }

    fn base_reward(&self, action: Action, is_attack: bool) -> f64 {
        let w = &self.weights;
        match (action, is_attack) {
            (Action::Block | Action::Challenge, true) => w.attack_blocked_reward,
            (Action::Block | Action::Challenge, false) => w.false_positive_penalty,
            (Action::Allow | Action::LogOnly, true) => w.false_negative_penalty,
            (Action::Allow | Action::LogOnly, false) => w.legitimate_allowed_reward,
            (Action::Sanitize, true) => w.attack_blocked_reward * w.sanitize_attack_factor,
            (Action::Sanitize, false) => w.legitimate_allowed_reward * w.sanitize_legitimate_factor,
            (Action::Throttle, true) => w.attack_blocked_reward * w.throttle_attack_factor,
            (Action::Throttle, false) => w.legitimate_allowed_reward * w.throttle_legitimate_factor,
        }
    }

    /// Heuristic attack likelihood in [0, 1] for when ground truth is unknown.
    pub fn estimate_attack_probability(&self, features: &FeatureVector) -> f64 {
        let indicators = [
            (features.get(Feature::SqlKeywordCount) > 0.0, KEYWORD_WEIGHT),
            (features.get(Feature::QuoteCount) > QUOTE_THRESHOLD, QUOTE_WEIGHT),
            (features.get(Feature::CommentPatternCount) > 0.0, COMMENT_WEIGHT),
            (features.get(Feature::OrAndCount) > 0.0, OR_AND_WEIGHT),
            (features.get(Feature::Entropy) > ENTROPY_THRESHOLD, ENTROPY_WEIGHT),
            (features.get(Feature::EncodingDepth) > ENCODING_DEPTH_THRESHOLD, ENCODING_WEIGHT),
        ];

        let score: f64 = indicators
            .iter()
            .filter(|(present, _)| *present)
            .map(|(_, weight)| weight)
            .sum();
        score.min(1.0)
    }

    /// Fill `is_attack` and `attack_probability` from the heuristic.
    pub fn label_outcome(&self, features: &FeatureVector, outcome: &Outcome) -> Outcome {
        let probability = self.estimate_attack_probability(features);
        Outcome {
            is_attack: probability > self.weights.attack_probability_threshold,
            attack_probability: Some(probability),
            ..outcome.clone()
        }
    }

    /// Score with a heuristic attack label in place of ground truth.
    pub fn score_from_features(&self, action: Action, features: &FeatureVector, outcome: &Outcome) -> f64 {
        self.score(action, &self.label_outcome(features, outcome))
    }
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self::new(RewardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waf::{FeatureExtractor, RequestRecord};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_base_rewards_by_action_class() {
        let calc = RewardCalculator::default();
        let attack = Outcome::attack();
        let legit = Outcome::legitimate();

        assert!(close(calc.score(Action::Block, &attack), 1.0));
        assert!(close(calc.score(Action::Challenge, &legit), -2.0));
        assert!(close(calc.score(Action::Allow, &attack), -1.5));
        assert!(close(calc.score(Action::Allow, &legit), 0.5));
        assert!(close(calc.score(Action::Sanitize, &attack), 0.7));
        assert!(close(calc.score(Action::Throttle, &attack), 0.5));
        assert!(close(calc.score(Action::Throttle, &legit), 0.3));
        // 0.8 * 0.5 plus the efficiency bonus
        assert!(close(calc.score(Action::Sanitize, &legit), 0.6));
        assert!(close(calc.score(Action::LogOnly, &legit), 0.7));
    }

    #[test]
    fn test_blocking_an_attack_beats_allowing_it() {
        let calc = RewardCalculator::default();
        let outcomes = [
            Outcome::attack(),
            Outcome::attack().with_latency_ms(2500.0),
            Outcome::attack().with_status(500).with_downstream_error(),
            Outcome::attack().with_user_complaint().with_status(404),
        ];
        for outcome in outcomes {
            assert!(calc.score(Action::Block, &outcome) > calc.score(Action::Allow, &outcome));
        }
    }

    #[test]
    fn test_latency_penalty_is_linear_and_capped() {
        let calc = RewardCalculator::default();
        let base = calc.score(Action::Allow, &Outcome::legitimate());

        let at_threshold = calc.score(Action::Allow, &Outcome::legitimate().with_latency_ms(1000.0));
        assert!(close(at_threshold, base));

        let slow = calc.score(Action::Allow, &Outcome::legitimate().with_latency_ms(1500.0));
        assert!(close(slow, base - 0.25));

        let very_slow = calc.score(Action::Allow, &Outcome::legitimate().with_latency_ms(60_000.0));
        assert!(close(very_slow, base - 0.5));

        let infinite = calc.score(Action::Allow, &Outcome::legitimate().with_latency_ms(f64::INFINITY));
        assert!(close(infinite, base - 0.5));
    }

    #[test]
    fn test_fixed_penalties_are_additive() {
        let calc = RewardCalculator::default();
        let outcome = Outcome::legitimate()
            .with_downstream_error()
            .with_user_complaint()
            .with_status(502);
        assert!(close(calc.score(Action::Allow, &outcome), 0.5 - 0.5 - 1.0 - 0.3));
    }

    #[test]
    fn test_forbidden_status_is_not_penalized() {
        let calc = RewardCalculator::default();
        let ok = calc.score(Action::Block, &Outcome::attack());
        assert!(close(calc.score(Action::Block, &Outcome::attack().with_status(403)), ok));
        assert!(close(calc.score(Action::Block, &Outcome::attack().with_status(429)), ok - 0.1));
        assert!(close(calc.score(Action::Block, &Outcome::attack().with_status(503)), ok - 0.3));
    }

    #[test]
    fn test_heuristic_flags_tautology_injection() {
        let calc = RewardCalculator::default();
        let record = RequestRecord::new("GET", "/api/user?id=1' OR '1'='1'");
        let features = FeatureExtractor::new().extract(&record).unwrap();

        assert!(features.get(Feature::QuoteCount) >= 4.0);
        assert!(features.get(Feature::OrAndCount) >= 1.0);

        let probability = calc.estimate_attack_probability(&features);
        assert!(probability > 0.5, "probability {}", probability);

        let block = calc.score_from_features(Action::Block, &features, &Outcome::default());
        let allow = calc.score_from_features(Action::Allow, &features, &Outcome::default());
        assert!(block > 0.0);
        assert!(block > allow);
    }

    #[test]
    fn test_heuristic_is_quiet_on_benign_traffic_and_capped() {
        let calc = RewardCalculator::default();
        let benign = FeatureExtractor::new()
            .extract(&RequestRecord::new("GET", "/api/user?id=1"))
            .unwrap();
        assert_eq!(calc.estimate_attack_probability(&benign), 0.0);

        let everything = FeatureVector::from_pairs([
            (Feature::SqlKeywordCount, 3.0),
            (Feature::QuoteCount, 6.0),
            (Feature::CommentPatternCount, 1.0),
            (Feature::OrAndCount, 2.0),
            (Feature::Entropy, 5.5),
            (Feature::EncodingDepth, 3.0),
        ]);
        assert_eq!(calc.estimate_attack_probability(&everything), 1.0);

        let labeled = calc.label_outcome(&everything, &Outcome::default().with_status(404));
        assert!(labeled.is_attack);
        assert_eq!(labeled.attack_probability, Some(1.0));
        assert_eq!(labeled.http_status, 404);
    }

    #[test]
    fn test_custom_weights_are_used() {
        let calc = RewardCalculator::new(RewardConfig {
            sanitize_attack_factor: 0.9,
            efficiency_bonus: 0.0,
            ..RewardConfig::default()
        });
        assert!(close(calc.score(Action::Sanitize, &Outcome::attack()), 0.9));
        assert!(close(calc.score(Action::LogOnly, &Outcome::legitimate()), 0.5));
        assert_eq!(calc.weights().sanitize_attack_factor, 0.9);
    }

    #[test]
    fn test_set_weights_validates_before_replacing() {
        let mut calc = RewardCalculator::default();

        let rejected = calc.set_weights(RewardConfig {
            false_positive_penalty: 1.0,
            ..RewardConfig::default()
        });
        assert!(rejected.is_err());
        assert_eq!(calc.weights(), &RewardConfig::default());

        calc.set_weights(RewardConfig {
            attack_blocked_reward: 2.0,
            ..RewardConfig::default()
        })
        .unwrap();
        assert!(close(calc.score(Action::Block, &Outcome::attack()), 2.0));
    }
}
