use crate::search::{DecodeError, SearchParams};

/// Which decoder produces candidates during RL training and evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Per-example beam search, one example after another.
    #[default]
    Beam,
    /// Beam search over the whole batch at once.
    BatchedBeam,
    /// Independent stochastic rollouts.
    MonteCarlo,
}

/// Decoding configuration loaded from the `[decode]` TOML section.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct DecodeConfig {
    #[serde(default)]
    pub strategy: DecodeStrategy,

    /// Beam width, or number of rollouts per example for Monte Carlo.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Maximum number of decoder steps.
    #[serde(default = "default_decoder_len_limit")]
    pub decoder_len_limit: usize,

    /// Seed for the Monte Carlo sampler.
    #[serde(default)]
    pub seed: u64,
}

fn default_sample_size() -> usize {
    10
}
fn default_decoder_len_limit() -> usize {
    65
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            strategy: DecodeStrategy::default(),
            sample_size: default_sample_size(),
            decoder_len_limit: default_decoder_len_limit(),
            seed: 0,
        }
    }
}

impl DecodeConfig {
    /// Reject configurations that could never decode.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.sample_size == 0 {
            return Err(DecodeError::InvalidWidth(self.sample_size));
        }
        if self.decoder_len_limit == 0 {
            return Err(DecodeError::InvalidMaxLen);
        }
        if self.strategy == DecodeStrategy::MonteCarlo && self.sample_size == 1 {
            tracing::warn!(
                sample_size = self.sample_size,
                "Monte Carlo with a single rollout gives every example one candidate"
            );
        }
        Ok(())
    }

    /// Search parameters for the given special tokens.
    pub fn params(&self, sos: usize, eos: usize) -> SearchParams {
        SearchParams {
            width: self.sample_size,
            max_len: self.decoder_len_limit,
            sos,
            eos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = DecodeConfig::default();
        assert_eq!(cfg.strategy, DecodeStrategy::Beam);
        assert_eq!(cfg.sample_size, 10);
        assert_eq!(cfg.decoder_len_limit, 65);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let cfg: DecodeConfig = toml::from_str("strategy = \"monte_carlo\"\nsample_size = 4\n").unwrap();
        assert_eq!(cfg.strategy, DecodeStrategy::MonteCarlo);
        assert_eq!(cfg.sample_size, 4);
        assert_eq!(cfg.decoder_len_limit, 65);
    }

    #[test]
    fn test_batched_beam_name() {
        let cfg: DecodeConfig = toml::from_str("strategy = \"batched_beam\"").unwrap();
        assert_eq!(cfg.strategy, DecodeStrategy::BatchedBeam);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let cfg = DecodeConfig {
            sample_size: 0,
            ..DecodeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DecodeError::InvalidWidth(0))));

        let cfg = DecodeConfig {
            decoder_len_limit: 0,
            ..DecodeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DecodeError::InvalidMaxLen)));
    }

    #[test]
    fn test_params() {
        let cfg = DecodeConfig::default();
        let p = cfg.params(1, 2);
        assert_eq!(p.width, 10);
        assert_eq!(p.max_len, 65);
        assert_eq!((p.sos, p.eos), (1, 2));
    }
}
