//! Epoch accumulators for MLE and RL training.

/// Token-weighted negative log-likelihood over an epoch or a dev pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenLoss {
    total: f64,
    tokens: usize,
}

impl TokenLoss {
    /// Add a batch whose loss is already averaged over its `tokens` gold tokens.
    pub fn update(&mut self, mean_loss: f64, tokens: usize) {
        self.total += mean_loss * tokens as f64;
        self.tokens += tokens;
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn mean(&self) -> f64 {
        if self.tokens == 0 {
            return 0.0;
        }
        self.total / self.tokens as f64
    }

    /// `exp` of the mean per-token loss.
    pub fn perplexity(&self) -> f64 {
        self.mean().exp()
    }
}

/// Running sums over the RL batches of one epoch.
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    pub loss: f64,
    pub reward: f64,
    pub coverage: usize,
    pub matches: usize,
    pub examples: usize,
    pub count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f64, reward: f64, coverage: usize, matches: usize, examples: usize) {
        self.loss += loss;
        self.reward += reward;
        self.coverage += coverage;
        self.matches += matches;
        self.examples += examples;
        self.count += 1;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.loss / self.count as f64
    }

    pub fn mean_reward(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.reward / self.count as f64
    }

    pub fn display(&self) -> String {
        if self.count == 0 {
            return "no data".to_string();
        }
        format!(
            "loss={:.4} reward={:.4} coverage={} matches={}",
            self.mean_loss(),
            self.mean_reward(),
            render_ratio(self.coverage, self.examples),
            render_ratio(self.matches, self.examples),
        )
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// `"n/d (p%)"`, with `d == 0` rendered as `"0/0 (0.0%)"`.
pub fn render_ratio(n: usize, d: usize) -> String {
    let pct = if d == 0 { 0.0 } else { 100.0 * n as f64 / d as f64 };
    format!("{n}/{d} ({pct:.1}%)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_loss_weights_by_tokens() {
        let mut acc = TokenLoss::default();
        acc.update(1.0, 3);
        acc.update(2.0, 1);
        assert_eq!(acc.tokens(), 4);
        assert!((acc.mean() - 1.25).abs() < 1e-12);
        assert!((acc.perplexity() - 1.25f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_empty_accumulators() {
        assert_eq!(TokenLoss::default().mean(), 0.0);
        let avg = RunningAvg::new();
        assert_eq!(avg.mean_loss(), 0.0);
        assert_eq!(avg.display(), "no data");
    }

    #[test]
    fn test_running_avg() {
        let mut avg = RunningAvg::new();
        avg.update(0.5, 0.2, 1, 0, 2);
        avg.update(1.5, 0.4, 2, 1, 2);
        assert!((avg.mean_loss() - 1.0).abs() < 1e-12);
        assert!((avg.mean_reward() - 0.3).abs() < 1e-12);
        assert_eq!(avg.display(), "loss=1.0000 reward=0.3000 coverage=3/4 (75.0%) matches=1/4 (25.0%)");
        avg.reset();
        assert_eq!(avg.count, 0);
    }

    #[test]
    fn test_render_ratio() {
        assert_eq!(render_ratio(1, 3), "1/3 (33.3%)");
        assert_eq!(render_ratio(0, 0), "0/0 (0.0%)");
    }
}
