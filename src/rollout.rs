//! Episode storage and return computation

use crate::policy::STATE_DIM;
use crate::sim::ROTORS;

/// Longest episode, in control steps
pub const MAX_STEPS: usize = 256;

/// One episode of `(state, action, reward, return)` transitions
///
/// Holds at most `MAX_STEPS` transitions. Returns are filled in by
/// [`Rollout::finish`] once the episode has ended.
#[derive(Clone, Debug, Default)]
pub struct Rollout {
    pub states: Vec<[f64; STATE_DIM]>,
    pub actions: Vec<[f64; ROTORS]>,
    pub rewards: Vec<f64>,
    pub returns: Vec<f64>,
}

impl Rollout {
    pub fn new() -> Self {
        Self {
            states: Vec::with_capacity(MAX_STEPS),
            actions: Vec::with_capacity(MAX_STEPS),
            rewards: Vec::with_capacity(MAX_STEPS),
            returns: Vec::with_capacity(MAX_STEPS),
        }
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_STEPS
    }

    /// Append a transition; returns `false` without storing once full
    pub fn push(&mut self, state: [f64; STATE_DIM], action: [f64; ROTORS], reward: f64) -> bool {
        if self.is_full() {
            return false;
        }
        self.states.push(state);
        self.actions.push(action);
        self.rewards.push(reward);
        true
    }

    /// Compute discounted returns for the stored rewards
    pub fn finish(&mut self, gamma: f64) {
        self.returns = discounted_returns(&self.rewards, gamma);
    }

    /// Return from the first step, or 0 for an empty episode
    pub fn initial_return(&self) -> f64 {
        self.returns.first().copied().unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.actions.clear();
        self.rewards.clear();
        self.returns.clear();
    }
}

/// `G_t = r_t + γ G_{t+1}`, computed from the last step backward
pub fn discounted_returns(rewards: &[f64], gamma: f64) -> Vec<f64> {
    let mut returns = vec![0.0; rewards.len()];
    let mut g = 0.0;
    for (ret, &r) in returns.iter_mut().zip(rewards).rev() {
        g = r + gamma * g;
        *ret = g;
    }
    returns
}

/// Shift and scale returns to zero mean and unit standard deviation
///
/// A batch with no spread is only centred.
pub fn normalize_returns(returns: &mut [f64]) {
    if returns.is_empty() {
        return;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let std = (returns.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n).sqrt();
    let scale = if std > 1e-8 { 1.0 / std } else { 1.0 };
    for g in returns.iter_mut() {
        *g = (*g - mean) * scale;
    }
}

/// Largest possible return for a full-length episode with reward 1 per step
pub fn theoretical_max_return(gamma: f64) -> f64 {
    if (1.0 - gamma).abs() < 1e-15 {
        return MAX_STEPS as f64;
    }
    (1.0 - gamma.powi(MAX_STEPS as i32)) / (1.0 - gamma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discounted_returns() {
        let g = discounted_returns(&[1.0, 1.0, 1.0], 0.5);
        assert_eq!(g, vec![1.75, 1.5, 1.0]);
    }

    #[test]
    fn test_discounted_returns_empty() {
        assert!(discounted_returns(&[], 0.9).is_empty());
    }

    #[test]
    fn test_normalize_returns() {
        let mut g = vec![1.0, 2.0, 3.0, 4.0];
        normalize_returns(&mut g);
        let mean: f64 = g.iter().sum::<f64>() / 4.0;
        let var: f64 = g.iter().map(|x| x * x).sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);
        assert!((var - 1.0).abs() < 1e-12);

        let mut flat = vec![2.0, 2.0];
        normalize_returns(&mut flat);
        assert_eq!(flat, vec![0.0, 0.0]);
    }

    #[test]
    fn test_rollout_capacity() {
        let mut r = Rollout::new();
        for _ in 0..MAX_STEPS {
            assert!(r.push([0.0; STATE_DIM], [0.0; ROTORS], 1.0));
        }
        assert!(!r.push([0.0; STATE_DIM], [0.0; ROTORS], 1.0));
        assert_eq!(r.len(), MAX_STEPS);

        r.finish(0.999);
        assert!((r.initial_return() - theoretical_max_return(0.999)).abs() < 1e-9);

        r.clear();
        assert!(r.is_empty());
        assert_eq!(r.initial_return(), 0.0);
    }
}
