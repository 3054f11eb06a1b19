//! REINFORCE Training
//!
//! Trains a [`PolicyNet`] to hover by sampling rotor speeds from its Gaussian
//! head and following the policy gradient
//!
//! ```text
//! ∇J ≈ 1/N Σ_t ∇ log π(a_t | s_t) G_t
//! ```
//!
//! over every transition of every rollout in the epoch, with an optional entropy
//! bonus.
//!
//! ## Epoch Summary
//!
//! Each epoch ends with one line an external orchestrator can parse:
//!
//! ```text
//! Iteration 3/100 [n=128]: 41.372910 ± 12.004551 (min: 9.118270, max: 70.512300)
//! ```
//!
//! The statistics are over the initial returns `G_0` of the epoch's rollouts.

use crate::error::{Error, Result};
use crate::gradients::clip_elementwise;
use crate::optimizer::Adam;
use crate::policy::{PolicyNet, Reparam, ACTION_DIM, STATE_DIM};
use crate::rollout::{normalize_returns, theoretical_max_return, Rollout, MAX_STEPS};
use crate::sim::{hover_reward, FlightSim, HOVER_RADIUS, HOVER_TARGET, ROTORS};
use crate::tensor::{Parameters, Tensor};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// REINFORCE hyperparameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub epochs: usize,
    pub rollouts_per_epoch: usize,
    pub gamma: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Entropy bonus weight α
    pub entropy_coeff: f64,
    /// Element-wise gradient bound
    pub grad_clip: f64,
    /// Standardise returns across each epoch's transitions
    pub normalize_returns: bool,
    pub reparam: Reparam,
    /// Hidden layer widths between the state and the 8 raw outputs
    pub hidden: Vec<usize>,
    pub seed: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            rollouts_per_epoch: 128,
            gamma: 0.999,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            entropy_coeff: 0.01,
            grad_clip: 10.0,
            normalize_returns: false,
            reparam: Reparam::FixedBounds,
            hidden: vec![64],
            seed: 42,
        }
    }
}

impl PolicyConfig {
    /// Few short epochs for tests
    pub fn tiny() -> Self {
        Self {
            epochs: 2,
            rollouts_per_epoch: 4,
            hidden: vec![16],
            ..Self::default()
        }
    }

    /// Network widths, input first
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![STATE_DIM];
        sizes.extend(&self.hidden);
        sizes.push(ACTION_DIM);
        sizes
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.gamma > 0.0 && self.gamma < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "discount factor must lie in (0, 1), got {}",
                self.gamma
            )));
        }
        if self.rollouts_per_epoch == 0 {
            return Err(Error::InvalidConfig("rollouts_per_epoch must be non-zero".into()));
        }
        if !(self.grad_clip > 0.0) {
            return Err(Error::InvalidConfig("grad_clip must be positive".into()));
        }
        Ok(())
    }
}

/// Statistics of one epoch's initial returns
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    pub iteration: usize,
    pub total: usize,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl EpochSummary {
    /// Population statistics of `returns`
    pub fn from_returns(iteration: usize, total: usize, returns: &[f64]) -> Self {
        let count = returns.len();
        if count == 0 {
            return Self {
                iteration,
                total,
                count,
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        let n = count as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
        Self {
            iteration,
            total,
            count,
            mean,
            std: var.sqrt(),
            min: returns.iter().copied().fold(f64::INFINITY, f64::min),
            max: returns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Iteration {}/{} [n={}]: {:.6} ± {:.6} (min: {:.6}, max: {:.6})",
            self.iteration, self.total, self.count, self.mean, self.std, self.min, self.max
        )
    }
}

impl FromStr for EpochSummary {
    type Err = Error;

    /// Parse a summary line; text before `Iteration` is ignored
    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::Summary(line.to_string());
        let num = |s: &str| s.trim().parse::<f64>().map_err(|_| bad());
        let int = |s: &str| s.trim().parse::<usize>().map_err(|_| bad());

        let start = line.find("Iteration").ok_or_else(bad)?;
        let rest = &line[start + "Iteration".len()..];

        let (counts, stats) = rest.split_once("]:").ok_or_else(bad)?;
        let (progress, count) = counts.split_once('[').ok_or_else(bad)?;
        let (iteration, total) = progress.split_once('/').ok_or_else(bad)?;
        let count = count.trim().strip_prefix("n=").ok_or_else(bad)?;

        let (spread, range) = stats.split_once('(').ok_or_else(bad)?;
        let (mean, std) = spread.split_once('±').ok_or_else(bad)?;
        let range = range.trim().strip_suffix(')').ok_or_else(bad)?;
        let (min, max) = range.split_once(',').ok_or_else(bad)?;
        let min = min.trim().strip_prefix("min:").ok_or_else(bad)?;
        let max = max.trim().strip_prefix("max:").ok_or_else(bad)?;

        Ok(Self {
            iteration: int(iteration)?,
            total: int(total)?,
            count: int(count)?,
            mean: num(mean)?,
            std: num(std)?,
            min: num(min)?,
            max: num(max)?,
        })
    }
}

pub struct PolicyTrainer {
    pub policy: PolicyNet,
    pub optimizer: Adam,
    pub config: PolicyConfig,
    rng: StdRng,
    iteration: usize,
    best_mean: f64,
}

impl PolicyTrainer {
    /// Trainer around a freshly initialised policy
    pub fn new(config: PolicyConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let policy = PolicyNet::new(&config.layer_sizes(), &mut rng)?;
        Ok(Self::with_policy(policy, config, rng))
    }

    /// Trainer around an existing policy, e.g. loaded from a weight file
    pub fn from_policy(policy: PolicyNet, config: PolicyConfig) -> Result<Self> {
        config.validate()?;
        if policy.sizes() != config.layer_sizes() {
            return Err(Error::InvalidConfig(format!(
                "policy has layers {:?}, config expects {:?}",
                policy.sizes(),
                config.layer_sizes()
            )));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self::with_policy(policy, config, rng))
    }

    fn with_policy(policy: PolicyNet, config: PolicyConfig, rng: StdRng) -> Self {
        let optimizer = Adam::new(config.learning_rate, config.weight_decay);
        Self {
            policy,
            optimizer,
            config,
            rng,
            iteration: 0,
            best_mean: f64::NEG_INFINITY,
        }
    }

    pub fn theoretical_max(&self) -> f64 {
        theoretical_max_return(self.config.gamma)
    }

    /// Best epoch mean return so far
    pub fn best_mean(&self) -> f64 {
        self.best_mean
    }

    /// Run one episode with actions sampled from the current policy
    ///
    /// The episode ends after `MAX_STEPS` control steps, when the craft leaves
    /// the hover radius, when the simulator reports divergence, or on a
    /// non-finite reward. Returns are computed in every case.
    pub fn collect_rollout<S: FlightSim + ?Sized>(&mut self, sim: &mut S) -> Rollout {
        let mut rollout = Rollout::new();
        let mut obs = sim.reset();

        while rollout.len() < MAX_STEPS {
            if obs.distance_to(&HOVER_TARGET) > HOVER_RADIUS {
                break;
            }

            let state = obs.sensor_state();
            let raw = self.policy.act(&state);
            let dists = self.config.reparam.distributions(&raw);
            let action: [f64; ROTORS] = std::array::from_fn(|i| dists[i].sample(&mut self.rng));

            let (next, diverged) = sim.step(&action);
            let reward = hover_reward(&next);
            if !reward.is_finite() {
                warn!("non-finite reward after {} steps; truncating rollout", rollout.len());
                break;
            }
            rollout.push(state, action, reward);

            if diverged {
                debug!("simulation diverged after {} steps", rollout.len());
                break;
            }
            obs = next;
        }

        rollout.finish(self.config.gamma);
        rollout
    }

    /// Accumulate the mean REINFORCE gradient over all transitions
    ///
    /// `returns[r]` replaces `rollouts[r].returns` so callers can pass
    /// normalised returns. Returns the number of transitions used.
    fn accumulate_policy_gradient(&mut self, rollouts: &[Rollout], returns: &[Vec<f64>]) -> usize {
        let transitions: usize = rollouts.iter().map(Rollout::len).sum();
        if transitions == 0 {
            return 0;
        }
        let scale = 1.0 / transitions as f64;
        let (reparam, alpha) = (self.config.reparam, self.config.entropy_coeff);

        for (rollout, rets) in rollouts.iter().zip(returns) {
            let t = rollout.len();
            if t == 0 {
                continue;
            }
            let states = Tensor::new(
                rollout.states.iter().flatten().copied().collect(),
                vec![t, STATE_DIM],
            );
            let (raw, cache) = self.policy.forward(&states);

            let mut grad = Tensor::zeros(vec![t, ACTION_DIM]);
            for step in 0..t {
                let g = reparam.output_gradient(raw.row(step), &rollout.actions[step], rets[step], alpha);
                for (o, v) in grad.row_mut(step).iter_mut().zip(g) {
                    *o = v * scale;
                }
            }
            self.policy.backward(&grad, &cache);
        }
        transitions
    }

    /// Collect rollouts, update the policy once, and summarise
    ///
    /// The best mean return is tracked from the collected episodes whether or
    /// not the update is applied.
    pub fn train_epoch<S: FlightSim + ?Sized>(&mut self, sim: &mut S) -> EpochSummary {
        self.iteration += 1;
        let rollouts: Vec<Rollout> = (0..self.config.rollouts_per_epoch)
            .map(|_| self.collect_rollout(sim))
            .collect();

        let initial: Vec<f64> = rollouts.iter().map(Rollout::initial_return).collect();
        let summary = EpochSummary::from_returns(self.iteration, self.config.epochs, &initial);
        if summary.mean.is_finite() {
            self.best_mean = self.best_mean.max(summary.mean);
        }

        self.update(&rollouts);
        summary
    }

    /// One REINFORCE step over finished rollouts
    ///
    /// Returns `false`, with gradients cleared and the optimizer untouched,
    /// when any return is not finite or there are no transitions.
    pub fn update(&mut self, rollouts: &[Rollout]) -> bool {
        let mut returns: Vec<Vec<f64>> = rollouts.iter().map(|r| r.returns.clone()).collect();
        if self.config.normalize_returns {
            let mut flat: Vec<f64> = returns.iter().flatten().copied().collect();
            normalize_returns(&mut flat);
            let mut it = flat.into_iter();
            for rets in &mut returns {
                for g in rets.iter_mut() {
                    *g = it.next().unwrap_or(0.0);
                }
            }
        }

        if returns.iter().flatten().any(|g| !g.is_finite()) {
            warn!("iteration {}: non-finite return; skipping update", self.iteration);
            self.policy.zero_grad();
            return false;
        }

        if self.accumulate_policy_gradient(rollouts, &returns) == 0 {
            self.policy.zero_grad();
            return false;
        }
        clip_elementwise(&mut self.policy, self.config.grad_clip);
        self.optimizer.step(&mut self.policy);
        true
    }
}
