//! End-to-end training paths through the public API

use flightnet::train::Normalization;
use flightnet::weights::{
    config_path, load_config, load_weights, normalization_path, save_config, save_weights,
};
use flightnet::{
    Config, EpochSummary, FlightSim, FlightTransformer, HoverSim, LoadError, Parameters,
    PolicyConfig, PolicyNet, PolicyTrainer, SupervisedTrainer, Tensor, TelemetryDataset,
    TrainingConfig, TrainingLogger, TransformerController,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("flightnet_{}_{}", std::process::id(), name))
}

fn telemetry_csv(rows: usize, width: usize) -> String {
    let header: Vec<String> = (0..width).map(|j| format!("c{j}")).collect();
    let mut csv = header.join(",") + "\n";
    for i in 0..rows {
        let row: Vec<String> = (0..width)
            .map(|j| format!("{:.6}", ((i as f64) * 0.2 + j as f64 * 0.7).sin() * 3.0))
            .collect();
        csv.push_str(&row.join(","));
        csv.push('\n');
    }
    csv
}

#[test]
fn supervised_training_saves_reloadable_weights() {
    let config = Config::tiny();
    let csv_path = temp_path("telemetry.csv");
    let log_path = temp_path("train_log.csv");
    let weights_path = temp_path("tiny.bin");
    fs::write(&csv_path, telemetry_csv(24, config.input_width())).unwrap();

    let dataset =
        TelemetryDataset::from_csv(&csv_path, config.cond_features, config.seq_features).unwrap();
    assert_eq!(dataset.rows(), 24);

    let mut rng = StdRng::seed_from_u64(3);
    let model = FlightTransformer::new(&config, &mut rng).unwrap();
    let mut trainer = SupervisedTrainer::new(model, TrainingConfig::tiny()).unwrap();
    let mut logger = TrainingLogger::with_csv(&log_path).unwrap().quiet();
    let loss = trainer.fit(&dataset, None, &mut logger).unwrap();
    assert!(loss.is_finite());
    assert!(trainer.steps() > 0);

    let log = fs::read_to_string(&log_path).unwrap();
    assert_eq!(log.lines().count(), trainer.steps() + 1);

    save_weights(&trainer.model, &weights_path).unwrap();
    save_config(&trainer.model.config, config_path(&weights_path)).unwrap();

    let reloaded_config: Config = load_config(config_path(&weights_path)).unwrap();
    assert_eq!(reloaded_config, config);
    let mut other = FlightTransformer::new(&reloaded_config, &mut StdRng::seed_from_u64(99)).unwrap();
    load_weights(&mut other, &weights_path).unwrap();

    let (x, _) = dataset.window(0, config.seq_len);
    assert_eq!(trainer.model.inference(&x), other.inference(&x));

    for path in [&csv_path, &log_path, &weights_path, &config_path(&weights_path)] {
        fs::remove_file(path).ok();
    }
}

#[test]
fn truncated_weight_file_is_rejected() {
    let path = temp_path("short.bin");
    let mut rng = StdRng::seed_from_u64(5);
    let mut policy = PolicyNet::new(&[6, 8, 8], &mut rng).unwrap();
    let before = policy.parameters()[0].value.clone();

    fs::write(&path, vec![0u8; 8 * 10]).unwrap();
    let err = load_weights(&mut policy, &path).unwrap_err();
    assert!(matches!(err, LoadError::Truncated { .. }));
    assert_eq!(policy.parameters()[0].value, before);

    let err = load_weights(&mut policy, temp_path("missing.bin")).unwrap_err();
    assert!(matches!(err, LoadError::Io(_)));
    fs::remove_file(&path).ok();
}

#[test]
fn reinforce_epochs_emit_parseable_summaries() {
    let config = PolicyConfig::tiny();
    let mut trainer = PolicyTrainer::new(config.clone()).unwrap();
    let mut sim = HoverSim::default();

    for expected in 1..=config.epochs {
        let summary = trainer.train_epoch(&mut sim);
        let parsed: EpochSummary = summary.to_string().parse().unwrap();
        assert_eq!(parsed.iteration, expected);
        assert_eq!(parsed.total, config.epochs);
        assert_eq!(parsed.count, config.rollouts_per_epoch);
        assert!(parsed.mean.is_finite());
    }
    assert!(trainer.best_mean() > 0.0);

    let path = temp_path("policy.bin");
    save_weights(&trainer.policy, &path).unwrap();
    let mut policy = PolicyNet::new(&config.layer_sizes(), &mut StdRng::seed_from_u64(1)).unwrap();
    load_weights(&mut policy, &path).unwrap();
    let state = [0.0, 9.81, 0.0, 0.0, 0.0, 0.0];
    assert_eq!(policy.act(&state), trainer.policy.act(&state));

    let resumed = PolicyTrainer::from_policy(policy, config).unwrap();
    assert_eq!(resumed.policy.sizes(), trainer.policy.sizes());
    fs::remove_file(&path).ok();
}

#[test]
fn controller_drives_simulator_after_warmup() {
    let config = Config {
        d_model: 8,
        n_head: 2,
        n_layers: 1,
        seq_len: 5,
        ..Config::flight()
    };
    let model = FlightTransformer::new(&config, &mut StdRng::seed_from_u64(21)).unwrap();
    let mut controller = TransformerController::new(model).unwrap();
    let mut sim = HoverSim::default();
    let mut obs = sim.reset();
    let mut commands = obs.rotor_speeds;
    let mut issued = 0;

    for _ in 0..12 {
        if let Some(cmd) = controller.command([0.0, 0.0, 0.3], &obs) {
            commands = cmd;
            issued += 1;
        }
        obs = sim.step(&commands).0;
    }
    assert_eq!(issued, 12 - (config.seq_len - 1));

    let input = Tensor::zeros(vec![config.seq_len, config.input_width()]);
    assert_eq!(controller.model().inference(&input).cols(), config.seq_features);
}

/// Hover-like telemetry: small velocities and rates, gravity on y, rotors at 50 ± 1
fn hover_rows(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let t = i as f64;
            let mut row = vec![
                0.3 * (0.1 * t).sin(),
                0.3 * (0.13 * t).cos(),
                0.2 * (0.07 * t).sin(),
            ];
            row.extend((0..3).map(|k| 0.05 * (0.3 * t + k as f64).sin()));
            row.extend([
                0.1 * (0.2 * t).sin(),
                9.81 + 0.1 * (0.25 * t).cos(),
                0.1 * (0.15 * t).cos(),
            ]);
            row.extend((0..4).map(|k| 50.0 + (0.2 * t + k as f64).sin()));
            row
        })
        .collect()
}

#[test]
fn controller_commands_stay_in_trained_rotor_range() {
    let config = Config {
        d_model: 8,
        n_head: 2,
        n_layers: 1,
        seq_len: 4,
        ..Config::flight()
    };
    let dataset =
        TelemetryDataset::from_rows(hover_rows(60), config.cond_features, config.seq_features)
            .unwrap();
    let model = FlightTransformer::new(&config, &mut StdRng::seed_from_u64(4)).unwrap();
    let mut trainer = SupervisedTrainer::new(
        model,
        TrainingConfig {
            epochs: 10,
            learning_rate: 3e-3,
            adaptive_lr: false,
            ..TrainingConfig::tiny()
        },
    )
    .unwrap();
    trainer
        .fit(&dataset, None, &mut TrainingLogger::stdout().quiet())
        .unwrap();

    let weights_path = temp_path("hover.bin");
    save_weights(&trainer.model, &weights_path).unwrap();
    save_config(&trainer.model.config, config_path(&weights_path)).unwrap();
    save_config(&dataset.normalization, normalization_path(&weights_path)).unwrap();

    let loaded_config: Config = load_config(config_path(&weights_path)).unwrap();
    let mut model = FlightTransformer::new(&loaded_config, &mut StdRng::seed_from_u64(0)).unwrap();
    load_weights(&mut model, &weights_path).unwrap();
    let norm: Normalization = load_config(normalization_path(&weights_path)).unwrap();
    for (a, b) in norm.mins.iter().zip(&dataset.normalization.mins) {
        assert!((a - b).abs() < 1e-12);
    }
    let mut controller = TransformerController::new(model)
        .unwrap()
        .with_normalization(norm)
        .unwrap();

    let mut sim = HoverSim::default();
    let mut obs = sim.reset();
    let mut commands = obs.rotor_speeds;
    let mut issued = 0;
    for _ in 0..5 {
        if let Some(cmd) = controller.command([0.0; 3], &obs) {
            for w in cmd {
                assert!((45.0..=55.0).contains(&w), "rotor command {w} far from hover");
            }
            commands = cmd;
            issued += 1;
        }
        obs = sim.step(&commands).0;
    }
    assert_eq!(issued, 5 - (config.seq_len - 1));

    for path in [
        weights_path.clone(),
        config_path(&weights_path),
        normalization_path(&weights_path),
    ] {
        fs::remove_file(path).ok();
    }
}
