use anyhow::Context;
use crossbeam_channel::unbounded;
use rw_scheduler::SchedulerConfig;
use rw_tuner::{
    RefitPolicy, SimulatedBackend, SimulatedBackendConfig, StoppingCriterion, Tuner, TunerConfig,
    TunerEvent,
};
use rw_types::{Configuration, ConfigurationSpace, ParameterValue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Validation loss of a toy network after `epoch` epochs.
fn validation_loss(config: &Configuration, epoch: u64) -> f64 {
    let lr = match config.get("learning_rate") {
        Some(ParameterValue::Float(v)) => *v,
        _ => 1e-3,
    };
    let layers = match config.get("layers") {
        Some(ParameterValue::Int(v)) => *v as f64,
        _ => 2.0,
    };
    let optimizer_bonus = match config.get("optimizer") {
        Some(ParameterValue::Json(v)) if v == "adam" => 0.05,
        _ => 0.0,
    };

    let asymptote = 0.1 + 0.08 * (lr.log10() + 2.5).powi(2) + 0.02 * (layers - 4.0).abs()
        - optimizer_bonus;
    let speed = 0.3 + 2.0 * lr.sqrt();
    asymptote + (1.0 - asymptote) * (-(speed * epoch as f64)).exp()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => TunerConfig::from_path(&path)
            .with_context(|| format!("loading tuner config from {path}"))?,
        None => TunerConfig::default()
            .with_workers(4)
            .with_seed(2024)
            .with_scheduler(
                SchedulerConfig::default()
                    .with_resources(1, 27)
                    .with_brackets(2),
            )
            .with_refit(RefitPolicy {
                min_new_observations: 20,
                max_interval_secs: 30.0,
            })
            .with_stopping(StoppingCriterion::max_trials(40).with_wallclock(120.0))
            .with_poll_interval_ms(0),
    };

    let space = ConfigurationSpace::new()
        .add_log_float("learning_rate", 1e-5, 1e-1)
        .add_int("layers", 1, 8)
        .add_choice(
            "optimizer",
            vec![serde_json::json!("sgd"), serde_json::json!("adam")],
        );

    let backend = SimulatedBackend::new(
        SimulatedBackendConfig {
            r_min: config.scheduler.r_min,
            r_max: config.scheduler.r_max,
            noise_std: 0.01,
            seed: config.seed,
            failure_rate: 0.002,
            ..SimulatedBackendConfig::default()
        },
        validation_loss,
    );

    let (tx, rx) = unbounded();
    let mut tuner = Tuner::new(config, space, backend)?.with_event_sender(tx);
    let summary = tuner.run().await?;

    let refits = rx
        .try_iter()
        .filter(|e| matches!(e, TunerEvent::RefitCompleted { .. }))
        .count();

    println!("outcome:       {:?}", summary.outcome);
    println!("trials:        {:?}", summary.trials);
    println!("observations:  {}", summary.num_observations);
    println!("epochs used:   {}", summary.cost);
    println!("refits:        {} ok, {} failed", refits, summary.failed_refits);
    if let Some(best) = &summary.best {
        println!(
            "best loss:     {:.4} (trial {} at epoch {})",
            best.value, best.trial_id, best.resource
        );
        println!("best config:   {}", serde_json::to_string(&best.config)?);
    }
    for rung in &summary.rungs {
        println!(
            "bracket {} rung {:>3}: {:>3} recorded, {:>2} promoted, best {:?}",
            rung.bracket, rung.resource, rung.recorded, rung.promoted, rung.best
        );
    }
    Ok(())
}
