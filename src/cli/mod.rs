//! Command-line interface

mod commands;

pub use commands::{Cli, Commands};

use crate::config::Config;
use crate::core::aggregate::AggregateState;
use crate::core::rating::EntityId;
use crate::db::RatingsDB;
use crate::trigger::dispatcher::DispatchReport;
use anyhow::Context;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

impl Cli {
    /// Configuration from `--config` and the environment, with flags on top
    pub fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(policy) = self.fold_policy {
            config.fold_policy = policy;
        }
        if self.dedup {
            config.dedup_replays = true;
        }
        Ok(config)
    }
}

/// Run the selected command to completion
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config()?;
    let mut db = RatingsDB::open(&config).await.context("failed to open ratings database")?;

    match cli.command {
        Commands::Rate { entity, rater, value } => {
            let path = db.submit_rating(&entity, &rater, value).await?;
            finish(&mut db).await?;
            let state = db.aggregate(&path.entity_id).await?;
            println!("{}", describe(&path.entity_id, &state));
        }
        Commands::Show { entity } => {
            finish(&mut db).await?;
            match entity {
                Some(entity) => {
                    let entity_id = EntityId::new(entity)?;
                    let state = db.aggregate(&entity_id).await?;
                    println!("{}", describe(&entity_id, &state));
                }
                None => {
                    for (entity_id, state) in db.aggregates().await? {
                        println!("{}", describe(&entity_id, &state));
                    }
                }
            }
        }
        Commands::Ratings { entity } => {
            finish(&mut db).await?;
            let entity_id = EntityId::new(entity)?;
            for (rater, record) in db.ratings_for(&entity_id).await? {
                println!("{rater}\t{}\t{}", record.value, record.written_at);
            }
        }
        Commands::Replay { file } => {
            let payloads = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut rejected = 0usize;
            for (line_no, line) in payloads.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match db.deliver_change(line).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => {
                        warn!(line = line_no + 1, error = %e, "Rejected document change");
                        rejected += 1;
                    }
                }
            }
            let report = finish(&mut db).await?;
            println!(
                "replayed {} changes ({} applied, {} duplicate, {} deletes ignored, {} rejected)",
                report.delivered, report.applied, report.duplicates, report.ignored, rejected
            );
            for (entity_id, state) in db.aggregates().await? {
                println!("{}", describe(&entity_id, &state));
            }
        }
        Commands::Simulate { entity, raters } => {
            let entity_id = EntityId::new(entity)?;
            let values: Vec<f64> = {
                let mut rng = rand::rng();
                (0..raters).map(|_| f64::from(rng.random_range(1..=3u8))).collect()
            };

            let db = Arc::new(db);
            let mut tasks = tokio::task::JoinSet::new();
            for (i, value) in values.iter().copied().enumerate() {
                let db = db.clone();
                let entity = entity_id.to_string();
                tasks.spawn(async move { db.submit_rating(&entity, &format!("sim-{i}"), value).await });
            }
            while let Some(submitted) = tasks.join_next().await {
                submitted??;
            }

            let mut db = Arc::into_inner(db).context("simulated raters still running")?;
            let report = finish(&mut db).await?;
            let state = db.aggregate(&entity_id).await?;
            println!("{}", describe(&entity_id, &state));
            if !values.is_empty() {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                println!("true mean {mean:.4} over {} raters, {} redeliveries", values.len(), report.redeliveries);
            }
        }
    }

    Ok(())
}

/// Drain pending aggregation, failing if any write could not be folded in
async fn finish(db: &mut RatingsDB) -> anyhow::Result<DispatchReport> {
    let report = db.close().await?;
    if let Some(failure) = report.failed.first() {
        anyhow::bail!(
            "{} of {} writes were not aggregated; first: {} ({})",
            report.failed.len(),
            report.delivered,
            failure.path,
            failure.error
        );
    }
    Ok(report)
}

fn describe(entity_id: &EntityId, state: &AggregateState) -> String {
    match state.record() {
        Some(record) => format!(
            "{entity_id}\tavgRating={:.4}\tnumRatings={}",
            record.avg_rating, record.num_ratings
        ),
        None => format!("{entity_id}\tno ratings"),
    }
}
