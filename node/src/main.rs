//! Tally Node - offline-first local store for point-of-sale data.
//!
//! Opens the store for the configured branch, keeps backups and retention
//! running in the background and shuts down cleanly on Ctrl-C.

use tally_engine::{CollectionSchema, FieldDef, FieldType, Schema, SchemaVersion};
use tally_node::config::DEFAULT_SENSITIVE_FIELD;
use tally_node::{
    BackupEngine, BackupOptions, Config, RetentionManager, Scheduler, Session,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Current store schema version.
const SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0);

fn business_schema() -> Schema {
    Schema::new(SCHEMA_VERSION)
        .with_collection(
            CollectionSchema::new(
                "invoices",
                vec![
                    FieldDef::required("number", FieldType::String),
                    FieldDef::optional("total", FieldType::Float),
                    FieldDef::optional("customerId", FieldType::String),
                ],
            )
            .with_unique("number")
            .with_index("customerId"),
        )
        .with_collection(CollectionSchema::new(
            "customers",
            vec![FieldDef::required("name", FieldType::String)],
        ))
        .with_collection(
            CollectionSchema::new(
                "users",
                vec![FieldDef::required("username", FieldType::String)],
            )
            .with_unique("username")
            .with_sensitive(DEFAULT_SENSITIVE_FIELD),
        )
        .with_collection(
            CollectionSchema::new(
                "cash_sessions",
                vec![FieldDef::optional("openedAt", FieldType::Int)],
            )
            .with_index("userId"),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        branch = %config.branch,
        "Starting Tally Node"
    );

    let key_provider = config.key_provider();
    let session = Session::open(config.clone(), business_schema(), key_provider).await?;

    let retention = RetentionManager::new(
        session.clone(),
        config.retention_policy(),
        config.changelog_retention,
    );
    match retention.run().await {
        Ok(report) => tracing::info!(
            deleted = report.deleted.len(),
            adopted = report.adopted.len(),
            orphans = report.orphans.len(),
            "Initial retention pass finished"
        ),
        Err(e) => tracing::warn!(error = %e, "Initial retention pass failed"),
    }

    let mut scheduler = Scheduler::new(session.clone());
    scheduler.every_retention(retention.clone(), config.retention_interval);
    if let Some(period) = config.auto_backup_interval {
        let options = BackupOptions {
            encrypt: config.backup_encrypt,
            key: None,
        };
        scheduler.every_backup(BackupEngine::new(session.clone(), retention), period, options);
    }

    tracing::info!(node_id = %session.node_id(), tasks = scheduler.len(), "Node ready");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}
