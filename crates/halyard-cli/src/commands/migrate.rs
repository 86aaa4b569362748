//! Migrate command - create the Postgres tables.

use anyhow::{Context, Result};

use halyard_core::tx::postgres::{PgDatabase, PgPoolSettings};

use crate::{Config, OutputFormat};

/// Schemas applied by `halyard migrate`, in order.
pub const SCHEMAS: [(&str, &str); 2] = [
    ("auth", halyard_auth::store::postgres::SCHEMA),
    ("events", halyard_notify::ledger::postgres::SCHEMA),
];

/// Execute the migrate command.
///
/// # Errors
///
/// Returns an error if the database URL is missing, the database cannot be
/// reached, or a schema fails to apply.
pub async fn execute(config: &Config) -> Result<()> {
    let database = PgDatabase::connect(config.require_database_url()?, PgPoolSettings::default())
        .await
        .context("failed to connect to database")?;

    for (name, schema) in SCHEMAS {
        database
            .apply_schema(schema)
            .await
            .with_context(|| format!("failed to apply {name} schema"))?;
        tracing::info!(schema = name, "schema applied");
    }

    match config.format {
        OutputFormat::Json => {
            let names: Vec<&str> = SCHEMAS.iter().map(|(name, _)| *name).collect();
            println!("{}", serde_json::json!({ "applied": names }));
        }
        OutputFormat::Text => println!("Applied {} schemas", SCHEMAS.len()),
    }
    Ok(())
}
