//! Risk ledger CLI commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, Pool, PoisonEntry};
use crate::output::{format_timestamp, print_success, print_warning, OutputFormat};

/// Row for the poisoned pools table
#[derive(Tabled)]
struct RiskRow {
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Interruptions")]
    interruptions: u32,
    #[tabled(rename = "Triggered By")]
    tenant: String,
    #[tabled(rename = "Poisoned At")]
    poisoned_at: String,
    #[tabled(rename = "Expires")]
    expires: String,
}

/// List currently poisoned pools
pub async fn list_risk(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let entries: Vec<PoisonEntry> = client.get("v1/risk").await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            if entries.is_empty() {
                print_warning("No poisoned pools");
                return Ok(());
            }
            let rows: Vec<RiskRow> = entries
                .iter()
                .map(|e| RiskRow {
                    pool: e.pool.to_string(),
                    interruptions: e.interruption_count,
                    tenant: e.triggering_tenant_id.clone(),
                    poisoned_at: format_timestamp(e.poisoned_at),
                    expires: format_timestamp(e.poison_expires_at),
                })
                .collect();
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
    }
    Ok(())
}

/// Force-expire a pool's poison flag
pub async fn expire_pool(
    client: &ApiClient,
    region: &str,
    zone: &str,
    resource_type: &str,
) -> Result<()> {
    let pool = Pool {
        region: region.to_string(),
        zone: zone.to_string(),
        resource_type: resource_type.to_string(),
    };
    let _: serde_json::Value = client.post("v1/risk/expire", &pool).await?;
    print_success(&format!("Poison flag expired for {}", pool));
    Ok(())
}
