//! Switch-related CLI commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, Constraints, ManagedResource, SwitchAccepted, SwitchRecord, SwitchRequest};
use crate::output::{color_status, format_cost_delta, format_timestamp, print_success, print_warning, OutputFormat};

/// Row for the switches table
#[derive(Tabled)]
struct SwitchRow {
    #[tabled(rename = "Record")]
    record_id: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Replacement")]
    replacement: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Cost Δ")]
    cost_delta: String,
    #[tabled(rename = "Created")]
    created: String,
}

/// Row for the resources table
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource_id: String,
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Lifecycle")]
    lifecycle: String,
    #[tabled(rename = "Tenant")]
    tenant: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// Build the tagged variant payload the controller expects. Only the
/// asg_member variant carries a capacity ceiling.
fn variant_payload(variant: &str, capacity_ceiling: usize) -> serde_json::Value {
    if variant == "asg_member" {
        serde_json::json!({ "variant": variant, "capacity_ceiling": capacity_ceiling })
    } else {
        serde_json::json!({ "variant": variant })
    }
}

/// Trigger a manual switch
#[allow(clippy::too_many_arguments)]
pub async fn trigger_switch(
    client: &ApiClient,
    source_resource_id: &str,
    variant: &str,
    capacity_ceiling: usize,
    instance_family: Option<String>,
    architecture: Option<String>,
    min_capacity: u32,
    reason: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let request = SwitchRequest {
        source_resource_id: source_resource_id.to_string(),
        constraints: Constraints {
            instance_family,
            architecture,
            min_capacity,
        },
        variant: variant_payload(variant, capacity_ceiling),
        reason,
    };

    let accepted: SwitchAccepted = client.post("v1/switches", &request).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&accepted)?),
        OutputFormat::Table => {
            print_success(&format!(
                "Switch {} accepted, replacing {} into {}",
                accepted.record_id, source_resource_id, accepted.chosen_pool
            ));
        }
    }
    Ok(())
}

/// Cancel an in-flight switch
pub async fn cancel_switch(client: &ApiClient, source_resource_id: &str) -> Result<()> {
    let _: serde_json::Value = client
        .post_empty(&format!("v1/switches/{}/cancel", source_resource_id))
        .await?;
    print_success(&format!("Cancellation requested for {}", source_resource_id));
    Ok(())
}

/// List switch records
pub async fn list_switches(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let records: Vec<SwitchRecord> = client.get("v1/switches").await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Table => {
            if records.is_empty() {
                print_warning("No switch records found");
                return Ok(());
            }
            let rows: Vec<SwitchRow> = records
                .iter()
                .map(|r| SwitchRow {
                    record_id: truncate_id(&r.record_id),
                    source: r.source_resource_id.clone(),
                    replacement: r
                        .replacement_resource_id
                        .clone()
                        .unwrap_or_else(|| "-".to_string()),
                    phase: color_status(&r.phase_reached),
                    outcome: r
                        .outcome
                        .as_deref()
                        .map(color_status)
                        .unwrap_or_else(|| "-".to_string()),
                    cost_delta: format_cost_delta(r.cost_delta),
                    created: format_timestamp(r.created_at),
                })
                .collect();
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!("\nTotal: {} switches", records.len());
        }
    }
    Ok(())
}

/// List managed resources
pub async fn list_resources(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let resources: Vec<ManagedResource> = client.get("v1/resources").await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
        OutputFormat::Table => {
            if resources.is_empty() {
                print_warning("No managed resources found");
                return Ok(());
            }
            let rows: Vec<ResourceRow> = resources
                .iter()
                .map(|r| ResourceRow {
                    resource_id: r.resource_id.clone(),
                    pool: r.pool.to_string(),
                    lifecycle: r.lifecycle.clone(),
                    tenant: r.tenant_id.clone(),
                    status: color_status(&r.status),
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

fn truncate_id(id: &str) -> String {
    if id.len() > 8 {
        format!("{}…", &id[..8])
    } else {
        id.to_string()
    }
}
