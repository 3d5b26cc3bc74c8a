//! Model gate CLI commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, MlModel};
use crate::output::{color_status, format_timestamp, print_success, print_warning, OutputFormat};

/// Row for the models table
#[derive(Tabled)]
struct ModelRow {
    #[tabled(rename = "Model")]
    model_id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Active")]
    active: String,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "Trained")]
    trained: String,
}

/// List registered risk models
pub async fn list_models(client: &ApiClient, active_only: bool, format: OutputFormat) -> Result<()> {
    let models: Vec<MlModel> = client.get("v1/models").await?;
    let filtered: Vec<_> = models
        .into_iter()
        .filter(|m| !active_only || m.is_active_production)
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&filtered)?),
        OutputFormat::Table => {
            if filtered.is_empty() {
                print_warning("No models found");
                return Ok(());
            }
            let rows: Vec<ModelRow> = filtered
                .iter()
                .map(|m| ModelRow {
                    model_id: m.model_id.clone(),
                    version: m.version.clone(),
                    status: color_status(&m.status),
                    active: if m.is_active_production { "yes" } else { "" }.to_string(),
                    accuracy: m
                        .validation_accuracy
                        .map(|a| format!("{:.0}%", a * 100.0))
                        .unwrap_or_else(|| "-".to_string()),
                    trained: format_timestamp(m.trained_at),
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

/// Force-activate a graduated model as the production scorer
pub async fn activate_model(client: &ApiClient, model_id: &str) -> Result<()> {
    let model: MlModel = client
        .post_empty(&format!("v1/models/{}/activate", model_id))
        .await?;
    print_success(&format!(
        "Model {} ({}) is now the active production model",
        model.model_id, model.version
    ));
    Ok(())
}
