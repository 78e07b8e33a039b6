//! Vault membership flow
//!
//! Toggling runs in two steps: flip membership on the hub, then read the
//! authoritative status back and fold it into the local record. A toggle
//! the hub reports as unsuccessful aborts quietly.

use tracing::{debug, info};

use crate::hub::VaultApi;
use crate::library::{Activity, ActivityKind, ActivityLog, Resource, ResourceStore};

/// Flip vault membership for a model version and update the local library.
///
/// The resource is found by `hash` when given, otherwise by the model
/// version id. Returns the updated resource, or `None` when the hub
/// declined or nothing local matched.
pub async fn toggle_vault_item(
    api: &dyn VaultApi,
    resources: &ResourceStore,
    activities: &ActivityLog,
    hash: Option<String>,
    model_version_id: i64,
) -> anyhow::Result<Option<Resource>> {
    let resource = match &hash {
        Some(hash) => resources.lookup(hash).await,
        None => resources.lookup_by_model_version(model_version_id).await,
    };

    let toggle = api.toggle_vault_item(model_version_id).await?;
    if !toggle.success {
        debug!(model_version_id, "Hub declined the vault toggle");
        return Ok(None);
    }

    let status = api.vault_status(&[model_version_id]).await?;
    let vault_id = status
        .first()
        .and_then(|entry| entry.vault_item.as_ref())
        .map(|item| item.vault_id);

    let Some(resource) = resource else {
        debug!(model_version_id, "No local resource for toggled version");
        return Ok(None);
    };

    let updated = resources.set_vault_id(&resource.hash, vault_id).await?;

    let kind = if vault_id.is_some() {
        ActivityKind::AddedVault
    } else {
        ActivityKind::RemovedVault
    };
    activities
        .record(Activity::new(resource.model_name.clone(), kind))
        .await?;

    info!(
        model_version_id,
        in_vault = vault_id.is_some(),
        "Vault membership updated"
    );

    Ok(updated)
}
