use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::routes::identity::AdminActor;
use crate::services::ledger::LedgerRepair;
use crate::services::reconciliation::ReconciliationReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ledger/repair", post(repair_ledger))
        .route("/ledger/reconcile", post(reconcile_ledgers))
}

#[derive(Debug, Serialize)]
pub struct RepairResponse {
    pub repaired: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileBody {
    /// Limit the sweep to one school.
    pub school_id: Option<String>,
    #[serde(default)]
    pub repair: bool,
}

/// Re-apply the missing half reported by a `PARTIAL_LEDGER_WRITE` error.
async fn repair_ledger(
    State(state): State<Arc<AppState>>,
    AdminActor(actor): AdminActor,
    Json(repair): Json<LedgerRepair>,
) -> AppResult<Json<RepairResponse>> {
    tracing::info!(
        "Admin {} requested ledger repair: {}",
        actor.account_id,
        repair.describe()
    );
    state.ledger.repair(&repair).await?;
    Ok(Json(RepairResponse {
        repaired: repair.describe(),
    }))
}

async fn reconcile_ledgers(
    State(state): State<Arc<AppState>>,
    AdminActor(_actor): AdminActor,
    Json(body): Json<ReconcileBody>,
) -> AppResult<Json<Vec<ReconciliationReport>>> {
    let reports = match body.school_id.as_deref() {
        Some(school_id) => vec![
            state
                .reconciler
                .reconcile_school(school_id, body.repair)
                .await?,
        ],
        None => state.reconciler.reconcile_all(body.repair).await?,
    };
    Ok(Json(reports))
}
