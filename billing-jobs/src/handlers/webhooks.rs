use crate::startup::AppState;
use crate::webhooks::{WebhookSummary, SIGNATURE_HEADER};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: WebhookSummary,
}

/// Payment provider callbacks. The body is read raw so the signature covers
/// exactly the bytes that were sent.
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let summary = state.webhooks.handle_webhook(signature, &body).await?;
    Ok(Json(WebhookResponse {
        success: true,
        summary,
    }))
}
