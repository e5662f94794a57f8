//! Health check endpoint

use axum::Json;
use axum::extract::State;

use crate::engine::Engine;

pub async fn health_check(State(engine): State<Engine>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tally-server",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": engine.config.environment,
        "marketplaces": engine.adapters.marketplace_codes(),
        "erp": engine.adapters.erp_code(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestEngine;

    #[tokio::test]
    async fn test_health_lists_registered_adapters() {
        let t = TestEngine::new().await;
        let Json(body) = health_check(State(t.engine.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["marketplaces"], serde_json::json!(["COUPANG"]));
        assert_eq!(body["erp"], "ECOUNT");
    }
}
