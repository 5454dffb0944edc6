//! Status API — read-only JSON snapshots for dashboards.
//!
//! Two endpoints, both snapshots taken under the engine lock:
//! - `/sync.json`: receiver -> peers -> [n_obs, jitter_ns, rate_ppm]
//! - `/coverage.json`: receiver -> bounding box of reference sightings

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::ingest::SharedEngine;

pub fn build_router(engine: SharedEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sync.json", get(sync_json))
        .route("/coverage.json", get(coverage_json))
        .route("/health", get(health))
        .layer(cors)
        .with_state(engine)
}

async fn sync_json(State(engine): State<SharedEngine>) -> Json<Value> {
    Json(engine.lock().unwrap().sync_snapshot())
}

async fn coverage_json(State(engine): State<SharedEngine>) -> Json<Value> {
    Json(engine.lock().unwrap().coverage_snapshot())
}

async fn health(State(engine): State<SharedEngine>) -> Json<Value> {
    let engine = engine.lock().unwrap();
    Json(json!({
        "receivers": engine.receiver_count(),
        "pairs": engine.sync().len(),
        "anchor": engine.anchor().map(|id| id.0),
        "fixes": engine.fixes_emitted,
        "fixes_gated": engine.fixes_gated,
        "solve_failures": {
            "poor_geometry": engine.solver_poor_geometry,
            "not_converged": engine.solver_not_converged,
            "high_residual": engine.solver_high_residual,
            "out_of_bounds": engine.solver_out_of_bounds,
        },
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use mlat_core::config::MlatParams;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_router_builds() {
        let engine = Arc::new(Mutex::new(Engine::new(MlatParams::default())));
        let _router = build_router(engine);
    }

    #[tokio::test]
    async fn test_empty_snapshots() {
        let engine = Arc::new(Mutex::new(Engine::new(MlatParams::default())));
        let Json(sync) = sync_json(State(engine.clone())).await;
        assert!(sync.as_object().unwrap().is_empty());
        let Json(cov) = coverage_json(State(engine)).await;
        assert!(cov.as_object().unwrap().is_empty());
    }
}
