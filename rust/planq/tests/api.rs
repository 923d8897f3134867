mod support;

use http::{Method, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use support::{revenue_plan, send, ScriptedProposer, TestEnv, API_KEY};

fn proposer(risk: &str) -> Arc<ScriptedProposer> {
    Arc::new(ScriptedProposer {
        intent: json!({"kpis": ["revenue"], "confidence": 0.8}),
        plan: revenue_plan(risk),
    })
}

#[tokio::test]
#[serial]
async fn health_reports_offline_state() {
    let env = TestEnv::new(None);
    let router = env.router(proposer("low"));

    let (status, body) = send(&router, Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "offline": true}));
}

#[tokio::test]
#[serial]
async fn api_key_is_required_when_configured() {
    let env = TestEnv::new(Some(5)).with_api_key();
    let router = env.router(proposer("low"));

    let (status, body) = send(&router, Method::GET, "/api/runs", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("authentication failed"));

    let (status, _) = send(&router, Method::GET, "/api/runs", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&router, Method::GET, "/api/runs", None, Some(API_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
#[serial]
async fn compile_returns_sql_plan_and_diagnostics() {
    let env = TestEnv::new(None);
    let router = env.router(proposer("low"));

    let payload = json!({
        "plan": {
            "tables": ["sales.orders", "ops.events"],
            "dimensions": ["region"],
            "metrics": [{"name": "Orders", "agg": "count"}],
            "query_cost_risk": "sideways",
        },
        "allowed_tables": ["sales.orders"],
    });
    let (status, body) = send(&router, Method::POST, "/api/compile", Some(payload), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let sql = body["compiled"]["sql"].as_str().unwrap();
    assert_eq!(
        sql,
        "SELECT t0.\"region\" AS \"region\", COUNT(1) AS \"Orders\" FROM \"sales\".\"orders\" AS t0 \
         GROUP BY t0.\"region\" LIMIT 5"
    );
    assert_eq!(body["compiled"]["expected_columns"], json!(["region", "Orders"]));
    assert_eq!(body["plan"]["tables"], json!(["sales.orders"]));
    assert_eq!(
        body["plan_diagnostics"],
        json!(["ignored unknown query_cost_risk 'sideways'"])
    );
    assert!(body["compiled"]["diagnostics"][0]
        .as_str()
        .unwrap()
        .contains("not in the allowlist"));
}

#[tokio::test]
#[serial]
async fn validate_reports_rejections() {
    let env = TestEnv::new(None);
    let router = env.router(proposer("low"));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/validate",
        Some(json!({"sql": "DELETE FROM sales.orders"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["reasons"], json!(["Disallowed keyword detected: delete"]));
    assert!(body.get("normalized_sql").is_none());

    let (_, body) = send(
        &router,
        Method::POST,
        "/api/validate",
        Some(json!({"sql": "select region from sales.orders"})),
        None,
    )
    .await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["limit_injected"], json!(true));
    assert_eq!(body["max_rows"], json!(20));
}

#[tokio::test]
#[serial]
async fn run_lifecycle_over_http() {
    let env = TestEnv::new(Some(12));
    let router = env.router(proposer("high"));

    let (status, halted) = send(
        &router,
        Method::POST,
        "/api/runs",
        Some(json!({"question": "revenue by region"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{halted}");
    assert_eq!(halted["status"], json!("needs_human_review"));
    assert_eq!(halted["review_packet"]["mode"], json!("E_HUMAN_REVIEW"));
    let run_id = halted["run_id"].as_str().unwrap().to_string();

    let (status, reviewed) = send(
        &router,
        Method::POST,
        &format!("/api/runs/{run_id}/review"),
        Some(json!({"plan": {"query_cost_risk": "medium"}})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{reviewed}");
    assert_eq!(reviewed["status"], json!("success"));
    assert_eq!(reviewed["result"]["rows"], json!(5));
    assert_eq!(reviewed["result"]["columns"], json!(["region", "revenue"]));
    let fingerprint = reviewed["result"]["exec_meta"]["fingerprint"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, again) = send(
        &router,
        Method::POST,
        &format!("/api/runs/{run_id}/review"),
        Some(json!({})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{again}");

    let (status, trace) = send(&router, Method::GET, &format!("/api/runs/{run_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trace["status"], json!("success"));
    assert_eq!(trace["nodes"]["sql_generation"]["payload"]["row_cap"], json!(5));
    assert!(trace["nodes"]["human_review__applied"].is_object());

    let (status, runs) = send(&router, Method::GET, "/api/runs", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["run_id"], json!(run_id));

    let (status, cached) = send(
        &router,
        Method::POST,
        &format!("/api/cache/{fingerprint}/query"),
        Some(json!({"columns": ["revenue"], "limit": 2})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{cached}");
    assert_eq!(cached["columns"], json!([{"name": "revenue", "type": "int64"}]));
    assert_eq!(cached["rows"].as_array().unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn unknown_runs_are_not_found() {
    let env = TestEnv::new(None);
    let router = env.router(proposer("low"));

    for path in ["/api/runs/abcdef012345", "/api/runs/..%2Fetc"] {
        let (status, body) = send(&router, Method::GET, path, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}: {body}");
    }

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/runs",
        Some(json!({"question": ""})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn cache_listing_and_clearing() {
    let env = TestEnv::new(Some(8));
    let router = env.router(proposer("low"));

    let (_, run) = send(
        &router,
        Method::POST,
        "/api/runs",
        Some(json!({"question": "revenue by region"})),
        None,
    )
    .await;
    assert_eq!(run["status"], json!("success"), "{run}");
    let key = run["result"]["exec_meta"]["fingerprint"].as_str().unwrap().to_string();

    let (status, listing) = send(&router, Method::GET, "/api/cache", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["entries"][0]["cache_key"], json!(key));
    assert_eq!(listing["snapshots"].as_array().unwrap().len(), 1);

    let (status, _) = send(&router, Method::DELETE, "/api/cache/not-a-key", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, cleared) = send(&router, Method::DELETE, &format!("/api/cache/{key}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared, json!({"catalog_entries": 1, "snapshots": 1}));

    let (status, _) = send(&router, Method::DELETE, &format!("/api/cache/{key}"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &router,
        Method::POST,
        &format!("/api/cache/{key}/query"),
        Some(json!({})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, cleared) = send(&router, Method::DELETE, "/api/cache", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared, json!({"catalog_entries": 0, "snapshots": 0}));
}

#[tokio::test]
#[serial]
async fn diff_compares_two_runs() {
    let env = TestEnv::new(Some(8));
    let router = env.router(proposer("low"));

    let mut ids = Vec::new();
    for large_mode in [false, true] {
        let (_, run) = send(
            &router,
            Method::POST,
            "/api/runs",
            Some(json!({"question": "revenue by region", "large_mode": large_mode})),
            None,
        )
        .await;
        assert_eq!(run["status"], json!("success"), "{run}");
        ids.push(run["run_id"].as_str().unwrap().to_string());
    }

    let (status, diffs) = send(
        &router,
        Method::GET,
        &format!("/api/runs/{}/diff/{}?nodes=sql_generation", ids[0], ids[1]),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{diffs}");
    let paths: Vec<&str> = diffs
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["path"].as_str())
        .collect();
    assert!(paths.contains(&"/sql_generation/row_cap"), "{paths:?}");
    assert!(paths.contains(&"/sql_generation/sql"), "{paths:?}");
    assert!(paths.iter().all(|p| p.starts_with("/sql_generation/")));

    let row_cap = diffs
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["path"] == Value::from("/sql_generation/row_cap"))
        .unwrap();
    assert_eq!(row_cap["left"], json!(5));
    assert_eq!(row_cap["right"], json!(20));
}

#[tokio::test]
#[serial]
async fn recent_queries_list_each_execution() {
    let env = TestEnv::new(Some(8));
    let router = env.router(proposer("low"));

    let (status, empty) = send(&router, Method::GET, "/api/queries", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(empty, json!([]));

    for _ in 0..2 {
        let (_, run) = send(
            &router,
            Method::POST,
            "/api/runs",
            Some(json!({"question": "revenue by region"})),
            None,
        )
        .await;
        assert_eq!(run["status"], json!("success"), "{run}");
    }

    let (status, entries) = send(&router, Method::GET, "/api/queries", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["mode"], json!("source"));
    assert_eq!(entries[1]["mode"], json!("cache"));
    assert_eq!(entries[0]["fingerprint"], entries[1]["fingerprint"]);
    assert!(entries[0]["sql"].as_str().unwrap().ends_with("LIMIT 5"));

    let (_, latest) = send(&router, Method::GET, "/api/queries?limit=1", None, None).await;
    assert_eq!(latest.as_array().unwrap().len(), 1);
    assert_eq!(latest[0]["cache_hit"], json!(true));
}
