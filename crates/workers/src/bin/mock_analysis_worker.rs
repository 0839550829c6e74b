//! Reference worker speaking the pool's line protocol on stdin/stdout.
//!
//! Answers the restaurant research methods with canned data so the whole
//! pipeline can run end to end without scrapers or models. Requests are
//! handled concurrently. EOF on stdin ends the process with code 0 once
//! in-flight requests are answered.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use workers::{WorkerRequest, WorkerResponse};

const COMPETITOR_NAMES: [&str; 8] = [
    "Blue Door Bistro",
    "Casa Verde",
    "The Copper Pot",
    "Little Saigon Kitchen",
    "Nonna's Table",
    "Smoke & Oak",
    "Sakura House",
    "Harbor Grill",
];

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let ready = json!({"event": "log", "level": "info", "message": "mock-analysis-worker ready"});
    let _ = out_tx.send(ready.to_string()).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("ignoring malformed request: {e}");
                continue;
            }
        };
        let out = out_tx.clone();
        tokio::spawn(async move {
            let response = handle(request).await;
            if let Ok(line) = serde_json::to_string(&response) {
                let _ = out.send(line).await;
            }
        });
    }

    eprintln!("stdin closed, finishing in-flight requests");
    drop(out_tx);
    writer.await.map_err(std::io::Error::other)?
}

async fn handle(request: WorkerRequest) -> WorkerResponse {
    let id = request.id;
    match dispatch(&request.method, &request.params).await {
        Ok(result) => WorkerResponse::success(id, result),
        Err(message) => WorkerResponse::failure(id, message),
    }
}

async fn dispatch(method: &str, params: &Value) -> Result<Value, String> {
    match method {
        "echo" => Ok(params.clone()),
        "sleep" => {
            let ms = params["ms"].as_u64().unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        }
        "fail" => Err(params["message"]
            .as_str()
            .unwrap_or("requested failure")
            .to_string()),
        "crash" => {
            let code = params["code"].as_i64().unwrap_or(1) as i32;
            eprintln!("crashing with code {code}");
            std::process::exit(code);
        }
        "collect.listings" => Ok(collect_listings(params)),
        "collect.reviews" => Ok(collect_reviews(params)),
        "menu.analyze" => Ok(menu_analysis(params)),
        "pricing.analyze" => Ok(pricing_analysis(params)),
        "sentiment.analyze" => Ok(sentiment_analysis(params)),
        "report.compile" => Ok(compile_report(params)),
        other => Err(format!("unknown method: {other}")),
    }
}

fn competitor_count(params: &Value) -> usize {
    let limit = params["target"]["competitor_limit"].as_u64().unwrap_or(5) as usize;
    limit.clamp(1, COMPETITOR_NAMES.len())
}

fn collect_listings(params: &Value) -> Value {
    let location = params["target"]["location"].as_str().unwrap_or("unknown");
    let radius = params["target"]["radius_km"].as_f64().unwrap_or(5.0);
    let listings: Vec<Value> = COMPETITOR_NAMES
        .iter()
        .take(competitor_count(params))
        .enumerate()
        .map(|(i, name)| {
            json!({
                "name": name,
                "distance_km": ((i as f64 + 1.0) * radius / 8.0 * 100.0).round() / 100.0,
                "rating": 3.5 + (i % 4) as f64 * 0.4,
                "price_level": 1 + i % 4,
            })
        })
        .collect();
    json!({ "location": location, "listings": listings })
}

fn collect_reviews(params: &Value) -> Value {
    let reviews: Vec<Value> = COMPETITOR_NAMES
        .iter()
        .take(competitor_count(params))
        .enumerate()
        .map(|(i, name)| {
            json!({
                "competitor": name,
                "review_count": 40 + i * 17,
                "positive_share": 0.55 + (i % 3) as f64 * 0.1,
            })
        })
        .collect();
    json!({ "reviews": reviews })
}

fn upstream_stages(params: &Value) -> Vec<String> {
    params["upstream"]
        .as_array()
        .map(|artifacts| {
            artifacts
                .iter()
                .filter_map(|a| a["stage_id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn menu_analysis(params: &Value) -> Value {
    let cuisine = params["target"]["cuisine"].as_str().unwrap_or("mixed");
    json!({
        "cuisine": cuisine,
        "popular_categories": ["small plates", "seasonal mains", "desserts"],
        "menu_gaps": ["vegan mains", "late-night menu"],
        "average_items": 34,
        "based_on": upstream_stages(params),
    })
}

fn pricing_analysis(params: &Value) -> Value {
    json!({
        "average_main_price": 21.5,
        "price_band": { "low": 14.0, "high": 32.0 },
        "recommended_position": "mid-market",
        "based_on": upstream_stages(params),
    })
}

fn sentiment_analysis(params: &Value) -> Value {
    json!({
        "overall_score": 0.68,
        "themes": {
            "positive": ["friendly staff", "fresh ingredients"],
            "negative": ["slow service", "noise"],
        },
        "based_on": upstream_stages(params),
    })
}

fn compile_report(params: &Value) -> Value {
    let restaurant = params["target"]["restaurant"].as_str().unwrap_or("unknown");
    let sections = upstream_stages(params);
    json!({
        "title": format!("Competitive landscape for {restaurant}"),
        "sections": sections,
        "summary": "Demand is strong for mid-market dining with faster service.",
    })
}
