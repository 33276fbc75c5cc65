//! Chat and command endpoints.
//!
//! `/chat/command` classifies free text: greetings, capabilities, and
//! out-of-scope input get message-only responses and create no run; trade
//! intents create a PENDING confirmation; `CONFIRM` with a confirmation id
//! goes through the confirmation gate. `/commands/execute` is the
//! structured path for programmatic clients.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::confirmations::confirm_impl;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::intent::{classify, parse_trade, CommandKind, ParsedTrade, DEFAULT_BUDGET_USD};
use crate::middleware::{AuthContext, RequestId};
use crate::news::analyze_headline_sentiment;
use crate::orchestrator::runner;

#[derive(Debug, Deserialize)]
pub struct ChatCommandRequest {
    pub text: String,
    pub conversation_id: Option<String>,
    pub confirmation_id: Option<String>,
    pub budget_usd: Option<f64>,
    pub mode: Option<String>,
}

pub async fn chat_command(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ChatCommandRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let text = sanitize(&req.text);
    if text.is_empty() {
        return Err(ApiError::bad_request("EMPTY_COMMAND", "Command text is empty", request_id.as_str()));
    }

    // Explicit confirm from the chat surface.
    if let Some(confirmation_id) = &req.confirmation_id {
        if text.to_uppercase().contains("CONFIRM") {
            let result = confirm_impl(
                &state,
                &auth.tenant_id,
                &auth.user_id,
                request_id.as_str(),
                confirmation_id,
            )
            .await?;
            return Ok(Json(result));
        }
    }

    match classify(&text) {
        CommandKind::Greeting => Ok(Json(message_only(
            "GREETING",
            "Hi! I can execute paper trades, analyze your portfolio, and replay past runs.",
            Some(vec!["Buy $10 of BTC", "analyze my portfolio"]),
        ))),
        CommandKind::Capabilities => Ok(Json(message_only(
            "CAPABILITIES",
            "I can: buy or sell crypto with a dollar budget, pick the most profitable asset over a window, analyze your portfolio, and replay past runs deterministically.",
            Some(vec!["buy the most profitable crypto of last 24h for $10", "sell $2 of BTC"]),
        ))),
        CommandKind::OutOfScope => Ok(Json(message_only(
            "OUT_OF_SCOPE",
            "That is outside what I can do. I handle trading commands, portfolio analysis, and run replays.",
            Some(vec!["Buy $10 of BTC"]),
        ))),
        CommandKind::Analytics => Ok(Json(message_only(
            "ANALYTICS",
            "Use GET /analytics/performance?window=7d for performance data.",
            None,
        ))),
        CommandKind::PortfolioAnalysis => {
            let portfolio = state
                .deps
                .portfolio()
                .latest_state(&auth.tenant_id)
                .await
                .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
            Ok(Json(json!({
                "run_id": null,
                "intent": "PORTFOLIO_ANALYSIS",
                "status": "COMPLETED",
                "content": format!(
                    "Portfolio value ${:.2}: cash ${:.2}, {} open positions.",
                    portfolio.total_value_usd,
                    portfolio.balances.get("USD").copied().unwrap_or(0.0),
                    portfolio.positions.len()
                ),
                "portfolio": {
                    "balances": portfolio.balances,
                    "positions": portfolio.positions,
                    "total_value_usd": portfolio.total_value_usd,
                },
            })))
        }
        CommandKind::Replay { source_run_id } => {
            start_replay(&state, &auth, request_id.as_str(), &source_run_id, &text).await
        }
        CommandKind::Trade(parsed) => {
            let mut parsed = *parsed;
            if let Some(budget) = req.budget_usd {
                parsed.intent.budget_usd = budget;
            }
            create_trade_confirmation(&state, &auth, request_id.as_str(), &req, parsed).await
        }
    }
}

async fn create_trade_confirmation(
    state: &AppState,
    auth: &AuthContext,
    request_id: &str,
    req: &ChatCommandRequest,
    parsed: ParsedTrade,
) -> Result<Json<Value>, ApiError> {
    let mode = req
        .mode
        .clone()
        .unwrap_or_else(|| state.deps.settings.execution_mode_default.clone())
        .to_uppercase();
    let intent = &parsed.intent;

    // Pre-compute the decision lock for auto-selected assets so downstream
    // nodes cannot re-pick a different symbol later.
    let selection_result = if parsed.is_most_profitable {
        select_top_performer(state, &intent.universe, intent.lookback_hours).await
    } else {
        None
    };
    let locked_product_id = if let Some(selection) = &selection_result {
        selection
            .get("selected_symbol")
            .and_then(|s| s.as_str())
            .map(|s| format!("{s}-USD"))
    } else {
        parsed.asset.as_ref().map(|a| format!("{a}-USD"))
    };

    let insight = build_insight(state, locked_product_id.as_deref(), &selection_result).await;
    let proposal = json!({
        "side": intent.side.clone(),
        "asset": parsed.asset.clone().unwrap_or_else(|| "AUTO".to_string()),
        "amount_usd": intent.budget_usd,
        "mode": mode.clone(),
        "is_most_profitable": parsed.is_most_profitable,
        "lookback_hours": intent.lookback_hours,
        "news_enabled": true,
        "asset_class": "CRYPTO",
        "locked_product_id": locked_product_id.clone(),
        "selection_result": selection_result,
    });

    let confirmation_id = state
        .deps
        .confirmations()
        .create_pending(
            &auth.tenant_id,
            &auth.user_id,
            req.conversation_id.as_deref(),
            &proposal.to_string(),
            insight.as_ref().map(|i| i.to_string()).as_deref(),
            &mode,
            state.deps.settings.confirmation_ttl_seconds,
        )
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;

    let asset_label = locked_product_id
        .clone()
        .unwrap_or_else(|| "the most profitable crypto".to_string());
    info!(
        conf = %confirmation_id,
        tenant = %auth.tenant_id,
        mode = %mode,
        asset = %asset_label,
        "created pending trade confirmation"
    );
    let mut response = json!({
        "confirmation_id": confirmation_id,
        "intent": "TRADE_CONFIRMATION_PENDING",
        "content": format!(
            "Ready to {} ${:.2} of {} in {} mode. Confirm to execute.",
            intent.side.to_lowercase(),
            intent.budget_usd,
            asset_label,
            mode
        ),
    });
    if let Some(insight) = insight {
        response["financial_insight"] = insight;
    }
    Ok(Json(response))
}

async fn start_replay(
    state: &AppState,
    auth: &AuthContext,
    request_id: &str,
    source_run_id: &str,
    command_text: &str,
) -> Result<Json<Value>, ApiError> {
    let source = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, source_run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    if source.is_none() {
        return Err(ApiError::not_found(
            format!("Source run {source_run_id} not found"),
            request_id,
        ));
    }
    let run_id = runner::create_run(&state.deps, &auth.tenant_id, "REPLAY", Some(source_run_id), None)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    // Carry the source intent so the replay researches the same universe.
    if let Some(source) = source {
        state
            .deps
            .runs()
            .set_trade_fields(
                &run_id,
                command_text,
                source.metadata_json.as_deref().unwrap_or("{}"),
                source.parsed_intent_json.as_deref().unwrap_or("{}"),
                "{}",
                source.news_enabled,
                &source.asset_class,
                source.locked_product_id.as_deref(),
                None,
            )
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
    }
    let trace_id = state
        .deps
        .runs()
        .get(&run_id)
        .await
        .ok()
        .flatten()
        .and_then(|r| r.trace_id);
    runner::spawn_run_worker(state.deps.clone(), run_id.clone());
    Ok(Json(json!({
        "run_id": run_id,
        "command_type": "replay",
        "trace_id": trace_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: String,
    #[serde(default)]
    pub execution_mode: Option<String>,
    pub source_run_id: Option<String>,
}

/// Structured command path for programmatic clients.
pub async fn execute_command(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ExecuteCommandRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let command = sanitize(&req.command);
    if command.is_empty() || command.len() > 5000 {
        return Err(ApiError::bad_request("INVALID_COMMAND", "Command must be 1-5000 characters", request_id.as_str()));
    }
    let execution_mode = req
        .execution_mode
        .clone()
        .unwrap_or_else(|| "PAPER".to_string())
        .to_uppercase();
    if !matches!(execution_mode.as_str(), "PAPER" | "LIVE" | "REPLAY") {
        return Err(ApiError::bad_request("INVALID_EXECUTION_MODE", format!("Unsupported execution mode {execution_mode}"), request_id.as_str()));
    }

    if let CommandKind::Replay { source_run_id } = classify(&command) {
        return start_replay(&state, &auth, request_id.as_str(), &source_run_id, &command).await;
    }
    if let Some(source_run_id) = &req.source_run_id {
        if execution_mode == "REPLAY" {
            return start_replay(&state, &auth, request_id.as_str(), source_run_id, &command).await;
        }
    }
    if execution_mode == "REPLAY" {
        return Err(ApiError::bad_request(
            "MISSING_SOURCE_RUN",
            "source_run_id is required when execution_mode is REPLAY",
            request_id.as_str(),
        ));
    }
    if command.contains("show") && command.contains("performance") {
        return Ok(Json(json!({
            "run_id": null,
            "command_type": "analytics",
            "message": "Use GET /analytics/performance?window=7d for performance data",
        })));
    }

    if execution_mode == "LIVE" && !state.deps.settings.enable_live_trading {
        return Err(ApiError::forbidden(
            "LIVE_DISABLED",
            "LIVE trading is disabled. Set ENABLE_LIVE_TRADING=true to enable.",
            request_id.as_str(),
        ));
    }

    let parsed = parse_trade(&command, DEFAULT_BUDGET_USD);
    let mut notional = parsed.intent.budget_usd;
    if execution_mode == "LIVE" {
        // Hard cap on live orders regardless of the parsed budget.
        notional = notional.min(state.deps.settings.live_max_notional_usd);
    }

    let run_id = runner::create_run(&state.deps, &auth.tenant_id, &execution_mode, None, None)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    let mut intent = parsed.intent.clone();
    intent.budget_usd = notional;
    let locked = parsed.asset.as_ref().map(|a| format!("{a}-USD"));
    state
        .deps
        .runs()
        .set_trade_fields(
            &run_id,
            &command,
            &json!({"intent": "TRADE_EXECUTION", "source": "commands_api"}).to_string(),
            &serde_json::to_string(&intent).unwrap_or_default(),
            "{}",
            true,
            "CRYPTO",
            locked.as_deref(),
            None,
        )
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    let trace_id = state
        .deps
        .runs()
        .get(&run_id)
        .await
        .ok()
        .flatten()
        .and_then(|r| r.trace_id);
    runner::spawn_run_worker(state.deps.clone(), run_id.clone());
    Ok(Json(json!({
        "run_id": run_id,
        "command_type": "trade",
        "trace_id": trace_id,
    })))
}

/// Rank the universe by return over the lookback and pick the winner.
/// Best effort: any failure just means no pre-selection.
async fn select_top_performer(
    state: &AppState,
    universe: &[String],
    lookback_hours: i64,
) -> Option<Value> {
    let mut best: Option<(String, f64)> = None;
    for product_id in universe {
        match state.deps.market.get_candles(product_id, lookback_hours).await {
            Ok(candles) => {
                let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
                    continue;
                };
                if first.close <= 0.0 {
                    continue;
                }
                let ret = (last.close - first.close) / first.close;
                if best.as_ref().map(|(_, b)| ret > *b).unwrap_or(true) {
                    best = Some((product_id.clone(), ret));
                }
            }
            Err(e) => {
                warn!(product_id = %product_id, error = %e, "pre-selection candle fetch failed");
            }
        }
    }
    let (product_id, ret) = best?;
    let base = product_id.split('-').next().unwrap_or(&product_id).to_string();
    let why = format!(
        "{base} had the highest return ({:.2}%) over the last {lookback_hours}h",
        ret * 100.0
    );
    Some(json!({
        "selected_symbol": base,
        "selected_return_pct": ret * 100.0,
        "window_description": format!("last {lookback_hours}h"),
        "why_explanation": why,
    }))
}

/// Small pre-confirmation insight: selection basis plus recent headlines.
async fn build_insight(
    state: &AppState,
    locked_product_id: Option<&str>,
    selection: &Option<Value>,
) -> Option<Value> {
    let product_id = locked_product_id?;
    let base = product_id.split('-').next().unwrap_or(product_id);
    let until = crate::ids::now_iso();
    let since = (chrono::Utc::now() - chrono::Duration::hours(24))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let items = state
        .deps
        .evidence()
        .news_items_for_asset(base, &since, &until, 5)
        .await
        .unwrap_or_default();
    let headlines: Vec<Value> = items
        .iter()
        .map(|item| {
            let sentiment = analyze_headline_sentiment(&item.title);
            json!({
                "title": item.title.clone(),
                "published_at": item.published_at.clone(),
                "url": item.url.clone(),
                "sentiment": sentiment.sentiment,
            })
        })
        .collect();
    let mut key_facts = vec![json!(format!("Target product: {product_id}"))];
    if let Some(selection) = selection {
        if let Some(why) = selection.get("why_explanation").and_then(|w| w.as_str()) {
            key_facts.push(json!(why));
        }
    }
    Some(json!({
        "headline": format!("Trade insight for {base}"),
        "key_facts": key_facts,
        "confidence": if headlines.is_empty() { 0.5 } else { 0.7 },
        "sources": {"headlines": headlines},
    }))
}

fn message_only(intent: &str, content: &str, suggestions: Option<Vec<&str>>) -> Value {
    let mut response = json!({
        "run_id": null,
        "intent": intent,
        "status": "COMPLETED",
        "content": content,
    });
    if let Some(suggestions) = suggestions {
        response["suggestions"] = json!(suggestions);
    }
    response
}

fn sanitize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
