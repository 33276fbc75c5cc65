//! News briefs and the headline sentiment gate.
//!
//! A brief collects recent `news_items` per candidate asset (or, in
//! REPLAY, exactly the items linked as evidence to the source run) and
//! records every used item as `run_news_evidence` for later replay. The
//! gate aggregates headline sentiment: critical security keywords always
//! block a BUY; a strongly bearish, confident consensus gates with a risk
//! override allowed.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::evidence::{EvidenceRepo, NewsItemRow};
use crate::ids::now_iso;

pub const CRITICAL_BLOCKER_KEYWORDS: &[&str] = &[
    "hack",
    "hacked",
    "exploit",
    "exploited",
    "delist",
    "delisted",
    "delisting",
    "rug pull",
    "rugpull",
    "bridge attack",
    "flash loan attack",
];

pub const SENTIMENT_GATE_THRESHOLD: f64 = -0.3;
pub const SENTIMENT_CONFIDENCE_THRESHOLD: f64 = 0.65;
pub const MIN_BEARISH_HEADLINES: usize = 2;

const BEARISH_TERMS: &[(&str, f64)] = &[
    ("crash", 0.9),
    ("plunge", 0.85),
    ("plummet", 0.85),
    ("drain", 0.8),
    ("dump", 0.75),
    ("selloff", 0.75),
    ("sell-off", 0.75),
    ("lawsuit", 0.7),
    ("sec charges", 0.85),
    ("bankrupt", 0.9),
    ("collapse", 0.85),
    ("tumble", 0.7),
    ("sink", 0.65),
    ("falls", 0.6),
    ("drop", 0.6),
    ("down", 0.5),
    ("bearish", 0.8),
    ("liquidation", 0.7),
    ("outage", 0.6),
];

const BULLISH_TERMS: &[(&str, f64)] = &[
    ("surge", 0.85),
    ("rally", 0.8),
    ("rallies", 0.8),
    ("soar", 0.85),
    ("record high", 0.9),
    ("all-time high", 0.9),
    ("breakout", 0.75),
    ("gains", 0.65),
    ("jumps", 0.7),
    ("climbs", 0.65),
    ("adoption", 0.6),
    ("approval", 0.7),
    ("etf inflow", 0.8),
    ("bullish", 0.8),
    ("up", 0.5),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlineSentiment {
    pub sentiment: String,
    pub confidence: f64,
    pub driver: String,
}

/// Keyword-lexicon headline classifier. The strongest matching term wins;
/// ties between directions resolve to neutral.
pub fn analyze_headline_sentiment(title: &str) -> HeadlineSentiment {
    let lower = title.to_lowercase();
    let best_bearish = BEARISH_TERMS
        .iter()
        .filter(|(term, _)| lower.contains(term))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    let best_bullish = BULLISH_TERMS
        .iter()
        .filter(|(term, _)| lower.contains(term))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match (best_bearish, best_bullish) {
        (Some((term, conf)), None) => HeadlineSentiment {
            sentiment: "bearish".to_string(),
            confidence: *conf,
            driver: term.to_string(),
        },
        (None, Some((term, conf))) => HeadlineSentiment {
            sentiment: "bullish".to_string(),
            confidence: *conf,
            driver: term.to_string(),
        },
        (Some((bear_term, bear_conf)), Some((_, bull_conf))) if bear_conf > bull_conf => {
            HeadlineSentiment {
                sentiment: "bearish".to_string(),
                confidence: *bear_conf,
                driver: bear_term.to_string(),
            }
        }
        (Some((_, bear_conf)), Some((bull_term, bull_conf))) if bull_conf > bear_conf => {
            HeadlineSentiment {
                sentiment: "bullish".to_string(),
                confidence: *bull_conf,
                driver: bull_term.to_string(),
            }
        }
        _ => HeadlineSentiment {
            sentiment: "neutral".to_string(),
            confidence: 0.0,
            driver: String::new(),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SentimentGate {
    pub gated: bool,
    pub net_sentiment: f64,
    pub confidence: f64,
    pub bearish_headlines: Vec<serde_json::Value>,
    pub critical_blockers: Vec<serde_json::Value>,
    pub bullish_count: usize,
    pub bearish_count: usize,
    pub neutral_count: usize,
    pub explanation: String,
    pub risk_override_allowed: bool,
}

pub struct NewsBriefService {
    evidence: EvidenceRepo,
}

impl NewsBriefService {
    pub fn new(evidence: EvidenceRepo) -> Self {
        Self { evidence }
    }

    /// Build a fresh brief for `assets` from `news_items` within the
    /// trailing window ending at `reference_time`.
    pub async fn create_brief(
        &self,
        run_id: &str,
        assets: &[String],
        window_hours: i64,
        reference_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<serde_json::Value> {
        let until = reference_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let since = (reference_time - chrono::Duration::hours(window_hours))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let mut brief_assets = Vec::new();
        for asset in assets {
            let items = self
                .evidence
                .news_items_for_asset(asset, &since, &until, 10)
                .await?;
            if let Some(entry) = self.asset_entry(run_id, asset, &items).await? {
                brief_assets.push(entry);
            }
        }
        Ok(serde_json::json!({
            "window_hours": window_hours,
            "assets": brief_assets,
            "blockers": [],
            "generated_at": now_iso(),
        }))
    }

    /// Rebuild a brief strictly from the evidence items of a source run.
    pub async fn create_brief_from_source(
        &self,
        run_id: &str,
        source_run_id: &str,
    ) -> Result<serde_json::Value> {
        let items = self.evidence.news_items_for_source_run(source_run_id).await?;
        let mut by_asset: std::collections::BTreeMap<String, Vec<NewsItemRow>> =
            std::collections::BTreeMap::new();
        for item in items {
            if item.asset_symbol.is_empty() {
                continue;
            }
            by_asset.entry(item.asset_symbol.clone()).or_default().push(item);
        }
        let mut brief_assets = Vec::new();
        for (asset, items) in &by_asset {
            if let Some(entry) = self.asset_entry(run_id, asset, items).await? {
                brief_assets.push(entry);
            }
        }
        Ok(serde_json::json!({
            "window_hours": 0,
            "assets": brief_assets,
            "blockers": [],
            "generated_at": now_iso(),
            "source_run_id": source_run_id,
        }))
    }

    async fn asset_entry(
        &self,
        run_id: &str,
        asset: &str,
        items: &[NewsItemRow],
    ) -> Result<Option<serde_json::Value>> {
        if items.is_empty() {
            return Ok(None);
        }
        let mut refs = Vec::new();
        for item in items {
            self.evidence.link_news_evidence(run_id, &item.id).await?;
            refs.push(serde_json::json!({
                "item_id": item.id.clone(),
                "source_id": item.source_id.clone(),
                "published_at": item.published_at.clone(),
                "url": item.url.clone(),
                "title": item.title.clone(),
            }));
        }
        Ok(Some(serde_json::json!({
            "symbol": asset,
            "clusters": [{
                "headline": format!("Recent news for {asset}"),
                "items": refs,
                "tags": [],
            }],
        })))
    }
}

/// Aggregate sentiment over the brief's headlines for the candidate assets.
pub fn compute_sentiment_gate(brief: &serde_json::Value, candidates: &[String]) -> SentimentGate {
    let mut bearish_headlines = Vec::new();
    let mut critical_blockers = Vec::new();
    let mut bullish_count = 0usize;
    let mut bearish_count = 0usize;
    let mut neutral_count = 0usize;

    let assets = brief.get("assets").and_then(|a| a.as_array()).cloned().unwrap_or_default();
    for asset_data in &assets {
        let symbol = asset_data.get("symbol").and_then(|s| s.as_str()).unwrap_or("");
        if !candidates.iter().any(|c| c == symbol) {
            continue;
        }
        let clusters = asset_data.get("clusters").and_then(|c| c.as_array()).cloned().unwrap_or_default();
        for cluster in &clusters {
            let items = cluster.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
            for item in &items {
                let title = item.get("title").and_then(|t| t.as_str()).unwrap_or("");
                if title.trim().is_empty() {
                    continue;
                }
                let title_lower = title.to_lowercase();
                if let Some(kw) = CRITICAL_BLOCKER_KEYWORDS.iter().find(|kw| title_lower.contains(*kw)) {
                    critical_blockers.push(serde_json::json!({
                        "asset": symbol,
                        "keyword": kw,
                        "title": title,
                        "url": item.get("url"),
                        "item_id": item.get("item_id"),
                    }));
                }
                let sa = analyze_headline_sentiment(title);
                match sa.sentiment.as_str() {
                    "bearish" => {
                        bearish_count += 1;
                        bearish_headlines.push(serde_json::json!({
                            "title": title,
                            "timestamp": item.get("published_at"),
                            "url": item.get("url"),
                            "confidence": sa.confidence,
                            "driver": sa.driver,
                        }));
                    }
                    "bullish" => bullish_count += 1,
                    _ => neutral_count += 1,
                }
            }
        }
    }

    let total = bullish_count + bearish_count + neutral_count;
    if total == 0 {
        return SentimentGate {
            explanation: "No news headlines available for sentiment analysis.".to_string(),
            ..Default::default()
        };
    }

    let net_sentiment = (bullish_count as f64 - bearish_count as f64) / total as f64;
    let avg_confidence = if bearish_headlines.is_empty() {
        0.0
    } else {
        bearish_headlines
            .iter()
            .filter_map(|h| h.get("confidence").and_then(|c| c.as_f64()))
            .sum::<f64>()
            / bearish_headlines.len() as f64
    };

    let mut gated = false;
    let mut explanation = String::new();
    if let Some(crit) = critical_blockers.first() {
        gated = true;
        explanation = format!(
            "CRITICAL: {} detected in \"{}\" ({}). Trade gated for safety.",
            crit.get("keyword").and_then(|k| k.as_str()).unwrap_or("").to_uppercase(),
            crit.get("title").and_then(|t| t.as_str()).unwrap_or(""),
            crit.get("asset").and_then(|a| a.as_str()).unwrap_or(""),
        );
    } else if net_sentiment < SENTIMENT_GATE_THRESHOLD
        && avg_confidence > SENTIMENT_CONFIDENCE_THRESHOLD
        && bearish_count >= MIN_BEARISH_HEADLINES
    {
        gated = true;
        let sample: Vec<String> = bearish_headlines
            .iter()
            .take(2)
            .filter_map(|h| h.get("title").and_then(|t| t.as_str()).map(|t| format!("\"{t}\"")))
            .collect();
        explanation = format!(
            "Bearish sentiment detected (score: {net_sentiment:.2}, confidence: {avg_confidence:.2}, {bearish_count} bearish headlines). Evidence: {}",
            sample.join("; ")
        );
    }

    let risk_override_allowed = gated && critical_blockers.is_empty();
    bearish_headlines.truncate(5);

    SentimentGate {
        gated,
        net_sentiment: (net_sentiment * 1000.0).round() / 1000.0,
        confidence: (avg_confidence * 1000.0).round() / 1000.0,
        bearish_headlines,
        critical_blockers,
        bullish_count,
        bearish_count,
        neutral_count,
        explanation,
        risk_override_allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief_with_titles(titles: &[&str]) -> serde_json::Value {
        let items: Vec<serde_json::Value> = titles
            .iter()
            .map(|t| serde_json::json!({"title": t, "item_id": "news_x"}))
            .collect();
        serde_json::json!({
            "assets": [{"symbol": "BTC", "clusters": [{"items": items}]}]
        })
    }

    #[test]
    fn test_headline_classifier() {
        assert_eq!(analyze_headline_sentiment("BTC rallies to new highs").sentiment, "bullish");
        assert_eq!(analyze_headline_sentiment("BTC price crash deepens").sentiment, "bearish");
        assert_eq!(analyze_headline_sentiment("BTC unchanged today").sentiment, "neutral");
    }

    #[test]
    fn test_critical_keyword_always_gates() {
        let brief = brief_with_titles(&["BTC bridge attack drains reserves"]);
        let gate = compute_sentiment_gate(&brief, &["BTC".to_string()]);
        assert!(gate.gated);
        assert!(!gate.risk_override_allowed);
        assert_eq!(gate.critical_blockers.len(), 1);
        assert!(gate.explanation.contains("CRITICAL"));
    }

    #[test]
    fn test_bearish_consensus_gates_with_override() {
        let brief = brief_with_titles(&[
            "BTC crash wipes out leveraged longs",
            "BTC collapse continues as funds flee",
            "Another BTC selloff hits miners",
        ]);
        let gate = compute_sentiment_gate(&brief, &["BTC".to_string()]);
        assert!(gate.gated);
        assert!(gate.risk_override_allowed);
        assert!(gate.net_sentiment < SENTIMENT_GATE_THRESHOLD);
        assert!(gate.bearish_count >= MIN_BEARISH_HEADLINES);
    }

    #[test]
    fn test_single_bearish_headline_does_not_gate() {
        let brief = brief_with_titles(&["BTC drop pauses", "BTC adoption grows", "BTC steady"]);
        let gate = compute_sentiment_gate(&brief, &["BTC".to_string()]);
        assert!(!gate.gated);
    }

    #[test]
    fn test_empty_brief_is_neutral() {
        let gate = compute_sentiment_gate(&serde_json::json!({"assets": []}), &["BTC".to_string()]);
        assert!(!gate.gated);
        assert_eq!(gate.net_sentiment, 0.0);
    }
}
