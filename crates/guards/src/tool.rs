//! Tool catalogue, tool id normalisation and request fingerprints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use dispatchgate_core::DomainError;

use crate::error::DispatchError;

/// How the admitted call is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecution {
    /// Invoked inline; the response carries the engine result.
    Sync,
    /// Invoked on a spawned task; the response returns `pending`.
    Background,
}

impl ToolExecution {
    /// Long-running tool families (research, bulk jobs, media generation,
    /// stock sync) run in the background.
    pub fn infer(tool_id: &str) -> Self {
        const PREFIXES: &[&str] = &[
            "research-",
            "amazon-",
            "media-video-",
            "media-audio-",
            "stock-",
            "keepa-",
            "trend-",
            "arbitrage-",
        ];
        const SUFFIXES: &[&str] = &["-batch", "-bulk"];

        let inventory_sync = tool_id.starts_with("inventory-") && tool_id.ends_with("-sync");
        if inventory_sync
            || PREFIXES.iter().any(|p| tool_id.starts_with(p))
            || SUFFIXES.iter().any(|s| tool_id.ends_with(s))
        {
            ToolExecution::Background
        } else {
            ToolExecution::Sync
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub tool_id: String,
    pub webhook_path: String,
    pub category: String,
    pub execution: ToolExecution,
}

impl ToolDefinition {
    pub fn new(
        tool_id: impl Into<String>,
        webhook_path: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let tool_id = tool_id.into();
        let execution = ToolExecution::infer(&tool_id);
        Self {
            tool_id,
            webhook_path: webhook_path.into(),
            category: category.into(),
            execution,
        }
    }

    pub fn job_type(&self) -> String {
        job_type_for(&self.tool_id)
    }
}

/// Shape accepted from a tools file; `execution` is inferred when omitted.
#[derive(Debug, Deserialize)]
struct ToolEntry {
    tool_id: String,
    webhook_path: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    execution: Option<ToolExecution>,
}

const BUILTIN_TOOLS: &[(&str, &str, &str)] = &[
    ("listing-local", "n3-listing-local", "listing"),
    ("listing-error-recovery", "listing-error-recovery", "listing"),
    ("listing-lp-auto", "listing-lp-auto", "listing"),
    ("listing-multi-region", "listing-multi-region", "listing"),
    ("listing-china-gateway", "listing-china", "listing"),
    ("listing-execute", "listing-execute", "listing"),
    ("ebay-listing", "ebay-listing", "listing"),
    ("qoo10-listing", "qoo10-listing", "listing"),
    ("shopify-sync", "shopify-sync", "listing"),
    ("amazon-listing", "amazon-listing", "listing"),
    ("stock-killer", "stock-sync", "inventory"),
    ("usa-supplier-monitor", "usa-monitor", "inventory"),
    ("inventory-monitoring", "inventory-monitoring", "inventory"),
    ("price-defense", "price-defense", "inventory"),
    ("ddp-calculate", "ddp-calculate", "finance"),
    ("profit-calculate", "profit-calculate", "finance"),
    ("accounting-sync", "accounting-sync", "finance"),
    ("bank-sync", "bank-sync", "finance"),
    ("payment-match", "payment-match", "finance"),
    ("research-agent", "research-agent", "research"),
    ("sm-batch", "sm-batch", "research"),
    ("trend-agent", "trend-agent", "research"),
    ("arbitrage-scan", "arbitrage-scan", "research"),
    ("amazon-research-bulk", "amazon-research-bulk", "research"),
    ("amazon-price-tracker", "amazon-price-tracker", "research"),
    ("amazon-competitor-scan", "amazon-competitor-scan", "research"),
    ("keepa-sync", "keepa-sync", "research"),
    ("media-video-gen", "media-video-gen", "media"),
    ("media-audio-gen", "media-audio-gen", "media"),
    ("media-timestamp", "media-timestamp", "media"),
    ("media-thumbnail", "media-thumbnail", "media"),
    ("media-script", "media-script", "media"),
    ("media-upload", "media-upload", "media"),
    ("media-analytics", "media-analytics", "media"),
    ("media-comment-reply", "media-comment", "media"),
    ("media-knowledge-loop", "media-knowledge", "media"),
    ("scoring-dispatch", "scoring-dispatch", "system"),
    ("fx-price-adjust", "fx-price-adjust", "system"),
    ("supplier-switch", "supplier-switch", "system"),
    ("sentinel-monitor", "sentinel", "system"),
    ("defense-copyright", "defense-copyright", "defense"),
    ("defense-ban-monitor", "defense-ban", "defense"),
];

const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("researchAgent", "research-agent"),
    ("amazonResearch", "amazon-research-bulk"),
    ("trendAgent", "trend-agent"),
    ("listingLocal", "listing-local"),
    ("stockKiller", "stock-killer"),
    ("mediaVideoGen", "media-video-gen"),
    ("mediaAudioGen", "media-audio-gen"),
    ("ddpCalculate", "ddp-calculate"),
    ("amazon_research_bulk", "amazon-research-bulk"),
    ("amazon_price_tracker", "amazon-price-tracker"),
    ("amazon_competitor_scan", "amazon-competitor-scan"),
    ("keepa_sync", "keepa-sync"),
    ("listing-ebay-create", "listing-local"),
    ("research-gpt-analyze", "research-agent"),
    ("research-amazon-search", "amazon-research-bulk"),
    ("research-trend-analyze", "trend-agent"),
    ("inventory-stock-sync", "stock-killer"),
    ("media-video-generate", "media-video-gen"),
    ("media-audio-generate", "media-audio-gen"),
    ("finance-ddp-calculate", "ddp-calculate"),
];

/// The set of dispatchable tools plus the legacy id aliases.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalogue {
    tools: BTreeMap<String, ToolDefinition>,
    aliases: BTreeMap<String, String>,
}

impl ToolCatalogue {
    pub fn builtin() -> Self {
        let definitions = BUILTIN_TOOLS
            .iter()
            .map(|(id, path, category)| ToolDefinition::new(*id, *path, *category));
        let mut catalogue = Self::default();
        for def in definitions {
            catalogue.tools.insert(def.tool_id.clone(), def);
        }
        catalogue.aliases = LEGACY_ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        catalogue
    }

    /// Build from explicit definitions (legacy aliases still apply).
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ToolDefinition>,
    ) -> Result<Self, DomainError> {
        let mut catalogue = Self {
            tools: BTreeMap::new(),
            aliases: Self::builtin().aliases,
        };
        for def in definitions {
            if def.tool_id.trim().is_empty() {
                return Err(DomainError::validation("tool_id cannot be empty"));
            }
            if def.webhook_path.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "tool '{}' has an empty webhook_path",
                    def.tool_id
                )));
            }
            if catalogue.tools.contains_key(&def.tool_id) {
                return Err(DomainError::conflict(format!(
                    "duplicate tool id '{}'",
                    def.tool_id
                )));
            }
            catalogue.tools.insert(def.tool_id.clone(), def);
        }
        Ok(catalogue)
    }

    /// Parse a JSON array of `{tool_id, webhook_path, category?, execution?}`.
    pub fn from_json(raw: &str) -> Result<Self, DomainError> {
        let entries: Vec<ToolEntry> = serde_json::from_str(raw)
            .map_err(|e| DomainError::validation(format!("invalid tools file: {e}")))?;
        Self::from_definitions(entries.into_iter().map(|entry| {
            let execution = entry
                .execution
                .unwrap_or_else(|| ToolExecution::infer(&entry.tool_id));
            ToolDefinition {
                category: entry.category.unwrap_or_else(|| job_type_for(&entry.tool_id)),
                tool_id: entry.tool_id,
                webhook_path: entry.webhook_path,
                execution,
            }
        }))
    }

    pub fn normalize_tool_id(&self, raw: &str) -> String {
        let raw = raw.trim();
        if let Some(migrated) = self.aliases.get(raw) {
            return migrated.clone();
        }
        if raw.contains('-') {
            return raw.to_lowercase();
        }
        camel_to_kebab(raw)
    }

    /// Normalise `raw` and look it up.
    pub fn resolve(&self, raw: &str) -> Result<&ToolDefinition, DispatchError> {
        let normalized = self.normalize_tool_id(raw);
        self.tools
            .get(&normalized)
            .or_else(|| self.tools.get(raw))
            .ok_or(DispatchError::UnknownTool {
                tool_id: normalized,
            })
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.get(tool_id)
    }

    /// Sorted tool ids.
    pub fn ids(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn camel_to_kebab(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('-');
        }
        prev_lower = c.is_ascii_lowercase();
        out.extend(c.to_lowercase());
    }
    out
}

/// Concurrency bucket for a tool: the first `-` segment, or `default`.
pub fn job_type_for(tool_id: &str) -> String {
    match tool_id.split('-').next() {
        Some(first) if !first.is_empty() => first.to_string(),
        _ => "default".to_string(),
    }
}

/// Hex SHA-256 over `tool_id`, `action` and key-sorted params.
pub fn fingerprint(tool_id: &str, action: &str, params: &JsonValue) -> String {
    let payload = serde_json::json!({
        "action": action,
        "params": canonicalize(params),
        "tool_id": tool_id,
    });
    let digest = Sha256::digest(payload.to_string().as_bytes());
    hex::encode(digest)
}

fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, JsonValue> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
