//! Gesture table for the emoji lookup.
//!
//! Ships with a small built-in table covering the gestures the default
//! backends emit; `BRIDGE_GESTURES` can point at a JSON file whose
//! entries extend or override it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bridge_core::{GestureLookup, GestureSymbol};
use tracing::info;

fn builtin_table() -> HashMap<String, GestureSymbol> {
    let entries = [
        ("Dancing", "🕺", "dancing"),
        ("Wave", "👋", "waving"),
        ("Applaud", "👏", "applauding"),
        ("Bow", "🙇", "bowing"),
        ("Point", "👉", "pointing"),
        ("Shrug", "🤷", "shrugging"),
        ("Nod", "👍", "agreeing"),
        ("Shake", "👎", "disagreeing"),
    ];
    entries
        .into_iter()
        .map(|(name, emoji, title)| {
            (
                name.to_string(),
                GestureSymbol {
                    emoji: emoji.to_string(),
                    title: title.to_string(),
                },
            )
        })
        .collect()
}

/// In-process [`GestureLookup`] over a fixed table.
pub struct StaticGestureLookup {
    table: HashMap<String, GestureSymbol>,
}

impl StaticGestureLookup {
    /// Build the table from the built-ins plus an optional JSON file of
    /// `name -> { emoji, title }` entries.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut table = builtin_table();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading gesture table {}", path.display()))?;
            let extra: HashMap<String, GestureSymbol> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing gesture table {}", path.display()))?;
            info!(path = %path.display(), entries = extra.len(), "loaded gesture table");
            table.extend(extra);
        }
        Ok(Self { table })
    }
}

#[async_trait]
impl GestureLookup for StaticGestureLookup {
    async fn find(&self, gesture: &str) -> Option<GestureSymbol> {
        self.table.get(gesture).cloned()
    }
}
