//! Gesture Symbol Lookup
//!
//! Boundary trait for resolving a backend gesture name ("Dancing",
//! "Wave", ...) to an emoji the UI can render. The actual lookup service
//! lives outside this crate; the server binary injects an implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A resolved gesture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureSymbol {
    /// The emoji glyph.
    pub emoji: String,
    /// Human-readable title shown as a tooltip.
    pub title: String,
}

/// Resolves gesture names to displayable symbols.
#[async_trait]
pub trait GestureLookup: Send + Sync {
    /// Resolve a gesture name, or `None` if nothing matches.
    async fn find(&self, gesture: &str) -> Option<GestureSymbol>;
}
