//! Conversation turn ledger.
//!
//! Turn numbers come from the store's atomic upsert-increment, so they are
//! unique across processes sharing the database. Allocation never fails the
//! caller: a store error yields turn 1 and a logged, counted fallback.

use std::sync::Arc;

use strata_core::{ConversationId, UserId};
use strata_store::GraphStore;
use tracing::warn;

use crate::errors::Result;

/// Turn used when allocation fails.
pub const FALLBACK_TURN: i64 = 1;

/// Allocates and counts conversation turns.
#[derive(Clone)]
pub struct TurnLedger {
    store: Arc<dyn GraphStore>,
}

impl TurnLedger {
    /// Ledger over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Next turn number of `conversation` for `user`.
    pub async fn allocate_turn(&self, user: &UserId, conversation: &ConversationId) -> i64 {
        match self.store.increment_counter(user, conversation).await {
            Ok(turn) => turn,
            Err(e) => {
                warn!(
                    user = %user,
                    conversation = %conversation,
                    error = %e,
                    "turn allocation failed, using fallback"
                );
                metrics::counter!("turn_allocation_fallbacks_total").increment(1);
                FALLBACK_TURN
            }
        }
    }

    /// Number of persisted turns.
    pub async fn turn_count(&self, user: &UserId, conversation: &ConversationId) -> Result<u64> {
        Ok(self.store.count_turn_episodes(user, conversation).await?)
    }
}
