//! Chat-turn persistence: per-user conversation buffers and the recorder
//! that allocates, stores and periodically summarizes turns.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strata_core::text::{char_len, is_correction_text};
use strata_core::{ConversationId, EpisodeId, EpisodeKind, Layer, UserId};
use strata_llm::{ChatMessage, ChatProvider};
use strata_settings::ConversationSettings;
use strata_store::GraphStore;
use tracing::{debug, info, warn};

use crate::errors::{MemoryError, Result};
use crate::ingest::{IngestRequest, IngestStatus, IngestionPipeline};
use crate::ledger::TurnLedger;
use crate::queue::BackgroundQueue;

/// Source description of chat turns and summaries.
pub const CHAT_SOURCE: &str = "chat";

/// Source description of long messages stored as documents.
pub const CHAT_DOCUMENT_SOURCE: &str = "chat_document";

/// Stored when the chat provider cannot produce a summary.
pub const SUMMARY_PLACEHOLDER: &str = "Brief conversation summary (generation failed)";

/// Text persisted for one exchange.
pub fn turn_text(user_message: &str, assistant_message: &str) -> String {
    format!("User: {user_message}\nAssistant: {assistant_message}")
}

fn summary_prompt(conversation: &str) -> String {
    format!(
        "Summarize this conversation briefly.\n\n\
         Conversation:\n{conversation}\n\n\
         The summary should cover:\n\
         - the main topics discussed\n\
         - decisions or agreements reached\n\
         - any updated facts or corrections\n\n\
         Keep it to 3-5 sentences."
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffers
// ─────────────────────────────────────────────────────────────────────────────

/// One buffered exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedTurn {
    /// User message.
    pub user: String,
    /// Assistant reply.
    pub assistant: String,
    /// Ledger turn number, when one was allocated.
    pub turn_index: Option<i64>,
    /// Conversation the turn was recorded in.
    pub conversation: Option<ConversationId>,
    /// Stored episode, once persisted.
    pub episode: Option<EpisodeId>,
}

/// One turn going into a summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryTurn {
    /// Ledger turn number.
    pub turn_index: i64,
    /// Stored episode; `None` while the turn is still being persisted.
    pub episode: Option<EpisodeId>,
    /// Transcript text.
    pub text: String,
}

#[derive(Debug)]
struct ConversationBuffer {
    conversation: ConversationId,
    turns: VecDeque<BufferedTurn>,
    last_activity: DateTime<Utc>,
}

impl ConversationBuffer {
    fn new() -> Self {
        Self {
            conversation: ConversationId::new(),
            turns: VecDeque::new(),
            last_activity: Utc::now(),
        }
    }
}

/// Recent exchanges per user, kept in memory.
///
/// Holds at most `max_messages` messages (two per turn) per user. Created
/// once at startup and shared; idle users are dropped by
/// [`ConversationBuffers::evict_idle`].
#[derive(Clone, Debug)]
pub struct ConversationBuffers {
    buffers: Arc<DashMap<UserId, ConversationBuffer>>,
    max_turns: usize,
}

impl ConversationBuffers {
    /// Buffers keeping `max_messages` messages per user.
    pub fn new(max_messages: usize) -> Self {
        Self {
            buffers: Arc::new(DashMap::new()),
            max_turns: (max_messages / 2).max(1),
        }
    }

    /// Active conversation of `user`, started on first use.
    pub fn conversation_id(&self, user: &UserId) -> ConversationId {
        self.buffers
            .entry(user.clone())
            .or_insert_with(ConversationBuffer::new)
            .conversation
            .clone()
    }

    /// Append an exchange, dropping the oldest past capacity.
    pub fn add_turn(&self, user: &UserId, turn: BufferedTurn) {
        let mut buffer = self
            .buffers
            .entry(user.clone())
            .or_insert_with(ConversationBuffer::new);
        buffer.turns.push_back(turn);
        while buffer.turns.len() > self.max_turns {
            let _ = buffer.turns.pop_front();
        }
        buffer.last_activity = Utc::now();
    }

    /// Attach the stored episode to buffered turn `turn_index`.
    pub fn record_episode(&self, user: &UserId, turn_index: i64, episode: EpisodeId) -> bool {
        let Some(mut buffer) = self.buffers.get_mut(user) else {
            return false;
        };
        match buffer
            .turns
            .iter_mut()
            .find(|t| t.turn_index == Some(turn_index))
        {
            Some(turn) => {
                turn.episode = Some(episode);
                true
            }
            None => false,
        }
    }

    /// Last `n` exchanges, oldest first.
    pub fn recent_turns(&self, user: &UserId, n: usize) -> Vec<BufferedTurn> {
        self.buffers
            .get(user)
            .map(|b| {
                let skip = b.turns.len().saturating_sub(n);
                b.turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Last `limit` messages as chat messages, oldest first.
    pub fn recent_messages(&self, user: &UserId, limit: usize) -> Vec<ChatMessage> {
        let messages: Vec<ChatMessage> = self
            .recent_turns(user, limit.div_ceil(2))
            .into_iter()
            .flat_map(|t| [ChatMessage::user(t.user), ChatMessage::assistant(t.assistant)])
            .collect();
        let skip = messages.len().saturating_sub(limit);
        messages.into_iter().skip(skip).collect()
    }

    /// Buffered turns of `conversation` numbered `from..=to`, in turn order.
    pub fn turns_for_summary(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        from: i64,
        to: i64,
    ) -> Vec<SummaryTurn> {
        let Some(buffer) = self.buffers.get(user) else {
            return Vec::new();
        };
        let mut turns: Vec<SummaryTurn> = buffer
            .turns
            .iter()
            .filter(|t| t.conversation.as_ref() == Some(conversation))
            .filter_map(|t| {
                let index = t.turn_index.filter(|i| (from..=to).contains(i))?;
                Some(SummaryTurn {
                    turn_index: index,
                    episode: t.episode.clone(),
                    text: turn_text(&t.user, &t.assistant),
                })
            })
            .collect();
        turns.sort_by_key(|t| t.turn_index);
        turns
    }

    /// Forget `user`'s buffer. Returns the number of messages dropped.
    pub fn clear(&self, user: &UserId) -> usize {
        self.buffers
            .remove(user)
            .map_or(0, |(_, b)| b.turns.len() * 2)
    }

    /// Drop buffers idle for longer than `max_age`. Returns how many went.
    pub fn evict_idle(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.buffers.len();
        self.buffers.retain(|_, b| b.last_activity >= cutoff);
        before - self.buffers.len()
    }

    /// Number of users with a buffer.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no user has a buffer.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recorder
// ─────────────────────────────────────────────────────────────────────────────

/// One exchange to record.
#[derive(Clone, Debug)]
pub struct ChatTurn {
    /// Speaker.
    pub user: UserId,
    /// Conversation; the user's buffered conversation when `None`.
    pub conversation: Option<ConversationId>,
    /// User message.
    pub user_message: String,
    /// Assistant reply.
    pub assistant_message: String,
}

/// How an exchange was stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDisposition {
    /// As a numbered chat turn.
    Turn,
    /// As a document, the message being too long for a turn.
    Document,
}

/// What [`ConversationRecorder::record_turn`] did before returning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReceipt {
    /// Conversation the turn belongs to.
    pub conversation: ConversationId,
    /// Allocated turn number; `None` for documents.
    pub turn_index: Option<i64>,
    /// How the exchange is stored.
    pub disposition: TurnDisposition,
    /// Whether this turn also triggers a summary.
    pub summary_due: bool,
    /// Whether the background job was accepted.
    pub queued: bool,
}

/// Records chat exchanges without blocking the reply path.
///
/// The turn number is allocated inline; storing the turn and any summary
/// happens on the [`BackgroundQueue`], each phase bounded by the persist
/// timeout.
#[derive(Clone)]
pub struct ConversationRecorder {
    store: Arc<dyn GraphStore>,
    ledger: TurnLedger,
    pipeline: IngestionPipeline,
    chat: Option<Arc<dyn ChatProvider>>,
    buffers: ConversationBuffers,
    queue: Arc<BackgroundQueue>,
    settings: ConversationSettings,
    long_message_chars: usize,
}

impl ConversationRecorder {
    /// Recorder writing through `pipeline` and scheduling on `queue`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn GraphStore>,
        ledger: TurnLedger,
        pipeline: IngestionPipeline,
        chat: Option<Arc<dyn ChatProvider>>,
        buffers: ConversationBuffers,
        queue: Arc<BackgroundQueue>,
        settings: ConversationSettings,
        long_message_chars: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            pipeline,
            chat,
            buffers,
            queue,
            settings,
            long_message_chars,
        }
    }

    /// The buffers.
    pub fn buffers(&self) -> &ConversationBuffers {
        &self.buffers
    }

    /// Whether `turn_index` closes a summary interval.
    pub fn summary_due(&self, turn_index: i64) -> bool {
        self.settings.summary_interval > 0
            && turn_index > 0
            && turn_index % self.settings.summary_interval == 0
    }

    /// First turn covered by the summary closing at `turn_index`.
    pub fn summary_start(&self, turn_index: i64) -> i64 {
        (turn_index - self.settings.summary_interval + 1).max(1)
    }

    fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.persist_timeout_secs)
    }

    /// Record one exchange.
    pub async fn record_turn(&self, turn: ChatTurn) -> Result<TurnReceipt> {
        let conversation = turn
            .conversation
            .clone()
            .unwrap_or_else(|| self.buffers.conversation_id(&turn.user));

        if char_len(&turn.user_message) > self.long_message_chars {
            return self.record_long_message(turn, conversation);
        }

        let turn_index = self.ledger.allocate_turn(&turn.user, &conversation).await;
        self.buffers.add_turn(
            &turn.user,
            BufferedTurn {
                user: turn.user_message.clone(),
                assistant: turn.assistant_message.clone(),
                turn_index: Some(turn_index),
                conversation: Some(conversation.clone()),
                episode: None,
            },
        );
        let summary_due = self.summary_due(turn_index);

        let this = self.clone();
        let user = turn.user.clone();
        let conv = conversation.clone();
        let text = turn_text(&turn.user_message, &turn.assistant_message);
        let queued = self.queue.try_submit("chat_turn", async move {
            let _ = this.persist_turn(&user, &conv, turn_index, text).await?;
            if summary_due {
                let _ = this.summarize(&user, &conv, turn_index).await?;
            }
            Ok(())
        })?;

        debug!(
            user = %turn.user,
            conversation = %conversation,
            turn_index,
            summary_due,
            queued,
            "chat turn recorded"
        );
        Ok(TurnReceipt {
            conversation,
            turn_index: Some(turn_index),
            disposition: TurnDisposition::Turn,
            summary_due,
            queued,
        })
    }

    fn record_long_message(&self, turn: ChatTurn, conversation: ConversationId) -> Result<TurnReceipt> {
        let chars = char_len(&turn.user_message);
        info!(user = %turn.user, chars, "long message, storing as document");
        self.buffers.add_turn(
            &turn.user,
            BufferedTurn {
                user: format!("[long text document uploaded: {chars} chars]"),
                assistant: turn.assistant_message.clone(),
                turn_index: None,
                conversation: Some(conversation.clone()),
                episode: None,
            },
        );

        let pipeline = self.pipeline.clone();
        let request = IngestRequest::new(turn.user_message, Layer::Personal)
            .source(CHAT_DOCUMENT_SOURCE)
            .author(turn.user);
        let queued = self.queue.try_submit("chat_document", async move {
            let outcome = pipeline.ingest(request).await?;
            match outcome.status {
                IngestStatus::Error => Err(MemoryError::NoEpisodeId {
                    source_description: CHAT_DOCUMENT_SOURCE.to_string(),
                }),
                IngestStatus::Success | IngestStatus::Skipped => Ok(()),
            }
        })?;

        Ok(TurnReceipt {
            conversation,
            turn_index: None,
            disposition: TurnDisposition::Document,
            summary_due: false,
            queued,
        })
    }

    /// Store one turn episode. Bounded by the persist timeout.
    pub async fn persist_turn(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        turn_index: i64,
        text: String,
    ) -> Result<EpisodeId> {
        let is_correction = is_correction_text(&text);
        let request = IngestRequest::new(text, Layer::Personal)
            .source(CHAT_SOURCE)
            .author(user.clone())
            .kind(EpisodeKind::ChatTurn)
            .metadata(json!({
                "conversation_id": conversation.as_str(),
                "turn_index": turn_index,
                "episode_kind": EpisodeKind::ChatTurn.as_str(),
                "is_correction": is_correction,
                "summarized": false,
            }));

        let outcome = self.bounded("persist chat turn", self.pipeline.ingest(request)).await?;
        let id = outcome
            .episode_id()
            .cloned()
            .ok_or_else(|| MemoryError::NoEpisodeId {
                source_description: CHAT_SOURCE.to_string(),
            })?;
        let _ = self.buffers.record_episode(user, turn_index, id.clone());
        info!(
            episode = %id,
            conversation = %conversation,
            turn_index,
            "chat turn saved"
        );
        Ok(id)
    }

    /// Summarize the interval closing at `turn_index`. Bounded by the
    /// persist timeout. Returns the summary episode, or `None` when there
    /// was nothing to summarize.
    pub async fn summarize(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        turn_index: i64,
    ) -> Result<Option<EpisodeId>> {
        let from = self.summary_start(turn_index);
        let stored = self
            .store
            .conversation_turns(user, conversation, from, turn_index)
            .await?;
        let mut by_index: BTreeMap<i64, SummaryTurn> = stored
            .into_iter()
            .filter_map(|e| {
                let index = e.turn_index?;
                Some((
                    index,
                    SummaryTurn {
                        turn_index: index,
                        episode: Some(e.id),
                        text: e.content,
                    },
                ))
            })
            .collect();
        // Turns still in flight on another worker are only in the buffer.
        for turn in self.buffers.turns_for_summary(user, conversation, from, turn_index) {
            let _ = by_index.entry(turn.turn_index).or_insert(turn);
        }
        let turns: Vec<SummaryTurn> = by_index.into_values().collect();
        if turns.is_empty() {
            debug!(conversation = %conversation, turn_index, "no turns to summarize");
            return Ok(None);
        }

        let transcript = turns
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let summary = self.generate_summary(&transcript).await;
        let covered: Vec<&EpisodeId> = turns.iter().filter_map(|t| t.episode.as_ref()).collect();
        let covered_ids: Vec<&str> = covered.iter().map(|id| id.as_str()).collect();

        let request = IngestRequest::new(summary, Layer::Personal)
            .source(CHAT_SOURCE)
            .author(user.clone())
            .kind(EpisodeKind::ChatSummary)
            .metadata(json!({
                "conversation_id": conversation.as_str(),
                "episode_kind": EpisodeKind::ChatSummary.as_str(),
                "covers_turns": format!("{from}-{turn_index}"),
                "summarized_turns": covered_ids,
            }));
        let outcome = self.bounded("persist chat summary", self.pipeline.ingest(request)).await?;
        let Some(summary_id) = outcome.episode_id().cloned() else {
            return Err(MemoryError::NoEpisodeId {
                source_description: CHAT_SOURCE.to_string(),
            });
        };

        for id in covered {
            if let Err(e) = self
                .store
                .update_episode_metadata(id, json!({ "summarized": true }))
                .await
            {
                warn!(episode = %id, error = %e, "failed to mark turn summarized");
            }
        }
        info!(
            episode = %summary_id,
            conversation = %conversation,
            covers = %format!("{from}-{turn_index}"),
            "chat summary saved"
        );
        Ok(Some(summary_id))
    }

    async fn generate_summary(&self, transcript: &str) -> String {
        let Some(chat) = &self.chat else {
            return SUMMARY_PLACEHOLDER.to_string();
        };
        let prompt = [ChatMessage::user(summary_prompt(transcript))];
        match self.bounded("generate chat summary", chat.chat(&prompt)).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => SUMMARY_PLACEHOLDER.to_string(),
            Err(e) => {
                warn!(error = %e, "summary generation failed, storing placeholder");
                SUMMARY_PLACEHOLDER.to_string()
            }
        }
    }

    async fn bounded<T, E, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        MemoryError: From<E>,
    {
        let limit = self.persist_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MemoryError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::CrossLayerLinker;
    use crate::testing::{FixedChat, ScriptedExtractor};
    use strata_core::RetryPolicy;
    use strata_embeddings::HashEmbedder;
    use strata_settings::{IngestSettings, LinkerSettings};
    use strata_store::SqliteGraphStore;

    fn turn(msg: &str) -> BufferedTurn {
        BufferedTurn {
            user: msg.into(),
            assistant: format!("re: {msg}"),
            turn_index: None,
            conversation: None,
            episode: None,
        }
    }

    #[test]
    fn buffer_keeps_the_newest_messages() {
        let buffers = ConversationBuffers::new(4);
        let u = UserId::from("u1");
        for i in 0..5 {
            buffers.add_turn(&u, turn(&format!("m{i}")));
        }
        let recent = buffers.recent_turns(&u, 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user, "m3");
        assert_eq!(recent[1].user, "m4");

        let messages = buffers.recent_messages(&u, 3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "re: m3");
        assert_eq!(messages[2].content, "re: m4");
    }

    #[test]
    fn conversation_id_is_stable_until_cleared() {
        let buffers = ConversationBuffers::new(12);
        let u = UserId::from("u1");
        let first = buffers.conversation_id(&u);
        assert_eq!(buffers.conversation_id(&u), first);
        buffers.add_turn(&u, turn("hi"));
        assert_eq!(buffers.clear(&u), 2);
        assert_eq!(buffers.clear(&u), 0);
        assert_ne!(buffers.conversation_id(&u), first);
    }

    #[test]
    fn summary_turns_follow_conversation_and_range() {
        let buffers = ConversationBuffers::new(12);
        let u = UserId::from("u1");
        let (c1, c2) = (ConversationId::from("c1"), ConversationId::from("c2"));
        for i in 1..=3 {
            let mut t = turn(&format!("m{i}"));
            t.turn_index = Some(i);
            t.conversation = Some(c1.clone());
            buffers.add_turn(&u, t);
        }
        let mut other = turn("elsewhere");
        other.turn_index = Some(2);
        other.conversation = Some(c2);
        buffers.add_turn(&u, other);

        assert!(buffers.record_episode(&u, 2, EpisodeId::from("e2")));
        assert!(!buffers.record_episode(&u, 9, EpisodeId::from("e9")));

        let turns = buffers.turns_for_summary(&u, &c1, 2, 3);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].episode, Some(EpisodeId::from("e2")));
        assert_eq!(turns[0].text, "User: m2\nAssistant: re: m2");
        assert_eq!(turns[1].turn_index, 3);
        assert_eq!(turns[1].episode, None);
    }

    #[test]
    fn idle_buffers_are_evicted() {
        let buffers = ConversationBuffers::new(12);
        buffers.add_turn(&UserId::from("u1"), turn("hi"));
        assert_eq!(buffers.evict_idle(chrono::Duration::hours(1)), 0);
        assert_eq!(buffers.evict_idle(chrono::Duration::seconds(-1)), 1);
        assert!(buffers.is_empty());
    }

    struct Rig {
        store: Arc<SqliteGraphStore>,
        queue: Arc<BackgroundQueue>,
        recorder: ConversationRecorder,
        chat: Arc<FixedChat>,
    }

    fn rig(chat: Arc<FixedChat>, interval: i64, long_message_chars: usize) -> Rig {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let extractor = ScriptedExtractor::new(store.clone(), vec![]);
        let pipeline = IngestionPipeline::new(
            store.clone(),
            extractor,
            Arc::new(HashEmbedder::new(8)),
            CrossLayerLinker::new(store.clone(), LinkerSettings::default()),
            RetryPolicy::default(),
            IngestSettings::default(),
        );
        let settings = ConversationSettings {
            summary_interval: interval,
            ..ConversationSettings::default()
        };
        let queue = Arc::new(BackgroundQueue::start(16, 1, Duration::from_secs(60)));
        let recorder = ConversationRecorder::new(
            store.clone(),
            TurnLedger::new(store.clone()),
            pipeline,
            Some(chat.clone()),
            ConversationBuffers::new(12),
            queue.clone(),
            settings,
            long_message_chars,
        );
        Rig {
            store,
            queue,
            recorder,
            chat,
        }
    }

    fn chat_turn(user: &UserId, conv: &ConversationId, msg: &str) -> ChatTurn {
        ChatTurn {
            user: user.clone(),
            conversation: Some(conv.clone()),
            user_message: msg.into(),
            assistant_message: "Noted.".into(),
        }
    }

    #[tokio::test]
    async fn turns_are_stored_and_summarized() {
        let rig = rig(FixedChat::replying("They discussed Lena and Riga."), 2, 8000);
        let user = UserId::from("u1");
        let conv = ConversationId::from("c1");

        let first = rig
            .recorder
            .record_turn(chat_turn(&user, &conv, "Lena lives in Riga"))
            .await
            .unwrap();
        assert_eq!(first.turn_index, Some(1));
        assert!(!first.summary_due);
        assert!(first.queued);
        rig.queue.wait_idle().await;

        let second = rig
            .recorder
            .record_turn(chat_turn(&user, &conv, "Actually she moved to Tallinn"))
            .await
            .unwrap();
        assert_eq!(second.turn_index, Some(2));
        assert!(second.summary_due);
        rig.queue.wait_idle().await;

        let ledger = TurnLedger::new(rig.store.clone());
        assert_eq!(ledger.turn_count(&user, &conv).await.unwrap(), 2);

        let turns = rig.store.conversation_turns(&user, &conv, 1, 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.summarized));
        assert!(!turns[0].is_correction);
        assert!(turns[1].is_correction);
        assert_eq!(turns[0].content, "User: Lena lives in Riga\nAssistant: Noted.");

        let summary = rig
            .store
            .find_episode_by_content(Layer::Personal, "They discussed Lena and Riga.", CHAT_SOURCE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.kind, Some(EpisodeKind::ChatSummary));
        assert_eq!(summary.metadata["covers_turns"], "1-2");
        assert_eq!(summary.metadata["summarized_turns"].as_array().unwrap().len(), 2);
        assert!(rig.chat.prompts.lock()[0].contains("Tallinn"));
    }

    #[tokio::test]
    async fn summary_includes_turns_not_yet_stored() {
        let rig = rig(FixedChat::replying("Lena moved."), 2, 8000);
        let user = UserId::from("u1");
        let conv = ConversationId::from("c1");
        for (i, msg) in [(1, "Lena lives in Riga"), (2, "She moved to Tallinn")] {
            rig.recorder.buffers().add_turn(
                &user,
                BufferedTurn {
                    user: msg.into(),
                    assistant: "Noted.".into(),
                    turn_index: Some(i),
                    conversation: Some(conv.clone()),
                    episode: None,
                },
            );
        }
        // Only the first turn reached the store.
        let first = rig
            .recorder
            .persist_turn(&user, &conv, 1, "User: Lena lives in Riga\nAssistant: Noted.".into())
            .await
            .unwrap();

        let summary_id = rig.recorder.summarize(&user, &conv, 2).await.unwrap().unwrap();
        let prompt = rig.chat.prompts.lock()[0].clone();
        assert!(prompt.contains("Riga"));
        assert!(prompt.contains("Tallinn"));

        let summary = rig.store.get_episode(&summary_id).await.unwrap().unwrap();
        assert_eq!(summary.metadata["covers_turns"], "1-2");
        assert_eq!(
            summary.metadata["summarized_turns"],
            serde_json::json!([first.as_str()])
        );
    }

    #[tokio::test]
    async fn failed_summary_generation_stores_placeholder() {
        let rig = rig(FixedChat::failing(), 1, 8000);
        let user = UserId::from("u1");
        let conv = ConversationId::from("c1");
        let _ = rig
            .recorder
            .record_turn(chat_turn(&user, &conv, "hello there"))
            .await
            .unwrap();
        rig.queue.wait_idle().await;

        let summary = rig
            .store
            .find_episode_by_content(Layer::Personal, SUMMARY_PLACEHOLDER, CHAT_SOURCE)
            .await
            .unwrap();
        assert!(summary.is_some());
    }

    #[tokio::test]
    async fn long_message_becomes_a_document() {
        let rig = rig(FixedChat::replying("unused"), 10, 20);
        let user = UserId::from("u1");
        let receipt = rig
            .recorder
            .record_turn(ChatTurn {
                user: user.clone(),
                conversation: None,
                user_message: "A very long pasted text about Lena.".into(),
                assistant_message: "Saved it.".into(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.disposition, TurnDisposition::Document);
        assert_eq!(receipt.turn_index, None);
        assert_eq!(receipt.conversation, rig.recorder.buffers().conversation_id(&user));
        rig.queue.wait_idle().await;

        let doc = rig
            .store
            .find_episode_by_content(
                Layer::Personal,
                "A very long pasted text about Lena.",
                CHAT_DOCUMENT_SOURCE,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.kind, Some(EpisodeKind::Document));
        assert_eq!(doc.author, Some(user.clone()));
        let buffered = rig.recorder.buffers().recent_turns(&user, 1);
        assert!(buffered[0].user.starts_with("[long text document uploaded"));
    }

    #[tokio::test]
    async fn summary_interval_arithmetic() {
        let rig = rig(FixedChat::replying("unused"), 10, 8000);
        let r = &rig.recorder;
        assert!(!r.summary_due(0));
        assert!(!r.summary_due(9));
        assert!(r.summary_due(10));
        assert!(r.summary_due(20));
        assert_eq!(r.summary_start(10), 1);
        assert_eq!(r.summary_start(20), 11);
        assert_eq!(r.summary_start(3), 1);
    }
}
