//! Unified channel reconciliation — one code path for all channels.
//!
//! Runs at boot and periodically. For each (channel, canonical jid) pair
//! past its cooldown: catch up inbound history since the stored cursor
//! (deduped, sender-filtered, remapped to the canonical jid) and retry
//! pending outbound rows in ledger order, stopping at the first failure
//! so per-channel ordering holds. Both cursors commit atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use pynchy_core::config::PynchyConfig;
use pynchy_core::types::WorkspaceProfile;
use pynchy_queue::GroupQueue;
use pynchy_store::Store;
use tracing::{debug, info, warn};

use crate::channel::Channel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Inbound messages ingested.
    pub recovered: usize,
    /// Outbound deliveries retried successfully.
    pub retried: usize,
}

pub struct Reconciler {
    store: Arc<Store>,
    config: Arc<PynchyConfig>,
    queue: GroupQueue,
    cooldown: Duration,
    last_reconciled: Mutex<HashMap<(String, String), Instant>>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, config: Arc<PynchyConfig>, queue: GroupQueue) -> Self {
        let cooldown = Duration::from_secs(config.reconcile.cooldown_secs);
        Self {
            store,
            config,
            queue,
            cooldown,
            last_reconciled: Mutex::new(HashMap::new()),
        }
    }

    /// Clear cooldown state (startup runs and tests).
    pub fn reset_cooldowns(&self) {
        self.last_reconciled.lock().unwrap().clear();
    }

    pub async fn reconcile_all(
        &self,
        channels: &[Arc<dyn Channel>],
        workspaces: &HashMap<String, WorkspaceProfile>,
    ) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        for ch in channels {
            for (canonical_jid, profile) in workspaces {
                // Connection gate: a workspace pinned to a connection is
                // only reconciled by that channel.
                if let Some(expected) = self.config.workspace_connection_name(&profile.folder) {
                    if expected != ch.name() {
                        continue;
                    }
                }
                if !ch.owns_jid(canonical_jid) {
                    debug!(channel = ch.name(), jid = %canonical_jid, "jid ownership skip");
                    continue;
                }

                let key = (ch.name().to_string(), canonical_jid.clone());
                {
                    let last = self.last_reconciled.lock().unwrap();
                    if last
                        .get(&key)
                        .map(|t| t.elapsed() < self.cooldown)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                }

                let pair_stats = self.reconcile_pair(ch.as_ref(), canonical_jid, profile).await;
                stats.recovered += pair_stats.recovered;
                stats.retried += pair_stats.retried;
                self.last_reconciled.lock().unwrap().insert(key, Instant::now());
            }
        }

        if stats.recovered > 0 {
            info!(count = stats.recovered, "recovered missed channel messages");
        }
        if stats.retried > 0 {
            info!(count = stats.retried, "retried pending outbound deliveries");
        }

        // GC cursors for channels that no longer exist.
        let active: Vec<String> = channels.iter().map(|c| c.name().to_string()).collect();
        match self.store.prune_stale_cursors(&active) {
            Ok(pruned) if pruned > 0 => info!(count = pruned, "pruned stale cursors"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cursor prune failed"),
        }

        stats
    }

    async fn reconcile_pair(
        &self,
        ch: &dyn Channel,
        canonical_jid: &str,
        profile: &WorkspaceProfile,
    ) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let target_jid = self
            .store
            .resolve_channel_jid(canonical_jid, ch.name())
            .unwrap_or_else(|_| canonical_jid.to_string());

        // --- inbound ---
        let inbound_cursor = self
            .store
            .get_channel_cursor(ch.name(), canonical_jid, "inbound")
            .ok()
            .flatten()
            .unwrap_or_else(|| {
                // Never reconciled: seed with a lookback so drops during
                // downtime are recoverable from the first cycle onward.
                let lookback =
                    chrono::Duration::hours(self.config.reconcile.initial_lookback_hours as i64);
                (Utc::now() - lookback).to_rfc3339()
            });

        let mut new_inbound_cursor = inbound_cursor.clone();
        match ch.fetch_inbound_since(&target_jid, &inbound_cursor).await {
            Ok(result) => {
                if result.high_water_mark > new_inbound_cursor {
                    new_inbound_cursor = result.high_water_mark.clone();
                }
                for mut msg in result.messages {
                    // The channel returned channel-native jids.
                    msg.chat_jid = canonical_jid.to_string();
                    if msg.timestamp > new_inbound_cursor {
                        new_inbound_cursor = msg.timestamp.clone();
                    }
                    let exists = self
                        .store
                        .message_exists(&msg.id, canonical_jid)
                        .unwrap_or(true);
                    if exists {
                        continue;
                    }
                    if !self.sender_allowed(profile, ch.name(), &msg.sender, msg.is_from_me) {
                        debug!(channel = ch.name(), sender = %msg.sender, "reconciler skip sender");
                        continue;
                    }
                    if let Err(e) = self.store.store_message(&msg) {
                        warn!(error = %e, "failed to ingest recovered message");
                        continue;
                    }
                    self.queue.enqueue_message_check(canonical_jid);
                    stats.recovered += 1;
                }
            }
            Err(e) => {
                warn!(channel = ch.name(), jid = %canonical_jid, error = %e, "fetch_inbound_since failed");
                return stats;
            }
        }

        // --- outbound retry ---
        let pending = self
            .store
            .get_pending_outbound(ch.name(), canonical_jid)
            .unwrap_or_default();
        let outbound_cursor = self
            .store
            .get_channel_cursor(ch.name(), canonical_jid, "outbound")
            .ok()
            .flatten()
            .unwrap_or_default();
        let mut new_outbound_cursor = outbound_cursor.clone();
        for row in pending {
            match ch.send_message(&target_jid, &row.content).await {
                Ok(()) => {
                    let _ = self.store.mark_delivered(row.ledger_id, ch.name());
                    if row.timestamp > new_outbound_cursor {
                        new_outbound_cursor = row.timestamp.clone();
                    }
                    stats.retried += 1;
                }
                Err(e) => {
                    let _ = self
                        .store
                        .mark_delivery_error(row.ledger_id, ch.name(), &e.to_string());
                    break; // preserve ordering — don't skip ahead
                }
            }
        }

        // --- atomic cursor commit ---
        let inbound_update =
            (new_inbound_cursor != inbound_cursor).then_some(new_inbound_cursor.as_str());
        let outbound_update =
            (new_outbound_cursor != outbound_cursor).then_some(new_outbound_cursor.as_str());
        if inbound_update.is_some() || outbound_update.is_some() {
            if let Err(e) = self.store.advance_cursors_atomic(
                ch.name(),
                canonical_jid,
                inbound_update,
                outbound_update,
            ) {
                warn!(error = %e, "cursor commit failed");
            }
        }

        stats
    }

    /// Match the main message loop's sender gate: admin workspaces bypass,
    /// everyone else checks the resolved allowlist.
    fn sender_allowed(
        &self,
        profile: &WorkspaceProfile,
        channel_name: &str,
        sender: &str,
        is_from_me: bool,
    ) -> bool {
        if profile.is_admin {
            return true;
        }
        let platform = channel_name.split(':').next().unwrap_or(channel_name);
        let resolved = self.config.resolve_workspace(&profile.folder);
        let Some(allowed) = self
            .config
            .resolve_allowed_users(&resolved.allowed_users, Some(platform))
        else {
            return true; // wildcard
        };
        if is_from_me {
            return true;
        }
        allowed.contains(&format!("{platform}:{sender}")) || allowed.contains(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FetchResult;
    use crate::error::ChannelError;
    use async_trait::async_trait;
    use pynchy_core::types::{MessageType, NewMessage};

    struct FakeChannel {
        name: String,
        inbound: Mutex<Vec<NewMessage>>,
        high_water: Mutex<String>,
        sent: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
    }

    impl FakeChannel {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                inbound: Mutex::new(Vec::new()),
                high_water: Mutex::new(String::new()),
                sent: Mutex::new(Vec::new()),
                fail_on: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn owns_jid(&self, _jid: &str) -> bool {
            true
        }
        async fn send_message(&self, _jid: &str, text: &str) -> Result<(), ChannelError> {
            if self.fail_on.lock().unwrap().as_deref() == Some(text) {
                return Err(ChannelError::SendFailed("simulated".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn fetch_inbound_since(
            &self,
            _jid: &str,
            cursor: &str,
        ) -> Result<FetchResult, ChannelError> {
            let messages: Vec<NewMessage> = self
                .inbound
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.timestamp.as_str() > cursor)
                .cloned()
                .collect();
            Ok(FetchResult {
                messages,
                high_water_mark: self.high_water.lock().unwrap().clone(),
            })
        }
    }

    /// Timestamp `offset_secs` from now, for fixtures that must fall
    /// within the default inbound lookback window regardless of
    /// wall-clock time when the test runs.
    fn recent_ts(offset_secs: i64) -> String {
        (Utc::now() + chrono::Duration::seconds(offset_secs)).to_rfc3339()
    }

    fn msg(id: &str, ts: &str) -> NewMessage {
        NewMessage {
            id: id.into(),
            chat_jid: "native-jid".into(),
            sender: "U1".into(),
            sender_name: "User".into(),
            content: format!("msg {id}"),
            timestamp: ts.into(),
            is_from_me: false,
            message_type: MessageType::User,
            metadata: None,
        }
    }

    fn setup() -> (Arc<Store>, Arc<PynchyConfig>, GroupQueue, HashMap<String, WorkspaceProfile>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = PynchyConfig::default();
        config.workspace_defaults.allowed_users = Some(vec!["*".to_string()]);
        let queue = GroupQueue::new(2, 0.01);
        let profile = WorkspaceProfile {
            jid: "g1@x".into(),
            name: "dev".into(),
            folder: "dev".into(),
            trigger: "@pynchy".into(),
            is_admin: false,
            container_config: None,
            added_at: Utc::now(),
        };
        store.set_registered_group(&profile).unwrap();
        let workspaces = HashMap::from([("g1@x".to_string(), profile)]);
        (store, Arc::new(config), queue, workspaces)
    }

    #[tokio::test]
    async fn ingests_new_messages_and_is_idempotent() {
        let (store, config, queue, workspaces) = setup();
        let ch = FakeChannel::new("chA");
        let ts1 = recent_ts(1);
        ch.inbound.lock().unwrap().push(msg("m1", &ts1));
        *ch.high_water.lock().unwrap() = ts1;
        let channels: Vec<Arc<dyn Channel>> = vec![ch.clone()];

        let rec = Reconciler::new(Arc::clone(&store), config, queue);
        let stats = rec.reconcile_all(&channels, &workspaces).await;
        assert_eq!(stats.recovered, 1);
        assert!(store.message_exists("m1", "g1@x").unwrap());
        // Canonical remap happened.
        let history = store.get_chat_history("g1@x", 10).unwrap();
        assert_eq!(history[0].chat_jid, "g1@x");

        // Second run against unchanged upstream: zero new ingestions.
        rec.reset_cooldowns();
        let stats = rec.reconcile_all(&channels, &workspaces).await;
        assert_eq!(stats.recovered, 0);
    }

    #[tokio::test]
    async fn outbound_retry_preserves_order_across_partial_failure() {
        let (store, config, queue, workspaces) = setup();
        let ch_a = FakeChannel::new("chA");
        let ch_b = FakeChannel::new("chB");
        let channel_names = vec!["chA".to_string(), "chB".to_string()];
        for content in ["A", "B", "C"] {
            store.record_broadcast("g1@x", content, &channel_names).unwrap();
        }
        // chA fails on "B".
        *ch_a.fail_on.lock().unwrap() = Some("B".into());

        let channels: Vec<Arc<dyn Channel>> = vec![ch_a.clone(), ch_b.clone()];
        let rec = Reconciler::new(Arc::clone(&store), config, queue);
        rec.reconcile_all(&channels, &workspaces).await;

        // chA delivered A, stopped at B; chB delivered everything.
        assert_eq!(*ch_a.sent.lock().unwrap(), vec!["A".to_string()]);
        assert_eq!(
            *ch_b.sent.lock().unwrap(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        let pending: Vec<String> = store
            .get_pending_outbound("chA", "g1@x")
            .unwrap()
            .into_iter()
            .map(|p| p.content)
            .collect();
        assert_eq!(pending, vec!["B".to_string(), "C".to_string()]);

        // chA restored: next cycle delivers B then C, in order.
        *ch_a.fail_on.lock().unwrap() = None;
        rec.reset_cooldowns();
        rec.reconcile_all(&channels, &workspaces).await;
        assert_eq!(
            *ch_a.sent.lock().unwrap(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        assert!(store.get_pending_outbound("chA", "g1@x").unwrap().is_empty());
    }

    #[tokio::test]
    async fn high_water_mark_advances_cursor_on_bot_only_pages() {
        let (store, config, queue, workspaces) = setup();
        let ch = FakeChannel::new("chA");
        *ch.high_water.lock().unwrap() = "2099-01-01T00:00:00+00:00".into();
        let channels: Vec<Arc<dyn Channel>> = vec![ch.clone()];

        let rec = Reconciler::new(Arc::clone(&store), config, queue);
        rec.reconcile_all(&channels, &workspaces).await;

        let cursor = store
            .get_channel_cursor("chA", "g1@x", "inbound")
            .unwrap()
            .unwrap();
        assert_eq!(cursor, "2099-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn sender_allowlist_filters_non_admin() {
        let (store, mut config_raw, queue, workspaces) = setup();
        let config = {
            let cfg = Arc::get_mut(&mut config_raw).unwrap();
            cfg.workspace_defaults.allowed_users = Some(vec!["chA:trusted".to_string()]);
            config_raw.clone()
        };
        let ch = FakeChannel::new("chA");
        ch.inbound.lock().unwrap().push(msg("m1", &recent_ts(1)));
        let mut trusted = msg("m2", &recent_ts(2));
        trusted.sender = "trusted".into();
        ch.inbound.lock().unwrap().push(trusted);
        let channels: Vec<Arc<dyn Channel>> = vec![ch.clone()];

        let rec = Reconciler::new(Arc::clone(&store), config, queue);
        let stats = rec.reconcile_all(&channels, &workspaces).await;
        assert_eq!(stats.recovered, 1);
        assert!(!store.message_exists("m1", "g1@x").unwrap());
        assert!(store.message_exists("m2", "g1@x").unwrap());
    }
}
