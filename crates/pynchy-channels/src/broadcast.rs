//! Ledger-backed broadcast across connected channels.
//!
//! Every broadcast records one ledger row and one delivery row per target
//! channel before any send happens, so a crash mid-fan-out loses nothing.
//! Sends run in parallel; failures stay pending for the reconciler.

use std::sync::Arc;

use futures_util::future::join_all;
use pynchy_store::Store;
use tracing::{debug, warn};

use crate::channel::Channel;

pub struct ChannelFanout {
    channels: Vec<Arc<dyn Channel>>,
    store: Arc<Store>,
}

impl ChannelFanout {
    pub fn new(channels: Vec<Arc<dyn Channel>>, store: Arc<Store>) -> Self {
        Self { channels, store }
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_connected()).count()
    }

    /// Send `text` to every connected channel for `chat_jid`, resolving
    /// the channel-local address through the alias table. With
    /// `suppress_errors` (trace broadcasts) failures are logged and the
    /// ledger row is still marked errored for later retry.
    pub async fn broadcast(&self, chat_jid: &str, text: &str, suppress_errors: bool) {
        self.broadcast_skipping(chat_jid, text, suppress_errors, &[]).await;
    }

    /// [`broadcast`](Self::broadcast) minus the channels in `skip` —
    /// used when streaming edits already delivered the content there.
    /// Skipped channels are marked delivered so the ledger row can clear.
    pub async fn broadcast_skipping(
        &self,
        chat_jid: &str,
        text: &str,
        suppress_errors: bool,
        skip: &[String],
    ) {
        let targets: Vec<&Arc<dyn Channel>> = self
            .channels
            .iter()
            .filter(|ch| ch.is_connected() && !skip.contains(&ch.name().to_string()))
            .collect();
        if targets.is_empty() {
            warn!(chat_jid, "broadcast with no connected channels — ledgered for retry");
        }

        let names: Vec<String> = self.channels.iter().map(|c| c.name().to_string()).collect();
        let ledger_id = match self.store.record_broadcast(chat_jid, text, &names) {
            Ok(id) => id,
            Err(e) => {
                warn!(chat_jid, error = %e, "failed to record broadcast — sending unledgered");
                -1
            }
        };
        if ledger_id >= 0 {
            for name in skip {
                let _ = self.store.mark_delivered(ledger_id, name);
            }
        }

        let sends = targets.iter().map(|ch| {
            let store = Arc::clone(&self.store);
            let channel = Arc::clone(ch);
            let chat_jid = chat_jid.to_string();
            let text = text.to_string();
            async move {
                let target_jid = store
                    .resolve_channel_jid(&chat_jid, channel.name())
                    .unwrap_or_else(|_| chat_jid.clone());
                match channel.send_message(&target_jid, &text).await {
                    Ok(()) => {
                        if ledger_id >= 0 {
                            let _ = store.mark_delivered(ledger_id, channel.name());
                        }
                        debug!(channel = channel.name(), chat_jid = %chat_jid, "delivered");
                    }
                    Err(e) => {
                        if ledger_id >= 0 {
                            let _ =
                                store.mark_delivery_error(ledger_id, channel.name(), &e.to_string());
                        }
                        if suppress_errors {
                            debug!(channel = channel.name(), error = %e, "broadcast send failed");
                        } else {
                            warn!(channel = channel.name(), error = %e, "broadcast send failed");
                        }
                    }
                }
            }
        });
        join_all(sends).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FetchResult;
    use crate::error::ChannelError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    pub(crate) struct FakeChannel {
        pub name: String,
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail_on: Mutex<Option<String>>,
    }

    impl FakeChannel {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
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
        async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
            if self.fail_on.lock().unwrap().as_deref() == Some(text) {
                return Err(ChannelError::SendFailed("simulated".into()));
            }
            self.sent.lock().unwrap().push((jid.into(), text.into()));
            Ok(())
        }
        async fn fetch_inbound_since(
            &self,
            _jid: &str,
            _cursor: &str,
        ) -> Result<FetchResult, ChannelError> {
            Ok(FetchResult::default())
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_and_ledgers() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ch_a = FakeChannel::new("chA");
        let ch_b = FakeChannel::new("chB");
        let fanout = ChannelFanout::new(
            vec![ch_a.clone() as Arc<dyn Channel>, ch_b.clone() as Arc<dyn Channel>],
            Arc::clone(&store),
        );

        fanout.broadcast("g1@x", "hello", false).await;

        assert_eq!(ch_a.sent.lock().unwrap().len(), 1);
        assert_eq!(ch_b.sent.lock().unwrap().len(), 1);
        assert!(store.get_pending_outbound("chA", "g1@x").unwrap().is_empty());
        assert!(store.get_pending_outbound("chB", "g1@x").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_stays_pending() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ch_a = FakeChannel::new("chA");
        *ch_a.fail_on.lock().unwrap() = Some("hello".into());
        let fanout =
            ChannelFanout::new(vec![ch_a.clone() as Arc<dyn Channel>], Arc::clone(&store));

        fanout.broadcast("g1@x", "hello", false).await;

        let pending = store.get_pending_outbound("chA", "g1@x").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "hello");
    }

    #[tokio::test]
    async fn alias_resolution_picks_channel_address() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_jid_alias("native-42", "g1@x", "chA").unwrap();
        let ch_a = FakeChannel::new("chA");
        let fanout =
            ChannelFanout::new(vec![ch_a.clone() as Arc<dyn Channel>], Arc::clone(&store));

        fanout.broadcast("g1@x", "hi", false).await;

        let sent = ch_a.sent.lock().unwrap();
        assert_eq!(sent[0].0, "native-42");
    }
}
