//! Finished-match persistence

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::game::MatchRecord;

use super::client::{AccountsClient, StoreError};

/// Match results sink
#[derive(Clone)]
pub struct MatchStore {
    client: AccountsClient,
}

impl MatchStore {
    pub fn new(client: AccountsClient) -> Self {
        Self { client }
    }

    /// Record a result; the service updates both players' win/loss counters
    pub async fn save_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        self.client.post("/api/matches", record).await
    }

    /// Drain finished matches until every room sender is gone. Failures are
    /// logged and the record is dropped.
    pub async fn run(self, mut records: mpsc::Receiver<MatchRecord>) {
        while let Some(record) = records.recv().await {
            if !self.client.is_configured() {
                info!(?record, "Match finished (stats service not configured)");
                continue;
            }
            match self.save_match(&record).await {
                Ok(()) => info!(
                    player1 = %record.player1,
                    player2 = %record.player2,
                    "Match result saved"
                ),
                Err(err) => warn!(?record, error = %err, "Failed to save match result"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> MatchRecord {
        MatchRecord {
            player1: "alice".into(),
            player2: "bob".into(),
            score1: 7,
            score2: 4,
            duration: 185,
        }
    }

    #[test]
    fn record_matches_stats_api_body() {
        assert_eq!(
            serde_json::to_value(record()).unwrap(),
            json!({"player1": "alice", "player2": "bob", "score1": 7, "score2": 4, "duration": 185})
        );
    }

    #[tokio::test]
    async fn worker_drains_and_stops_when_senders_drop() {
        let store = MatchStore::new(AccountsClient::with_base_url(None));
        let (tx, rx) = mpsc::channel(4);
        tx.send(record()).await.unwrap();
        tx.send(record()).await.unwrap();
        drop(tx);

        tokio_test::assert_ok!(
            tokio::time::timeout(std::time::Duration::from_secs(1), store.run(rx)).await
        );
    }
}
