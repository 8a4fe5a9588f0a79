//! Channel-backed pipeline carrying crawl results out of the crawler.

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::artifact::Artifact;
use crate::frontier::SpawnedUrl;

/// Hands artifacts to the gatherer task and spawned URLs to the frontier
/// push task. Sends give up silently when the worker is shutting down, so a
/// crawl in flight at cancellation cannot deadlock on a full channel.
#[derive(Clone)]
pub struct OutputPipeline {
    artifact_tx: Sender<Artifact>,
    push_tx: Sender<SpawnedUrl>,
    cancel: CancellationToken,
}

impl OutputPipeline {
    pub fn new(
        artifact_tx: Sender<Artifact>,
        push_tx: Sender<SpawnedUrl>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            artifact_tx,
            push_tx,
            cancel,
        }
    }

    pub async fn output_artifact(&self, artifact: Artifact) {
        tokio::select! {
            _ = self.artifact_tx.send(artifact) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    pub async fn output_spawned(&self, spawned: SpawnedUrl) {
        tokio::select! {
            _ = self.push_tx.send(spawned) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitized_url::SanitizedUrl;

    fn artifact() -> Artifact {
        Artifact {
            host: "example.com".to_string(),
            url: "http://example.com/".to_string(),
            status: 200,
            title: String::new(),
            server: String::new(),
            elapsed: 0.0,
        }
    }

    #[tokio::test]
    async fn delivers_when_capacity_is_available() {
        let (artifact_tx, mut artifact_rx) = tokio::sync::mpsc::channel(1);
        let (push_tx, _push_rx) = tokio::sync::mpsc::channel(1);
        let out = OutputPipeline::new(artifact_tx, push_tx, CancellationToken::new());

        out.output_artifact(artifact()).await;
        assert!(artifact_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_full_channel() {
        let (artifact_tx, _artifact_rx) = tokio::sync::mpsc::channel(1);
        let (push_tx, _push_rx) = tokio::sync::mpsc::channel(1);
        let cancel = CancellationToken::new();
        let out = OutputPipeline::new(artifact_tx, push_tx.clone(), cancel.clone());

        // Fill the push channel so the next send would block forever.
        push_tx
            .send(SpawnedUrl {
                from: SanitizedUrl::parse("http://example.com/").unwrap(),
                elapsed: 0.0,
                spawned: vec![],
            })
            .await
            .unwrap();

        cancel.cancel();
        out.output_spawned(SpawnedUrl {
            from: SanitizedUrl::parse("http://example.com/").unwrap(),
            elapsed: 0.0,
            spawned: vec![],
        })
        .await;
    }
}
