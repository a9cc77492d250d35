use async_trait::async_trait;
use std::path::Path;

/// A message received from a channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
}

/// Core channel trait — implement for any messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send a message through this channel
    async fn send(&self, message: &str, recipient: &str) -> anyhow::Result<()>;

    /// Send a placeholder message and return its platform message id so it
    /// can be edited in place later. Platforms without edit support may
    /// return an empty id, in which case `edit_message` is a no-op.
    async fn send_placeholder(&self, text: &str, recipient: &str) -> anyhow::Result<String>;

    /// Edit a previously sent message in place
    async fn edit_message(
        &self,
        message_id: &str,
        text: &str,
        recipient: &str,
    ) -> anyhow::Result<()>;

    /// Send a file with an optional caption
    async fn send_file(
        &self,
        path: &Path,
        caption: Option<&str>,
        recipient: &str,
    ) -> anyhow::Result<()>;

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyChannel;

    #[async_trait]
    impl Channel for DummyChannel {
        fn name(&self) -> &str {
            "dummy"
        }

        async fn send(&self, _message: &str, _recipient: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_placeholder(&self, _text: &str, _recipient: &str) -> anyhow::Result<String> {
            Ok("1".into())
        }

        async fn edit_message(
            &self,
            _message_id: &str,
            _text: &str,
            _recipient: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_file(
            &self,
            _path: &Path,
            _caption: Option<&str>,
            _recipient: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn listen(
            &self,
            tx: tokio::sync::mpsc::Sender<ChannelMessage>,
        ) -> anyhow::Result<()> {
            tx.send(ChannelMessage {
                id: "1".into(),
                sender: "tester".into(),
                content: "hello".into(),
                channel: "dummy".into(),
                timestamp: 123,
            })
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
        }
    }

    #[tokio::test]
    async fn default_health_check_is_healthy() {
        let channel = DummyChannel;
        assert!(channel.health_check().await);
    }

    #[tokio::test]
    async fn listen_sends_message_to_channel() {
        let channel = DummyChannel;
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        channel.listen(tx).await.unwrap();

        let received = rx.recv().await.expect("message should be sent");
        assert_eq!(received.sender, "tester");
        assert_eq!(received.content, "hello");
        assert_eq!(received.channel, "dummy");
    }
}
