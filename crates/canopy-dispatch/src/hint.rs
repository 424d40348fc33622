use canopy_storage::BlobPath;
use tokio::sync::mpsc;

/// A blob known to have been written, pushed ahead of the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHint {
  pub account: String,
  pub path: BlobPath,
}

/// Sending half of the blob hint channel. Sends never block and are dropped
/// once the listener is gone.
#[derive(Debug, Clone)]
pub struct BlobHintSender {
  sender: mpsc::UnboundedSender<BlobHint>,
}

impl BlobHintSender {
  pub fn send(&self, account: impl Into<String>, path: BlobPath) {
    // Ignore send errors - the listener may have stopped
    let _ = self.sender.send(BlobHint {
      account: account.into(),
      path,
    });
  }
}

pub type BlobHintReceiver = mpsc::UnboundedReceiver<BlobHint>;

pub fn blob_hint_channel() -> (BlobHintSender, BlobHintReceiver) {
  let (sender, receiver) = mpsc::unbounded_channel();
  (BlobHintSender { sender }, receiver)
}
