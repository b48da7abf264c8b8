//! The outbound sender binding.
//!
//! Every envelope the client emits (handshake, application, keepalive)
//! goes through one channel to the socket writer task, so bytes leave in
//! the order they were encoded. The channel does not exist until the
//! socket opens; sending before then is a programming error, not a
//! silent drop.

use tokio::sync::mpsc::UnboundedSender;

use crate::ClientError;

/// Either no socket yet, or the channel feeding the socket writer.
#[derive(Debug, Default)]
pub enum SenderBinding {
    #[default]
    Unbound,
    Bound(UnboundedSender<Vec<u8>>),
}

impl SenderBinding {
    /// Binds the channel for a freshly opened socket.
    ///
    /// # Errors
    /// [`ClientError::SenderAlreadyBound`] if a channel is already bound.
    pub fn bind(&mut self, sender: UnboundedSender<Vec<u8>>) -> Result<(), ClientError> {
        match self {
            Self::Bound(_) => Err(ClientError::SenderAlreadyBound),
            Self::Unbound => {
                *self = Self::Bound(sender);
                Ok(())
            }
        }
    }

    /// Drops the channel, which lets the writer task finish and close the
    /// socket.
    pub fn unbind(&mut self) {
        *self = Self::Unbound;
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    /// Queues an encoded envelope for the socket.
    ///
    /// # Errors
    /// [`ClientError::SenderUnbound`] before the socket opens, and
    /// [`ClientError::NotConnected`] if the writer has already gone away.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        match self {
            Self::Unbound => Err(ClientError::SenderUnbound),
            Self::Bound(tx) => tx.send(bytes).map_err(|_| ClientError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_send_unbound_returns_error() {
        let binding = SenderBinding::default();
        assert!(matches!(
            binding.send(vec![1]),
            Err(ClientError::SenderUnbound)
        ));
    }

    #[test]
    fn test_bind_twice_returns_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let mut binding = SenderBinding::default();
        binding.bind(tx).unwrap();
        assert!(matches!(
            binding.bind(tx2),
            Err(ClientError::SenderAlreadyBound)
        ));
    }

    #[test]
    fn test_send_bound_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut binding = SenderBinding::default();
        binding.bind(tx).unwrap();

        binding.send(vec![1]).unwrap();
        binding.send(vec![2]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
    }

    #[test]
    fn test_unbind_closes_channel_and_allows_rebind() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut binding = SenderBinding::default();
        binding.bind(tx).unwrap();

        binding.unbind();
        assert!(!binding.is_bound());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        let (tx2, _rx2) = mpsc::unbounded_channel();
        binding.bind(tx2).unwrap();
        assert!(binding.is_bound());
    }

    #[test]
    fn test_send_after_writer_gone_is_not_connected() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut binding = SenderBinding::default();
        binding.bind(tx).unwrap();
        drop(rx);

        assert!(matches!(
            binding.send(vec![1]),
            Err(ClientError::NotConnected)
        ));
    }
}
