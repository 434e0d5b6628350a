//! Ordered delivery of outbound lines.
//!
//! Producers enqueue through a cheap [`OutboundQueue`] handle; a single
//! [`OutboundWriter`] task owns the socket's write half and writes one line
//! at a time in FIFO order. A failed write ends the writer and everything
//! still queued is discarded.

use audio_protocol::ClientMessage;
use log::{debug, warn};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl OutboundQueue {
    /// A queue with no connection behind it; messages are dropped
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// A queue and the receiving end a writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Returns false when the message could not be queued
    pub fn send(&self, message: ClientMessage) -> bool {
        let Some(tx) = &self.tx else {
            debug!("Dropping {:?}, not connected", message);
            return false;
        };
        debug!("📤 {:?}", message);
        tx.send(message.to_line()).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

pub struct OutboundWriter<W> {
    writer: W,
    rx: mpsc::UnboundedReceiver<String>,
}

impl<W: AsyncWrite + Unpin> OutboundWriter<W> {
    pub fn new(writer: W, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { writer, rx }
    }

    /// Write lines until every queue handle is dropped, then flush and shut
    /// the stream down. `on_written` is called after each complete line.
    pub async fn run<F>(mut self, mut on_written: F) -> io::Result<()>
    where
        F: FnMut(usize),
    {
        while let Some(line) = self.rx.recv().await {
            if let Err(e) = self.writer.write_all(line.as_bytes()).await {
                self.rx.close();
                let mut discarded = 0;
                while self.rx.try_recv().is_ok() {
                    discarded += 1;
                }
                warn!(
                    "❌ Write failed ({}), discarding {} queued messages",
                    e, discarded
                );
                return Err(e);
            }
            on_written(line.len());
        }

        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_protocol::{PlayCode, TransferCode};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    struct FailingWriter {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_after: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut writes = self.writes.lock().unwrap();
            if writes.len() >= self.fail_after {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")));
            }
            writes.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn detached_queue_drops_messages() {
        let queue = OutboundQueue::detached();
        assert!(!queue.is_attached());
        assert!(!queue.send(ClientMessage::Ack));
    }

    #[test_log::test(tokio::test)]
    async fn lines_are_written_in_order() {
        let (queue, rx) = OutboundQueue::channel();
        let (client, mut server) = tokio::io::duplex(1024);

        assert!(queue.send(ClientMessage::Transfer(TransferCode::Local)));
        assert!(queue.send(ClientMessage::Play {
            handle: 3,
            code: PlayCode::Success
        }));
        assert!(queue.send(ClientMessage::Ack));
        drop(queue);

        let mut written = 0;
        OutboundWriter::new(client, rx)
            .run(|n| written += n)
            .await
            .unwrap();

        let mut received = String::new();
        server.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "1\t0\n2\t3\t0\n\n");
        assert_eq!(written, received.len());
    }

    #[tokio::test]
    async fn failed_write_discards_the_rest() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let (queue, rx) = OutboundQueue::channel();
        for handle in 0..4 {
            queue.send(ClientMessage::Stop { handle });
        }

        let writer = FailingWriter {
            writes: writes.clone(),
            fail_after: 1,
        };
        let result = OutboundWriter::new(writer, rx).run(|_| {}).await;

        assert!(result.is_err());
        assert_eq!(*writes.lock().unwrap(), vec![b"4\t0\n".to_vec()]);
        assert!(!queue.is_attached());
        assert!(!queue.send(ClientMessage::Stop { handle: 9 }));
    }
}
