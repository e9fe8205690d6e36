//! Background readers that drain child process streams into a queue.
//!
//! Each stream gets a dedicated thread so a slow poller never leaves a pipe
//! full and blocks the child. Pollers consume chunks from the shared channel
//! instead of touching the raw pipes.

use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};

use crate::session::ChannelEvent;

const CHUNK_SIZE: usize = 8192;

enum Message {
    Data(ChannelEvent),
    Eof,
}

/// Drains stdout and stderr of one child on two reader threads.
#[derive(Debug)]
pub(crate) struct StreamPump {
    receiver: Receiver<Message>,
    open: usize,
}

impl StreamPump {
    /// Starts readers for both streams.
    pub(crate) fn start<O, E>(stdout: O, stderr: E) -> io::Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let stderr_sender = sender.clone();
        thread::Builder::new()
            .name(String::from("foreman-stdout"))
            .spawn(move || pump(stdout, ChannelEvent::Stdout, &sender))?;
        thread::Builder::new()
            .name(String::from("foreman-stderr"))
            .spawn(move || pump(stderr, ChannelEvent::Stderr, &stderr_sender))?;
        Ok(Self { receiver, open: 2 })
    }

    /// Returns `true` once both streams reached end of file and every chunk
    /// has been handed out.
    pub(crate) const fn is_drained(&self) -> bool {
        self.open == 0
    }

    /// Waits for the next chunk. `None` blocks until a chunk arrives or both
    /// streams end.
    pub(crate) fn next(&mut self, timeout: Option<Duration>) -> Option<ChannelEvent> {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        while self.open > 0 {
            let message = match deadline {
                None => self.receiver.recv().ok(),
                Some(at) => match self.receiver.recv_deadline(at) {
                    Ok(received) => Some(received),
                    Err(RecvTimeoutError::Timeout) => return None,
                    Err(RecvTimeoutError::Disconnected) => None,
                },
            };
            if let Some(event) = self.accept(message) {
                return Some(event);
            }
        }
        None
    }

    /// Returns every chunk that is already queued without waiting.
    pub(crate) fn drain(&mut self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while self.open > 0 {
            let message = match self.receiver.try_recv() {
                Ok(received) => Some(received),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => None,
            };
            if let Some(event) = self.accept(message) {
                events.push(event);
            }
        }
        events
    }

    fn accept(&mut self, message: Option<Message>) -> Option<ChannelEvent> {
        match message {
            Some(Message::Data(event)) => Some(event),
            Some(Message::Eof) => {
                self.open = self.open.saturating_sub(1);
                None
            }
            None => {
                self.open = 0;
                None
            }
        }
    }
}

fn pump<R: Read>(mut reader: R, wrap: fn(Vec<u8>) -> ChannelEvent, sender: &Sender<Message>) {
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                let chunk = buffer.get(..read).map(<[u8]>::to_vec).unwrap_or_default();
                if sender.send(Message::Data(wrap(chunk))).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    sender.send(Message::Eof).ok();
}
