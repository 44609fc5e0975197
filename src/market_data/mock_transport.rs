//! Scripted transport for tests: each `connect` consumes the next queued
//! session. With nothing queued the connection stays open and silent.

use std::collections::VecDeque;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::market_data::kline_stream::{TextStream, Transport};

enum Session {
    Frames(mpsc::UnboundedReceiver<String>),
    Fail(String),
}

#[derive(Default)]
pub struct MockTransport {
    sessions: Mutex<VecDeque<Session>>,
    urls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session whose frames are fed through the returned sender.
    /// Dropping the sender ends the session like a server-side close.
    pub fn push_session(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push_back(Session::Frames(rx));
        tx
    }

    /// Queue a failed connect attempt.
    pub fn push_failure(&self, reason: &str) {
        self.sessions.lock().push_back(Session::Fail(reason.to_string()));
    }

    /// Every URL passed to `connect`, oldest first.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TextStream>> {
        self.urls.lock().push(url);
        let session = self.sessions.lock().pop_front();
        async move {
            match session {
                Some(Session::Frames(rx)) => {
                    let frames = futures_util::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|text| (Ok(text), rx))
                    });
                    Ok(frames.boxed())
                }
                Some(Session::Fail(reason)) => Err(anyhow::anyhow!(reason)),
                None => Ok(futures_util::stream::pending().boxed()),
            }
        }
        .boxed()
    }
}
