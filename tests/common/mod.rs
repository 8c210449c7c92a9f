#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use feed_dispatch::{HttpRequest, HttpResponse, Transport, TransportError};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};

/// How a [Scripted] transport answers a request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Error(TransportError),
    /// Respond after a delay.
    Delayed(Duration, u16),
    /// Never respond.
    Hang,
}

/// A transport which answers with scripted replies, then with a fallback.
#[derive(Debug)]
pub struct Scripted {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<HttpRequest>>,
    closes: AtomicUsize,
    close_error: Option<TransportError>,
}

impl Scripted {
    pub fn new(script: impl IntoIterator<Item = Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            requests: Mutex::new(vec![]),
            closes: AtomicUsize::new(0),
            close_error: None,
        })
    }

    pub fn always(reply: Reply) -> Arc<Self> {
        Self::new([], reply)
    }

    pub fn failing_to_close(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Reply::Status(200),
            requests: Mutex::new(vec![]),
            closes: AtomicUsize::new(0),
            close_error: Some(error),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for Scripted {
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Status(status) => future::ready(Ok(HttpResponse::new(status, ""))).boxed(),
            Reply::Error(error) => future::ready(Err(error)).boxed(),
            Reply::Delayed(delay, status) => async move {
                tokio::time::sleep(delay).await;
                Ok(HttpResponse::new(status, ""))
            }
            .boxed(),
            Reply::Hang => future::pending().boxed(),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
