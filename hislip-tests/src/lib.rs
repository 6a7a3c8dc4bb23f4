//! Shared fixtures for the end-to-end tests: a handler echoing commands and a
//! server running on an ephemeral loopback port.
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use hislip_server::{
    HandlerError, Subaddress,
    server::{Builder, Server},
    session::SessionTable,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub const IDENTITY: &[u8] = b"hislip-tests,Echo,0,1.0\n";

/// Answers `*IDN?` with [`IDENTITY`], fails on `FAIL` and echoes every other
/// command once its `DataEnd` arrived. Asynchronous requests are answered with
/// their control code.
#[derive(Default)]
pub struct Echo {
    pending: Mutex<Vec<u8>>,
}

impl Subaddress for Echo {
    fn handle_sync(&self, payload: &[u8], end: bool) -> Result<Vec<u8>, HandlerError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| HandlerError::new("poisoned"))?;
        pending.extend_from_slice(payload);
        if !end {
            return Ok(Vec::new());
        }
        let command = std::mem::take(&mut *pending);
        match command.as_slice() {
            b"*IDN?" | b"*IDN?\n" => Ok(IDENTITY.to_vec()),
            b"FAIL" => Err(HandlerError::new("command failed")),
            _ => Ok(command),
        }
    }

    fn handle_async(&self, control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(vec![control_code])
    }
}

/// A server serving [`Echo`] handlers on `127.0.0.1` until dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    server: Arc<Server>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl TestServer {
    /// Starts a server with the given configuration serving `subaddresses`.
    pub async fn start(builder: Builder, subaddresses: &[&str]) -> TestServer {
        let mut server = builder.build();
        for name in subaddresses {
            server
                .register_subaddress(*name, Echo::default())
                .unwrap();
        }
        let server = Arc::new(server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, stopped) = oneshot::channel::<()>();
        let serving = server.clone();
        let task = tokio::spawn(async move {
            serving
                .serve_until(listener, async {
                    let _ = stopped.await;
                })
                .await
        });
        TestServer {
            addr,
            server,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Starts a server with default configuration serving `hislip0`.
    pub async fn start_default() -> TestServer {
        TestServer::start(Builder::new(), &["hislip0"]).await
    }

    pub fn sessions(&self) -> &SessionTable {
        self.server.sessions()
    }

    /// Waits until the number of open sessions reaches `expected`.
    pub async fn wait_for_sessions(&self, expected: usize) {
        for _ in 0..200 {
            if self.sessions().allocated() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} open sessions, found {}",
            expected,
            self.sessions().allocated()
        );
    }

    /// Stops accepting connections and waits for the accept loop to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
