//! Scripted in-process embedding server for tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// One step of a scripted reply
pub enum Reply {
    /// Written verbatim
    Raw(String),
    /// Written as one JSON line
    Frame(Value),
    Sleep(Duration),
}

type Script = dyn Fn(&Value, usize) -> Vec<Reply> + Send + Sync;

pub struct FakeServer {
    pub path: PathBuf,
    pub requests: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl FakeServer {
    /// Start a server; the script receives each request and its 0-based index
    pub fn start<F>(script: F) -> Self
    where
        F: Fn(&Value, usize) -> Vec<Reply> + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);

        let seen = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
                        return;
                    };
                    let index = {
                        let mut seen = seen.lock();
                        seen.push(request.clone());
                        seen.len() - 1
                    };
                    for reply in script(&request, index) {
                        let result = match reply {
                            Reply::Raw(raw) => write.write_all(raw.as_bytes()).await,
                            Reply::Frame(value) => {
                                write.write_all(format!("{value}\n").as_bytes()).await
                            }
                            Reply::Sleep(d) => {
                                tokio::time::sleep(d).await;
                                Ok(())
                            }
                        };
                        if result.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            path,
            requests,
            handle,
            _dir: dir,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Deterministic vector of the given dimension
pub fn vector(dim: usize) -> Vec<f32> {
    (0..dim).map(|i| i as f32 / dim as f32).collect()
}
