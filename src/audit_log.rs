use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One finished gateway request. Pushed fire-and-forget; the writer task
/// owns the file and rotates it by size.
#[derive(Clone, Serialize)]
pub struct GatewayAuditRecord {
    pub ts_ms: u128,
    pub request_id: String,
    pub family: String,
    pub model: String,
    pub account_id: i64,
    pub account_name: String,
    pub api_key_id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub subscription: Option<String>,
    pub stream: bool,
    pub switch_count: u32,
    pub status: u16,
}

#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<GatewayAuditRecord>,
}

impl AuditLogger {
    pub fn new(base_path: String, max_file_bytes: u64) -> Result<Self, String> {
        let (tx, mut rx) = mpsc::channel::<GatewayAuditRecord>(256);
        tokio::spawn(async move {
            let mut current_path = build_log_path(&base_path);
            let mut file = match open_log_file(&current_path).await {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!("audit log open error: {}", err);
                    return;
                }
            };
            let mut current_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            while let Some(record) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&record) {
                    let projected = current_size + line.len() as u64 + 1;
                    if projected > max_file_bytes {
                        current_path = build_log_path(&base_path);
                        match open_log_file(&current_path).await {
                            Ok(new_file) => {
                                file = new_file;
                                current_size = 0;
                            }
                            Err(err) => {
                                tracing::error!("audit log rotate error: {}", err);
                            }
                        }
                    }
                    if file.write_all(line.as_bytes()).await.is_err() {
                        tracing::error!("audit log write error");
                        continue;
                    }
                    if file.write_all(b"\n").await.is_err() {
                        tracing::error!("audit log write error");
                    }
                    current_size += line.len() as u64 + 1;
                }
            }
        });
        Ok(Self { sender: tx })
    }

    pub async fn push(&self, record: GatewayAuditRecord) {
        let _ = self.sender.send(record).await;
    }
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn build_log_path(base: &str) -> String {
    let ts = now_ms();
    if let Some(stripped) = base.strip_suffix(".jsonl") {
        format!("{}.{}.jsonl", stripped, ts)
    } else {
        format!("{}.{}", base, ts)
    }
}

async fn open_log_file(path: &str) -> Result<tokio::fs::File, std::io::Error> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
