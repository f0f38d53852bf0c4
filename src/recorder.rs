// ===============================
// src/recorder.rs
// ===============================
//
// JSONL audit recorder untuk satu kali run flash close:
// - Tulis setiap Event ke file .jsonl (append), satu baris per event + timestamp.
// - Bufer dengan BufWriter agar hemat syscall, flush periodik tiap 1s.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file dan lanjut.
//
// ENV: set `RECORD_FILE=/path/to/flash_close.jsonl` (atau --record-file) agar aktif.
//
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

#[derive(Serialize)]
struct Line<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Drains `rx` until every sender is dropped, then flushes and returns.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, events will not be recorded");
            // tetap kuras channel supaya pengirim tidak tertahan
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // Channel closed: flush dan keluar
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&Line { ts: Utc::now(), event: &ev }) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            // coba lagi sekali setelah reopen
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                            }
                        }
                        Err(e2) => error!(?e2, "recorder: reopen failed, drop event"),
                    }
                }
            }

            _ = tick.tick() => {
                // Flush periodik
                let _ = writer.flush().await;
            }
        }
    }
}
