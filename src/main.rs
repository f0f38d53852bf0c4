// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/flash_close

 # dry run terhadap akun mock (tanpa kredensial)
 VENUE_MODE=mock cargo run -- --record-file data/flash_close.jsonl

 # akun live, kredensial dari BITGET1_API_KEY / _API_SECRET / _API_PASSPHRASE
 cargo run --release -- --account BITGET1 --product-type USDT-FUTURES --metrics-file data/flash_close.prom
*/
/*
=============================================================================
Project : flash_close — emergency flat-and-cancel tool for Bitget futures
Module  : <module_name>.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Closes every open position and cancels every trigger, TP/SL and
          limit order on one Bitget futures account, retrying rate-limited
          calls with exponential backoff, then re-checks the account and
          reports anything still open.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod retry;
mod gateway;          // trait + mock venue (in-memory account)
mod bitget;           // helper (signer/types/symbols) for Bitget
mod gateway_bitget;   // real Bitget futures (REST v2 mix)
mod report;
mod flash_close;

use std::error::Error;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{Args, Cli, Credentials, VenueMode};
use crate::domain::Event;
use crate::flash_close::FlashClose;
use crate::gateway::{Gateway, MockGateway};
use crate::gateway_bitget::BitgetGateway;
use crate::report::FlashCloseReport;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter(config::log_filter()).init();

    // ---- Load config ----
    let cli = Cli::parse();
    let args = match config::load(&cli) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            info!("Flash close operation completed");
            return;
        }
    };

    // ---- Metrics ----
    metrics::init();

    info!(
        venue_mode = args.venue_mode.as_str(),
        product_type = %args.product_type,
        account = %args.account,
        max_attempts = args.retry.max_attempts,
        base_delay_ms = args.retry.base_delay.as_millis() as u64,
        "startup config"
    );

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(1024);
    let recorder = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));
    let rec_tx = recorder.as_ref().map(|_| rec_tx);
    if let Some(tx) = &rec_tx {
        let message = format!(
            "start venue={} product_type={} account={}",
            args.venue_mode.as_str(),
            args.product_type,
            args.account
        );
        let _ = tx.send(Event::Note { message }).await;
    }

    // ---- Venue ----
    let outcome = match args.venue_mode {
        VenueMode::Mock => {
            warn!("VENUE_MODE=mock, running against an in-memory demo account");
            let gw = MockGateway::demo(args.product_type);
            execute(&gw, &args, rec_tx).await
        }
        VenueMode::Bitget => {
            match Credentials::from_env(&args.account)
                .map_err(BoxError::from)
                .and_then(|c| BitgetGateway::connect(&args, c).map_err(BoxError::from))
            {
                Ok(gw) => execute(&gw, &args, rec_tx).await,
                Err(e) => {
                    drop(rec_tx);
                    Err(e)
                }
            }
        }
    };

    match outcome {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(s) => println!("{s}"),
                    Err(e) => error!(error = %e, "could not serialize report"),
                }
            } else {
                print!("{report}");
            }
            if !report.is_flat() {
                warn!("account is not verified flat, check the summary above");
            }
        }
        Err(e) => error!(error = %e, "flash close aborted"),
    }

    // Semua sender sudah di-drop, recorder flush lalu berhenti
    if let Some(handle) = recorder {
        if let Err(e) = handle.await {
            error!(?e, "recorder task failed");
        }
    }

    if let Some(path) = &args.metrics_file {
        if let Err(e) = metrics::write_textfile(path).await {
            error!(?e, %path, "could not write metrics file");
        }
    }

    info!("Flash close operation completed");
}

async fn execute<G: Gateway>(
    gw: &G,
    args: &Args,
    rec_tx: Option<mpsc::Sender<Event>>,
) -> Result<FlashCloseReport, BoxError> {
    let mut fc = FlashClose::new(gw, args.retry);
    if let Some(tx) = rec_tx {
        fc = fc.with_recorder(tx);
    }
    Ok(fc.run().await?)
}
