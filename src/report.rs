// ===============================
// src/report.rs
// ===============================
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{OrderKind, Position};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub symbol: String,
    /// Order id, or the side for positions.
    pub id: String,
    pub error: String,
}

/// Outcome of one remediation stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub found: usize,
    pub done: usize,
    pub failures: Vec<ItemFailure>,
    pub fetch_error: Option<String>,
}

impl StageReport {
    pub fn failed(&self) -> usize { self.failures.len() }
}

/// What the verification pass still saw open. `None` = could not be re-fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Residual {
    pub positions: Option<Vec<Position>>,
    pub trigger_orders: Option<usize>,
    pub tpsl_orders: Option<usize>,
    pub limit_orders: Option<usize>,
    pub errors: Vec<String>,
}

impl Residual {
    pub fn orders(&self, kind: OrderKind) -> Option<usize> {
        match kind {
            OrderKind::Trigger => self.trigger_orders,
            OrderKind::TpSl => self.tpsl_orders,
            OrderKind::Limit => self.limit_orders,
        }
    }

    pub fn set_orders(&mut self, kind: OrderKind, n: Option<usize>) {
        match kind {
            OrderKind::Trigger => self.trigger_orders = n,
            OrderKind::TpSl => self.tpsl_orders = n,
            OrderKind::Limit => self.limit_orders = n,
        }
    }

    pub fn remaining_positions(&self) -> Option<usize> { self.positions.as_ref().map(Vec::len) }

    /// Sum over the order classes, `None` if any class is unknown.
    pub fn remaining_orders(&self) -> Option<usize> {
        OrderKind::ALL.iter().map(|k| self.orders(*k)).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlashCloseReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub positions: StageReport,
    pub trigger_orders: StageReport,
    pub tpsl_orders: StageReport,
    pub limit_orders: StageReport,
    pub residual: Residual,
    pub release_error: Option<String>,
}

impl FlashCloseReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            positions: StageReport::default(),
            trigger_orders: StageReport::default(),
            tpsl_orders: StageReport::default(),
            limit_orders: StageReport::default(),
            residual: Residual::default(),
            release_error: None,
        }
    }

    pub fn orders(&self, kind: OrderKind) -> &StageReport {
        match kind {
            OrderKind::Trigger => &self.trigger_orders,
            OrderKind::TpSl => &self.tpsl_orders,
            OrderKind::Limit => &self.limit_orders,
        }
    }

    pub fn orders_mut(&mut self, kind: OrderKind) -> &mut StageReport {
        match kind {
            OrderKind::Trigger => &mut self.trigger_orders,
            OrderKind::TpSl => &mut self.tpsl_orders,
            OrderKind::Limit => &mut self.limit_orders,
        }
    }

    /// Verified flat: nothing open and nothing unknown.
    pub fn is_flat(&self) -> bool {
        self.residual.remaining_positions() == Some(0) && self.residual.remaining_orders() == Some(0)
    }

    /// Human-readable summary, one line each.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut out = vec![stage_line(&self.positions, "open position", "closed", "no open positions")];
        for kind in OrderKind::ALL {
            let label = kind.label();
            out.push(stage_line(
                self.orders(kind),
                &format!("{label} order"),
                "canceled",
                &format!("no {label} orders"),
            ));
        }

        match &self.residual.positions {
            None => out.push("WARNING: positions could not be verified".to_string()),
            Some(p) if p.is_empty() => out.push("All positions closed successfully".to_string()),
            Some(p) => {
                out.push(format!("WARNING: {} positions still open", p.len()));
                for pos in p {
                    out.push(format!("  - {} {}: {} contracts", pos.symbol, pos.side, pos.contracts));
                }
            }
        }

        match self.residual.remaining_orders() {
            Some(0) => out.push("All orders canceled successfully".to_string()),
            total => {
                match total {
                    Some(n) => out.push(format!("WARNING: {n} orders still open")),
                    None => out.push("WARNING: orders could not be fully verified".to_string()),
                }
                for (kind, name) in
                    [(OrderKind::Trigger, "Trigger"), (OrderKind::TpSl, "TP/SL"), (OrderKind::Limit, "Limit")]
                {
                    let n = self.residual.orders(kind).map_or("unknown".to_string(), |n| n.to_string());
                    out.push(format!("  - {name} orders: {n}"));
                }
            }
        }

        for e in &self.residual.errors {
            out.push(format!("ERROR: verification fetch failed: {e}"));
        }
        if let Some(e) = &self.release_error {
            out.push(format!("ERROR: session release failed: {e}"));
        }
        out
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 { format!("{n} {noun}") } else { format!("{n} {noun}s") }
}

fn stage_line(stage: &StageReport, noun: &str, verb: &str, empty: &str) -> String {
    if let Some(e) = &stage.fetch_error {
        return format!("ERROR: {noun}s could not be fetched: {e}");
    }
    if stage.found == 0 {
        return empty.to_string();
    }
    let mut line = format!("{} {verb}", plural(stage.done, noun));
    if stage.failed() > 0 {
        line.push_str(&format!(", {} failed", stage.failed()));
        for f in &stage.failures {
            line.push_str(&format!("\n  - {} {}: {}", f.symbol, f.id, f.error));
        }
    }
    line
}

impl fmt::Display for FlashCloseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flash close summary ({} -> {})", self.started_at.to_rfc3339(), self.finished_at.to_rfc3339())?;
        for line in self.summary_lines() {
            writeln!(f, " > {line}")?;
        }
        Ok(())
    }
}
