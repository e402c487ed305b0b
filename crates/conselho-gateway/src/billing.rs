//! Per-room billing meter.
//!
//! A meter runs while both participants are in the room. Every period it
//! charges one minute of the consultation's snapshotted rate to the client.
//! Stopping a meter cancels it, waits for any in-flight charge to finish and
//! then optionally flushes the partial interval since the last charge.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conselho_db::Database;
use conselho_db::ledger::{Charge, LedgerError};
use conselho_types::models::Consultation;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::rooms::RoomManager;

/// How a meter task ended.
#[derive(Debug, Clone, Copy)]
pub struct MeterReport {
    /// Billing is paid up to this instant.
    pub paid_until: Instant,
    pub ticks: u64,
    /// The meter stopped itself (funds ran out or the consultation ended);
    /// there is nothing left to flush.
    pub settled: bool,
}

pub struct MeterHandle {
    consultation_id: Uuid,
    rate: Decimal,
    period: Duration,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<MeterReport>,
}

impl MeterHandle {
    /// Spawn a meter for `consultation`. `counter` numbers charges across
    /// every meter the room ever runs, so reference ids never repeat.
    pub fn start(
        rooms: RoomManager,
        consultation: &Consultation,
        period: Duration,
        counter: Arc<AtomicU64>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let meter = Meter {
            rooms,
            consultation_id: consultation.id,
            client_id: consultation.client_id,
            rate: consultation.price_per_minute_snapshot,
            period,
            counter: counter.clone(),
            cancel: cancel.clone(),
        };
        info!(
            "Billing started for consultation {} at {} per {:?}",
            consultation.id, meter.rate, period
        );
        Self {
            consultation_id: consultation.id,
            rate: consultation.price_per_minute_snapshot,
            period,
            counter,
            cancel,
            task: tokio::spawn(meter.run()),
        }
    }

    /// Cancel the meter and wait for it to stop. A charge already in flight
    /// completes first.
    pub async fn stop(self) -> (MeterReport, Flush) {
        self.cancel.cancel();
        let report = match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Billing task for {} failed: {}", self.consultation_id, e);
                MeterReport {
                    paid_until: Instant::now(),
                    ticks: 0,
                    settled: true,
                }
            }
        };
        let flush = Flush {
            consultation_id: self.consultation_id,
            rate: self.rate,
            period: self.period,
            counter: self.counter,
            since: report.paid_until,
        };
        (report, flush)
    }

    /// Stop the meter and charge the partial interval unless it settled
    /// itself. Returns the flush charge, if one was made.
    pub async fn stop_and_flush(self, db: Arc<Database>) -> Option<Charge> {
        let (report, flush) = self.stop().await;
        if report.settled {
            return None;
        }
        flush.charge(db).await
    }
}

/// The not-yet-billed tail of a stopped meter.
pub struct Flush {
    consultation_id: Uuid,
    rate: Decimal,
    period: Duration,
    counter: Arc<AtomicU64>,
    since: Instant,
}

impl Flush {
    pub fn amount(&self) -> Decimal {
        prorate(self.rate, self.since.elapsed(), self.period)
    }

    pub async fn charge(self, db: Arc<Database>) -> Option<Charge> {
        let amount = self.amount();
        if amount.is_zero() {
            return None;
        }
        let id = self.consultation_id;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let reference = format!("consultation:{}:partial:{}", id, n);

        let result =
            tokio::task::spawn_blocking(move || db.charge_consultation(id, amount, &reference))
                .await;
        match result {
            Ok(Ok(charge)) => {
                debug!("Flushed {} for consultation {}", amount, id);
                Some(charge)
            }
            Ok(Err(LedgerError::InsufficientFunds { balance, required })) => {
                warn!(
                    "Partial charge for {} skipped: balance {} < {}",
                    id, balance, required
                );
                None
            }
            Ok(Err(LedgerError::ConsultationNotActive(_))) => None,
            Ok(Err(e)) => {
                error!("Partial charge for {} failed: {}", id, e);
                None
            }
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                None
            }
        }
    }
}

/// Charge for `elapsed` out of a `period`-long billable minute, truncated to
/// whole cents. Never more than one full rate.
pub fn prorate(rate: Decimal, elapsed: Duration, period: Duration) -> Decimal {
    let period_ms = period.as_millis();
    if period_ms == 0 {
        return Decimal::ZERO;
    }
    let elapsed_ms = elapsed.as_millis().min(period_ms);
    let (Ok(elapsed_ms), Ok(period_ms)) = (u64::try_from(elapsed_ms), u64::try_from(period_ms))
    else {
        return Decimal::ZERO;
    };
    (rate * Decimal::from(elapsed_ms) / Decimal::from(period_ms))
        .round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

struct Meter {
    rooms: RoomManager,
    consultation_id: Uuid,
    client_id: Uuid,
    rate: Decimal,
    period: Duration,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Meter {
    async fn run(self) -> MeterReport {
        let mut paid_until = Instant::now();
        let mut ticks = 0;
        let mut interval = tokio::time::interval_at(paid_until + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return MeterReport { paid_until, ticks, settled: false };
                }
                _ = interval.tick() => {}
            }

            let id = self.consultation_id;
            let rate = self.rate;
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let reference = format!("consultation:{}:tick:{}", id, n);
            let db = self.rooms.db();
            let result =
                tokio::task::spawn_blocking(move || db.charge_consultation(id, rate, &reference))
                    .await;

            match result {
                Ok(Ok(charge)) => {
                    ticks += 1;
                    paid_until += self.period;
                    debug!(
                        "Consultation {} tick {}: charged {}, total {}, client balance {}",
                        id, n, rate, charge.total_charged, charge.transaction.balance_after
                    );
                }
                Ok(Err(LedgerError::InsufficientFunds { balance, required })) => {
                    warn!(
                        "Consultation {} out of funds: balance {}, required {}",
                        id, balance, required
                    );
                    // Closing the room awaits this task, so it cannot run inline.
                    tokio::spawn(self.rooms.clone().close_for_insufficient_funds(
                        id,
                        self.client_id,
                        balance,
                        required,
                    ));
                    return MeterReport { paid_until, ticks, settled: true };
                }
                Ok(Err(LedgerError::ConsultationNotActive(_))) => {
                    info!("Consultation {} ended elsewhere, closing its room", id);
                    tokio::spawn(self.rooms.clone().close_ended_elsewhere(id));
                    return MeterReport { paid_until, ticks, settled: true };
                }
                Ok(Err(e)) => {
                    error!("Billing tick for {} failed: {}", id, e);
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                }
            }
        }
    }
}
