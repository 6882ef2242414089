//! Register sink and publish policy.
//!
//! The protocol client pushes every parsed register in here. The two
//! energy totals drive the [`EnergyGauge`]; everything else is logged.
//! Publishing happens opportunistically: a significant change goes out
//! after 25 s, a hefty load after 60 s, and anything at all after 120 s.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::gauge::EnergyGauge;
use crate::obis::ElectricityObis;
use crate::{now_ms, Error, Result};

/// The session is torn down when no energy total arrives for this long.
pub const DEAD_MANS_LIMIT_MS: i64 = 50_000;

/// Sink for everything the protocol client decodes.
pub trait ValueProcessor {
    /// The full textual readout, mostly useful for debugging.
    fn set_readout(&mut self, text: &str);

    /// One register value, as read from the wire.
    fn set_register(&mut self, address: &str, value: &str, unit: Option<&str>) -> Result<()>;

    /// Called after every poll round; decides for itself whether to
    /// actually publish.
    fn try_publish(&mut self);

    /// Polling continues while this returns false.
    fn should_stop(&self) -> bool {
        false
    }
}

/// External sink for the aggregated values: positive and negative energy
/// totals in Wh and the signed instantaneous power estimate in W.
pub trait Publisher {
    fn publish(&self, positive_wh: i64, negative_wh: i64, instantaneous_w: i64);
}

/// Timestamp of the last sane register value, shared between the client's
/// processor and the watchdog task.
#[derive(Clone)]
pub struct Watchdog {
    last: Arc<AtomicI64>,
}

impl Watchdog {
    /// A fresh watchdog starts satisfied; the meter gets a full window to
    /// produce its first value.
    pub fn new() -> Self {
        Self {
            last: Arc::new(AtomicI64::new(now_ms())),
        }
    }

    pub fn mark(&self) {
        self.last.store(now_ms(), Ordering::Relaxed);
    }

    pub fn ms_since_mark(&self) -> i64 {
        now_ms() - self.last.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn mark_at(&self, time_ms: i64) {
        self.last.store(time_ms, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// Fails the session once the watchdog goes stale. Runs alongside the
/// client task; whichever fails first wins, and the supervisor tears the
/// rest down.
pub async fn dead_mans_switch(watchdog: Watchdog) -> Result<()> {
    loop {
        let tdelta = watchdog.ms_since_mark();
        if tdelta >= DEAD_MANS_LIMIT_MS {
            return Err(Error::DeadMansSwitchTripped(tdelta));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Processor for the ME162 register layout: `1.8.0` and `2.8.0` feed the
/// gauge, the rest is informational.
pub struct Me162Processor<P: Publisher> {
    publisher: Option<P>,
    gauge: EnergyGauge,
    watchdog: Watchdog,
    /// Time of the last publish on the [`now_ms`] clock.
    last_publish: Option<i64>,
}

impl<P: Publisher> Me162Processor<P> {
    pub fn new(publisher: Option<P>) -> Self {
        Self {
            publisher,
            gauge: EnergyGauge::new(),
            watchdog: Watchdog::new(),
            last_publish: None,
        }
    }

    /// Handle for the dead man's switch task.
    pub fn watchdog(&self) -> Watchdog {
        self.watchdog.clone()
    }

    /// Publish every 120 s, and more often when there is detail worth
    /// forwarding. Before the first publish we pretend half a minute has
    /// passed, so a significant change goes out right away.
    fn is_time_to_publish(&self) -> bool {
        let tdelta_s = self
            .last_publish
            .map(|t| (now_ms() - t) / 1000)
            .unwrap_or(30);
        let inst_pwr = self.gauge.get_instantaneous_power();

        tdelta_s >= 120
            || (tdelta_s >= 60 && inst_pwr.abs() >= 400)
            || (tdelta_s >= 25 && self.gauge.has_significant_change())
    }
}

impl<P: Publisher> ValueProcessor for Me162Processor<P> {
    fn set_readout(&mut self, text: &str) {
        log::info!("[text readout] {:?}", text);
    }

    fn set_register(&mut self, address: &str, value: &str, unit: Option<&str>) -> Result<()> {
        let obis = ElectricityObis::from_code(address)?.set_value(value, unit)?;
        let current_ms = now_ms();
        log::info!("set_register (at {}): {}", current_ms, obis);

        if address == "1.8.0" || address == "2.8.0" {
            let Some(wh) = obis.integral_value() else {
                log::warn!("register {} carries no usable number, ignored", obis);
                return Ok(());
            };
            if address == "1.8.0" {
                self.gauge.set_positive_active_energy_total(current_ms, wh);
            } else {
                self.gauge.set_negative_active_energy_total(current_ms, wh);
            }
            self.watchdog.mark();
        }
        Ok(())
    }

    fn try_publish(&mut self) {
        if !self.is_time_to_publish() {
            return;
        }

        let pos_act = self.gauge.get_positive_active_energy_total();
        let neg_act = self.gauge.get_negative_active_energy_total();
        let inst_pwr = self.gauge.get_instantaneous_power();

        match &self.publisher {
            Some(publisher) => publisher.publish(pos_act, neg_act, inst_pwr),
            None => log::info!(
                "Time to publish: 1.8.0 {} Wh, 2.8.0 {} Wh, 16.7.0 {} W",
                pos_act,
                neg_act,
                inst_pwr
            ),
        }

        self.last_publish = Some(now_ms());
        self.gauge.reset();
    }
}
