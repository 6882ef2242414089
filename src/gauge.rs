//! Power estimation from cumulative watt hour counters.
//!
//! Meters like the ME162 expose energy totals but no usable instantaneous
//! power registers, so the power has to be derived from counter deltas.
//! Sampling often and averaging over a sliding window keeps the estimate
//! honest at low wattage, where a single watt hour takes minutes to tick.

/// Approximates current watt usage from a stream of `(time_ms, counter_wh)`
/// samples with monotonic time and a monotonically increasing counter.
///
/// Keeps a three point window: the oldest retained change, the next to
/// last change and the latest change. Feed it every second or so via
/// [`WattGauge::set_active_energy_total`]; read and [`WattGauge::reset`]
/// at a slower cadence.
#[derive(Debug, Default)]
pub struct WattGauge {
    /// Sample times: window start, next-to-last change, last change.
    t: [i64; 3],
    /// Counter values at those times.
    p: [i64; 3],
    /// Latest sample time, even without a counter change.
    tlast: i64,
    /// Latest estimate that made sense.
    watt: i64,
    seeded: bool,
}

impl WattGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest counter value in watt hours.
    pub fn get_active_energy_total(&self) -> i64 {
        self.p[2]
    }

    /// Best guess of the current power usage in watt.
    pub fn get_instantaneous_power(&self) -> i64 {
        self.watt
    }

    /// Time since the counter last changed.
    pub fn interval_since_last_change(&self) -> i64 {
        self.tlast - self.t[2]
    }

    /// Feed a sample to the gauge: do this often.
    pub fn set_active_energy_total(&mut self, time_ms: i64, current_wh: i64) {
        self.tlast = time_ms;

        if !self.seeded {
            self.t = [time_ms; 3];
            self.p = [current_wh; 3];
            self.watt = 0;
            self.seeded = true;
            return;
        }

        if current_wh == self.p[2] {
            // No change. If there was activity earlier but not anymore,
            // cap the estimate by what a single 1 Wh increment over the
            // quiet interval would amount to.
            if self.tlast - self.t[2] > 30_000 {
                let possible_watt = 1000 * 3600 / (self.tlast - self.t[2]);
                if possible_watt < self.watt {
                    self.watt = possible_watt;
                }
            }
            return;
        }

        if self.t[0] == self.t[1] {
            // First change after seeding.
            self.t[1] = time_ms;
            self.t[2] = time_ms;
            self.p[1] = current_wh;
            self.p[2] = current_wh;
        } else {
            self.t[1] = self.t[2];
            self.p[1] = self.p[2];
            self.t[2] = time_ms;
            self.p[2] = current_wh;
        }

        // A long idle stretch followed by quick changes means the old
        // window misrepresents a sudden usage spike: collapse it.
        if self.t[1] - self.t[0] > 60_000
            && self.p[1] - self.p[0] <= 1
            && self.t[2] - self.t[1] < 15_000
        {
            self.reset();
        }

        self.recalculate_if_sensible();
    }

    /// Start a new measurement interval; typically called right after the
    /// estimate has been consumed. The window only shifts when it held
    /// enough data, and the estimate itself is preserved.
    pub fn reset(&mut self) {
        if self.there_are_enough_values() {
            self.t[0] = self.t[1];
            self.p[0] = self.p[1];
            self.t[1] = self.t[2];
            self.p[1] = self.p[2];
        }
    }

    fn tdelta(&self) -> i64 {
        self.t[2] - self.t[0]
    }

    fn pdelta(&self) -> i64 {
        self.p[2] - self.p[0]
    }

    /// Minimum sampling interval 20 s with 6 Wh of change, or longer
    /// intervals with less change.
    fn there_are_enough_values(&self) -> bool {
        (self.tdelta() >= 20_000 && self.pdelta() >= 6)
            || (self.tdelta() >= 50_000 && self.pdelta() >= 2)
            || self.tdelta() >= 300_000
    }

    fn recalculate_if_sensible(&mut self) {
        if self.there_are_enough_values() {
            self.watt = self.pdelta() * 1000 * 3600 / self.tdelta();
        } else if self.tlast - self.t[0] > 300_000 {
            self.watt = 0;
        }
    }
}

/// Combines two [`WattGauge`]s to monitor positive and negative energy at
/// once. A usable estimate for either direction requires knowing that the
/// other one sat still.
#[derive(Debug, Default)]
pub struct EnergyGauge {
    positive: WattGauge,
    negative: WattGauge,
    wprev: i64,
}

impl EnergyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_positive_active_energy_total(&self) -> i64 {
        self.positive.get_active_energy_total()
    }

    pub fn get_negative_active_energy_total(&self) -> i64 {
        self.negative.get_active_energy_total()
    }

    /// Signed power estimate; positive when consuming, negative when
    /// producing. The direction that changed most recently wins.
    pub fn get_instantaneous_power(&self) -> i64 {
        if self.positive.interval_since_last_change() < self.negative.interval_since_last_change()
        {
            self.positive.get_instantaneous_power()
        } else {
            -self.negative.get_instantaneous_power()
        }
    }

    /// Whether the estimate moved enough since the last reset to be worth
    /// publishing out of schedule.
    pub fn has_significant_change(&self) -> bool {
        let watt = self.get_instantaneous_power();
        let wprev = self.wprev;

        if (wprev < 0 && watt > 0) || (watt < 0 && wprev > 0) {
            return true; // sign change is significant
        }
        if wprev == 0 {
            // Fluctuating around zero is not.
            return !(-20 < watt && watt < 20);
        }

        let factor = watt as f64 / wprev as f64;
        !(0.6 < factor && factor < 1.6)
    }

    pub fn set_positive_active_energy_total(&mut self, time_ms: i64, current_wh: i64) {
        self.positive.set_active_energy_total(time_ms, current_wh);
    }

    pub fn set_negative_active_energy_total(&mut self, time_ms: i64, current_wh: i64) {
        self.negative.set_active_energy_total(time_ms, current_wh);
    }

    pub fn reset(&mut self) {
        self.wprev = self.get_instantaneous_power();
        self.positive.reset();
        self.negative.reset();
    }
}
