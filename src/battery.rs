use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

pub const MIN_SOC: f64 = 10.0;
pub const MAX_SOC: f64 = 100.0;

const DISCHARGE_THRESHOLD: f64 = 0.4;
const CHARGE_THRESHOLD: f64 = 0.7;

/// Point-in-time copy of the four battery channels.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct BatteryState {
    /// State of charge in percent.
    pub soc: f64,
    pub voltage: f64,
    /// Amps, positive while discharging.
    pub current: f64,
    pub temperature: f64,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Mode {
    Discharge,
    Charge,
    Idle,
}

impl Mode {
    pub fn select(r: f64) -> Self {
        if r < DISCHARGE_THRESHOLD {
            Mode::Discharge
        } else if r < CHARGE_THRESHOLD {
            Mode::Charge
        } else {
            Mode::Idle
        }
    }
}

struct Inner {
    state: BatteryState,
    rng: StdRng,
}

/// Bounded random walk over the battery channels.
///
/// A single draw per tick picks the mode and sets the magnitudes, so voltage and
/// current move together with the charge trend.
pub struct Generator {
    inner: Mutex<Inner>,
    negative_charge_current: bool,
}

impl Generator {
    pub fn new(initial: BatteryState, negative_charge_current: bool) -> Self {
        Self::with_rng(initial, negative_charge_current, StdRng::from_os_rng())
    }

    pub fn with_seed(initial: BatteryState, negative_charge_current: bool, seed: u64) -> Self {
        Self::with_rng(initial, negative_charge_current, StdRng::seed_from_u64(seed))
    }

    /// Starts from `initial` with the charge pulled into `MIN_SOC..=MAX_SOC`.
    fn with_rng(initial: BatteryState, negative_charge_current: bool, rng: StdRng) -> Self {
        let state = BatteryState {
            soc: initial.soc.clamp(MIN_SOC, MAX_SOC),
            ..initial
        };

        Self {
            inner: Mutex::new(Inner { state, rng }),
            negative_charge_current,
        }
    }

    pub fn snapshot(&self) -> BatteryState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Advances the channels by one step and returns the mode taken with the new state.
    ///
    /// The state is copied under the same lock as the step, so it is never one
    /// written by a later tick.
    pub fn tick(&self) -> (Mode, BatteryState) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let r = inner.rng.random::<f64>();
        let mode = self.step(&mut inner.state, r);
        (mode, inner.state)
    }

    /// Same as [`Generator::tick`] with an explicit draw `r` in `[0, 1)`.
    #[cfg(test)]
    pub fn tick_with(&self, r: f64) -> Mode {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.step(&mut inner.state, r)
    }

    fn step(&self, state: &mut BatteryState, r: f64) -> Mode {
        let mode = Mode::select(r);

        match mode {
            Mode::Discharge => {
                state.soc = (state.soc - 0.5).max(MIN_SOC);
                state.voltage = voltage_for(state.soc, r, 2.0);
                state.current = 10.0 + r * 40.0;
            },
            Mode::Charge => {
                state.soc = (state.soc + 0.3).min(MAX_SOC);
                state.voltage = voltage_for(state.soc, r, 2.0);

                let magnitude = 5.0 + r * 20.0;
                state.current = if self.negative_charge_current { -magnitude } else { magnitude };
            },
            Mode::Idle => {
                state.soc = (state.soc - 0.1).max(MIN_SOC);
                state.voltage = voltage_for(state.soc, r, 1.0);
                state.current = r * 5.0;
            },
        }

        state.temperature = 20.0 + r * 15.0;
        mode
    }
}

fn voltage_for(soc: f64, r: f64, wobble: f64) -> f64 {
    48.0 + (soc / 100.0) * 10.0 + (r - 0.5) * wobble
}
