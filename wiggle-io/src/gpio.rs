//! Raspberry Pi GPIO io backend.
//!
//! Clock-in and trigger-in are sampled with async edge interrupts; the
//! interrupt callbacks are the edge-reader and only stamp/notify. On a
//! primary node the shared clock line is generated in hardware with the PWM
//! peripheral so the pulse train keeps running regardless of scheduling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use rppal::pwm::{Channel, Polarity, Pwm};
use tracing::{debug, info};
use wiggle_config::GpioBackendConfig;
use wiggle_types::time::monotonic_ns;

use crate::{derive_framerate, EdgeSignals, Error, IoBackend, Result};

/// Duty cycle of the generated clock. Half-period high keeps the falling
/// edge exactly at the phase midpoint, which the trigger-out path relies on.
const CLOCK_DUTY_CYCLE: f64 = 0.5;

struct GpioLines {
    // held to keep the interrupts registered
    _clock_in: InputPin,
    _trigger_in: InputPin,
    trigger_out: OutputPin,
    pwm: Option<Pwm>,
}

pub struct GpioIoBackend {
    config: GpioBackendConfig,
    signals: Arc<EdgeSignals>,
    lines: Mutex<Option<GpioLines>>,
}

fn gpio_err<E: std::fmt::Display>(err: E) -> Error {
    Error::HardwareUnavailable {
        msg: err.to_string(),
    }
}

impl GpioIoBackend {
    pub fn new(config: GpioBackendConfig) -> Self {
        Self {
            config,
            signals: Arc::new(EdgeSignals::new()),
            lines: Mutex::new(None),
        }
    }

    fn pwm_channel(&self) -> Channel {
        match self.config.pwm_channel {
            0 => Channel::Pwm0,
            _ => Channel::Pwm1,
        }
    }
}

impl IoBackend for GpioIoBackend {
    fn start(&self) -> Result<()> {
        let mut guard = self.lines.lock();
        if guard.is_some() {
            return Ok(());
        }

        let gpio = Gpio::new().map_err(gpio_err)?;

        let mut clock_in = gpio
            .get(self.config.clock_in_pin)
            .map_err(gpio_err)?
            .into_input_pulldown();
        let clock_signals = self.signals.clone();
        clock_in
            .set_async_interrupt(Trigger::Both, move |level: Level| match level {
                Level::High => clock_signals.notify_rise(monotonic_ns()),
                Level::Low => clock_signals.notify_fall(),
            })
            .map_err(gpio_err)?;

        let mut trigger_in = gpio
            .get(self.config.trigger_in_pin)
            .map_err(gpio_err)?
            .into_input_pulldown();
        let trigger_signals = self.signals.clone();
        trigger_in
            .set_async_interrupt(Trigger::RisingEdge, move |_level: Level| {
                trigger_signals.notify_trigger();
            })
            .map_err(gpio_err)?;

        let trigger_out = gpio
            .get(self.config.trigger_out_pin)
            .map_err(gpio_err)?
            .into_output_low();

        let pwm = if self.config.enable_clock {
            let pwm = Pwm::with_frequency(
                self.pwm_channel(),
                self.config.fps_nominal as f64,
                CLOCK_DUTY_CYCLE,
                Polarity::Normal,
                true,
            )
            .map_err(gpio_err)?;
            info!(
                "hardware clock enabled on pwm channel {} at {} fps",
                self.config.pwm_channel, self.config.fps_nominal
            );
            Some(pwm)
        } else {
            debug!("hardware clock generation disabled in config");
            None
        };

        info!(
            "gpio lines up: clock_in={} trigger_in={} trigger_out={}",
            self.config.clock_in_pin, self.config.trigger_in_pin, self.config.trigger_out_pin
        );

        *guard = Some(GpioLines {
            _clock_in: clock_in,
            _trigger_in: trigger_in,
            trigger_out,
            pwm,
        });
        Ok(())
    }

    fn stop(&self) {
        if let Some(mut lines) = self.lines.lock().take() {
            if let Some(pwm) = lines.pwm.take() {
                if let Err(e) = pwm.disable() {
                    debug!("disabling pwm clock failed: {e}");
                }
            }
            lines.trigger_out.set_low();
            // dropping the input pins deregisters the interrupts
        }
    }

    fn derive_nominal_framerate_from_clock(&self) -> Result<u32> {
        derive_framerate(&self.signals)
    }

    fn wait_for_clock_rise(&self, timeout: Duration) -> Result<i64> {
        self.signals.wait_rise(timeout)
    }

    fn wait_for_clock_fall(&self, timeout: Duration) -> Result<()> {
        self.signals.wait_fall(timeout)
    }

    fn wait_for_trigger(&self, timeout: Duration) -> Result<()> {
        self.signals.wait_trigger(timeout)
    }

    fn set_trigger_out(&self, on: bool) -> Result<()> {
        let mut guard = self.lines.lock();
        let lines = guard.as_mut().ok_or_else(|| Error::HardwareUnavailable {
            msg: "gpio backend not started".to_string(),
        })?;
        if on {
            lines.trigger_out.set_high();
        } else {
            lines.trigger_out.set_low();
        }
        Ok(())
    }

    fn clock_signal_valid(&self) -> bool {
        self.signals.clock_signal_valid()
    }
}
