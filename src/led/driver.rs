use anyhow::{anyhow, Context, Result};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::SpidevBus;
use smart_leds::{SmartLedsWrite, RGB8};
use tracing::{debug, warn};
use ws2812_spi::Ws2812;

use crate::config::Config;
use crate::model::LedColor;

const SPI_CLOCK_HZ: u32 = 3_800_000;

const OFF: RGB8 = RGB8 { r: 0, g: 0, b: 0 };

fn color_value(color: LedColor) -> RGB8 {
    match color {
        LedColor::Red => RGB8::new(255, 0, 0),
        LedColor::Yellow => RGB8::new(255, 150, 0),
        LedColor::Green => RGB8::new(0, 255, 0),
    }
}

/// Hardware capability of the LED service: three color-dedicated strips.
/// Implementations must be drivable from a single thread; all hardware I/O
/// goes through this trait.
pub trait LedDriver: Send {
    fn set_strip(&mut self, strip: LedColor, lit: bool) -> Result<()>;
    fn clear_all(&mut self) -> Result<()>;
}

/// Real driver: one WS2812 strip per severity color, each on its own SPI bus.
pub struct Ws2812Driver {
    red: Ws2812<SpidevBus>,
    yellow: Ws2812<SpidevBus>,
    green: Ws2812<SpidevBus>,
    pixels: usize,
}

impl Ws2812Driver {
    pub fn open(config: &Config) -> Result<Ws2812Driver> {
        Ok(Ws2812Driver {
            red: open_strip(&config.spi_device_red)?,
            yellow: open_strip(&config.spi_device_yellow)?,
            green: open_strip(&config.spi_device_green)?,
            pixels: config.leds_per_strip,
        })
    }

    fn strip(&mut self, strip: LedColor) -> &mut Ws2812<SpidevBus> {
        match strip {
            LedColor::Red => &mut self.red,
            LedColor::Yellow => &mut self.yellow,
            LedColor::Green => &mut self.green,
        }
    }
}

fn open_strip(device: &str) -> Result<Ws2812<SpidevBus>> {
    let mut bus = SpidevBus::open(device)
        .map_err(|err| anyhow!("Opening SPI bus {}: {:?}", device, err))?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(SPI_CLOCK_HZ)
        .mode(SpiModeFlags::SPI_MODE_0)
        .build();
    bus.0
        .configure(&options)
        .with_context(|| format!("Configuring SPI bus {}", device))?;
    Ok(Ws2812::new(bus))
}

impl LedDriver for Ws2812Driver {
    fn set_strip(&mut self, strip: LedColor, lit: bool) -> Result<()> {
        let value = if lit { color_value(strip) } else { OFF };
        let pixels = self.pixels;
        self.strip(strip)
            .write(std::iter::repeat(value).take(pixels))
            .map_err(|err| anyhow!("Writing {} strip: {:?}", strip.name(), err))
    }

    fn clear_all(&mut self) -> Result<()> {
        for strip in [LedColor::Red, LedColor::Yellow, LedColor::Green] {
            self.set_strip(strip, false)?;
        }
        Ok(())
    }
}

/// No-op driver used when hardware initialization fails; keeps the service
/// reading the control channel and publishing status for headless testing.
pub struct SimulatedDriver;

impl LedDriver for SimulatedDriver {
    fn set_strip(&mut self, strip: LedColor, lit: bool) -> Result<()> {
        debug!("Simulated {} strip -> {}", strip.name(), if lit { "on" } else { "off" });
        Ok(())
    }

    fn clear_all(&mut self) -> Result<()> {
        debug!("Simulated strips cleared");
        Ok(())
    }
}

/// Initializes the real driver, degrading to simulation when the SPI buses
/// are unavailable. The boolean is the `hardware_available` status flag.
pub fn init_driver(config: &Config) -> (Box<dyn LedDriver>, bool) {
    match Ws2812Driver::open(config) {
        Ok(driver) => (Box::new(driver), true),
        Err(err) => {
            warn!("LED hardware unavailable, running in simulation mode: {:#}", err);
            (Box::new(SimulatedDriver), false)
        }
    }
}

pub mod test {
    use super::*;
    use crossbeam_channel::{self, Receiver, Sender};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DriverEvent {
        Set(LedColor, bool),
        Clear,
    }

    /// Driver double recording every hardware call.
    pub struct CapturingDriver {
        tx: Sender<DriverEvent>,
        pub fail_writes: bool,
    }

    impl CapturingDriver {
        pub fn new() -> (CapturingDriver, Receiver<DriverEvent>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            (
                CapturingDriver {
                    tx,
                    fail_writes: false,
                },
                rx,
            )
        }
    }

    impl LedDriver for CapturingDriver {
        fn set_strip(&mut self, strip: LedColor, lit: bool) -> Result<()> {
            if self.fail_writes {
                anyhow::bail!("injected hardware failure");
            }
            self.tx
                .send(DriverEvent::Set(strip, lit))
                .context("Recording driver event")
        }

        fn clear_all(&mut self) -> Result<()> {
            if self.fail_writes {
                anyhow::bail!("injected hardware failure");
            }
            self.tx.send(DriverEvent::Clear).context("Recording driver event")
        }
    }
}
