#![warn(warnings)]

use anyhow::{anyhow, Context};
use clap::Parser;
use embedded_hal_bus::spi::ExclusiveDevice;
use linux_embedded_hal::gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::{CdevPin, Delay, SpidevBus};

#[derive(Parser)]
#[command(about = "Read temperature and pressure from a BMP280 and print them as JSON")]
struct Opt {
    /// SPI bus device the sensor is wired to
    #[arg(long, default_value = "/dev/spidev0.0")]
    spi: String,

    /// GPIO character device holding the chip-select line
    #[arg(long, default_value = "/dev/gpiochip0")]
    gpiochip: String,

    /// Line offset of the chip-select pin
    #[arg(long, default_value_t = 5)]
    cs_line: u32,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let mut bus = SpidevBus::open(&opt.spi).with_context(|| format!("opening {}", opt.spi))?;
    bus.0
        .configure(
            &SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(500_000)
                .mode(SpiModeFlags::SPI_MODE_0)
                .build(),
        )
        .context("configuring spi bus")?;

    let mut chip =
        Chip::new(&opt.gpiochip).map_err(|e| anyhow!("opening {}: {e}", opt.gpiochip))?;
    let handle = chip
        .get_line(opt.cs_line)
        .and_then(|line| line.request(LineRequestFlags::OUTPUT, 1, "read-barometer"))
        .map_err(|e| anyhow!("claiming chip-select line {}: {e}", opt.cs_line))?;
    let cs = CdevPin::new(handle).map_err(|e| anyhow!("driving chip-select line: {e}"))?;

    let spi = ExclusiveDevice::new(bus, cs, Delay)
        .map_err(|e| anyhow!("releasing chip select: {e:?}"))?;
    let mut sensor = bmp280::Device::new(spi).map_err(|e| anyhow!("initializing sensor: {e}"))?;

    bmp280::report(&mut sensor, &mut std::io::stdout().lock())
        .map_err(|e| anyhow!("reading sensor: {e}"))?;

    Ok(())
}
