#![warn(warnings)]

use std::env;
use std::fmt;
use std::io::Write;
use std::thread::sleep;
use std::time::Duration;

use embedded_hal::spi::{Operation, SpiDevice};
use serde::Serialize;
use thiserror::Error;

macro_rules! dbg_bmp {
    ($($arg:tt)*) => {
        if env::var("BMP280_DEBUG").is_ok() {
            eprintln!("[bmp280] {}", format!($($arg)*));
        }
    };
}

const CHIP_ID: u8 = 0x58;

const REGISTER_CHIPID: u8 = 0xD0;
const REGISTER_SOFTRESET: u8 = 0xE0;
const REGISTER_STATUS: u8 = 0xF3;
const REGISTER_CTRL_MEAS: u8 = 0xF4;
const REGISTER_CONFIG: u8 = 0xF5;
const REGISTER_PRESS_MSB: u8 = 0xF7;
const REGISTER_CALIBRATION: u8 = 0x88;

const SOFTRESET_COMMAND: u8 = 0xB6;
const STATUS_MEASURING: u8 = 0x08;

const OVERSCAN_X2: u8 = 0x02;
const OVERSCAN_X16: u8 = 0x05;
const MODE_FORCE: u8 = 0x01;
const STANDBY_TC_125: u8 = 0x02;
const IIR_FILTER_OFF: u8 = 0x00;

// Bit 7 of the register address selects read (1) or write (0) on the wire.
const SPI_READ: u8 = 0x80;
const SPI_WRITE_MASK: u8 = 0x7F;

const RESET_SETTLE: Duration = Duration::from_millis(2);
const CONVERSION_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum Error<E: fmt::Debug> {
    #[error("spi transfer failed: {0:?}")]
    Bus(E),
    #[error("unexpected chip id 0x{0:02X}")]
    ChipId(u8),
}

#[derive(Debug, Error)]
pub enum ReportError<E: fmt::Debug> {
    #[error("sensor read failed: {0:?}")]
    Sensor(E),
    #[error("writing report failed")]
    Io(#[from] std::io::Error),
}

/// The two scalar queries a barometric sensor answers.
pub trait Barometer {
    type Error: fmt::Debug;

    fn temperature_celsius(&mut self) -> Result<f64, Self::Error>;
    fn pressure_hpa(&mut self) -> Result<f64, Self::Error>;
}

/// One temperature/pressure pair, as reported on stdout.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub temperature_c: f64,
    pub pressure_hpa: f64,
}

impl Reading {
    /// Barometric altitude above the given sea-level reference pressure.
    pub fn altitude_m(&self, sea_level_hpa: f64) -> f64 {
        44330.0 * (1.0 - (self.pressure_hpa / sea_level_hpa).powf(0.1903))
    }
}

impl fmt::Display for Reading {
    // The line shape downstream consumers parse; the values stay quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{ "temperature_c":"{}", "pressure_hpa":"{}" }}"#,
            self.temperature_c, self.pressure_hpa
        )
    }
}

pub fn read_once<B: Barometer>(sensor: &mut B) -> Result<Reading, B::Error> {
    Ok(Reading {
        temperature_c: sensor.temperature_celsius()?,
        pressure_hpa: sensor.pressure_hpa()?,
    })
}

pub fn report<B: Barometer, W: Write>(
    sensor: &mut B,
    out: &mut W,
) -> Result<(), ReportError<B::Error>> {
    let reading = read_once(sensor).map_err(ReportError::Sensor)?;
    writeln!(out, "{reading}")?;

    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
}

impl Calibration {
    fn from_registers(data: &[u8; 24]) -> Calibration {
        Calibration {
            t1: u16::from_le_bytes([data[0], data[1]]),
            t2: i16::from_le_bytes([data[2], data[3]]),
            t3: i16::from_le_bytes([data[4], data[5]]),
            p1: u16::from_le_bytes([data[6], data[7]]),
            p2: i16::from_le_bytes([data[8], data[9]]),
            p3: i16::from_le_bytes([data[10], data[11]]),
            p4: i16::from_le_bytes([data[12], data[13]]),
            p5: i16::from_le_bytes([data[14], data[15]]),
            p6: i16::from_le_bytes([data[16], data[17]]),
            p7: i16::from_le_bytes([data[18], data[19]]),
            p8: i16::from_le_bytes([data[20], data[21]]),
            p9: i16::from_le_bytes([data[22], data[23]]),
        }
    }

    fn t_fine(&self, adc_t: i32) -> f64 {
        let var1 = (adc_t as f64 / 16384.0 - self.t1 as f64 / 1024.0) * self.t2 as f64;
        let var2 = (adc_t as f64 / 131072.0 - self.t1 as f64 / 8192.0).powi(2) * self.t3 as f64;

        var1 + var2
    }

    fn temperature(&self, adc_t: i32) -> f64 {
        self.t_fine(adc_t) / 5120.0
    }

    fn pressure(&self, t_fine: f64, adc_p: i32) -> f64 {
        let var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.p6 as f64 / 32768.0;
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        let var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        let var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;

        // datasheet guard against division by zero
        if var1 == 0.0 {
            return 0.0;
        }

        let p = 1048576.0 - adc_p as f64;
        let p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.p9 as f64 * p * p / 2147483648.0;
        let var2 = p * self.p8 as f64 / 32768.0;

        p + (var1 + var2 + self.p7 as f64) / 16.0
    }
}

/// A BMP280 behind an exclusively-owned SPI handle.
pub struct Device<SPI> {
    spi: SPI,
    calibration: Calibration,
}

impl<SPI: SpiDevice> Device<SPI> {
    pub fn new(spi: SPI) -> Result<Device<SPI>, Error<SPI::Error>> {
        let mut device = Device {
            spi,
            calibration: Calibration::default(),
        };

        let id = device.read_register(REGISTER_CHIPID)?;
        if id != CHIP_ID {
            return Err(Error::ChipId(id));
        }

        device.soft_reset()?;
        device.calibration = device.read_calibration()?;
        device.write_register(REGISTER_CONFIG, STANDBY_TC_125 << 5 | IIR_FILTER_OFF << 2)?;

        Ok(device)
    }

    fn soft_reset(&mut self) -> Result<(), Error<SPI::Error>> {
        dbg_bmp!("soft reset");
        self.write_register(REGISTER_SOFTRESET, SOFTRESET_COMMAND)?;
        sleep(RESET_SETTLE);

        Ok(())
    }

    fn read_calibration(&mut self) -> Result<Calibration, Error<SPI::Error>> {
        let mut data = [0u8; 24];
        self.read_registers(REGISTER_CALIBRATION, &mut data)?;

        let calibration = Calibration::from_registers(&data);
        dbg_bmp!("calibration {:?}", calibration);

        Ok(calibration)
    }

    // Forced one-shot measurement; returns the raw 20-bit samples
    // (adc_t, adc_p) from one burst read.
    fn measure(&mut self) -> Result<(i32, i32), Error<SPI::Error>> {
        let ctrl = OVERSCAN_X2 << 5 | OVERSCAN_X16 << 2 | MODE_FORCE;
        self.write_register(REGISTER_CTRL_MEAS, ctrl)?;

        while self.read_register(REGISTER_STATUS)? & STATUS_MEASURING != 0 {
            sleep(CONVERSION_POLL);
        }

        let mut data = [0u8; 6];
        self.read_registers(REGISTER_PRESS_MSB, &mut data)?;

        let adc_p = (data[0] as i32) << 12 | (data[1] as i32) << 4 | (data[2] as i32) >> 4;
        let adc_t = (data[3] as i32) << 12 | (data[4] as i32) << 4 | (data[5] as i32) >> 4;
        dbg_bmp!("raw sample adc_t={} adc_p={}", adc_t, adc_p);

        Ok((adc_t, adc_p))
    }

    fn read_register(&mut self, register: u8) -> Result<u8, Error<SPI::Error>> {
        let mut value = [0u8; 1];
        self.read_registers(register, &mut value)?;

        Ok(value[0])
    }

    fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[register | SPI_READ]),
                Operation::Read(buffer),
            ])
            .map_err(Error::Bus)?;
        dbg_bmp!("read 0x{:02X} -> {:02X?}", register, buffer);

        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Error<SPI::Error>> {
        dbg_bmp!("write 0x{:02X} <- 0x{:02X}", register, value);
        self.spi
            .write(&[register & SPI_WRITE_MASK, value])
            .map_err(Error::Bus)
    }
}

impl<SPI: SpiDevice> Barometer for Device<SPI> {
    type Error = Error<SPI::Error>;

    fn temperature_celsius(&mut self) -> Result<f64, Self::Error> {
        let (adc_t, _) = self.measure()?;

        Ok(self.calibration.temperature(adc_t))
    }

    fn pressure_hpa(&mut self) -> Result<f64, Self::Error> {
        let (adc_t, adc_p) = self.measure()?;
        let t_fine = self.calibration.t_fine(adc_t);

        Ok(self.calibration.pressure(t_fine, adc_p) / 100.0)
    }
}
