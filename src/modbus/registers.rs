use std::ops::Range;
use thiserror::Error;

pub type Address = u16;
pub type Register = Range<Address>;

/// Number of holding registers exposed by the simulated unit.
pub const REGISTER_COUNT: usize = 31;

pub const VOLTAGE: Register = 0..10;
pub const TEMPERATURE: Register = 10..20;
pub const CURRENT: Register = 20..30;
pub const STATE_OF_CHARGE: Register = 30..31;

pub const VOLTAGE_SCALE: f64 = 100.0;
pub const TEMPERATURE_SCALE: f64 = 10.0;
pub const CURRENT_SCALE: f64 = 1000.0;
pub const STATE_OF_CHARGE_SCALE: f64 = 100.0;

/// Raw register words as served to Modbus clients.
pub type RegisterImage = [u16; REGISTER_COUNT];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    #[error("register block {start}..{end} lies outside the register image")]
    OutOfRange { start: Address, end: Address },
}

pub fn is_register_in_address_range(range: Range<Address>, reg: &Register) -> bool {
    reg.start >= range.start && reg.start <= reg.end && reg.end <= range.end
}

/// Scales `value` and truncates toward zero.
///
/// The generator keeps every channel well inside the i16 range once scaled
/// (current peaks below 26 A, voltage below 59 V), so no clamping happens here.
pub fn encode(value: f64, scale: f64) -> i16 {
    let scaled = (value * scale).trunc();
    debug_assert!(
        scaled >= i16::MIN as f64 && scaled <= i16::MAX as f64,
        "encoded value {scaled} does not fit a 16 bit register"
    );
    scaled as i32 as i16
}

pub fn decode(encoded: i16, scale: f64) -> f64 {
    encoded as f64 / scale
}

/// Fills every slot of `reg` with the same word.
pub fn write_block(image: &mut RegisterImage, reg: &Register, value: i16) -> Result<(), RegisterError> {
    if !is_register_in_address_range(0..REGISTER_COUNT as Address, reg) {
        return Err(RegisterError::OutOfRange { start: reg.start, end: reg.end });
    }

    image[reg.start as usize..reg.end as usize].fill(value as u16);
    Ok(())
}

/// Decodes the first word of `reg`, the value a client polling that block sees.
pub fn read_channel(image: &RegisterImage, reg: &Register, scale: f64) -> f64 {
    decode(image[reg.start as usize] as i16, scale)
}

/// Builds a complete image from the four channel values.
pub fn encode_image(voltage: f64, temperature: f64, current: f64, charge: f64) -> Result<RegisterImage, RegisterError> {
    let mut image = [0; REGISTER_COUNT];

    write_block(&mut image, &VOLTAGE, encode(voltage, VOLTAGE_SCALE))?;
    write_block(&mut image, &TEMPERATURE, encode(temperature, TEMPERATURE_SCALE))?;
    write_block(&mut image, &CURRENT, encode(current, CURRENT_SCALE))?;
    write_block(&mut image, &STATE_OF_CHARGE, encode(charge, STATE_OF_CHARGE_SCALE))?;

    Ok(image)
}
