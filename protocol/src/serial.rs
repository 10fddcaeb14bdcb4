//! Serial line parameters as they appear in the device schema: numeric data
//! bits and stop bits, lowercase parity names.

use std::convert::TryFrom;
use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(format!("invalid data bits: {}", x)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(x: DataBits) -> u8 {
        match x {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            _ => Err(format!("invalid stop bits: {}", x)),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(x: StopBits) -> u8 {
        match x {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize, Hash)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Display for DataBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl Display for StopBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x = match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        };
        f.write_str(x)
    }
}

impl Display for SerialParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}{}{}",
            self.baud, self.data_bits, self.parity, self.stop_bits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_bits_accepts_only_5_to_8() {
        let bits: DataBits = serde_json::from_str("8").unwrap();
        assert_eq!(bits, DataBits::Eight);
        assert!(serde_json::from_str::<DataBits>("9").is_err());
        assert_eq!(serde_json::to_string(&DataBits::Seven).unwrap(), "7");
    }

    #[test]
    fn parity_uses_lowercase_names() {
        let p: Parity = serde_json::from_str("\"even\"").unwrap();
        assert_eq!(p, Parity::Even);
        assert!(serde_json::from_str::<Parity>("\"mark\"").is_err());
    }

    #[test]
    fn params_display() {
        let params = SerialParams {
            baud: 115200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        };
        assert_eq!(params.to_string(), "115200::8N1");
    }
}
