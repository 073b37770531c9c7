//! USB stack: xHCI host controller and HID class support.

pub mod descriptors;
pub mod hid;
pub mod xhci;

/// USB speed classes, mapped to the default xHCI port speed ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    LowSpeed,
    FullSpeed,
    HighSpeed,
    SuperSpeed,
}

impl SpeedClass {
    /// Decode a PORTSC port-speed id.
    pub fn from_speed_id(speed_id: u8) -> Option<SpeedClass> {
        match speed_id {
            1 => Some(SpeedClass::FullSpeed),
            2 => Some(SpeedClass::LowSpeed),
            3 => Some(SpeedClass::HighSpeed),
            4 => Some(SpeedClass::SuperSpeed),
            _ => None,
        }
    }

    pub fn speed_id(&self) -> u8 {
        match self {
            SpeedClass::FullSpeed => 1,
            SpeedClass::LowSpeed => 2,
            SpeedClass::HighSpeed => 3,
            SpeedClass::SuperSpeed => 4,
        }
    }

    /// Default max packet size for endpoint 0 until the device
    /// descriptor corrects it.
    pub fn default_control_packet_size(&self) -> u16 {
        match self {
            SpeedClass::LowSpeed | SpeedClass::FullSpeed => 8,
            SpeedClass::HighSpeed => 64,
            SpeedClass::SuperSpeed => 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_id_round_trip() {
        for speed in [
            SpeedClass::LowSpeed,
            SpeedClass::FullSpeed,
            SpeedClass::HighSpeed,
            SpeedClass::SuperSpeed,
        ] {
            assert_eq!(SpeedClass::from_speed_id(speed.speed_id()), Some(speed));
        }
        assert_eq!(SpeedClass::from_speed_id(0), None);
    }
}
