//! Class of Device (`CoD`) handling
//!
//! The Class of Device is a 24-bit field reported over BR/EDR inquiry:
//! - Major Service Classes (bits 23-13)
//! - Major Device Class (bits 12-8)
//! - Minor Device Class (bits 7-2)
//! - Format Type (bits 1-0, always 0b00)
//!
//! Besides the raw decomposition this module derives the `Icon` observable:
//! a freedesktop-style icon name computed from the class, with the LE
//! appearance value as fallback for devices that never report a class.

/// Class of Device indicating device type and capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClassOfDevice {
    raw: u32,
}

impl ClassOfDevice {
    /// Create a `ClassOfDevice` from a raw 24-bit value
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw: raw & 0x00FF_FFFF,
        }
    }

    /// Get the raw 24-bit value
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    /// Get the Major Device Class (bits 12-8)
    #[must_use]
    pub fn major_device_class(&self) -> MajorDeviceClass {
        MajorDeviceClass::from_raw(((self.raw >> 8) & 0x1F) as u8)
    }

    /// Get the Minor Device Class (bits 7-2)
    #[must_use]
    pub const fn minor_device_class(&self) -> u8 {
        ((self.raw >> 2) & 0x3F) as u8
    }

    /// Whether the Audio major service class bit is set
    #[must_use]
    pub const fn audio_service(&self) -> bool {
        (self.raw & 0x0020_0000) != 0
    }

    /// Whether the Rendering major service class bit is set
    #[must_use]
    pub const fn rendering_service(&self) -> bool {
        (self.raw & 0x0004_0000) != 0
    }

    /// Derive the icon name for this class
    #[must_use]
    pub fn icon(&self) -> Option<&'static str> {
        let minor = self.minor_device_class();

        match self.major_device_class() {
            MajorDeviceClass::Computer => Some("computer"),
            MajorDeviceClass::Phone => Some("phone"),
            MajorDeviceClass::LanNetworkAccessPoint => Some("network-wireless"),
            MajorDeviceClass::AudioVideo => Some(match minor {
                0x01 | 0x02 => "audio-headset",
                0x06 => "audio-headphones",
                0x07 => "multimedia-player",
                0x0B..=0x0D => "camera-video",
                _ => "audio-card",
            }),
            MajorDeviceClass::Peripheral => match (minor >> 4) & 0x3 {
                1 | 3 => Some("input-keyboard"),
                2 => Some("input-mouse"),
                _ => match minor & 0xF {
                    0x1 | 0x2 => Some("input-gaming"),
                    0x5 => Some("input-tablet"),
                    _ => None,
                },
            },
            MajorDeviceClass::Imaging => {
                if minor & 0x20 != 0 {
                    Some("printer")
                } else if minor & 0x08 != 0 {
                    Some("camera-photo")
                } else {
                    None
                }
            }
            MajorDeviceClass::Wearable => match minor {
                0x01 => Some("watch"),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Derive an icon name from an LE appearance value
///
/// The appearance category occupies the top ten bits; HID devices carry
/// their sub-type in the bottom six.
#[must_use]
pub fn icon_from_appearance(appearance: u16) -> Option<&'static str> {
    match appearance >> 6 {
        0x01 => Some("phone"),
        0x02 => Some("computer"),
        0x03 => Some("watch"),
        0x05 => Some("video-display"),
        0x0A => Some("multimedia-player"),
        0x0B => Some("scanner"),
        0x0F => match appearance & 0x3F {
            0x01 => Some("input-keyboard"),
            0x02 => Some("input-mouse"),
            0x03 | 0x04 => Some("input-gaming"),
            0x05 => Some("input-tablet"),
            _ => Some("input-gaming"),
        },
        _ => None,
    }
}

/// Major Device Class enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorDeviceClass {
    /// Miscellaneous devices
    Miscellaneous,
    /// Computer devices (desktop, server, laptop, etc.)
    Computer,
    /// Phone devices (cellular, cordless, smartphone, etc.)
    Phone,
    /// LAN/Network Access Point devices
    LanNetworkAccessPoint,
    /// Audio/Video devices (headphones, speakers, microphones, etc.)
    AudioVideo,
    /// Peripheral devices (keyboard, mouse, etc.)
    Peripheral,
    /// Imaging devices (display, camera, scanner, printer)
    Imaging,
    /// Wearable devices (watch, glasses, etc.)
    Wearable,
    /// Toy devices (robot, vehicle, controller, etc.)
    Toy,
    /// Health devices (monitor, scale, etc.)
    Health,
    /// Uncategorized devices
    Uncategorized,
    /// Reserved or unknown device class
    Reserved(u8),
}

impl MajorDeviceClass {
    /// Create `MajorDeviceClass` from a raw 5-bit value
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Miscellaneous,
            0x01 => Self::Computer,
            0x02 => Self::Phone,
            0x03 => Self::LanNetworkAccessPoint,
            0x04 => Self::AudioVideo,
            0x05 => Self::Peripheral,
            0x06 => Self::Imaging,
            0x07 => Self::Wearable,
            0x08 => Self::Toy,
            0x09 => Self::Health,
            0x1F => Self::Uncategorized,
            other => Self::Reserved(other),
        }
    }
}
