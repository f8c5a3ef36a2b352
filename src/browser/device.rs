use serde::{Deserialize, Serialize};

/// Viewport and identity a device emulation applies to the browser
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
    pub is_mobile: bool,
    pub user_agent: Option<&'static str>,
}

/// Devices available for emulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Device {
    #[default]
    Desktop,
    IphoneX,
    #[serde(rename = "IPHONE_15")]
    Iphone15,
    SamsungGalaxyS20,
}

impl Device {
    pub fn profile(&self) -> DeviceProfile {
        match self {
            Device::Desktop => DeviceProfile {
                width: 1920,
                height: 1080,
                pixel_ratio: 1.0,
                is_mobile: false,
                user_agent: None,
            },
            Device::IphoneX => DeviceProfile {
                width: 414,
                height: 896,
                pixel_ratio: 2.0,
                is_mobile: true,
                user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 12_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/12.0 Mobile/15E148 Safari/604.1"),
            },
            Device::Iphone15 => DeviceProfile {
                width: 428,
                height: 926,
                pixel_ratio: 3.0,
                is_mobile: true,
                user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1"),
            },
            Device::SamsungGalaxyS20 => DeviceProfile {
                width: 320,
                height: 720,
                pixel_ratio: 3.5,
                is_mobile: true,
                user_agent: Some("Mozilla/5.0 (Linux; Android 10; Samsung Galaxy S20) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/88.0.4324.93 Mobile Safari/537.36"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names_match_request_format() {
        let device: Device = serde_json::from_str("\"IPHONE_15\"").unwrap();
        assert_eq!(device, Device::Iphone15);
        assert_eq!(serde_json::to_string(&Device::Iphone15).unwrap(), "\"IPHONE_15\"");
        assert_eq!(serde_json::to_string(&Device::IphoneX).unwrap(), "\"IPHONE_X\"");
        assert_eq!(serde_json::to_string(&Device::SamsungGalaxyS20).unwrap(), "\"SAMSUNG_GALAXY_S20\"");
    }

    #[test]
    fn test_mobile_profiles_carry_user_agent() {
        assert!(Device::Desktop.profile().user_agent.is_none());
        for device in [Device::IphoneX, Device::Iphone15, Device::SamsungGalaxyS20] {
            let profile = device.profile();
            assert!(profile.is_mobile);
            assert!(profile.user_agent.is_some());
        }
    }
}
