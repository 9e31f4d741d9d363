//! Stable device identity derived from client-supplied material.
//!
//! Reconnect stability matters more than cross-device uniqueness here:
//! collisions are tolerated and simply treated as the same device.

use crate::models::DeviceType;

/// Derive the stable device id from the user agent, the client address and
/// the Accept-Language header.
///
/// Mobile Safari clients (iPhone/iPad/iPod) churn addresses across
/// cellular/Wi-Fi handoffs, so the address is left out of their seed.
pub fn derive_device_id(user_agent: &str, addr: &str, accept_language: &str) -> String {
    let ios = is_ios(user_agent);
    let mut seed = String::with_capacity(user_agent.len() + accept_language.len() + addr.len());
    seed.push_str(user_agent);
    seed.push_str(accept_language);
    if !ios {
        seed.push_str(addr);
    }

    let hash = java_string_hash(&seed);
    if ios {
        format!("ios-{}", to_base36(hash as u32))
    } else {
        format!("device-{}", to_base36(hash as u32))
    }
}

/// 32-bit rolling hash with Java `String.hashCode` semantics.
fn java_string_hash(input: &str) -> i32 {
    let mut hash: i32 = 0;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as i32);
    }
    hash
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

pub fn is_ios(user_agent: &str) -> bool {
    user_agent.contains("iPhone") || user_agent.contains("iPad") || user_agent.contains("iPod")
}

/// Platform/browser/type information sniffed from a user agent, used for
/// default device naming and the presence projection.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub platform: String,
    pub browser: String,
    pub device_type: DeviceType,
    pub default_name: String,
    /// Mobile Safari sessions get the fragile-session treatment: immediate
    /// welcome, smaller chunk size, tighter heartbeat.
    pub mobile_safari: bool,
}

impl DeviceProfile {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent;
        let ios = is_ios(ua);
        let android = ua.contains("Android");

        let (platform, device_type, default_name) = if ua.contains("iPhone") || ua.contains("iPod")
        {
            ("iOS", DeviceType::Mobile, "iPhone")
        } else if ua.contains("iPad") {
            ("iOS", DeviceType::Tablet, "iPad")
        } else if android && ua.contains("Mobile") {
            ("Android", DeviceType::Mobile, "Android Phone")
        } else if android {
            ("Android", DeviceType::Tablet, "Android Tablet")
        } else if ua.contains("Windows") {
            ("Windows", DeviceType::Desktop, "Windows PC")
        } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
            ("macOS", DeviceType::Desktop, "Mac")
        } else if ua.contains("Linux") || ua.contains("X11") {
            ("Linux", DeviceType::Desktop, "Linux PC")
        } else {
            ("Unknown", DeviceType::Unknown, "Device")
        };

        // Order matters: Edge carries "Chrome", Chrome carries "Safari".
        let browser = if ua.contains("Edg/") || ua.contains("Edge/") {
            "Edge"
        } else if ua.contains("Firefox/") {
            "Firefox"
        } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
            "Chrome"
        } else if ua.contains("Safari/") {
            "Safari"
        } else {
            "Unknown"
        };

        DeviceProfile {
            platform: platform.to_string(),
            browser: browser.to_string(),
            device_type,
            default_name: default_name.to_string(),
            mobile_safari: ios,
        }
    }
}
