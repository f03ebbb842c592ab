//! Media-key synthesizer.
//!
//! Maps next/pause/resume to OS virtual media keys. Off Windows the
//! synthesis is a logged no-op that still reports the resolved key code, so
//! the action pipeline stays exercisable on any host.

use serde_json::json;
use tracing::info;
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::Outcome;

pub const VK_MEDIA_NEXT_TRACK: u32 = 0xB0;
pub const VK_MEDIA_PLAY_PAUSE: u32 = 0xB3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKey {
    Next,
    PlayPause,
}

impl MediaKey {
    pub fn vk_code(self) -> u32 {
        match self {
            MediaKey::Next => VK_MEDIA_NEXT_TRACK,
            MediaKey::PlayPause => VK_MEDIA_PLAY_PAUSE,
        }
    }

    pub fn vk_name(self) -> &'static str {
        match self {
            MediaKey::Next => "VK_MEDIA_NEXT_TRACK",
            MediaKey::PlayPause => "VK_MEDIA_PLAY_PAUSE",
        }
    }
}

#[derive(Default)]
pub struct MediaKeyActuator;

impl MediaKeyActuator {
    pub fn new() -> Self {
        Self
    }

    /// `tool_key` is the canonical name, e.g. `sammi.music_next`.
    pub fn invoke(&self, tool_key: &str) -> Outcome {
        let started_at = utc_now_iso();
        let key = match tool_key {
            "sammi.music_next" => MediaKey::Next,
            "sammi.music_pause" | "sammi.music_resume" => MediaKey::PlayPause,
            other => {
                return Outcome::error(
                    started_at,
                    ReasonCode::AdapterError,
                    format!("unsupported media tool: {other}"),
                )
            }
        };
        send_virtual_key(key.vk_code());
        Outcome::success(
            started_at,
            json!({"virtual_key": key.vk_name(), "vk_code": key.vk_code()}),
        )
    }
}

#[cfg(windows)]
pub(crate) fn send_virtual_key(vk_code: u32) {
    const KEYEVENTF_KEYUP: u32 = 0x0002;
    #[link(name = "user32")]
    extern "system" {
        fn keybd_event(vk: u8, scan: u8, flags: u32, extra: usize);
    }
    unsafe {
        keybd_event(vk_code as u8, 0, 0, 0);
        keybd_event(vk_code as u8, 0, KEYEVENTF_KEYUP, 0);
    }
}

#[cfg(not(windows))]
pub(crate) fn send_virtual_key(vk_code: u32) {
    info!(vk_code, "virtual key synthesis is a no-op on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::OutcomeStatus;

    #[test]
    fn maps_music_tools_to_media_keys() {
        let actuator = MediaKeyActuator::new();
        let next = actuator.invoke("sammi.music_next");
        assert_eq!(next.status, OutcomeStatus::Success);
        assert_eq!(next.output["vk_code"], VK_MEDIA_NEXT_TRACK);

        let pause = actuator.invoke("sammi.music_pause");
        assert_eq!(pause.output["virtual_key"], "VK_MEDIA_PLAY_PAUSE");
    }

    #[test]
    fn unknown_tool_errors() {
        let actuator = MediaKeyActuator::new();
        let outcome = actuator.invoke("sammi.music_shuffle");
        assert_eq!(outcome.status, OutcomeStatus::Error);
    }
}
