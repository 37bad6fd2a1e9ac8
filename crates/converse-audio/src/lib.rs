pub mod capture;
pub mod device;
pub mod playback;

pub use capture::{CaptureCommand, CaptureEvent, CaptureHandle};
pub use device::{DeviceInfo, DeviceManager};
pub use playback::{PlaybackCommand, PlaybackEvent, PlaybackHandle};
