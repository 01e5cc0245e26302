pub mod idle_detector;
pub mod rolling_window;

pub use idle_detector::{IdleDetector, IdleThresholds};
pub use rolling_window::{HorizonAverage, RollingWindow, WindowStats};
