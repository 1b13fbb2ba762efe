pub mod drain;
pub mod manager;
pub mod queue;
pub mod session;
pub mod transform;

pub use drain::{frame_filename, DrainEvent, DrainOptions, DrainOrder, DrainReport, SaveDrainer};
pub use manager::{CameraManager, Clock};
pub use queue::{FrameQueue, QueueEntry};
pub use session::{CaptureSession, SessionState};
pub use transform::rotate_quarter_turn;
