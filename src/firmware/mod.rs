// Device firmware core
//
// Everything that runs on the microcontroller: hardware abstraction, motion
// ownership, macros, drive limiting, safety gates, the command router and the
// cooperative scheduler tying them together. No allocation; every buffer has
// a fixed capacity.

pub mod device;
pub mod diagnostics;
pub mod drive_limits;
pub mod hal;
pub mod init_sequence;
pub mod kinematics;
pub mod macros;
pub mod motion;
pub mod router;
pub mod safety;
pub mod scheduler;
pub mod sensors;

pub use device::Device;
pub use hal::{Actuators, PinBank, SimPins};
pub use motion::{MotionController, MotionOwner};
pub use sensors::{SensorSuite, SimSensors};
