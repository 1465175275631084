// Motion-control runtime for the ZIP robot: the device firmware core and the
// host bridge that exposes its serial link to network clients.

pub mod bridge;
pub mod config;
pub mod firmware;
pub mod protocol;
