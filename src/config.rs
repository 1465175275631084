// Rates, timeouts, buffer capacities, bridge defaults

// Scheduler task rates
pub const CONTROL_LOOP_HZ: u32 = 50;
pub const SENSORS_SLOW_HZ: u32 = 10;
pub const PROTOCOL_RX_HZ: u32 = 1000;

// Max bytes the receive task drains per pass, keeps the pass bounded
pub const RX_BYTES_PER_PASS: usize = 48;

// Serial link
pub const SERIAL_BAUD: u32 = 115_200;

// Binary frame sentinel and limits
pub const FRAME_HEADER: [u8; 2] = [0xAA, 0x55];
pub const MAX_PAYLOAD: usize = 64;
// header(2) + len(1) + type(1) + seq(1) + payload + crc(2)
pub const MAX_FRAME: usize = 2 + 1 + 2 + MAX_PAYLOAD + 2;

// Text command limits
pub const TEXT_MARKER: u8 = b'{';
pub const MAX_TEXT_LINE: usize = 96;
pub const MAX_TAG_LEN: usize = 11;

// Device receive/transmit queues
pub const RX_QUEUE_CAPACITY: usize = 64;
pub const TX_QUEUE_CAPACITY: usize = 512;

// Motor output range (signed PWM)
pub const OUTPUT_LIMIT: i16 = 255;

// Setpoint TTL bounds; a missing T gets the default
pub const SETPOINT_TTL_MIN_MS: u32 = 150;
pub const SETPOINT_TTL_MAX_MS: u32 = 10_000;
pub const SETPOINT_TTL_DEFAULT_MS: u32 = 200;

// Macro TTL bounds
pub const MACRO_TTL_MIN_MS: u32 = 1000;
pub const MACRO_TTL_MAX_MS: u32 = 10_000;
pub const MACRO_TTL_DEFAULT_MS: u32 = 5000;

// Rate limiter: at most this many commands in any window
pub const RATE_LIMIT_MAX_COMMANDS: usize = 50;
pub const RATE_LIMIT_WINDOW_MS: u32 = 1000;

// Hardware watchdog timeout
pub const WATCHDOG_TIMEOUT_MS: u32 = 4000;

// Servo
pub const SERVO_MIN_ANGLE: u8 = 0;
pub const SERVO_MAX_ANGLE: u8 = 180;
pub const SERVO_CENTER_ANGLE: u8 = 90;

// Obstacle threshold for N=21 D1=1
pub const OBSTACLE_THRESHOLD_CM: u16 = 20;

// Hardware profile reported in the boot line and diagnostics
pub const HARDWARE_PROFILE: &str = "uno-tb6612-v11";

// Bridge defaults
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_SOCKET_ADDR: &str = "127.0.0.1:8765";
pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8766";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BOOT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_STREAM_RATE_HZ: u32 = 20;
pub const DEFAULT_STREAM_TTL_MS: u32 = 200;
pub const MAX_STREAM_RATE_HZ: u32 = 50;
pub const RECONNECT_DELAY_MS: u64 = 1000;

// Zenoh topics for republished device output
pub const TOPIC_DEVICE_LINES: &str = "zip/robot/lines";
pub const TOPIC_BRIDGE_STATUS: &str = "zip/robot/status";
