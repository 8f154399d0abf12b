// Timeouts, topics, queue and chain sizing
use std::time::Duration;

// Scheduler loop frequency
pub const LOOP_HZ: u64 = 200;

// Queue arenas
pub const LIVE_QUEUE_SIZE: usize = 2048; // Q0, interpreted every tick
pub const NAMED_QUEUE_SIZE: usize = 512; // macro storage
pub const NAMED_QUEUES: usize = 8;

// Chain (daisy) serial link
pub const CHAIN_PORT: &str = "/dev/ttyUSB0";
pub const CHAIN_BAUDRATE: u32 = 115_200;
pub const CHAIN_BUFFER_SIZE: usize = 2048; // input arena, one frame must fit
pub const CHAIN_READ_CHUNK: usize = 256;

// Chain keepalive and snapshot periods
pub const PING_INTERVAL: Duration = Duration::from_millis(1000);
pub const ACTIVE_TIMEOUT: Duration = Duration::from_millis(3000); // no ping seen -> inactive
pub const SLAVE_STATE_INTERVAL: Duration = Duration::from_millis(250);
pub const SLAVE_CONFIG_INTERVAL: Duration = Duration::from_millis(5000);

// Zenoh topics
pub const TOPIC_CMD: &str = "stepper/cmd"; // requests from front-ends
pub const TOPIC_RECEIPT: &str = "stepper/receipt"; // synchronous enqueue result
pub const TOPIC_STATE: &str = "stepper/state"; // polled status
pub const STATE_PUBLISH_PERIOD: Duration = Duration::from_millis(100);

// Storage keys
pub const STORAGE_DIR: &str = "./stepper-data";
pub const KEY_MOTOR_CONFIG: &str = "motorcfg.json";

pub fn queue_key(queue: usize) -> String {
    format!("queue{}.bin", queue)
}
