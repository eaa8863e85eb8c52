/// Application name
pub const APP_NAME: &str = "CleepDesktop";

/// Presence channel joined by every Cleep node on the LAN
pub const BUS_CHANNEL: &str = "CLEEP";

/// Protocol version string advertised to peers
pub const PROTOCOL_VERSION: &str = "/cleep/1.0.0";

/// Request/response protocol used for HELLO headers and WHISPER payloads
pub const EXCHANGE_PROTOCOL: &str = "/cleep/exchange/1.0.0";

/// Default QUIC listen port for the peer bus
pub const DEFAULT_BUS_PORT: u16 = 5670;

/// First retry delay of the bus adapter while the network is down
pub const BUS_RETRY_MIN_MS: u64 = 500;

/// Upper bound of the bus adapter retry delay in seconds
pub const BUS_RETRY_MAX_SECS: u64 = 4;

/// Interval between default route checks while the bus is running
pub const NETWORK_CHECK_SECS: u64 = 5;

/// Request timeout of the HELLO / WHISPER exchange in seconds
pub const EXCHANGE_TIMEOUT_SECS: u64 = 10;

/// Gossipsub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Maximum bus payload size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Hostname reported by a freshly flashed, not yet configured device
pub const UNCONFIGURED_HOSTNAME: &str = "cleepdevice";

/// Download cache prefixes
pub const TMP_PREFIX: &str = "cleep_tmp_";
pub const DOWNLOAD_PREFIX: &str = "cleep_download_";
pub const CACHED_PREFIX: &str = "cleep_cached_";

/// Wi-Fi credential file prefix (written next to the download cache)
pub const WIFI_FILE_PREFIX: &str = "cleep_wifi_";

/// Image catalog time-to-live in seconds
pub const IMAGES_CACHE_TTL_SECS: u64 = 900;

/// Wi-Fi scan cache time-to-live in seconds
pub const WIFI_CACHE_TTL_SECS: u64 = 30;

/// Removable drive listing cache time-to-live in seconds
pub const DRIVES_CACHE_TTL_SECS: u64 = 2;

/// Wall-time granted to a subprocess on the update path
pub const SUBPROCESS_TIMEOUT_SECS: u64 = 20;

/// Time given to the elevation helper to connect back on loopback
pub const ELEVATE_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default unicast command timeout on the message bus
pub const COMMAND_TIMEOUT_SECS: u64 = 3;

/// Recipient idle time after which the message bus drops it
pub const RECIPIENT_IDLE_SECS: u64 = 600;

/// Per-recipient queue size on the message bus
pub const RECIPIENT_QUEUE_SIZE: usize = 256;

/// WPA/WPA2 pre-shared key derivation (IEEE 802.11i)
pub const PSK_ITERATIONS: u32 = 4096;
pub const PSK_LENGTH: usize = 32;

/// Release feeds
pub const CLEEP_RELEASES_URL: &str = "https://api.github.com/repos/tangb/cleep/releases";
pub const RASPIOS_INDEX_URL: &str = "https://downloads.raspberrypi.org/raspios_armhf/images/";
pub const RASPIOS_LITE_INDEX_URL: &str =
    "https://downloads.raspberrypi.org/raspios_lite_armhf/images/";
pub const TOOL_RELEASES_URL: &str = "https://api.github.com/repos/balena-io/balena-cli/releases";

/// User agent sent with every HTTP request
pub const USER_AGENT: &str = concat!("cleep-desktop/", env!("CARGO_PKG_VERSION"));

/// Well-known event broadcast once the application is ready
pub const EVENT_APPLICATION_READY: &str = "core.application.ready";
