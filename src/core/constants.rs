//! Protocol constants for the stornet wire format and runtime defaults.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Length prefix of a sealed chunk (big-endian u32).
pub const SEAL_LEN_PREFIX_SIZE: usize = 4;

/// AES-256-GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Total overhead a sealed chunk adds on top of its plaintext:
/// the 4-byte length prefix plus the 16-byte AEAD tag.
pub const NOISE_OVERHEAD: usize = SEAL_LEN_PREFIX_SIZE + AEAD_TAG_SIZE;

/// Frame header size: 4-byte big-endian payload length plus 1-byte type.
pub const FRAME_HEADER_SIZE: usize = 4 + 1;

/// Length of a connection id: a hyphenated v4 UUID.
pub const CONN_ID_LEN: usize = 36;

// =============================================================================
// RENDEZVOUS RESOURCE NAMES
// =============================================================================

/// Default name of the shared handshake inbox.
pub const DEFAULT_HANDSHAKE_ENDPOINT: &str = "handshake";

/// Default name of the shared token outbox.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "token";

/// Default prefix for the initiator-to-listener session resource.
pub const DEFAULT_REQ_PREFIX: &str = "req";

/// Default prefix for the listener-to-initiator session resource.
pub const DEFAULT_RES_PREFIX: &str = "res";

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Polling interval used while data is actively flowing.
/// Adaptive polling backs off exponentially from here to [`DEFAULT_DATA_POLL`].
pub const DEFAULT_FAST_POLL: Duration = Duration::from_millis(10);

/// Steady-state polling interval for idle connections. At 500ms this costs
/// roughly 7,200 read transactions per hour per connection; tune it to trade
/// latency against storage cost.
pub const DEFAULT_DATA_POLL: Duration = Duration::from_millis(500);

/// Interval between listener scans of the handshake inbox.
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Keep-alive heartbeat cadence. Zero disables keep-alive.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time a dialer waits for the listener to answer its handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle threshold after which the janitor evicts a connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Validity window of issued signed URLs.
pub const DEFAULT_SAS_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Budget for fire-and-forget cleanup calls (token deletion, janitor sweeps).
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// ENVIRONMENT
// =============================================================================

/// Environment variable consulted for the account name when the URL has none.
pub const ENV_STORAGE_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";

/// Environment variable consulted for the account secret when the URL has none.
pub const ENV_STORAGE_ACCOUNT_KEY: &str = "AZURE_STORAGE_ACCOUNT_KEY";

/// Host suffix that marks an endpoint as living in the public cloud.
pub const CLOUD_HOST_SUFFIX: &str = ".core.windows.net";
