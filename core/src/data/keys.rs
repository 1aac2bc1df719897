/// Keys predefined for persistance:
/// Prefix used with per server value tracker statistics
pub const VALUE_TRACKER_NODE_PREFIX: &str = "vt:node";
/// Value tracker statistics aggregated over all servers
pub const VALUE_TRACKER_GLOBAL_KEY: &str = "vt:global";
/// Server pool candidate table
pub const SERVER_POOL_NODES_KEY: &str = "serverpool:nodes";
