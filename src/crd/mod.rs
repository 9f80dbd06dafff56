pub mod subnamespace;
pub mod tenant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "core.edge-net.io";
pub const VERSION: &str = "v1alpha1";

/// Labels stamped on every object this controller creates. Consumers
/// (cleanup jobs, dashboards, the inheritance selector) key off these.
pub mod labels {
    pub const GENERATED: &str = "edge-net.io/generated";
    pub const KIND: &str = "edge-net.io/kind";
    pub const TENANT: &str = "edge-net.io/tenant";
    pub const OWNER: &str = "edge-net.io/owner";
    pub const PARENT_NAMESPACE: &str = "edge-net.io/parent-namespace";
    pub const CLUSTER_UID: &str = "edge-net.io/cluster-uid";
    pub const TENANT_UID: &str = "edge-net.io/tenant-uid";
    pub const REQUEST_UID: &str = "edge-net.io/request-uid";
    pub const ACCESS: &str = "edge-net.io/access";
    pub const SLICE: &str = "edge-net.io/slice";
    pub const PRE_RESERVATION: &str = "edge-net.io/pre-reservation";
}

/// Point of contact carried by tenants and subsidiary namespaces; the
/// email doubles as the RBAC subject name.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Contact {
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub phone: String,
}

/// Adler-32 over `{namespace}-{name}`, rendered as lowercase hex. The
/// digest suffixes every derived child name, so it must stay stable
/// across releases.
pub fn name_digest(namespace: &str, name: &str) -> String {
    const MOD: u32 = 65_521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for byte in namespace
        .as_bytes()
        .iter()
        .chain(b"-")
        .chain(name.as_bytes())
    {
        a = (a + *byte as u32) % MOD;
        b = (b + a) % MOD;
    }
    format!("{:x}", (b << 16) | a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_adler32_vector() {
        // adler32("Wiki-pedia") = 0x148903c5, computed with zlib.
        assert_eq!(name_digest("Wiki", "pedia"), "148903c5");
    }

    #[test]
    fn digest_is_deterministic_and_distinct() {
        assert_eq!(name_digest("ns", "a"), name_digest("ns", "a"));
        assert_ne!(name_digest("ns", "a"), name_digest("ns", "b"));
        assert_ne!(name_digest("ns1", "a"), name_digest("ns2", "a"));
    }
}
