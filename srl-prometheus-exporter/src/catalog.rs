//! Built-in metric groups and their gNMI state paths.

use std::collections::BTreeMap;

const BUILTIN: &[(&str, &[&str])] = &[
    (
        "interfaces",
        &[
            "/interface/statistics",
            "/interface/ethernet/statistics/",
            "/interface/queue-statistics",
            "/interface/lag/members/statistics/",
        ],
    ),
    ("subinterfaces", &["/interface/subinterface/statistics"]),
    ("lldp", &["/system/lldp/interface/statistics"]),
    (
        "platform",
        &[
            "/platform/control/disk/statistics",
            "/platform/control/cpu/software-interrupt",
            "/platform/control/memory",
            "/platform/linecard/forwarding-complex/buffer-memory",
        ],
    ),
    (
        "acl",
        &[
            "/acl/policers/system-cpu-policer[name=*]/statistics",
            "/acl/policers/policer[name=*]/statistics",
            "/acl/ipv4-filter[name=*]/entry[sequence-id=*]/statistics",
            "/acl/ipv6-filter[name=*]/entry[sequence-id=*]/statistics",
            "/acl/cpm-filter/ipv4-filter/entry[sequence-id=*]/statistics",
            "/acl/cpm-filter/ipv6-filter/entry[sequence-id=*]/statistics",
        ],
    ),
    ("aaa", &["/system/aaa/server-group/server/statistics"]),
    (
        "network-instance-bridge-table",
        &["/network-instance/bridge-table/statistics"],
    ),
    ("network-instance-icmp", &["/network-instance/icmp/statistics"]),
    ("network-instance-icmp6", &["/network-instance/icmp6/statistics"]),
    (
        "route-table-ipv4-unicast",
        &["/network-instance/route-table/ipv4-unicast/statistics"],
    ),
    (
        "route-table-ipv6-unicast",
        &["/network-instance/route-table/ipv6-unicast/statistics"],
    ),
    ("mpls", &["/network-instance/route-table/mpls/statistics"]),
    (
        "isis",
        &["/network-instance/protocols/isis/instance/statistics"],
    ),
    ("bgp", &["/network-instance/protocols/bgp/group/statistics"]),
    ("udp", &["/network-instance/udp/statistics"]),
    ("tcp", &["/network-instance/tcp/statistics"]),
];

/// Static lookup from known metric name to its ordered path list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricCatalog {
    entries: BTreeMap<String, Vec<String>>,
}

impl MetricCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|(name, paths)| {
                (
                    name.to_string(),
                    paths.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect();
        Self { entries }
    }

    /// The built-in catalog with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> Self {
        let mut catalog = Self::builtin();
        for (name, paths) in overrides {
            catalog.entries.insert(name.clone(), paths.clone());
        }
        catalog
    }

    /// Paths for `name`, empty if unknown.
    pub fn paths(&self, name: &str) -> &[String] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All metric names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
