//! Provides a means to read, parse and resolve configuration options for scans.
//!
//! Options travel through three stages: what the caller supplied
//! ([`ScanOptions`] with `Some` fields), the engine's default table
//! ([`ScanOptions::standard`]) and the fallback constants in this module.
//! [`resolve`] applies them in that order and validates the result.
use crate::address::ExpandOptions;
use crate::error::ConfigError;
use crate::scanner::concurrency::{default_auto_max_threads, ConcurrencyMode, ConcurrencyOptions};
use crate::scanner::preflight::PreflightConfig;
use clap::Parser;
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

pub const FALLBACK_PORTS: &str = "top1";
pub const DEFAULT_PREFLIGHT_PORTS: &str = "80,443,53,3389";
pub const FALLBACK_PREFLIGHT_TIMEOUT: Duration = Duration::from_millis(500);
pub const FALLBACK_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_GLOBAL_MAX_PPS: u32 = 200;
pub const DEFAULT_PER_IP_MAX_PPS: u32 = 20;

/// Web ports. Always dispatched first when present in a scan.
const TOP1_PORTS: &[u16] = &[80, 443, 8080, 8443];

const TOP2_PORTS: &[u16] = &[
    80, 443, 8080, 8443, 21, 22, 23, 25, 53, 110, 135, 139, 143, 445, 1433, 1521, 3306, 3389,
    5432, 5900, 6379, 7001, 8000, 8888, 9200, 27017,
];

const TOP3_PORTS: &[u16] = &[
    80, 443, 8080, 8443, 21, 22, 23, 25, 53, 110, 135, 139, 143, 445, 1433, 1521, 3306, 3389,
    5432, 5900, 6379, 7001, 8000, 8888, 9200, 27017, 81, 88, 111, 389, 465, 587, 636, 873, 993,
    995, 1080, 1723, 2049, 2181, 2375, 5000, 5601, 5672, 5985, 6443, 7000, 8081, 8088, 8161, 9000,
    9090, 9092, 10250, 11211, 15672, 50070,
];

// https://nullsec.us/top-1-000-tcp-and-udp-ports-nmap-default
const TOP_1000_PORTS: [u16; 1000] = [
    1, 3, 4, 6, 7, 9, 13, 17, 19, 20, 21, 22, 23, 24, 25, 26, 30, 32, 33, 37, 42, 43, 49, 53, 70,
    79, 80, 81, 82, 83, 84, 85, 88, 89, 90, 99, 100, 106, 109, 110, 111, 113, 119, 125, 135, 139,
    143, 144, 146, 161, 163, 179, 199, 211, 212, 222, 254, 255, 256, 259, 264, 280, 301, 306, 311,
    340, 366, 389, 406, 407, 416, 417, 425, 427, 443, 444, 445, 458, 464, 465, 481, 497, 500, 512,
    513, 514, 515, 524, 541, 543, 544, 545, 548, 554, 555, 563, 587, 593, 616, 617, 625, 631, 636,
    646, 648, 666, 667, 668, 683, 687, 691, 700, 705, 711, 714, 720, 722, 726, 749, 765, 777, 783,
    787, 800, 801, 808, 843, 873, 880, 888, 898, 900, 901, 902, 903, 911, 912, 981, 987, 990, 992,
    993, 995, 999, 1000, 1001, 1002, 1007, 1009, 1010, 1011, 1021, 1022, 1023, 1024, 1025, 1026,
    1027, 1028, 1029, 1030, 1031, 1032, 1033, 1034, 1035, 1036, 1037, 1038, 1039, 1040, 1041, 1042,
    1043, 1044, 1045, 1046, 1047, 1048, 1049, 1050, 1051, 1052, 1053, 1054, 1055, 1056, 1057, 1058,
    1059, 1060, 1061, 1062, 1063, 1064, 1065, 1066, 1067, 1068, 1069, 1070, 1071, 1072, 1073, 1074,
    1075, 1076, 1077, 1078, 1079, 1080, 1081, 1082, 1083, 1084, 1085, 1086, 1087, 1088, 1089, 1090,
    1091, 1092, 1093, 1094, 1095, 1096, 1097, 1098, 1099, 1100, 1102, 1104, 1105, 1106, 1107, 1108,
    1110, 1111, 1112, 1113, 1114, 1117, 1119, 1121, 1122, 1123, 1124, 1126, 1130, 1131, 1132, 1137,
    1138, 1141, 1145, 1147, 1148, 1149, 1151, 1152, 1154, 1163, 1164, 1165, 1166, 1169, 1174, 1175,
    1183, 1185, 1186, 1187, 1192, 1198, 1199, 1201, 1213, 1216, 1217, 1218, 1233, 1234, 1236, 1244,
    1247, 1248, 1259, 1271, 1272, 1277, 1287, 1296, 1300, 1301, 1309, 1310, 1311, 1322, 1328, 1334,
    1352, 1417, 1433, 1434, 1443, 1455, 1461, 1494, 1500, 1501, 1503, 1521, 1524, 1533, 1556, 1580,
    1583, 1594, 1600, 1641, 1658, 1666, 1687, 1688, 1700, 1717, 1718, 1719, 1720, 1721, 1723, 1755,
    1761, 1782, 1783, 1801, 1805, 1812, 1839, 1840, 1862, 1863, 1864, 1875, 1900, 1914, 1935, 1947,
    1971, 1972, 1974, 1984, 1998, 1999, 2000, 2001, 2002, 2003, 2004, 2005, 2006, 2007, 2008, 2009,
    2010, 2013, 2020, 2021, 2022, 2030, 2033, 2034, 2035, 2038, 2040, 2041, 2042, 2043, 2045, 2046,
    2047, 2048, 2049, 2065, 2068, 2099, 2100, 2103, 2105, 2106, 2107, 2111, 2119, 2121, 2126, 2135,
    2144, 2160, 2161, 2170, 2179, 2190, 2191, 2196, 2200, 2222, 2251, 2260, 2288, 2301, 2323, 2366,
    2381, 2382, 2383, 2393, 2394, 2399, 2401, 2492, 2500, 2522, 2525, 2557, 2601, 2602, 2604, 2605,
    2607, 2608, 2638, 2701, 2702, 2710, 2717, 2718, 2725, 2800, 2809, 2811, 2869, 2875, 2909, 2910,
    2920, 2967, 2968, 2998, 3000, 3001, 3003, 3005, 3006, 3007, 3011, 3013, 3017, 3030, 3031, 3052,
    3071, 3077, 3128, 3168, 3211, 3221, 3260, 3261, 3268, 3269, 3283, 3300, 3301, 3306, 3322, 3323,
    3324, 3325, 3333, 3351, 3367, 3369, 3370, 3371, 3372, 3389, 3390, 3404, 3476, 3493, 3517, 3527,
    3546, 3551, 3580, 3659, 3689, 3690, 3703, 3737, 3766, 3784, 3800, 3801, 3809, 3814, 3826, 3827,
    3828, 3851, 3869, 3871, 3878, 3880, 3889, 3905, 3914, 3918, 3920, 3945, 3971, 3986, 3995, 3998,
    4000, 4001, 4002, 4003, 4004, 4005, 4006, 4045, 4111, 4125, 4126, 4129, 4224, 4242, 4279, 4321,
    4343, 4443, 4444, 4445, 4446, 4449, 4550, 4567, 4662, 4848, 4899, 4900, 4998, 5000, 5001, 5002,
    5003, 5004, 5009, 5030, 5033, 5050, 5051, 5054, 5060, 5061, 5080, 5087, 5100, 5101, 5102, 5120,
    5190, 5200, 5214, 5221, 5222, 5225, 5226, 5269, 5280, 5298, 5357, 5405, 5414, 5431, 5432, 5440,
    5500, 5510, 5544, 5550, 5555, 5560, 5566, 5631, 5633, 5666, 5678, 5679, 5718, 5730, 5800, 5801,
    5802, 5810, 5811, 5815, 5822, 5825, 5850, 5859, 5862, 5877, 5900, 5901, 5902, 5903, 5904, 5906,
    5907, 5910, 5911, 5915, 5922, 5925, 5950, 5952, 5959, 5960, 5961, 5962, 5963, 5987, 5988, 5989,
    5998, 5999, 6000, 6001, 6002, 6003, 6004, 6005, 6006, 6007, 6009, 6025, 6059, 6100, 6101, 6106,
    6112, 6123, 6129, 6156, 6346, 6389, 6502, 6510, 6543, 6547, 6565, 6566, 6567, 6580, 6646, 6666,
    6667, 6668, 6669, 6689, 6692, 6699, 6779, 6788, 6789, 6792, 6839, 6881, 6901, 6969, 7000, 7001,
    7002, 7004, 7007, 7019, 7025, 7070, 7100, 7103, 7106, 7200, 7201, 7402, 7435, 7443, 7496, 7512,
    7625, 7627, 7676, 7741, 7777, 7778, 7800, 7911, 7920, 7921, 7937, 7938, 7999, 8000, 8001, 8002,
    8007, 8008, 8009, 8010, 8011, 8021, 8022, 8031, 8042, 8045, 8080, 8081, 8082, 8083, 8084, 8085,
    8086, 8087, 8088, 8089, 8090, 8093, 8099, 8100, 8180, 8181, 8192, 8193, 8194, 8200, 8222, 8254,
    8290, 8291, 8292, 8300, 8333, 8383, 8400, 8402, 8443, 8500, 8600, 8649, 8651, 8652, 8654, 8701,
    8800, 8873, 8888, 8899, 8994, 9000, 9001, 9002, 9003, 9009, 9010, 9011, 9040, 9050, 9071, 9080,
    9081, 9090, 9091, 9099, 9100, 9101, 9102, 9103, 9110, 9111, 9200, 9207, 9220, 9290, 9415, 9418,
    9485, 9500, 9502, 9503, 9535, 9575, 9593, 9594, 9595, 9618, 9666, 9876, 9877, 9878, 9898, 9900,
    9917, 9929, 9943, 9944, 9968, 9998, 9999, 10000, 10001, 10002, 10003, 10004, 10009, 10010,
    10012, 10024, 10025, 10082, 10180, 10215, 10243, 10566, 10616, 10617, 10621, 10626, 10628,
    10629, 10778, 11110, 11111, 11967, 12000, 12174, 12265, 12345, 13456, 13722, 13782, 13783,
    14000, 14238, 14441, 14442, 15000, 15002, 15003, 15004, 15660, 15742, 16000, 16001, 16012,
    16016, 16018, 16080, 16113, 16992, 16993, 17877, 17988, 18040, 18101, 18988, 19101, 19283,
    19315, 19350, 19780, 19801, 19842, 20000, 20005, 20031, 20221, 20222, 20828, 21571, 22939,
    23502, 24444, 24800, 25734, 25735, 26214, 27000, 27352, 27353, 27355, 27356, 27715, 28201,
    30000, 30718, 30951, 31038, 31337, 32768, 32769, 32770, 32771, 32772, 32773, 32774, 32775,
    32776, 32777, 32778, 32779, 32780, 32781, 32782, 32783, 32784, 32785, 33354, 33899, 34571,
    34572, 34573, 35500, 38292, 40193, 40911, 41511, 42510, 44176, 44442, 44443, 44501, 45100,
    48080, 49152, 49153, 49154, 49155, 49156, 49157, 49158, 49159, 49160, 49161, 49163, 49165,
    49167, 49175, 49176, 49400, 49999, 50000, 50001, 50002, 50003, 50006, 50300, 50389, 50500,
    50636, 50800, 51103, 51493, 52673, 52822, 52848, 52869, 54045, 54328, 55055, 55056, 55555,
    55600, 56737, 56738, 57294, 57797, 58080, 60020, 60443, 61532, 61900, 62078, 63331, 64623,
    64680, 65000, 65129, 65389,
];

static PORT_PRESETS: Lazy<HashMap<&'static str, Vec<u16>>> = Lazy::new(|| {
    HashMap::from([
        ("top1", TOP1_PORTS.to_vec()),
        ("top2", TOP2_PORTS.to_vec()),
        ("top3", TOP3_PORTS.to_vec()),
        ("top1000", TOP_1000_PORTS.to_vec()),
        ("all", (LOWEST_PORT_NUMBER..=TOP_PORT_NUMBER).collect()),
    ])
});

fn port_preset(name: &str) -> Option<&'static [u16]> {
    PORT_PRESETS
        .get(name.to_ascii_lowercase().as_str())
        .map(Vec::as_slice)
}

/// Parses a port specification into the list of ports to dispatch.
///
/// The grammar is a comma separated mix of single ports, `start-end`
/// ranges and preset names (`top1`, `top2`, `top3`, `top1000`, `all`).
/// Duplicates are removed and well known ports are moved to the front,
/// see [`prioritize_ports`].
///
/// ```rust
/// # use rustsweep::input::parse_port_spec;
/// let ports = parse_port_spec("22,80,443").unwrap();
/// assert_eq!(ports, vec![80, 443, 22]);
/// ```
pub fn parse_port_spec(input: &str) -> Result<Vec<u16>, ConfigError> {
    collect_ports(input).map(prioritize_ports)
}

/// Parses the ports dialled by the liveness preflight, in ascending order.
/// An empty specification falls back to [`DEFAULT_PREFLIGHT_PORTS`].
pub fn parse_preflight_ports(input: &str) -> Result<Vec<u16>, ConfigError> {
    let spec = match input.trim() {
        "" => DEFAULT_PREFLIGHT_PORTS,
        trimmed => trimmed,
    };
    collect_ports(spec).map_err(|err| match err {
        ConfigError::InvalidPorts(reason) => ConfigError::InvalidPreflightPorts(reason),
        other => other,
    })
}

fn collect_ports(input: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some(preset) = port_preset(part) {
            ports.extend_from_slice(preset);
        } else if part.contains('-') {
            let range_ports = parse_port_range(part).map_err(ConfigError::InvalidPorts)?;
            ports.extend(range_ports);
        } else {
            let port = parse_single_port(part).map_err(ConfigError::InvalidPorts)?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(ConfigError::InvalidPorts(String::from(
            "No valid ports or ranges provided",
        )));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let range_parts: Vec<&str> = range_str.split('-').collect();
    if range_parts.len() != 2 {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 1-1000.",
        ));
    }

    let start: u16 = range_parts[0].trim().parse().map_err(|_| {
        format!(
            "Invalid start port '{}' in range '{range_str}'",
            range_parts[0]
        )
    })?;
    let end: u16 = range_parts[1].trim().parse().map_err(|_| {
        format!(
            "Invalid end port '{}' in range '{range_str}'",
            range_parts[1]
        )
    })?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

/// Reorders `ports` so the members of `top1`, then `top2`, then `top3` come
/// first (in preset order), followed by every other port in its original order.
pub fn prioritize_ports(ports: Vec<u16>) -> Vec<u16> {
    if ports.len() <= 1 {
        return ports;
    }

    let wanted: HashSet<u16> = ports.iter().copied().collect();
    let mut seen = HashSet::with_capacity(ports.len());
    let mut ordered = Vec::with_capacity(ports.len());

    for layer in [TOP1_PORTS, TOP2_PORTS, TOP3_PORTS] {
        for &port in layer {
            if wanted.contains(&port) && seen.insert(port) {
                ordered.push(port);
            }
        }
    }

    ordered.extend(ports.into_iter().filter(|port| seen.insert(*port)));
    ordered
}

/// Flattens the target list and a free-text blob (split on newlines, tabs,
/// commas and semicolons) into trimmed, unique targets in first-seen order.
pub fn normalize_targets(targets: &[String], text: Option<&str>) -> Vec<String> {
    let from_text = text
        .into_iter()
        .flat_map(|blob| blob.split(['\n', '\r', '\t', ',', ';']));

    targets
        .iter()
        .map(String::as_str)
        .chain(from_text)
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .unique()
        .map(str::to_owned)
        .collect()
}

/// Every tunable of a scan. All fields are optional: the same type serves as
/// the caller's request and as the engine's default table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ScanOptions {
    pub ports: Option<String>,
    pub resolve_hosts: Option<bool>,
    pub resolve_ipv6: Option<bool>,
    pub allow_loopback: Option<bool>,
    pub allow_private: Option<bool>,
    pub preflight_enabled: Option<bool>,
    pub preflight_ports: Option<String>,
    pub preflight_timeout_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub mode: Option<ConcurrencyMode>,
    pub threads: Option<usize>,
    pub max_threads: Option<usize>,
    /// Global permits per second. `Some(0)` disables the global limiter.
    pub max_pps: Option<u32>,
    /// Permits per second per destination. `Some(0)` disables it.
    pub per_ip_max_pps: Option<u32>,
    pub resolver: Option<String>,
    pub worker: Option<String>,
}

impl ScanOptions {
    /// The default table an [`Engine`](crate::scanner::Engine) starts with.
    pub fn standard() -> Self {
        Self {
            ports: Some(FALLBACK_PORTS.to_owned()),
            preflight_ports: Some(DEFAULT_PREFLIGHT_PORTS.to_owned()),
            preflight_timeout_ms: Some(FALLBACK_PREFLIGHT_TIMEOUT.as_millis() as u64),
            probe_timeout_ms: Some(FALLBACK_PROBE_TIMEOUT.as_millis() as u64),
            mode: Some(ConcurrencyMode::Auto),
            max_pps: Some(DEFAULT_GLOBAL_MAX_PPS),
            per_ip_max_pps: Some(DEFAULT_PER_IP_MAX_PPS),
            ..Self::default()
        }
    }

    /// Field-wise `self` first, `defaults` second.
    pub fn layered_over(&self, defaults: &Self) -> Self {
        macro_rules! layer {
            ($($field: ident),+) => {
                Self {
                    $($field: self.$field.clone().or_else(|| defaults.$field.clone()),)+
                }
            }
        }

        layer!(
            ports,
            resolve_hosts,
            resolve_ipv6,
            allow_loopback,
            allow_private,
            preflight_enabled,
            preflight_ports,
            preflight_timeout_ms,
            probe_timeout_ms,
            mode,
            threads,
            max_threads,
            max_pps,
            per_ip_max_pps,
            resolver,
            worker
        )
    }
}

/// Fully validated options for one run.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub ports: Vec<u16>,
    pub expand: ExpandOptions,
    pub preflight: Option<PreflightConfig>,
    pub probe_timeout: Duration,
    pub concurrency: ConcurrencyOptions,
    pub resolver: Option<String>,
    pub worker: Option<String>,
}

fn positive_millis(name: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidOption {
            name,
            reason: String::from("must be greater than zero"),
        });
    }
    Ok(Duration::from_millis(value))
}

/// Resolves `user` against `defaults` and the fallback constants.
///
/// Pure: no I/O, no global state. Port and preflight specifications are
/// parsed here so that every option error surfaces before a run starts.
pub fn resolve(user: &ScanOptions, defaults: &ScanOptions) -> Result<ResolvedOptions, ConfigError> {
    let merged = user.layered_over(defaults);

    let ports = parse_port_spec(
        merged
            .ports
            .as_deref()
            .map(str::trim)
            .filter(|spec| !spec.is_empty())
            .unwrap_or(FALLBACK_PORTS),
    )?;

    let expand = ExpandOptions {
        resolve_hosts: merged.resolve_hosts.unwrap_or(false),
        resolve_ipv6: merged.resolve_ipv6.unwrap_or(false),
        allow_loopback: merged.allow_loopback.unwrap_or(false),
        allow_private: merged.allow_private.unwrap_or(false),
    };

    let preflight = if merged.preflight_enabled.unwrap_or(false) {
        let ports = parse_preflight_ports(merged.preflight_ports.as_deref().unwrap_or_default())?;
        let timeout = match merged.preflight_timeout_ms {
            Some(ms) => positive_millis("preflight_timeout_ms", ms)?,
            None => FALLBACK_PREFLIGHT_TIMEOUT,
        };
        Some(PreflightConfig { ports, timeout })
    } else {
        None
    };

    let probe_timeout = match merged.probe_timeout_ms {
        Some(ms) => positive_millis("probe_timeout_ms", ms)?,
        None => FALLBACK_PROBE_TIMEOUT,
    };

    let mode = merged.mode.unwrap_or_default();
    let concurrency = match mode {
        ConcurrencyMode::Manual => {
            if merged.threads == Some(0) {
                return Err(ConfigError::InvalidOption {
                    name: "threads",
                    reason: String::from("must be at least 1 in manual mode"),
                });
            }
            ConcurrencyOptions {
                mode,
                threads: merged.threads,
                max_threads: None,
                max_pps: merged.max_pps.unwrap_or(0),
                per_ip_max_pps: merged.per_ip_max_pps.unwrap_or(0),
            }
        }
        ConcurrencyMode::Auto => {
            let max_threads = merged.max_threads.unwrap_or_else(default_auto_max_threads);
            if max_threads == 0 {
                return Err(ConfigError::InvalidOption {
                    name: "max_threads",
                    reason: String::from("must be at least 1 in auto mode"),
                });
            }
            ConcurrencyOptions {
                mode,
                threads: None,
                max_threads: Some(max_threads),
                max_pps: merged.max_pps.unwrap_or(0),
                per_ip_max_pps: merged.per_ip_max_pps.unwrap_or(0),
            }
        }
    };

    Ok(ResolvedOptions {
        ports,
        expand,
        preflight,
        probe_timeout,
        concurrency,
        resolver: merged.resolver,
        worker: merged.worker.map(|w| w.trim().to_owned()).filter(|w| !w.is_empty()),
    })
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rustsweep",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Adaptive, rate-limited TCP sweep.
/// WARNING Only scan networks you are authorised to test. Loopback and
/// private ranges are refused unless explicitly allowed.
pub struct Opts {
    /// A comma-delimited list of CIDRs, IPs, or hosts (optionally with a /len suffix) to be scanned.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// A list of CIDRs, IPs, or hosts to be excluded from scanning.
    #[arg(short = 'x', long = "exclude-addresses", value_delimiter = ',')]
    pub exclude_addresses: Option<Vec<String>>,

    /// Ports, ranges and presets to scan. Examples: 80,443 or 1-1000 or top2,8000-8100.
    #[arg(short, long)]
    pub ports: Option<String>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output open sockets.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Print results and the final progress snapshot as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// Resolve hostnames given as targets.
    #[arg(long)]
    pub resolve_hosts: bool,

    /// Keep IPv6 addresses returned by hostname resolution.
    #[arg(long)]
    pub resolve_ipv6: bool,

    /// Permit loopback targets.
    #[arg(long)]
    pub allow_loopback: bool,

    /// Permit private (RFC 1918 / ULA) targets.
    #[arg(long)]
    pub allow_private: bool,

    /// Check each address for liveness before sweeping its ports.
    #[arg(long)]
    pub preflight: bool,

    /// Ports dialled by the liveness preflight.
    #[arg(long)]
    pub preflight_ports: Option<String>,

    /// Per-port preflight timeout in milliseconds.
    #[arg(long)]
    pub preflight_timeout: Option<u64>,

    /// The timeout in milliseconds before a port is assumed to be closed.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// The number of tries before a port is assumed to be closed.
    /// If set to 0, rustsweep will correct it to 1.
    #[arg(long, default_value = "1")]
    pub tries: u8,

    /// Concurrency mode: fixed thread count or elastic auto-tuning.
    #[arg(long, value_enum, ignore_case = true)]
    pub mode: Option<ConcurrencyMode>,

    /// Worker count in manual mode.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Worker ceiling in auto mode.
    #[arg(long)]
    pub max_threads: Option<usize>,

    /// Global permits per second. 0 disables the global limit.
    #[arg(long)]
    pub max_pps: Option<u32>,

    /// Permits per second per destination address. 0 disables it.
    #[arg(long)]
    pub per_ip_max_pps: Option<u32>,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// Label copied into every result.
    #[arg(long)]
    pub worker: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Reads the command line arguments into an Opts struct and merge
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            addresses,
            greppable,
            accessible,
            json,
            tries,
            resolve_hosts,
            resolve_ipv6,
            allow_loopback,
            allow_private,
            preflight
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(
            exclude_addresses,
            ports,
            resolver,
            preflight_ports,
            preflight_timeout,
            timeout,
            mode,
            threads,
            max_threads,
            max_pps,
            per_ip_max_pps,
            ulimit,
            worker
        );
    }

    /// Converts the merged command line into caller-stage [`ScanOptions`].
    /// Unset flags stay `None` so the engine defaults apply.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            ports: self.ports.clone(),
            resolve_hosts: self.resolve_hosts.then_some(true),
            resolve_ipv6: self.resolve_ipv6.then_some(true),
            allow_loopback: self.allow_loopback.then_some(true),
            allow_private: self.allow_private.then_some(true),
            preflight_enabled: self.preflight.then_some(true),
            preflight_ports: self.preflight_ports.clone(),
            preflight_timeout_ms: self.preflight_timeout,
            probe_timeout_ms: self.timeout,
            mode: self.mode,
            threads: self.threads,
            max_threads: self.max_threads,
            max_pps: self.max_pps,
            per_ip_max_pps: self.per_ip_max_pps,
            resolver: self.resolver.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: vec![],
            exclude_addresses: None,
            ports: None,
            no_config: true,
            config_path: None,
            greppable: true,
            accessible: false,
            json: false,
            resolver: None,
            resolve_hosts: false,
            resolve_ipv6: false,
            allow_loopback: false,
            allow_private: false,
            preflight: false,
            preflight_ports: None,
            preflight_timeout: None,
            timeout: None,
            tries: 0,
            mode: None,
            threads: None,
            max_threads: None,
            max_pps: None,
            per_ip_max_pps: None,
            ulimit: None,
            worker: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    addresses: Option<Vec<String>>,
    exclude_addresses: Option<Vec<String>>,
    ports: Option<String>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    resolver: Option<String>,
    resolve_hosts: Option<bool>,
    resolve_ipv6: Option<bool>,
    allow_loopback: Option<bool>,
    allow_private: Option<bool>,
    preflight: Option<bool>,
    preflight_ports: Option<String>,
    preflight_timeout: Option<u64>,
    timeout: Option<u64>,
    tries: Option<u8>,
    mode: Option<ConcurrencyMode>,
    threads: Option<usize>,
    max_threads: Option<usize>,
    max_pps: Option<u32>,
    per_ip_max_pps: Option<u32>,
    ulimit: Option<u64>,
    worker: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct.
    ///
    /// # Format
    ///
    /// addresses = ["203.0.113.0/28"]
    /// ports = "top2,8000-8100"
    /// mode = "manual"
    /// threads = 128
    /// max_pps = 500
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        let config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("found {e} in configuration file {}", config_path.display())
        })?;
        Ok(config)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".rustsweep.toml");
    Some(config_path)
}
