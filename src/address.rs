//! Expands target strings (IPs, CIDRs, hosts) into the address ranges a scan walks.
//!
//! Targets are parsed, optionally resolved through a [`Resolve`]r, filtered
//! against the loopback / private / reserved safety rail, unioned, and then
//! every exclude is subtracted. The output is a sorted list of disjoint
//! [`AddressRange`]s plus a [`HostMap`] remembering which hostname produced
//! which address.
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use cidr_utils::cidr::{IpCidr, IpInet};
use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use log::{debug, info};
use tokio::fs;

use crate::error::ConfigError;

/// Upper bound on a single hostname lookup.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Switches that control how targets are expanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandOptions {
    pub resolve_hosts: bool,
    pub resolve_ipv6: bool,
    pub allow_loopback: bool,
    pub allow_private: bool,
}

/// Something that can turn a hostname into addresses.
pub trait Resolve: Send + Sync {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// Resolves through the operating system first and falls back to a
/// hickory resolver.
pub struct SystemResolver {
    backup: TokioAsyncResolver,
}

impl SystemResolver {
    /// `resolver` is either a path to a file of nameserver IPs or a
    /// comma-separated list of them. `None` uses the system configuration.
    pub async fn new(resolver: Option<&str>) -> Self {
        Self {
            backup: get_resolver(resolver).await,
        }
    }
}

impl Resolve for SystemResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        async move {
            if let Ok(addrs) = tokio::net::lookup_host((host, 80)).await {
                let ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
                if !ips.is_empty() {
                    return Ok(ips);
                }
            }

            let lookup = self.backup.lookup_ip(host).await.map_err(io::Error::other)?;
            Ok(lookup.iter().collect())
        }
        .boxed()
    }
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver (default
///       behaviour).
async fn get_resolver(resolver: Option<&str>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Parses an input file of nameserver IPs.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}

/// Looks `host` up with a deadline, unmapping IPv4-mapped IPv6 answers and
/// dropping IPv6 unless `include_ipv6` is set. Order is preserved, duplicates removed.
async fn resolve_host_records(
    resolver: &dyn Resolve,
    host: &str,
    include_ipv6: bool,
) -> Result<Vec<IpAddr>, ConfigError> {
    let lookup = tokio::time::timeout(RESOLVE_TIMEOUT, resolver.lookup(host))
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "hostname lookup timed out",
            ))
        })
        .map_err(|source| ConfigError::Resolve {
            host: host.to_owned(),
            source,
        })?;

    let mut records = Vec::with_capacity(lookup.len());
    for addr in lookup.into_iter().map(unmap) {
        if addr.is_ipv6() && !include_ipv6 {
            continue;
        }
        if !records.contains(&addr) {
            records.push(addr);
        }
    }
    Ok(records)
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

/// The safety rail applied to every included address.
///
/// Unspecified, multicast, link-local and broadcast addresses are always
/// refused. Loopback and private addresses need an explicit opt-in.
pub fn address_allowed(addr: IpAddr, opts: &ExpandOptions) -> bool {
    let addr = unmap(addr);
    if addr.is_unspecified() || addr.is_multicast() || is_link_local(addr) {
        return false;
    }
    if addr.is_loopback() {
        return opts.allow_loopback;
    }
    if is_private(addr) && !opts.allow_private {
        return false;
    }
    !matches!(addr, IpAddr::V4(v4) if v4.is_broadcast())
}

fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// A parsed target string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Network(IpCidr),
    Host { name: String, prefix: Option<u8> },
}

/// Parses `raw` as an IP, a CIDR (host bits are masked off), a hostname, or
/// a hostname followed by `/len`.
fn parse_target(raw: &str) -> Option<Target> {
    if let Ok(inet) = IpInet::from_str(raw) {
        return Some(Target::Network(inet.network()));
    }

    let (name, prefix) = match raw.split_once('/') {
        Some((name, len)) => (name, Some(len.trim().parse::<u8>().ok()?)),
        None => (raw, None),
    };
    let name = name.trim();
    if name.is_empty() || IpAddr::from_str(name).is_ok() || !looks_like_hostname(name) {
        return None;
    }
    Some(Target::Host {
        name: name.to_owned(),
        prefix,
    })
}

fn looks_like_hostname(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    let numeric_tld = name
        .rsplit('.')
        .next()
        .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit()));

    name.len() <= 253
        && !numeric_tld
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn network_of(addr: IpAddr, prefix: Option<u8>) -> Option<IpCidr> {
    let len = match (addr, prefix) {
        (_, Some(len)) => len,
        (IpAddr::V4(_), None) => 32,
        (IpAddr::V6(_), None) => 128,
    };
    IpInet::new(addr, len).ok().map(|inet| inet.network())
}

/// Inclusive `[start, end]` intervals, sorted and pairwise disjoint and non-adjacent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IntervalSet(Vec<(u128, u128)>);

impl IntervalSet {
    fn insert(&mut self, start: u128, end: u128) {
        let (mut start, mut end) = (start, end);
        let mut merged = Vec::with_capacity(self.0.len() + 1);
        let mut placed = false;

        for &(s, e) in &self.0 {
            if e.saturating_add(1) < start {
                merged.push((s, e));
            } else if end.saturating_add(1) < s {
                if !placed {
                    merged.push((start, end));
                    placed = true;
                }
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        if !placed {
            merged.push((start, end));
        }
        merged.sort_unstable();
        self.0 = merged;
    }

    fn remove(&mut self, start: u128, end: u128) {
        let mut kept = Vec::with_capacity(self.0.len() + 1);
        for &(s, e) in &self.0 {
            if e < start || s > end {
                kept.push((s, e));
                continue;
            }
            if s < start {
                kept.push((s, start - 1));
            }
            if e > end {
                kept.push((end + 1, e));
            }
        }
        self.0 = kept;
    }
}

/// IPv4 and IPv6 addresses kept apart so that numeric values never collide.
#[derive(Debug, Default)]
struct AddressSet {
    v4: IntervalSet,
    v6: IntervalSet,
}

impl AddressSet {
    fn family(&mut self, cidr: &IpCidr) -> &mut IntervalSet {
        match cidr {
            IpCidr::V4(_) => &mut self.v4,
            IpCidr::V6(_) => &mut self.v6,
        }
    }

    fn add(&mut self, cidr: &IpCidr) {
        let (start, end) = bounds(cidr);
        self.family(cidr).insert(start, end);
    }

    fn subtract(&mut self, cidr: &IpCidr) {
        let (start, end) = bounds(cidr);
        self.family(cidr).remove(start, end);
    }

    fn into_ranges(self) -> Vec<AddressRange> {
        let v4 = self.v4.0.into_iter().map(|(start, end)| AddressRange {
            base: IpAddr::V4(Ipv4Addr::from(start as u32)),
            count: end - start + 1,
        });
        let v6 = self.v6.0.into_iter().map(|(start, end)| AddressRange {
            base: IpAddr::V6(Ipv6Addr::from(start)),
            count: end - start + 1,
        });
        v4.chain(v6).collect()
    }
}

fn bounds(cidr: &IpCidr) -> (u128, u128) {
    (
        addr_to_u128(cidr.first_address()),
        addr_to_u128(cidr.last_address()),
    )
}

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// A contiguous block of addresses. Iterating never consumes the range:
/// every call to [`AddressRange::iter`] starts again from the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    base: IpAddr,
    count: u128,
}

impl AddressRange {
    pub const fn base(&self) -> IpAddr {
        self.base
    }

    /// Number of addresses in the range. Never zero.
    pub const fn len(&self) -> u128 {
        self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn last(&self) -> IpAddr {
        offset(self.base, self.count - 1)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        if addr.is_ipv4() != self.base.is_ipv4() {
            return false;
        }
        let start = addr_to_u128(self.base);
        let value = addr_to_u128(addr);
        value >= start && value - start < self.count
    }

    pub const fn iter(&self) -> AddressIter {
        AddressIter {
            range: *self,
            next: 0,
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 1 {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}-{}", self.base, self.last())
        }
    }
}

impl IntoIterator for &AddressRange {
    type Item = IpAddr;
    type IntoIter = AddressIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn offset(base: IpAddr, by: u128) -> IpAddr {
    match base {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(by as u32))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(by))),
    }
}

/// Sequential walk over an [`AddressRange`].
#[derive(Debug, Clone)]
pub struct AddressIter {
    range: AddressRange,
    next: u128,
}

impl AddressIter {
    /// Addresses not yet yielded.
    pub const fn remaining(&self) -> u128 {
        self.range.count - self.next
    }

    /// Starts over from the range base.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

impl Iterator for AddressIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.range.count {
            return None;
        }
        let addr = offset(self.range.base, self.next);
        self.next += 1;
        Some(addr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (remaining, usize::try_from(self.remaining()).ok())
    }
}

/// Hostnames that led to each address, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMap(BTreeMap<IpAddr, Vec<String>>);

impl HostMap {
    pub fn insert(&mut self, addr: IpAddr, host: &str) {
        if host.is_empty() {
            return;
        }
        let hosts = self.0.entry(addr).or_default();
        if !hosts.iter().any(|known| known == host) {
            hosts.push(host.to_owned());
        }
    }

    pub fn get(&self, addr: IpAddr) -> &[String] {
        self.0.get(&addr).map_or(&[], Vec::as_slice)
    }

    /// Hostnames for `addr`, or those recorded for `fallback` (the base
    /// address of the enclosing range) when `addr` has none of its own.
    pub fn hosts_for(&self, addr: IpAddr, fallback: IpAddr) -> &[String] {
        match self.get(addr) {
            [] => self.get(fallback),
            hosts => hosts,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output of [`expand_targets`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    pub ranges: Vec<AddressRange>,
    pub hosts: HostMap,
}

impl Expansion {
    /// Total addresses across all ranges, saturating.
    pub fn address_count(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |total, range| total.saturating_add(range.len()))
    }

    /// The range `addr` belongs to, if any.
    pub fn range_of(&self, addr: IpAddr) -> Option<&AddressRange> {
        self.ranges.iter().find(|range| range.contains(addr))
    }
}

/// Expands `targets` minus `excludes` into sorted, disjoint address ranges.
///
/// ```rust
/// # use rustsweep::address::{expand_targets, ExpandOptions, SystemResolver};
/// # tokio_test_block(async {
/// let resolver = SystemResolver::new(None).await;
/// let targets = vec!["203.0.113.0/30".to_owned()];
/// let expansion = expand_targets(&targets, &[], &ExpandOptions::default(), &resolver)
///     .await
///     .unwrap();
/// assert_eq!(expansion.address_count(), 4);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub async fn expand_targets(
    targets: &[String],
    excludes: &[String],
    opts: &ExpandOptions,
    resolver: &dyn Resolve,
) -> Result<Expansion, ConfigError> {
    let mut set = AddressSet::default();
    let mut hosts = HostMap::default();
    let mut included = 0usize;

    for raw in targets.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        match parse_target(raw).ok_or_else(|| ConfigError::InvalidTarget(raw.to_owned()))? {
            Target::Network(cidr) => {
                if !address_allowed(cidr.first_address(), opts) {
                    return Err(ConfigError::TargetNotAllowed(raw.to_owned()));
                }
                set.add(&cidr);
            }
            Target::Host { name, prefix } => {
                if !opts.resolve_hosts {
                    return Err(ConfigError::InvalidTarget(raw.to_owned()));
                }
                let records = resolve_host_records(resolver, &name, opts.resolve_ipv6).await?;
                let allowed: Vec<IpAddr> = records
                    .into_iter()
                    .filter(|addr| address_allowed(*addr, opts))
                    .collect();
                if allowed.is_empty() {
                    return Err(ConfigError::HostFiltered(name));
                }

                for addr in allowed {
                    let network = network_of(addr, prefix)
                        .ok_or_else(|| ConfigError::InvalidTarget(raw.to_owned()))?;
                    hosts.insert(addr, &name);
                    hosts.insert(network.first_address(), &name);
                    set.add(&network);
                }
            }
        }
        included += 1;
    }

    if included == 0 {
        return Err(ConfigError::NoTargets);
    }

    for raw in excludes.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        match parse_target(raw).ok_or_else(|| ConfigError::InvalidExclude(raw.to_owned()))? {
            Target::Network(cidr) => set.subtract(&cidr),
            Target::Host { name, prefix } => {
                if !opts.resolve_hosts {
                    return Err(ConfigError::InvalidExclude(raw.to_owned()));
                }
                for addr in resolve_host_records(resolver, &name, true).await? {
                    let network = network_of(addr, prefix)
                        .ok_or_else(|| ConfigError::InvalidExclude(raw.to_owned()))?;
                    set.subtract(&network);
                }
            }
        }
    }

    let ranges = set.into_ranges();
    if ranges.is_empty() {
        return Err(ConfigError::NoTargetsAfterExclude);
    }

    let expansion = Expansion { ranges, hosts };
    info!(
        "Expanded {} targets into {} ranges ({} addresses, {} named)",
        included,
        expansion.ranges.len(),
        expansion.address_count(),
        expansion.hosts.len()
    );
    debug!("Ranges: {:?}", expansion.ranges);
    Ok(expansion)
}
