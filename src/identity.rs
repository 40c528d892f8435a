//! Deterministic network identity for a VM, derived from its name.
//!
//! Everything here is a pure function of the sanitized name: the same name
//! yields the same hardware and IPv4 address on any host, at any time. Name
//! uniqueness is enforced by the store, not by these functions.

use std::fmt;
use std::net::Ipv4Addr;

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::descriptor::NetworkMode;

/// Locally administered OUI used by QEMU for virtio NICs.
const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Bridged guests live in `192.168.105.0/24`, last octet 100..=254.
const BRIDGE_SUBNET: [u8; 3] = [192, 168, 105];
const BRIDGE_FIRST_HOST: u32 = 100;
const BRIDGE_HOST_COUNT: u32 = 155;

/// A 6-byte hardware address, rendered as `52:54:00:xx:xx:xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Replace characters that are not allowed in a hostname with `-`.
///
/// Only ASCII alphanumerics, `-` and `.` survive; `my_vm_1` becomes `my-vm-1`.
/// Idempotent.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn digest(name: &str) -> [u8; 32] {
    Sha256::digest(sanitize_name(name).as_bytes()).into()
}

/// Deterministic hardware address: fixed vendor prefix plus the first three
/// bytes of SHA-256 over the sanitized name.
pub fn derive_mac(name: &str) -> MacAddress {
    let h = digest(name);
    let [p0, p1, p2] = MAC_PREFIX;
    MacAddress([p0, p1, p2, h[0], h[1], h[2]])
}

/// Deterministic bridged-network address in `192.168.105.100`–`192.168.105.254`.
///
/// The first four digest bytes (big-endian) are reduced modulo 155. Changing
/// the hash changes previously assigned addresses.
pub fn derive_static_ip(name: &str) -> Ipv4Addr {
    let h = digest(name);
    let n = u32::from_be_bytes([h[0], h[1], h[2], h[3]]);
    let host = BRIDGE_FIRST_HOST + n % BRIDGE_HOST_COUNT;
    let [a, b, c] = BRIDGE_SUBNET;
    Ipv4Addr::new(a, b, c, host as u8)
}

/// True when `ip` is inside the bridged /24.
pub fn in_bridge_subnet(ip: Ipv4Addr) -> bool {
    ip.octets()[..3] == BRIDGE_SUBNET
}

/// Hardware address plus (bridged only) IPv4 address for one VM name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub mac: MacAddress,
    pub ip: Option<Ipv4Addr>,
}

impl NetworkIdentity {
    pub fn derive(name: &str, mode: NetworkMode) -> Self {
        Self {
            mac: derive_mac(name),
            ip: match mode {
                NetworkMode::Bridge => Some(derive_static_ip(name)),
                NetworkMode::Portfwd => None,
            },
        }
    }
}

const ADJECTIVES: &[&str] = &["swift", "bright", "clever", "happy", "quick", "bold", "calm", "deep"];
const NOUNS: &[&str] = &["server", "engine", "cloud", "node", "host", "box", "core", "hub"];
const PASSWORD_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_below(bound: u32) -> u32 {
    // Rejection sampling keeps the result unbiased.
    let zone = u32::MAX - (u32::MAX % bound);
    loop {
        let v = OsRng.next_u32();
        if v < zone {
            return v % bound;
        }
    }
}

/// Random `<adjective>-<noun>-<100..999>` name for VMs created without one.
pub fn random_name() -> String {
    let adj = ADJECTIVES[random_below(ADJECTIVES.len() as u32) as usize];
    let noun = NOUNS[random_below(NOUNS.len() as u32) as usize];
    let num = 100 + random_below(900);
    format!("{adj}-{noun}-{num}")
}

/// Random alphanumeric password from the OS RNG.
pub fn random_password(len: usize) -> String {
    (0..len)
        .map(|_| PASSWORD_CHARSET[random_below(PASSWORD_CHARSET.len() as u32) as usize] as char)
        .collect()
}
