use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::address::{DiscoveryError, PublicAddressSource};
use crate::prompt::Prompt;

/// An address range in `address/prefix` notation. Parsing canonicalizes the
/// address to the network base, so `192.168.1.5/24` and `192.168.1.0/24`
/// compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// The host-exact range for one address: `/32` for IPv4, `/128` for IPv6.
    pub fn host(address: IpAddr) -> Self {
        let prefix_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            address,
            prefix_len,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// A range is broad when its mask matches every address of its family.
    pub fn is_broad(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrParseError {
    #[error("missing '/' in CIDR notation")]
    MissingPrefix,
    #[error("bad IP address {value:?}")]
    Address { value: String },
    #[error("bad prefix length {value:?}")]
    Prefix { value: String },
    #[error("prefix length {prefix_len} exceeds {max}")]
    PrefixRange { prefix_len: u8, max: u8 },
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = value
            .split_once('/')
            .ok_or(CidrParseError::MissingPrefix)?;
        let address: IpAddr = address.parse().map_err(|_| CidrParseError::Address {
            value: address.to_owned(),
        })?;
        let prefix_len: u8 = prefix.parse().map_err(|_| CidrParseError::Prefix {
            value: prefix.to_owned(),
        })?;
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(CidrParseError::PrefixRange { prefix_len, max });
        }
        Ok(Self {
            address: network_base(address, prefix_len),
            prefix_len,
        })
    }
}

fn network_base(address: IpAddr, prefix_len: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len))
            };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len))
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// Caller-supplied access inputs, straight from the command line.
#[derive(Debug, Clone, Default)]
pub struct AccessRequest {
    /// Ranges allowed to reach the bastion. Empty means auto-detect the
    /// caller's public addresses.
    pub cidrs: Vec<String>,
    /// Accept broad ranges without asking.
    pub force: bool,
}

/// The validated ingress policy a bastion is created with.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    ranges: Vec<Cidr>,
    auto_detected: bool,
    force_accepted: bool,
}

impl AccessPolicy {
    pub fn ranges(&self) -> &[Cidr] {
        &self.ranges
    }

    pub fn range_strings(&self) -> Vec<String> {
        self.ranges.iter().map(Cidr::to_string).collect()
    }

    pub fn auto_detected(&self) -> bool {
        self.auto_detected
    }

    pub fn force_accepted(&self) -> bool {
        self.force_accepted
    }
}

/// How policy resolution ended. Declining the broad-range confirmation is a
/// deliberate abort, not a failure; callers translate it into a clean exit.
#[derive(Debug)]
pub enum PolicyOutcome {
    Accepted(AccessPolicy),
    Declined,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to determine your system's public IP addresses: {0}")]
    Discovery(#[source] DiscoveryError),
    #[error("must at least specify a single CIDR to allow access to the bastion")]
    Missing,
    #[error("CIDR {value:?} is invalid: {source}")]
    InvalidCidr {
        value: String,
        #[source]
        source: CidrParseError,
    },
    #[error("failed to read confirmation: {0}")]
    Prompt(#[from] std::io::Error),
}

/// Resolves the request into an [`AccessPolicy`].
///
/// With no ranges given, the caller's public addresses are discovered and
/// mapped to host-exact ranges. Every supplied range must parse; a broad
/// range requires `force` or an interactive confirmation (defaulting to No)
/// before it is accepted.
pub async fn resolve(
    request: AccessRequest,
    addresses: &dyn PublicAddressSource,
    prompt: &dyn Prompt,
) -> Result<PolicyOutcome, PolicyError> {
    let mut auto_detected = false;
    let mut entries = request.cidrs;

    if entries.is_empty() {
        let discovered = addresses.discover().await.map_err(PolicyError::Discovery)?;
        entries = discovered
            .into_iter()
            .map(|address| Cidr::host(address).to_string())
            .collect();
        if !entries.is_empty() {
            let name = if entries.len() == 1 { "CIDR" } else { "CIDRs" };
            println!("Auto-detected your system's {name} as {}", entries.join(", "));
            auto_detected = true;
        }
    }

    if entries.is_empty() {
        return Err(PolicyError::Missing);
    }

    let mut ranges = Vec::with_capacity(entries.len());
    for value in &entries {
        let cidr: Cidr = value.parse().map_err(|source| PolicyError::InvalidCidr {
            value: value.clone(),
            source,
        })?;

        if cidr.is_broad() && !request.force {
            let question = format!("Large CIDR range {value:?} compromises security. Continue?");
            if !prompt.confirm(&question, false)? {
                debug!(target: "pontoon::policy", range = %value, "broad range declined");
                return Ok(PolicyOutcome::Declined);
            }
        }
        ranges.push(cidr);
    }

    Ok(PolicyOutcome::Accepted(AccessPolicy {
        ranges,
        auto_detected,
        force_accepted: request.force,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    struct StaticAddresses {
        addresses: Vec<IpAddr>,
        calls: Arc<Mutex<usize>>,
    }

    impl StaticAddresses {
        fn new(addresses: &[&str]) -> Self {
            Self {
                addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl PublicAddressSource for StaticAddresses {
        async fn discover(&self) -> Result<Vec<IpAddr>, DiscoveryError> {
            *self.calls.lock() += 1;
            Ok(self.addresses.clone())
        }
    }

    #[derive(Default)]
    struct ScriptedPrompt {
        answers: Mutex<VecDeque<bool>>,
        asked: Mutex<Vec<(String, bool)>>,
    }

    impl ScriptedPrompt {
        fn answering(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                asked: Mutex::new(Vec::new()),
            }
        }

        fn questions(&self) -> Vec<(String, bool)> {
            self.asked.lock().clone()
        }
    }

    impl Prompt for ScriptedPrompt {
        fn confirm(&self, question: &str, default_answer: bool) -> io::Result<bool> {
            self.asked
                .lock()
                .push((question.to_owned(), default_answer));
            Ok(self.answers.lock().pop_front().unwrap_or(default_answer))
        }
    }

    fn request(cidrs: &[&str], force: bool) -> AccessRequest {
        AccessRequest {
            cidrs: cidrs.iter().map(|s| (*s).to_owned()).collect(),
            force,
        }
    }

    #[test]
    fn cidr_parses_and_masks_to_network_base() {
        let cidr: Cidr = "192.168.1.5/24".parse().expect("parses");
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
        assert_eq!(cidr.prefix_len(), 24);
        assert!(!cidr.is_broad());

        let v6: Cidr = "2001:db8::dead:beef/64".parse().expect("parses");
        assert_eq!(v6.to_string(), "2001:db8::/64");
    }

    #[test]
    fn cidr_rejects_malformed_input() {
        assert_eq!(
            "10.0.0.1".parse::<Cidr>().unwrap_err(),
            CidrParseError::MissingPrefix
        );
        assert!(matches!(
            "300.0.0.0/24".parse::<Cidr>().unwrap_err(),
            CidrParseError::Address { .. }
        ));
        assert!(matches!(
            "10.0.0.0/abc".parse::<Cidr>().unwrap_err(),
            CidrParseError::Prefix { .. }
        ));
        assert_eq!(
            "10.0.0.0/33".parse::<Cidr>().unwrap_err(),
            CidrParseError::PrefixRange { prefix_len: 33, max: 32 }
        );
        assert_eq!(
            "::1/129".parse::<Cidr>().unwrap_err(),
            CidrParseError::PrefixRange { prefix_len: 129, max: 128 }
        );
    }

    #[test]
    fn broad_means_zero_prefix_for_either_family() {
        assert!("0.0.0.0/0".parse::<Cidr>().unwrap().is_broad());
        assert!("::/0".parse::<Cidr>().unwrap().is_broad());
        assert!(!"10.0.0.0/8".parse::<Cidr>().unwrap().is_broad());
        assert!(!"8.8.8.8/32".parse::<Cidr>().unwrap().is_broad());
    }

    #[test_timeout::tokio_timeout_test]
    async fn auto_detects_host_ranges_when_no_cidr_given() {
        let addresses = StaticAddresses::new(&["203.0.113.7", "2001:db8::1"]);
        let prompt = ScriptedPrompt::default();

        let outcome = resolve(request(&[], false), &addresses, &prompt)
            .await
            .expect("resolves");

        let policy = match outcome {
            PolicyOutcome::Accepted(policy) => policy,
            PolicyOutcome::Declined => panic!("unexpected decline"),
        };
        assert_eq!(
            policy.range_strings(),
            vec!["203.0.113.7/32".to_owned(), "2001:db8::1/128".to_owned()]
        );
        assert!(policy.auto_detected());
        assert!(prompt.questions().is_empty());
        assert_eq!(*addresses.calls.lock(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn supplied_ranges_skip_discovery() {
        let addresses = StaticAddresses::new(&["203.0.113.7"]);
        let prompt = ScriptedPrompt::default();

        let outcome = resolve(request(&["10.1.0.0/16"], false), &addresses, &prompt)
            .await
            .expect("resolves");

        assert!(matches!(outcome, PolicyOutcome::Accepted(ref policy) if !policy.auto_detected()));
        assert_eq!(*addresses.calls.lock(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_range_fails_naming_the_entry() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::default();

        let err = resolve(request(&["nonsense/99"], false), &addresses, &prompt)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "CIDR \"nonsense/99\" is invalid: bad IP address \"nonsense\""
        );
        assert_eq!(*addresses.calls.lock(), 0);
        assert!(prompt.questions().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn no_ranges_and_no_addresses_is_an_error() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::default();

        let err = resolve(request(&[], false), &addresses, &prompt)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "must at least specify a single CIDR to allow access to the bastion"
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn broad_range_asks_and_decline_wins() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::answering(&[false]);

        let outcome = resolve(request(&["0.0.0.0/0"], false), &addresses, &prompt)
            .await
            .expect("resolves");

        assert!(matches!(outcome, PolicyOutcome::Declined));
        assert_eq!(
            prompt.questions(),
            vec![(
                "Large CIDR range \"0.0.0.0/0\" compromises security. Continue?".to_owned(),
                false
            )]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn broad_range_accepted_when_confirmed() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::answering(&[true]);

        let outcome = resolve(request(&["::/0"], false), &addresses, &prompt)
            .await
            .expect("resolves");

        assert!(matches!(outcome, PolicyOutcome::Accepted(_)));
        assert_eq!(prompt.questions().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn force_skips_the_confirmation() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::default();

        let outcome = resolve(request(&["0.0.0.0/0"], true), &addresses, &prompt)
            .await
            .expect("resolves");

        let policy = match outcome {
            PolicyOutcome::Accepted(policy) => policy,
            PolicyOutcome::Declined => panic!("unexpected decline"),
        };
        assert!(policy.force_accepted());
        assert!(prompt.questions().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn host_ranges_never_prompt() {
        let addresses = StaticAddresses::new(&[]);
        let prompt = ScriptedPrompt::default();

        let outcome = resolve(
            request(&["8.8.8.8/32", "2001:db8::1/128"], false),
            &addresses,
            &prompt,
        )
        .await
        .expect("resolves");

        assert!(matches!(outcome, PolicyOutcome::Accepted(_)));
        assert!(prompt.questions().is_empty());
    }
}
