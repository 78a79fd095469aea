//! Progressive SCP target resolution.
//!
//! Push targets range from a bare droplet name to a full
//! `user@host:/path`. Every form normalizes to the same canonical target:
//! equivalent inputs resolve identically modulo the `root` user and
//! `/root` path defaults. Resolution priority for the host portion is
//! literal IP, then DNS lookup, then droplet lookup by name or id.

use std::fmt;
use std::net::ToSocketAddrs;

use crate::error::Error;
use crate::proxy::routes::is_ipv4;

/// A fully resolved push target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpTarget {
    /// Remote user.
    pub user: String,
    /// Remote host, resolved to an IP address.
    pub host: String,
    /// Remote path.
    pub path: String,
}

impl fmt::Display for ScpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.path)
    }
}

/// Host resolution hooks, separated so target parsing is testable without
/// the network or a provider account.
pub trait HostResolver {
    /// Resolve a hostname through DNS, returning a dotted-quad IP.
    fn resolve_dns(&self, host: &str) -> Option<String>;

    /// Resolve a droplet name or id to its public IP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the provider cannot be queried.
    fn resolve_droplet(&self, name: &str) -> Result<Option<String>, Error>;
}

/// Resolver backed by the system DNS, with an optional droplet provider.
pub struct SystemResolver<'a> {
    droplets: Option<&'a dyn crate::push::droplet::DropletProvider>,
}

impl<'a> SystemResolver<'a> {
    /// DNS-only resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self { droplets: None }
    }

    /// Resolver that can also look up droplets by name or id.
    #[must_use]
    pub const fn with_droplets(droplets: &'a dyn crate::push::droplet::DropletProvider) -> Self {
        Self {
            droplets: Some(droplets),
        }
    }
}

impl Default for SystemResolver<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl HostResolver for SystemResolver<'_> {
    fn resolve_dns(&self, host: &str) -> Option<String> {
        // Port is irrelevant; ToSocketAddrs needs one.
        format!("{host}:22")
            .to_socket_addrs()
            .ok()?
            .find(|a| a.is_ipv4())
            .map(|a| a.ip().to_string())
    }

    fn resolve_droplet(&self, name: &str) -> Result<Option<String>, Error> {
        let Some(provider) = self.droplets else {
            return Ok(None);
        };
        let Some(info) = provider.find(name)? else {
            return Ok(None);
        };
        Ok(info.public_ip)
    }
}

/// Resolve any accepted target form into a canonical [`ScpTarget`].
///
/// # Errors
///
/// Returns [`Error::NotFound`] when the host cannot be resolved through
/// any of the three channels.
pub fn resolve_target(input: &str, resolver: &dyn HostResolver) -> Result<ScpTarget, Error> {
    let (user, rest) = match input.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        _ => ("root".to_string(), input),
    };
    let (host, path) = match rest.split_once(':') {
        Some((host, path)) if !path.is_empty() => (host.to_string(), path.to_string()),
        Some((host, _)) => (host.to_string(), "/root".to_string()),
        None => (rest.to_string(), "/root".to_string()),
    };

    if host.is_empty() {
        return Err(Error::validation(format!("invalid push target '{input}'")));
    }

    // Priority: literal IP, DNS, droplet lookup.
    let resolved = if is_ipv4(&host) {
        host
    } else if let Some(ip) = resolver.resolve_dns(&host) {
        tracing::info!(host = %host, ip = %ip, "resolved host via DNS");
        ip
    } else if let Some(ip) = resolver.resolve_droplet(&host)? {
        tracing::info!(droplet = %host, ip = %ip, "resolved host via droplet lookup");
        ip
    } else {
        return Err(Error::not_found(format!(
            "could not resolve '{host}' as an IP, hostname, or droplet"
        )));
    };

    Ok(ScpTarget {
        user,
        host: resolved,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResolver;

    impl HostResolver for FakeResolver {
        fn resolve_dns(&self, host: &str) -> Option<String> {
            (host == "example.com").then(|| "203.0.113.10".to_string())
        }

        fn resolve_droplet(&self, name: &str) -> Result<Option<String>, Error> {
            Ok((name == "worker-1").then(|| "203.0.113.99".to_string()))
        }
    }

    #[test]
    fn full_form_is_used_as_structured() {
        let target = resolve_target("deploy@203.0.113.10:/srv/app", &FakeResolver).unwrap();
        assert_eq!(target.to_string(), "deploy@203.0.113.10:/srv/app");
    }

    #[test]
    fn equivalent_inputs_resolve_identically() {
        let forms = [
            "example.com",
            "root@example.com",
            "root@example.com:/root",
            "example.com:/root",
        ];
        let targets: Vec<String> = forms
            .iter()
            .map(|f| resolve_target(f, &FakeResolver).unwrap().to_string())
            .collect();
        assert!(targets.iter().all(|t| t == "root@203.0.113.10:/root"));
    }

    #[test]
    fn bare_ip_gets_defaults() {
        let target = resolve_target("203.0.113.10", &FakeResolver).unwrap();
        assert_eq!(target.to_string(), "root@203.0.113.10:/root");

        let target = resolve_target("203.0.113.10:/srv", &FakeResolver).unwrap();
        assert_eq!(target.to_string(), "root@203.0.113.10:/srv");
    }

    #[test]
    fn droplet_lookup_is_the_last_resort() {
        let target = resolve_target("worker-1", &FakeResolver).unwrap();
        assert_eq!(target.host, "203.0.113.99");
        assert_eq!(target.user, "root");
    }

    #[test]
    fn unresolvable_host_is_not_found() {
        let err = resolve_target("nope.invalid-zone", &FakeResolver).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
