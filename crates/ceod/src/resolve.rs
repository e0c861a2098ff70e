//! Host name resolution for registry locality checks.
//!
//! An operation is local when its owning host resolves to the same canonical
//! name as this machine. Resolution is behind [`HostResolver`] so the
//! registry can be exercised without DNS.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io::{self, ErrorKind};
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::ptr;

/// A resolved owning host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Canonical host name.
    pub canonical: String,
    /// First IPv4 address.
    pub addr: IpAddr,
}

/// Resolves host names to canonical names and addresses.
pub trait HostResolver {
    /// Resolve `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name does not resolve.
    fn resolve(&self, host: &str) -> io::Result<ResolvedHost>;

    /// Canonical name of the machine this process runs on.
    ///
    /// # Errors
    ///
    /// Returns an error if the local host name cannot be read or resolved.
    fn local_fqdn(&self) -> io::Result<String>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<ResolvedHost> {
        getaddrinfo_canonical(host)
    }

    fn local_fqdn(&self) -> io::Result<String> {
        let name = nix::unistd::gethostname().map_err(io::Error::from)?;
        let name = name
            .into_string()
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "hostname is not UTF-8"))?;
        Ok(getaddrinfo_canonical(&name)?.canonical)
    }
}

/// `nix` has no `getaddrinfo` binding, so this calls `libc` directly.
#[allow(unsafe_code)]
fn getaddrinfo_canonical(host: &str) -> io::Result<ResolvedHost> {
    let c_host = CString::new(host)
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "hostname contains NUL"))?;

    // SAFETY: addrinfo is plain data; all-zero is the documented empty hint.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_flags = libc::AI_CANONNAME;
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: `c_host` and `hints` outlive the call; `res` is only read on
    // success.
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut res) };
    if rc != 0 {
        // SAFETY: gai_strerror returns a static NUL-terminated string.
        let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }.to_string_lossy();
        return Err(io::Error::new(ErrorKind::NotFound, format!("{host}: {reason}")));
    }

    // SAFETY: getaddrinfo succeeded, so `res` heads a valid list that stays
    // alive until freeaddrinfo below.
    let resolved = unsafe {
        let mut canonical = None;
        let mut addr = None;
        let mut cur = res;
        while !cur.is_null() {
            let info = &*cur;
            if canonical.is_none() && !info.ai_canonname.is_null() {
                canonical = Some(CStr::from_ptr(info.ai_canonname).to_string_lossy().into_owned());
            }
            if addr.is_none() && info.ai_family == libc::AF_INET && !info.ai_addr.is_null() {
                let sin = &*info.ai_addr.cast::<libc::sockaddr_in>();
                addr = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
            }
            cur = info.ai_next;
        }
        libc::freeaddrinfo(res);
        (canonical, addr)
    };

    match resolved {
        (canonical, Some(addr)) => Ok(ResolvedHost {
            canonical: canonical.unwrap_or_else(|| host.to_string()),
            addr,
        }),
        (_, None) => Err(io::Error::new(
            ErrorKind::NotFound,
            format!("{host}: no IPv4 address"),
        )),
    }
}

/// Resolver with a fixed table, for tests and offline tooling.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    fqdn: String,
    hosts: HashMap<String, ResolvedHost>,
}

impl StaticResolver {
    /// Create a resolver for a machine named `fqdn`.
    #[must_use]
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into(),
            hosts: HashMap::new(),
        }
    }

    /// Map `alias` to `canonical` at `addr`.
    #[must_use]
    pub fn with_host(mut self, alias: &str, canonical: &str, addr: IpAddr) -> Self {
        self.hosts.insert(
            alias.to_string(),
            ResolvedHost {
                canonical: canonical.to_string(),
                addr,
            },
        );
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> io::Result<ResolvedHost> {
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("{host}: unknown host")))
    }

    fn local_fqdn(&self) -> io::Result<String> {
        Ok(self.fqdn.clone())
    }
}

/// A resolver whose local name is fixed by configuration.
#[derive(Debug, Clone)]
pub struct FixedFqdn<R> {
    inner: R,
    fqdn: String,
}

impl<R: HostResolver> FixedFqdn<R> {
    /// Wrap `inner`, reporting `fqdn` as the local canonical name.
    pub fn new(inner: R, fqdn: impl Into<String>) -> Self {
        Self {
            inner,
            fqdn: fqdn.into(),
        }
    }
}

impl<R: HostResolver> HostResolver for FixedFqdn<R> {
    fn resolve(&self, host: &str) -> io::Result<ResolvedHost> {
        self.inner.resolve(host)
    }

    fn local_fqdn(&self) -> io::Result<String> {
        Ok(self.fqdn.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let resolver = StaticResolver::new("a.example").with_host(
            "a",
            "a.example",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert_eq!(resolver.local_fqdn().unwrap(), "a.example");
        assert_eq!(resolver.resolve("a").unwrap().canonical, "a.example");
        assert_eq!(
            resolver.resolve("b").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_system_resolver_localhost() {
        let resolved = SystemResolver.resolve("localhost").unwrap();
        assert!(resolved.addr.is_loopback());
        assert!(!resolved.canonical.is_empty());
    }

    #[test]
    fn test_system_resolver_unknown_host() {
        assert!(SystemResolver.resolve("nonexistent.invalid").is_err());
        assert!(SystemResolver.resolve("bad\0name").is_err());
    }

    #[test]
    fn test_fixed_fqdn_overrides_local_name() {
        let resolver = FixedFqdn::new(StaticResolver::new("real.example"), "override.example");
        assert_eq!(resolver.local_fqdn().unwrap(), "override.example");
    }
}
