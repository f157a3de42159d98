//! Name checks for certificate requests.
//!
//! Allowed-domain entries come in two forms:
//! - `*.example.com` matches any name below `example.com`, never
//!   `example.com` itself
//! - `example.com` matches `example.com` exactly when the role allows bare
//!   domains, and names below it when the role allows subdomains
//!
//! When several entries cover a name, the longest one decides.

use std::net::IpAddr;

use super::types::PkiRole;

/// Maximum length of a DNS name.
const MAX_NAME_LEN: usize = 253;

/// Maximum length of one DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Check a common name or SAN against the role. Returns the reason for a
/// refusal.
pub(crate) fn check_name(role: &PkiRole, name: &str) -> Result<(), String> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return check_ip(role, ip);
    }

    let name = name.to_ascii_lowercase();
    check_syntax(&name)?;

    let wildcard = name.starts_with("*.");
    if wildcard && !role.allow_wildcard_certificates {
        return Err(format!("wildcard name '{name}' is not allowed"));
    }
    if role.allow_any_name {
        return Ok(());
    }
    if name == "localhost" && role.allow_localhost {
        return Ok(());
    }

    match longest_match(role, &name) {
        Some(Verdict::Allowed) => Ok(()),
        Some(Verdict::NeedsBare(entry)) => Err(format!(
            "'{name}' matches '{entry}' but bare domains are not allowed"
        )),
        Some(Verdict::NeedsSubdomains(entry)) => Err(format!(
            "'{name}' is below '{entry}' but subdomains are not allowed"
        )),
        None => Err(format!("'{name}' is not in the allowed domains")),
    }
}

/// Check an IP SAN against the role.
pub(crate) fn check_ip(role: &PkiRole, ip: IpAddr) -> Result<(), String> {
    if role.allow_ip_sans || role.allow_any_name {
        Ok(())
    } else {
        Err(format!("IP SAN {ip} is not allowed"))
    }
}

#[derive(Debug)]
enum Verdict<'a> {
    Allowed,
    NeedsBare(&'a str),
    NeedsSubdomains(&'a str),
}

fn longest_match<'a>(role: &'a PkiRole, name: &str) -> Option<Verdict<'a>> {
    let mut best: Option<(usize, Verdict<'a>)> = None;

    for entry in &role.allowed_domains {
        let (base, entry_wildcard) = match entry.strip_prefix("*.") {
            Some(base) => (base, true),
            None => (entry.as_str(), false),
        };
        let base_lower = base.to_ascii_lowercase();
        let exact = name == base_lower;
        let below = name
            .strip_suffix(base_lower.as_str())
            .is_some_and(|head| head.ends_with('.') && head.len() > 1);

        let verdict = match (entry_wildcard, exact, below) {
            (true, _, true) => Verdict::Allowed,
            (false, true, _) if role.allow_bare_domains => Verdict::Allowed,
            (false, true, _) => Verdict::NeedsBare(entry),
            (false, _, true) if role.allow_subdomains => Verdict::Allowed,
            (false, _, true) => Verdict::NeedsSubdomains(entry),
            _ => continue,
        };

        let len = base.len();
        let replace = match &best {
            None => true,
            Some((best_len, best_verdict)) => {
                len > *best_len
                    || (len == *best_len
                        && matches!(verdict, Verdict::Allowed)
                        && !matches!(best_verdict, Verdict::Allowed))
            }
        };
        if replace {
            best = Some((len, verdict));
        }
    }

    best.map(|(_, verdict)| verdict)
}

fn check_syntax(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!("name must be 1-{MAX_NAME_LEN} characters"));
    }
    for (i, label) in name.split('.').enumerate() {
        if i == 0 && label == "*" {
            continue;
        }
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(format!("'{name}' is not a valid DNS name"));
        }
    }
    if name == "*" {
        return Err("a bare '*' is not a valid name".to_owned());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(domains: &[&str]) -> PkiRole {
        let mut role = PkiRole::new("web", "root", 3600);
        role.allowed_domains = domains.iter().map(|d| (*d).to_owned()).collect();
        role
    }

    #[test]
    fn wildcard_entry_matches_subdomains_only() {
        let r = role(&["*.example.com"]);
        assert!(check_name(&r, "api.example.com").is_ok());
        assert!(check_name(&r, "a.b.example.com").is_ok());
        assert!(check_name(&r, "example.com").is_err());
        assert!(check_name(&r, "badexample.com").is_err());
    }

    #[test]
    fn bare_domain_requires_flag() {
        let mut r = role(&["example.com"]);
        assert!(check_name(&r, "example.com").is_err());
        r.allow_bare_domains = true;
        assert!(check_name(&r, "example.com").is_ok());
        assert!(check_name(&r, "api.example.com").is_err());
    }

    #[test]
    fn subdomains_require_flag() {
        let mut r = role(&["example.com"]);
        r.allow_subdomains = true;
        assert!(check_name(&r, "api.example.com").is_ok());
        assert!(check_name(&r, "API.Example.COM").is_ok());
        assert!(check_name(&r, "example.org").is_err());
    }

    #[test]
    fn longest_entry_decides() {
        let mut r = role(&["*.example.com", "internal.example.com"]);
        // The more specific non-wildcard entry takes over and has no
        // subdomain permission.
        assert!(check_name(&r, "db.internal.example.com").is_err());
        assert!(check_name(&r, "www.example.com").is_ok());
        r.allow_subdomains = true;
        assert!(check_name(&r, "db.internal.example.com").is_ok());
    }

    #[test]
    fn wildcard_certificates_need_permission() {
        let mut r = role(&["example.com"]);
        r.allow_subdomains = true;
        assert!(check_name(&r, "*.example.com").is_err());
        r.allow_wildcard_certificates = true;
        assert!(check_name(&r, "*.example.com").is_ok());
        assert!(check_name(&r, "a.*.example.com").is_err());
    }

    #[test]
    fn localhost_and_ips() {
        let mut r = role(&[]);
        assert!(check_name(&r, "localhost").is_err());
        assert!(check_name(&r, "10.0.0.1").is_err());
        r.allow_localhost = true;
        r.allow_ip_sans = true;
        assert!(check_name(&r, "localhost").is_ok());
        assert!(check_name(&r, "10.0.0.1").is_ok());
        assert!(check_name(&r, "::1").is_ok());
    }

    #[test]
    fn any_name_still_checks_syntax() {
        let mut r = role(&[]);
        r.allow_any_name = true;
        assert!(check_name(&r, "anything.test").is_ok());
        assert!(check_name(&r, "bad_name.test").is_err());
        assert!(check_name(&r, "-lead.test").is_err());
        assert!(check_name(&r, "").is_err());
    }
}
