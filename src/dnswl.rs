use crate::config::DnswlConfig;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;

/// Secondary source of trust for signing domains.
#[async_trait]
pub trait SignerAllowList: Send + Sync {
    /// Returns the listing answer when `domain` is allow-listed.
    async fn lookup(&self, domain: &str) -> Option<String>;
}

/// DNS whitelist lookup: `<domain>.dwl.<zone>`. A listing whose first A
/// record ends in `.255` is an error/limit answer from the list operator and
/// does not count.
pub struct DnsWhitelist {
    resolver: TokioAsyncResolver,
    zone: String,
    timeout: Duration,
}

impl DnsWhitelist {
    pub fn from_system_conf(config: &DnswlConfig) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self {
            resolver,
            zone: config.zone.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    pub fn query_name(&self, domain: &str) -> String {
        format!("{domain}.dwl.{}", self.zone)
    }
}

/// Interpret the A records of a whitelist answer.
pub fn listing_from_answers(answers: &[IpAddr]) -> Option<String> {
    let first = answers.iter().find(|ip| ip.is_ipv4())?.to_string();
    if first.ends_with(".255") {
        None
    } else {
        Some(first)
    }
}

#[async_trait]
impl SignerAllowList for DnsWhitelist {
    async fn lookup(&self, domain: &str) -> Option<String> {
        let name = self.query_name(domain);
        let answers: Vec<IpAddr> =
            match tokio::time::timeout(self.timeout, self.resolver.lookup_ip(name.as_str())).await {
                Ok(Ok(response)) => response.iter().collect(),
                Ok(Err(e)) => {
                    log::debug!("DNSWL lookup failed for {name}: {e}");
                    return None;
                }
                Err(_) => {
                    log::debug!("DNSWL lookup timed out for {name}");
                    return None;
                }
            };
        let listing = listing_from_answers(&answers);
        if let Some(answer) = &listing {
            log::info!("Signing domain {domain} is DNS whitelisted ({answer})");
        }
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_from_answers() {
        let listed: IpAddr = "127.0.10.2".parse().unwrap();
        let limit: IpAddr = "127.0.0.255".parse().unwrap();
        assert_eq!(listing_from_answers(&[listed]), Some("127.0.10.2".into()));
        assert_eq!(listing_from_answers(&[limit]), None);
        assert_eq!(listing_from_answers(&[]), None);
    }
}
